//! Configuration for gateway-dataplane components

use crate::{ClusterId, Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top level configuration of a gateway process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Cluster ID of the local cluster
    pub cluster_id: ClusterId,

    /// Heartbeat settings
    pub conncheck: ConnCheckConfig,

    /// Routing and firewall reconciliation settings
    pub dataplane: DataplaneConfig,

    /// Remote gateways to monitor
    pub peers: Vec<PeerConfig>,
}

/// Settings of the connectivity heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnCheckConfig {
    /// Local address the shared socket binds to
    pub bind_ip: IpAddr,

    /// UDP port used on both ends of the heartbeat
    pub ping_port: u16,

    /// Size of the receive buffer; bounds the datagram size
    pub ping_buffer_size: usize,

    /// Number of missed intervals after which a peer is disconnected
    pub ping_loss_threshold: u32,

    /// Interval between two probes, in milliseconds
    pub ping_interval_ms: u64,
}

/// Settings of the routing and firewall reconcilers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    /// Routing table name registry
    pub rt_tables_path: PathBuf,

    /// Name of the nftables table holding the NodePort mark chains
    pub firewall_table: String,
}

/// A remote gateway to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub cluster_id: ClusterId,
    pub address: IpAddr,
}

impl ConnCheckConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Time without a valid PONG after which a peer counts as unreachable
    pub fn loss_window(&self) -> Duration {
        self.ping_interval() * self.ping_loss_threshold
    }

    /// Poll period of the disconnect observer
    pub fn disconnect_poll_interval(&self) -> Duration {
        (self.loss_window() / 10).max(Duration::from_millis(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_interval_ms == 0 {
            return Err(Error::Config("ping interval must be positive".to_string()));
        }
        if self.ping_loss_threshold == 0 {
            return Err(Error::Config("ping loss threshold must be positive".to_string()));
        }
        if self.ping_buffer_size == 0 {
            return Err(Error::Config("ping buffer size must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cluster_id: ClusterId("default".to_string()),
            conncheck: ConnCheckConfig::default(),
            dataplane: DataplaneConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl Default for ConnCheckConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ping_port: crate::DEFAULT_PING_PORT,
            ping_buffer_size: 1024,
            ping_loss_threshold: 5,
            ping_interval_ms: 2000,
        }
    }
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            rt_tables_path: crate::DEFAULT_RT_TABLES_PATH.into(),
            firewall_table: "gateway-nodeport".to_string(),
        }
    }
}

/// Load configuration from a YAML file, overridden by `GATEWAY__*`
/// environment variables (e.g. `GATEWAY__CONNCHECK__PING_PORT`).
pub fn load_config<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Yaml))
        .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
        .build()
        .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
    settings
        .try_deserialize()
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
}

/// Save configuration to file
pub fn save_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let content = serde_yaml::to_string(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conncheck_defaults() {
        let config = ConnCheckConfig::default();
        assert_eq!(config.ping_port, 12345);
        assert_eq!(config.ping_interval(), Duration::from_secs(2));
        assert_eq!(config.loss_window(), Duration::from_secs(10));
        assert_eq!(config.disconnect_poll_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = ConnCheckConfig {
            ping_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");

        let mut config = GatewayConfig::default();
        config.cluster_id = ClusterId("cluster-a".to_string());
        config.conncheck.ping_interval_ms = 500;
        config.peers.push(PeerConfig {
            cluster_id: ClusterId("cluster-b".to_string()),
            address: "10.1.1.1".parse().unwrap(),
        });

        save_config(&config, &path).unwrap();
        let loaded: GatewayConfig = load_config(&path).unwrap();

        assert_eq!(loaded.cluster_id, config.cluster_id);
        assert_eq!(loaded.conncheck, config.conncheck);
        assert_eq!(loaded.peers, config.peers);
    }
}
