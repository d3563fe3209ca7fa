//! Binary running the tunnel heartbeat against a set of remote gateways

use chrono::{DateTime, Utc};
use clap::Parser;
use gateway_dataplane::{
    config::{load_config, GatewayConfig, PeerConfig},
    conncheck::{ConnChecker, UpdateCallback},
    ClusterId, DEFAULT_PING_PORT,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "gateway-conncheck",
    about = "Heartbeat prober for the tunnels towards remote gateways",
    version
)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local address of the heartbeat socket
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Heartbeat UDP port
    #[arg(long, default_value_t = DEFAULT_PING_PORT)]
    port: u16,

    /// Probe interval in milliseconds
    #[arg(long, default_value_t = 2000)]
    interval_ms: u64,

    /// Missed intervals before a peer is reported down
    #[arg(long, default_value_t = 5)]
    loss_threshold: u32,

    /// Remote gateway as CLUSTER_ID=IP, repeatable
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerConfig>,

    /// Log level
    #[arg(long, default_value = "info", env = "GATEWAY_LOG_LEVEL")]
    log_level: String,
}

fn parse_peer(value: &str) -> Result<PeerConfig, String> {
    let (id, ip) = value
        .split_once('=')
        .ok_or_else(|| format!("expected CLUSTER_ID=IP, got {:?}", value))?;
    let address = ip
        .parse()
        .map_err(|e| format!("invalid address {:?}: {}", ip, e))?;
    Ok(PeerConfig {
        cluster_id: ClusterId::from(id),
        address,
    })
}

fn status_logger(cluster_id: ClusterId) -> Arc<dyn UpdateCallback> {
    Arc::new(
        move |connected: bool,
              latency: Duration,
              at: Option<DateTime<Utc>>|
              -> gateway_dataplane::Result<()> {
            match (connected, at) {
                (true, Some(at)) => info!(
                    cluster_id = %cluster_id,
                    latency_ms = latency.as_millis() as u64,
                    at = %at,
                    "Tunnel up"
                ),
                _ => warn!(cluster_id = %cluster_id, "Tunnel down"),
            }
            Ok(())
        },
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting gateway heartbeat");

    let config = if let Some(config_path) = args.config {
        load_config::<GatewayConfig>(&config_path)?
    } else {
        let mut config = GatewayConfig::default();
        config.conncheck.bind_ip = args.bind_ip;
        config.conncheck.ping_port = args.port;
        config.conncheck.ping_interval_ms = args.interval_ms;
        config.conncheck.ping_loss_threshold = args.loss_threshold;
        config.peers = args.peers;
        config
    };

    info!("Heartbeat configuration: {:?}", config.conncheck);

    let checker = Arc::new(ConnChecker::new(config.conncheck.clone())?);
    for peer in &config.peers {
        let callback = status_logger(peer.cluster_id.clone());
        match checker
            .add_sender(peer.cluster_id.clone(), peer.address, callback)
            .await
        {
            Err(e) if e.is_duplicate() => {
                warn!("Peer {} listed twice", peer.cluster_id);
                continue;
            }
            other => other?,
        }
        checker.start_sender(&peer.cluster_id).await?;
    }

    let result = tokio::select! {
        result = checker.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping heartbeat");
            Ok(())
        }
    };

    for cluster_id in checker.peers().await {
        checker.del_and_stop_sender(&cluster_id).await?;
    }
    checker.shutdown();

    if let Err(e) = result {
        error!("Heartbeat error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
