//! Gateway Dataplane - control core of a multi-cluster VPN gateway
//!
//! Keeps the kernel's routing and firewall state in sync with a declarative
//! description, and measures whether the tunnel towards each paired remote
//! gateway is alive through a small UDP heartbeat protocol.

pub mod config;
pub mod conncheck;
pub mod crd;
pub mod error;
pub mod firewall;
pub mod marks;
pub mod netlink;
pub mod nodeport;
pub mod reconciler;
pub mod rt_tables;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Identifies a remote cluster paired with this gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(id: &str) -> Self {
        ClusterId(id.to_string())
    }
}

impl From<String> for ClusterId {
    fn from(id: String) -> Self {
        ClusterId(id)
    }
}

/// Default UDP port of the heartbeat protocol
pub const DEFAULT_PING_PORT: u16 = 12345;

/// Default location of the routing table name registry
pub const DEFAULT_RT_TABLES_PATH: &str = "/etc/iproute2/rt_tables";

/// Label carrying the node a route or firewall configuration belongs to
pub const NODE_NAME_LABEL: &str = "networking.gateway.dev/node-name";
