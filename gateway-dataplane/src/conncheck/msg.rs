//! Heartbeat wire format

use crate::ClusterId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MsgType {
    Ping,
    Pong,
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MsgType::Ping => write!(f, "PING"),
            MsgType::Pong => write!(f, "PONG"),
        }
    }
}

/// A single heartbeat datagram, JSON encoded on the wire.
///
/// The PONG echoes the PING's `timestamp` untouched, so the initiator can
/// compute the round trip against its own clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg {
    #[serde(rename = "clusterID")]
    pub cluster_id: ClusterId,
    #[serde(rename = "msgType")]
    pub msg_type: MsgType,
    #[serde(rename = "timeStamp")]
    pub timestamp: DateTime<Utc>,
}

impl Msg {
    pub fn ping(cluster_id: ClusterId, timestamp: DateTime<Utc>) -> Self {
        Self {
            cluster_id,
            msg_type: MsgType::Ping,
            timestamp,
        }
    }

    /// Turn a PING into the matching PONG
    pub fn into_pong(self) -> Self {
        Self {
            msg_type: MsgType::Pong,
            ..self
        }
    }
}
