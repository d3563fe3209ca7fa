//! Periodic PING emitter towards one remote gateway

use super::msg::Msg;
use crate::{ClusterId, Result};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub struct Sender {
    pub(crate) cluster_id: ClusterId,
    pub(crate) remote: SocketAddr,
    pub(crate) token: CancellationToken,
    pub(crate) task: Option<JoinHandle<Result<()>>>,
}

impl Sender {
    pub(crate) fn new(cluster_id: ClusterId, remote: SocketAddr, token: CancellationToken) -> Self {
        Self {
            cluster_id,
            remote,
            token,
            task: None,
        }
    }

    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

/// Send one PING stamped with the current time
pub(crate) async fn send_ping(
    conn: &UdpSocket,
    cluster_id: &ClusterId,
    remote: SocketAddr,
) -> Result<()> {
    let msg = Msg::ping(cluster_id.clone(), Utc::now());
    let payload = serde_json::to_vec(&msg)?;
    conn.send_to(&payload, remote).await?;
    trace!(cluster_id = %cluster_id, %remote, "Sent PING");
    Ok(())
}

/// Ping `remote` every `period` until `token` is cancelled.
///
/// A failed send is logged and absorbed by the next tick.
pub(crate) async fn ping_loop(
    conn: Arc<UdpSocket>,
    cluster_id: ClusterId,
    remote: SocketAddr,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(cluster_id = %cluster_id, %remote, "Sender started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = send_ping(&conn, &cluster_id, remote).await {
                    warn!(cluster_id = %cluster_id, %remote, "Failed to send PING: {}", e);
                }
            }
        }
    }

    debug!(cluster_id = %cluster_id, "Sender stopped");
}
