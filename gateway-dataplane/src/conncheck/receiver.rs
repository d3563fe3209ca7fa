//! Shared heartbeat listener
//!
//! One receiver serves every peer through one UDP socket: it answers PINGs
//! with PONGs, turns PONGs into latency samples, and runs the disconnect
//! observer that flags peers which went silent.

use super::msg::{Msg, MsgType};
use super::peer::{Peer, UpdateCallback};
use crate::{ClusterId, Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug)]
pub struct Receiver {
    conn: Arc<UdpSocket>,
    buffer_size: usize,
    loss_window: Duration,
    poll_interval: Duration,
    peers: RwLock<HashMap<ClusterId, Peer>>,
}

impl Receiver {
    pub(crate) fn new(
        conn: Arc<UdpSocket>,
        buffer_size: usize,
        loss_window: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            conn,
            buffer_size,
            loss_window,
            poll_interval,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a peer. Fails with [`Error::DuplicateSender`] if present.
    pub async fn init_peer(
        &self,
        cluster_id: ClusterId,
        callback: Arc<dyn UpdateCallback>,
    ) -> Result<()> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&cluster_id) {
            return Err(Error::DuplicateSender(cluster_id.0));
        }
        peers.insert(cluster_id, Peer::new(callback));
        Ok(())
    }

    pub async fn remove_peer(&self, cluster_id: &ClusterId) -> bool {
        self.peers.write().await.remove(cluster_id).is_some()
    }

    pub async fn latency(&self, cluster_id: &ClusterId) -> Result<Duration> {
        let peers = self.peers.read().await;
        peers
            .get(cluster_id)
            .map(Peer::latency)
            .ok_or_else(|| Error::PeerNotFound(cluster_id.0.clone()))
    }

    pub async fn connected(&self, cluster_id: &ClusterId) -> Result<bool> {
        let peers = self.peers.read().await;
        peers
            .get(cluster_id)
            .map(Peer::connected)
            .ok_or_else(|| Error::PeerNotFound(cluster_id.0.clone()))
    }

    pub async fn peer_ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Echo a PING back to where it came from as a PONG
    pub async fn receive_ping(&self, msg: Msg, from: SocketAddr) -> Result<()> {
        let pong = msg.into_pong();
        let payload = serde_json::to_vec(&pong)?;
        self.conn.send_to(&payload, from).await?;
        trace!(cluster_id = %pong.cluster_id, %from, "Sent PONG");
        Ok(())
    }

    /// Apply a PONG to its peer, unless it is unknown or stale.
    ///
    /// Returns whether the peer state was updated.
    pub async fn receive_pong(&self, msg: &Msg, now: DateTime<Utc>) -> bool {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(&msg.cluster_id) else {
            debug!(cluster_id = %msg.cluster_id, "PONG from unknown peer, ignoring");
            return false;
        };
        if peer.is_stale(msg.timestamp) {
            debug!(cluster_id = %msg.cluster_id, "Stale PONG, ignoring");
            return false;
        }

        let latency = now
            .signed_duration_since(msg.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !peer.connected {
            info!(cluster_id = %msg.cluster_id, latency_ms = latency.as_millis() as u64, "Peer connected");
        }
        peer.connected = true;
        peer.latency = latency;
        peer.last_received = Some(msg.timestamp);

        if let Err(e) = peer.callback.on_update(true, latency, Some(now)) {
            error!(cluster_id = %msg.cluster_id, "Update callback failed: {}", e);
        }
        true
    }

    /// Mark every connected peer that has been silent for longer than the
    /// loss window as disconnected. Returns the IDs that changed state.
    pub async fn check_disconnections(&self, now: DateTime<Utc>) -> Vec<ClusterId> {
        let mut peers = self.peers.write().await;
        let mut changed = Vec::new();
        for (cluster_id, peer) in peers.iter_mut() {
            if !peer.connected || !peer.is_expired(now, self.loss_window) {
                continue;
            }
            warn!(
                cluster_id = %cluster_id,
                silent_for = ?peer.last_received.map(|t| now.signed_duration_since(t)),
                "Peer unreachable"
            );
            peer.connected = false;
            peer.latency = Duration::ZERO;
            if let Err(e) = peer.callback.on_update(false, Duration::ZERO, None) {
                error!(cluster_id = %cluster_id, "Update callback failed: {}", e);
            }
            changed.push(cluster_id.clone());
        }
        changed
    }

    /// Receive loop; returns when `shutdown` is cancelled.
    ///
    /// Socket and decoding errors are logged and never end the loop.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(addr = ?self.conn.local_addr().ok(), "Heartbeat receiver started");
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let (len, from) = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.conn.recv_from(&mut buffer) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Failed to read from heartbeat socket: {}", e);
                        continue;
                    }
                },
            };

            let msg: Msg = match serde_json::from_slice(&buffer[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(%from, len, "Dropping malformed heartbeat datagram: {}", e);
                    continue;
                }
            };

            match msg.msg_type {
                MsgType::Ping => {
                    if let Err(e) = self.receive_ping(msg, from).await {
                        warn!(%from, "Failed to answer PING: {}", e);
                    }
                }
                MsgType::Pong => {
                    self.receive_pong(&msg, Utc::now()).await;
                }
            }
        }

        info!("Heartbeat receiver stopped");
        Ok(())
    }

    /// Disconnect observer loop; returns when `shutdown` is cancelled.
    pub async fn run_disconnect_observer(&self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            poll_ms = self.poll_interval.as_millis() as u64,
            window_ms = self.loss_window.as_millis() as u64,
            "Disconnect observer started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_disconnections(Utc::now()).await;
                }
            }
        }
        Ok(())
    }
}
