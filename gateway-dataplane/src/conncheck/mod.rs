//! Connectivity checker for the tunnels towards remote gateways
//!
//! Every remote cluster gets a [`Sender`] that periodically emits PINGs
//! through a UDP socket shared with the [`Receiver`]. The remote receiver
//! echoes them back as PONGs carrying the original timestamp, which yields
//! the round trip latency without clock synchronisation. A disconnect
//! observer flags peers that stop answering.
//!
//! Locking: the sender map is guarded by the checker, the peer map by the
//! receiver. When both are needed they are always taken checker first.

mod msg;
mod peer;
mod receiver;
mod sender;

pub use msg::{Msg, MsgType};
pub use peer::{Peer, UpdateCallback};
pub use receiver::Receiver;
pub use sender::Sender;

use crate::config::ConnCheckConfig;
use crate::{ClusterId, Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct SenderState {
    senders: HashMap<ClusterId, Sender>,
    /// Running ping loops, keyed to the run that owns the guard
    running: HashMap<ClusterId, u64>,
    next_run: u64,
}

/// A claimed ping loop of one sender
#[derive(Debug)]
struct SenderRun {
    id: u64,
    remote: SocketAddr,
    token: CancellationToken,
}

/// Owns the shared socket, the receiver, and one sender per remote cluster
#[derive(Debug)]
pub struct ConnChecker {
    config: ConnCheckConfig,
    conn: Arc<UdpSocket>,
    receiver: Arc<Receiver>,
    state: Mutex<SenderState>,
    shutdown: CancellationToken,
}

impl ConnChecker {
    /// Bind the shared heartbeat socket on `bind_ip:ping_port`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ConnCheckConfig) -> Result<Self> {
        config.validate()?;

        let addr = SocketAddr::new(config.bind_ip, config.ping_port);
        let conn = Arc::new(bind_udp(addr).map_err(|e| {
            Error::Network(format!("Failed to bind heartbeat socket on {}: {}", addr, e))
        })?);
        info!("Heartbeat socket bound on {}", conn.local_addr()?);

        let receiver = Arc::new(Receiver::new(
            conn.clone(),
            config.ping_buffer_size,
            config.loss_window(),
            config.disconnect_poll_interval(),
        ));

        Ok(Self {
            config,
            conn,
            receiver,
            state: Mutex::new(SenderState::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.conn.local_addr()?)
    }

    pub fn config(&self) -> &ConnCheckConfig {
        &self.config
    }

    pub fn receiver(&self) -> &Arc<Receiver> {
        &self.receiver
    }

    /// Register a sender and its peer towards `ip` on the configured port.
    ///
    /// Returns [`Error::DuplicateSender`] if the cluster is already known.
    pub async fn add_sender(
        &self,
        cluster_id: impl Into<ClusterId>,
        ip: IpAddr,
        callback: Arc<dyn UpdateCallback>,
    ) -> Result<()> {
        let remote = SocketAddr::new(ip, self.config.ping_port);
        self.add_sender_with_addr(cluster_id, remote, callback).await
    }

    /// Like [`ConnChecker::add_sender`] with an explicit remote port
    pub async fn add_sender_with_addr(
        &self,
        cluster_id: impl Into<ClusterId>,
        remote: SocketAddr,
        callback: Arc<dyn UpdateCallback>,
    ) -> Result<()> {
        let cluster_id = cluster_id.into();
        let mut state = self.state.lock().await;
        if state.senders.contains_key(&cluster_id) {
            return Err(Error::DuplicateSender(cluster_id.0));
        }

        self.receiver.init_peer(cluster_id.clone(), callback).await?;
        let sender = Sender::new(cluster_id.clone(), remote, self.shutdown.child_token());
        state.senders.insert(cluster_id.clone(), sender);

        info!(cluster_id = %cluster_id, %remote, "Added heartbeat sender");
        Ok(())
    }

    /// Ping the cluster until its sender is stopped. Blocking; meant to run
    /// as a background task.
    pub async fn run_sender(&self, cluster_id: &ClusterId) -> Result<()> {
        let run = self.claim_sender(cluster_id).await?;
        sender::ping_loop(
            self.conn.clone(),
            cluster_id.clone(),
            run.remote,
            self.config.ping_interval(),
            run.token,
        )
        .await;
        self.release_sender(cluster_id, run.id).await;
        Ok(())
    }

    async fn claim_sender(&self, cluster_id: &ClusterId) -> Result<SenderRun> {
        let mut state = self.state.lock().await;
        let sender = state
            .senders
            .get(cluster_id)
            .ok_or_else(|| Error::PeerNotFound(cluster_id.0.clone()))?;
        let (remote, token) = (sender.remote, sender.token.clone());
        if state.running.contains_key(cluster_id) {
            return Err(Error::SenderAlreadyRunning(cluster_id.0.clone()));
        }

        state.next_run += 1;
        let id = state.next_run;
        state.running.insert(cluster_id.clone(), id);
        Ok(SenderRun { id, remote, token })
    }

    /// Drop the running guard, unless a newer run of a re-added sender
    /// owns it by now
    async fn release_sender(&self, cluster_id: &ClusterId, run: u64) {
        let mut state = self.state.lock().await;
        if state.running.get(cluster_id) == Some(&run) {
            state.running.remove(cluster_id);
        }
    }

    /// Spawn [`ConnChecker::run_sender`] as a task owned by the checker; it
    /// is joined by [`ConnChecker::del_and_stop_sender`].
    pub async fn start_sender(self: &Arc<Self>, cluster_id: &ClusterId) -> Result<()> {
        let mut state = self.state.lock().await;
        let sender = state
            .senders
            .get_mut(cluster_id)
            .ok_or_else(|| Error::PeerNotFound(cluster_id.0.clone()))?;
        if sender.task.is_some() {
            return Err(Error::SenderAlreadyRunning(cluster_id.0.clone()));
        }

        let checker = Arc::clone(self);
        let id = cluster_id.clone();
        sender.task = Some(tokio::spawn(async move { checker.run_sender(&id).await }));
        Ok(())
    }

    /// Stop the sender and forget the peer. Unknown IDs are a no-op.
    pub async fn del_and_stop_sender(&self, cluster_id: &ClusterId) -> Result<()> {
        let task = {
            let mut state = self.state.lock().await;
            if let Some(sender) = state.senders.get(cluster_id) {
                sender.token.cancel();
            }
            let removed = state.senders.remove(cluster_id);
            state.running.remove(cluster_id);
            self.receiver.remove_peer(cluster_id).await;

            match removed {
                Some(mut sender) => sender.task.take(),
                None => {
                    debug!(cluster_id = %cluster_id, "No sender to stop");
                    return Ok(());
                }
            }
        };

        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(cluster_id = %cluster_id, "Sender ended with error: {}", e),
                Err(e) => error!(cluster_id = %cluster_id, "Sender task failed: {}", e),
            }
        }
        info!(cluster_id = %cluster_id, "Stopped heartbeat sender");
        Ok(())
    }

    pub async fn get_latency(&self, cluster_id: &ClusterId) -> Result<Duration> {
        self.receiver.latency(cluster_id).await
    }

    pub async fn get_connected(&self, cluster_id: &ClusterId) -> Result<bool> {
        self.receiver.connected(cluster_id).await
    }

    /// Registered cluster IDs, sorted
    pub async fn peers(&self) -> Vec<ClusterId> {
        let state = self.state.lock().await;
        let mut ids: Vec<ClusterId> = state.senders.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Receive loop bound to the checker lifetime
    pub async fn run_receiver(&self) -> Result<()> {
        self.receiver.run(self.shutdown.clone()).await
    }

    /// Disconnect observer bound to the checker lifetime
    pub async fn run_receiver_disconnect_observer(&self) -> Result<()> {
        self.receiver
            .run_disconnect_observer(self.shutdown.clone())
            .await
    }

    /// Run the receiver and the disconnect observer until shutdown
    pub async fn run(&self) -> Result<()> {
        tokio::select! {
            result = self.run_receiver() => {
                debug!("Receiver ended: {:?}", result);
                result
            }
            result = self.run_receiver_disconnect_observer() => {
                debug!("Disconnect observer ended: {:?}", result);
                result
            }
        }
    }

    /// Cancel the receiver, the observer and every sender
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config() -> ConnCheckConfig {
        ConnCheckConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ping_port: 0,
            ping_interval_ms: 50,
            ping_loss_threshold: 3,
            ..Default::default()
        }
    }

    fn ignore(_: bool, _: Duration, _: Option<chrono::DateTime<chrono::Utc>>) -> Result<()> {
        Ok(())
    }

    fn noop() -> Arc<dyn UpdateCallback> {
        Arc::new(ignore)
    }

    #[tokio::test]
    async fn test_add_sender_twice_is_duplicate() {
        let checker = ConnChecker::new(test_config()).unwrap();
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        checker.add_sender("cluster-b", ip, noop()).await.unwrap();
        let err = checker.add_sender("cluster-b", ip, noop()).await.unwrap_err();

        assert!(err.is_duplicate());
        assert_eq!(checker.peers().await, vec![ClusterId::from("cluster-b")]);
    }

    #[tokio::test]
    async fn test_lookups_on_unknown_cluster() {
        let checker = ConnChecker::new(test_config()).unwrap();
        let id = ClusterId::from("nope");

        assert!(matches!(checker.get_latency(&id).await, Err(Error::PeerNotFound(_))));
        assert!(matches!(checker.get_connected(&id).await, Err(Error::PeerNotFound(_))));
        assert!(matches!(checker.run_sender(&id).await, Err(Error::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_new_peer_starts_disconnected() {
        let checker = ConnChecker::new(test_config()).unwrap();
        let id = ClusterId::from("cluster-b");
        checker
            .add_sender(id.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), noop())
            .await
            .unwrap();

        assert!(!checker.get_connected(&id).await.unwrap());
        assert_eq!(checker.get_latency(&id).await.unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_second_run_sender_is_rejected() {
        let checker = Arc::new(ConnChecker::new(test_config()).unwrap());
        let id = ClusterId::from("cluster-b");
        checker
            .add_sender(id.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), noop())
            .await
            .unwrap();

        checker.start_sender(&id).await.unwrap();
        assert!(matches!(
            checker.start_sender(&id).await,
            Err(Error::SenderAlreadyRunning(_))
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            checker.run_sender(&id).await,
            Err(Error::SenderAlreadyRunning(_))
        ));

        checker.del_and_stop_sender(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_del_and_stop_sender() {
        let checker = Arc::new(ConnChecker::new(test_config()).unwrap());
        let id = ClusterId::from("cluster-b");
        checker
            .add_sender(id.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), noop())
            .await
            .unwrap();
        checker.start_sender(&id).await.unwrap();

        checker.del_and_stop_sender(&id).await.unwrap();
        assert!(checker.peers().await.is_empty());
        assert!(checker.get_connected(&id).await.is_err());

        // Idempotent, and the ID can be registered again.
        checker.del_and_stop_sender(&id).await.unwrap();
        checker
            .add_sender(id.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), noop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops() {
        let checker = Arc::new(ConnChecker::new(test_config()).unwrap());
        let id = ClusterId::from("cluster-b");
        checker
            .add_sender(id.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), noop())
            .await
            .unwrap();

        let runner = tokio::spawn({
            let checker = checker.clone();
            async move { checker.run().await }
        });
        let sender = tokio::spawn({
            let checker = checker.clone();
            let id = id.clone();
            async move { checker.run_sender(&id).await }
        });

        checker.shutdown();
        let timeout = Duration::from_secs(2);
        assert!(tokio::time::timeout(timeout, runner).await.unwrap().unwrap().is_ok());
        assert!(tokio::time::timeout(timeout, sender).await.unwrap().unwrap().is_ok());
        assert!(checker.is_shutdown());
    }

    #[tokio::test]
    async fn test_stopped_loop_keeps_guard_of_readded_sender() {
        let checker = Arc::new(ConnChecker::new(test_config()).unwrap());
        let id = ClusterId::from("cluster-b");
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        checker.add_sender(id.clone(), ip, noop()).await.unwrap();

        let old = tokio::spawn({
            let checker = checker.clone();
            let id = id.clone();
            async move { checker.run_sender(&id).await }
        });
        while !checker.state.lock().await.running.contains_key(&id) {
            tokio::task::yield_now().await;
        }

        // Deleted and re-added before the old loop observes its cancellation
        checker.del_and_stop_sender(&id).await.unwrap();
        checker.add_sender(id.clone(), ip, noop()).await.unwrap();
        let run = checker.claim_sender(&id).await.unwrap();
        old.await.unwrap().unwrap();

        assert!(matches!(
            checker.run_sender(&id).await,
            Err(Error::SenderAlreadyRunning(_))
        ));
        checker.release_sender(&id, run.id).await;
        assert!(checker.state.lock().await.running.is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        // TEST-NET-1, never assigned to a local interface
        let config = ConnCheckConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            ..test_config()
        };
        assert!(matches!(ConnChecker::new(config), Err(Error::Network(_))));
    }
}
