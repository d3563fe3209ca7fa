//! Two checkers exchanging heartbeats over loopback

use chrono::{DateTime, Utc};
use gateway_dataplane::config::ConnCheckConfig;
use gateway_dataplane::conncheck::{ConnChecker, UpdateCallback};
use gateway_dataplane::{ClusterId, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn loopback_config() -> ConnCheckConfig {
    ConnCheckConfig {
        bind_ip: "127.0.0.1".parse().unwrap(),
        ping_port: 0,
        ping_interval_ms: 50,
        ping_loss_threshold: 3,
        ..Default::default()
    }
}

fn channel_callback() -> (Arc<dyn UpdateCallback>, mpsc::UnboundedReceiver<(bool, Duration)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: Arc<dyn UpdateCallback> = Arc::new(
        move |connected: bool, latency: Duration, _: Option<DateTime<Utc>>| -> Result<()> {
            let _ = tx.send((connected, latency));
            Ok(())
        },
    );
    (callback, rx)
}

async fn next_state(rx: &mut mpsc::UnboundedReceiver<(bool, Duration)>, connected: bool) -> Duration {
    timeout(Duration::from_secs(5), async {
        loop {
            let (state, latency) = rx.recv().await.expect("callback channel closed");
            if state == connected {
                return latency;
            }
        }
    })
    .await
    .expect("peer state did not change in time")
}

#[tokio::test]
async fn test_heartbeat_connects_then_detects_loss() {
    let a = Arc::new(ConnChecker::new(loopback_config()).unwrap());
    let b = Arc::new(ConnChecker::new(loopback_config()).unwrap());
    let cluster_b = ClusterId::from("cluster-b");

    let (callback, mut rx) = channel_callback();
    a.add_sender_with_addr(cluster_b.clone(), b.local_addr().unwrap(), callback)
        .await
        .unwrap();
    a.start_sender(&cluster_b).await.unwrap();

    let a_loop = tokio::spawn({
        let a = a.clone();
        async move { a.run().await }
    });
    let b_loop = tokio::spawn({
        let b = b.clone();
        async move { b.run().await }
    });

    let latency = next_state(&mut rx, true).await;
    assert!(latency < Duration::from_secs(1));
    assert!(a.get_connected(&cluster_b).await.unwrap());

    // B stops answering
    b.shutdown();
    b_loop.await.unwrap().unwrap();

    next_state(&mut rx, false).await;
    assert!(!a.get_connected(&cluster_b).await.unwrap());
    assert_eq!(a.get_latency(&cluster_b).await.unwrap(), Duration::ZERO);

    a.del_and_stop_sender(&cluster_b).await.unwrap();
    assert!(a.peers().await.is_empty());
    a.shutdown();
    a_loop.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_peer_without_answers_never_connects() {
    let a = Arc::new(ConnChecker::new(loopback_config()).unwrap());
    // Bound but never running its receiver
    let silent = ConnChecker::new(loopback_config()).unwrap();
    let cluster = ClusterId::from("silent");

    let (callback, mut rx) = channel_callback();
    a.add_sender_with_addr(cluster.clone(), silent.local_addr().unwrap(), callback)
        .await
        .unwrap();
    a.start_sender(&cluster).await.unwrap();
    let a_loop = tokio::spawn({
        let a = a.clone();
        async move { a.run().await }
    });

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(rx.try_recv().is_err());
    assert!(!a.get_connected(&cluster).await.unwrap());

    a.shutdown();
    a_loop.await.unwrap().unwrap();
    a.del_and_stop_sender(&cluster).await.unwrap();
}
