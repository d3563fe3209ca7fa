//! Per-cluster liveness state

use crate::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Receives connectivity changes of one peer.
///
/// Invoked with `(true, latency, Some(now))` on every accepted PONG and with
/// `(false, ZERO, None)` when the peer is declared unreachable. Implemented
/// for any `Fn(bool, Duration, Option<DateTime<Utc>>) -> Result<()>`.
pub trait UpdateCallback: Send + Sync {
    fn on_update(
        &self,
        connected: bool,
        latency: Duration,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

impl<F> UpdateCallback for F
where
    F: Fn(bool, Duration, Option<DateTime<Utc>>) -> Result<()> + Send + Sync,
{
    fn on_update(
        &self,
        connected: bool,
        latency: Duration,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self(connected, latency, timestamp)
    }
}

/// Liveness record of a remote cluster, owned by the receiver
pub struct Peer {
    pub(crate) connected: bool,
    pub(crate) latency: Duration,
    pub(crate) last_received: Option<DateTime<Utc>>,
    pub(crate) callback: Arc<dyn UpdateCallback>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("connected", &self.connected)
            .field("latency", &self.latency)
            .field("last_received", &self.last_received)
            .field("callback", &"<UpdateCallback>")
            .finish()
    }
}

impl Peer {
    pub fn new(callback: Arc<dyn UpdateCallback>) -> Self {
        Self {
            connected: false,
            latency: Duration::ZERO,
            last_received: None,
            callback,
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        self.last_received
    }

    /// A PONG carrying a timestamp older than the last accepted one is stale
    pub(crate) fn is_stale(&self, timestamp: DateTime<Utc>) -> bool {
        matches!(self.last_received, Some(last) if timestamp < last)
    }

    /// True once `now` is past the last accepted probe, plus its latency,
    /// plus the loss window.
    pub(crate) fn is_expired(&self, now: DateTime<Utc>, loss_window: Duration) -> bool {
        let Some(last) = self.last_received else {
            return true;
        };
        let seen = last + to_chrono(self.latency);
        now.signed_duration_since(seen) > to_chrono(loss_window)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
