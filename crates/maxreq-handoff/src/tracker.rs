//! In-flight connection tracking for drain coordination.
//!
//! Every accepted connection holds a [`ConnectionGuard`]. Dropping the guard
//! (handler finished, failed or panicked) removes the connection; the drain waits
//! for the registry to empty or for the drain timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::DrainError;
use crate::listener::PeerAddr;

/// How long the drain phase may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Wait for every connection, however long it takes.
    WaitForever,
    /// Give up after the duration and report the abandoned connections.
    Bounded(Duration),
}

impl DrainPolicy {
    /// `None` or a zero duration means wait forever.
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) if !timeout.is_zero() => DrainPolicy::Bounded(timeout),
            _ => DrainPolicy::WaitForever,
        }
    }
}

/// An in-flight connection, as reported when a drain is abandoned.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: PeerAddr,
    pub listener: String,
    pub accepted_at: Instant,
}

struct Inner {
    in_flight: DashMap<u64, ConnectionInfo>,
    next_id: AtomicU64,
    drained: Notify,
}

/// Registry of in-flight connections. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<Inner>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps its connection registered until dropped.
pub struct ConnectionGuard {
    id: u64,
    inner: Arc<Inner>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.id);
        if self.inner.in_flight.is_empty() {
            self.inner.drained.notify_waiters();
        }
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                in_flight: DashMap::new(),
                next_id: AtomicU64::new(1),
                drained: Notify::new(),
            }),
        }
    }

    /// Register a connection.
    pub fn track(&self, peer: PeerAddr, listener: &str) -> ConnectionGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.insert(
            id,
            ConnectionInfo {
                id,
                peer,
                listener: listener.to_string(),
                accepted_at: Instant::now(),
            },
        );
        ConnectionGuard {
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Snapshot of the in-flight connections, oldest first.
    pub fn in_flight(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> =
            self.inner.in_flight.iter().map(|entry| entry.value().clone()).collect();
        connections.sort_by_key(|c| c.id);
        connections
    }

    /// Wait for all connections to complete, bounded by `policy`.
    pub async fn drain(&self, policy: DrainPolicy) -> Result<(), DrainError> {
        let active = self.active_connections();
        if active == 0 {
            info!("No active connections, drain complete");
            return Ok(());
        }

        match policy {
            DrainPolicy::WaitForever => {
                info!(active_connections = active, "Draining active connections (no timeout)");
                self.wait_for_drain().await;
                info!("All connections drained cleanly");
                Ok(())
            }
            DrainPolicy::Bounded(timeout) => {
                info!(
                    active_connections = active,
                    timeout_secs = timeout.as_secs_f64(),
                    "Draining active connections"
                );
                tokio::select! {
                    _ = self.wait_for_drain() => {
                        info!("All connections drained cleanly");
                        Ok(())
                    }
                    _ = tokio::time::sleep(timeout) => {
                        let abandoned = self.in_flight();
                        for connection in &abandoned {
                            warn!(
                                id = connection.id,
                                peer = %connection.peer,
                                listener = %connection.listener,
                                age_ms = connection.accepted_at.elapsed().as_millis() as u64,
                                "Abandoning connection at drain timeout"
                            );
                        }
                        Err(DrainError::Timeout { timeout, abandoned })
                    }
                }
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            // Register interest before checking, so a guard dropped in between
            // cannot slip its notification past us.
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerAddr {
        PeerAddr::Tcp("127.0.0.1:4000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_graceful_drain() {
        let tracker = ConnectionTracker::new();

        let guard1 = tracker.track(peer(), "listen-0");
        let guard2 = tracker.track(peer(), "listen-0");
        assert_eq!(tracker.active_connections(), 2);
        assert_ne!(guard1.id(), guard2.id());

        drop(guard1);
        assert_eq!(tracker.active_connections(), 1);

        drop(guard2);
        assert_eq!(tracker.active_connections(), 0);

        tracker.drain(DrainPolicy::Bounded(Duration::from_secs(5))).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_guards() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(peer(), "listen-0");

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(guard);
        });

        let started = Instant::now();
        tracker.drain(DrainPolicy::WaitForever).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_timeout_reports_abandoned() {
        let tracker = ConnectionTracker::new();

        drop(tracker.track(peer(), "listen-0"));
        let stuck = tracker.track(peer(), "listen-1");

        let err = tracker
            .drain(DrainPolicy::Bounded(Duration::from_millis(100)))
            .await
            .unwrap_err();
        let DrainError::Timeout { abandoned, .. } = err;
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].id, stuck.id());
        assert_eq!(abandoned[0].listener, "listen-1");
        assert_eq!(tracker.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_guard_counting() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_connections(), 0);

        let mut guards: Vec<_> = (0..10).map(|_| tracker.track(peer(), "listen-0")).collect();
        assert_eq!(tracker.active_connections(), 10);

        guards.truncate(5);
        assert_eq!(tracker.active_connections(), 5);

        drop(guards);
        assert_eq!(tracker.active_connections(), 0);
    }

    #[test]
    fn test_policy_from_timeout() {
        assert_eq!(DrainPolicy::from_timeout(None), DrainPolicy::WaitForever);
        assert_eq!(DrainPolicy::from_timeout(Some(Duration::ZERO)), DrainPolicy::WaitForever);
        assert_eq!(
            DrainPolicy::from_timeout(Some(Duration::from_secs(3))),
            DrainPolicy::Bounded(Duration::from_secs(3))
        );
    }
}
