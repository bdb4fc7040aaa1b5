//! In-process presence store.
//!
//! `LocalPresenceHub` is a shared table that several [`HubSession`]s write
//! into, one per device. A session's key is removed when it disconnects or is
//! dropped, the in-process equivalent of a store-side remove-on-disconnect
//! rule.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::presence::{PeerEntry, PresenceSnapshot, PresenceSync, DEFAULT_PEER_TTL_SECS};

const SNAPSHOT_CAP: usize = 64;

#[derive(Clone)]
pub struct LocalPresenceHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    table: RwLock<PresenceSnapshot>,
    tx: broadcast::Sender<PresenceSnapshot>,
    ttl: ChronoDuration,
}

impl Default for LocalPresenceHub {
    fn default() -> Self {
        Self::new(ChronoDuration::seconds(DEFAULT_PEER_TTL_SECS))
    }
}

impl LocalPresenceHub {
    pub fn new(ttl: ChronoDuration) -> Self {
        let (tx, _) = broadcast::channel(SNAPSHOT_CAP);
        Self {
            inner: Arc::new(HubInner {
                table: RwLock::new(PresenceSnapshot::default()),
                tx,
                ttl,
            }),
        }
    }

    /// Register a device. Its entry appears on the first `publish`.
    pub fn connect(&self, device_id: impl Into<String>, display_name: impl Into<String>) -> HubSession {
        HubSession {
            hub: self.clone(),
            device_id: device_id.into(),
            display_name: display_name.into(),
            connected: AtomicBool::new(true),
        }
    }

    /// Fresh view with stale peers removed.
    pub fn snapshot(&self) -> PresenceSnapshot {
        let mut snap = self.inner.table.read().clone();
        snap.prune_stale(Utc::now(), self.inner.ttl);
        snap
    }

    fn upsert(&self, device_id: &str, entry: PeerEntry) {
        self.inner.table.write().peers.insert(device_id.to_string(), entry);
        self.broadcast();
    }

    fn remove(&self, device_id: &str) {
        let removed = self.inner.table.write().peers.remove(device_id).is_some();
        if removed {
            self.broadcast();
        }
    }

    fn broadcast(&self) {
        let _ = self.inner.tx.send(self.snapshot());
    }
}

/// One device's connection to a [`LocalPresenceHub`].
pub struct HubSession {
    hub: LocalPresenceHub,
    device_id: String,
    display_name: String,
    connected: AtomicBool,
}

impl PresenceSync for HubSession {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn publish(&self, count: usize) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        self.hub.upsert(
            &self.device_id,
            PeerEntry {
                count,
                display_name: self.display_name.clone(),
                last_seen: Utc::now(),
            },
        );
    }

    fn snapshot(&self) -> PresenceSnapshot {
        self.hub.snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<PresenceSnapshot> {
        self.hub.inner.tx.subscribe()
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(device = %self.device_id, "presence session disconnected");
            self.hub.remove(&self.device_id);
        }
    }
}

impl Drop for HubSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_follows_publishes_and_disconnects() {
        let hub = LocalPresenceHub::default();
        let a = hub.connect("device-a", "Norte");
        let b = hub.connect("device-b", "Sur");

        a.publish(2);
        b.publish(3);
        assert_eq!(hub.snapshot().aggregate_count(), 5);

        a.publish(0);
        assert_eq!(b.snapshot().aggregate_count(), 3);

        b.disconnect();
        b.disconnect();
        assert_eq!(hub.snapshot().peers.len(), 1);

        b.publish(9);
        assert_eq!(hub.snapshot().aggregate_count(), 0);
    }

    #[test]
    fn dropping_a_session_removes_its_key() {
        let hub = LocalPresenceHub::default();
        {
            let a = hub.connect("device-a", "Norte");
            a.publish(4);
            assert_eq!(hub.snapshot().aggregate_count(), 4);
        }
        assert!(hub.snapshot().peers.is_empty());
    }

    #[test]
    fn subscribers_see_updates() {
        let hub = LocalPresenceHub::default();
        let a = hub.connect("device-a", "Norte");
        let mut rx = a.subscribe();
        a.publish(1);
        let snap = rx.try_recv().expect("snapshot broadcast");
        assert_eq!(snap.aggregate_count(), 1);
        assert_eq!(snap.peers["device-a"].display_name, "Norte");
    }
}
