//! Multi-device presence.
//!
//! Each device publishes `{count, displayName, lastSeen}` under its own key
//! and observes the full key set to show an aggregate count. The store is an
//! external collaborator: the detection loop only calls `publish`, which must
//! return immediately whether or not the write succeeds.
//!
//! Connection lifecycle (subscribe, publish, remove-on-disconnect) is owned by
//! the presence implementation, independent of any camera session.

pub mod local;

#[cfg(feature = "cloud")]
pub mod firebase;

pub use local::{HubSession, LocalPresenceHub};

#[cfg(feature = "cloud")]
pub use firebase::{FirebaseConfig, FirebasePresence};

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Peers not seen for this long are left out of the aggregate.
pub const DEFAULT_PEER_TTL_SECS: i64 = 30;

/// One device's last published state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    pub count: usize,
    pub display_name: String,
    pub last_seen: DateTime<Utc>,
}

/// All known devices keyed by device id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub peers: BTreeMap<String, PeerEntry>,
}

impl PresenceSnapshot {
    /// Sum of every device's last count.
    pub fn aggregate_count(&self) -> usize {
        self.peers.values().map(|p| p.count).sum()
    }

    /// `(device_id, display_name, count)` in device-id order.
    pub fn devices(&self) -> Vec<(String, String, usize)> {
        self.peers
            .iter()
            .map(|(id, p)| (id.clone(), p.display_name.clone(), p.count))
            .collect()
    }

    /// Drop peers whose `last_seen` is older than `ttl` relative to `now`.
    pub fn prune_stale(&mut self, now: DateTime<Utc>, ttl: ChronoDuration) {
        self.peers.retain(|_, p| now.signed_duration_since(p.last_seen) <= ttl);
    }
}

/// Contract for shared presence stores.
pub trait PresenceSync: Send + Sync + 'static {
    /// This device's key.
    fn device_id(&self) -> &str;

    /// Publish the local count. Fire-and-forget: never blocks on the store.
    fn publish(&self, count: usize);

    /// Latest known view of all devices.
    fn snapshot(&self) -> PresenceSnapshot;

    /// Live snapshot updates.
    fn subscribe(&self) -> broadcast::Receiver<PresenceSnapshot>;

    /// Remove this device's key and stop observing. Idempotent.
    fn disconnect(&self);
}

/// Random device key: `device-` followed by 12 lowercase alphanumerics.
pub fn generate_device_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("device-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(count: usize, secs_ago: i64) -> PeerEntry {
        PeerEntry {
            count,
            display_name: format!("cam {count}"),
            last_seen: Utc::now() - ChronoDuration::seconds(secs_ago),
        }
    }

    #[test]
    fn aggregate_sums_all_peers() {
        let mut snap = PresenceSnapshot::default();
        snap.peers.insert("a".into(), entry(2, 0));
        snap.peers.insert("b".into(), entry(3, 0));
        assert_eq!(snap.aggregate_count(), 5);
        assert_eq!(snap.devices()[1].0, "b");
    }

    #[test]
    fn stale_peers_are_pruned() {
        let mut snap = PresenceSnapshot::default();
        snap.peers.insert("fresh".into(), entry(1, 1));
        snap.peers.insert("stale".into(), entry(4, 120));
        snap.prune_stale(Utc::now(), ChronoDuration::seconds(DEFAULT_PEER_TTL_SECS));
        assert_eq!(snap.aggregate_count(), 1);
        assert!(snap.peers.contains_key("fresh"));
    }

    #[test]
    fn device_ids_are_prefixed_and_distinct() {
        let a = generate_device_id();
        let b = generate_device_id();
        assert!(a.starts_with("device-"));
        assert_eq!(a.len(), "device-".len() + 12);
        assert!(a.chars().all(|c| !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn peer_entry_serializes_camel_case() {
        let json = serde_json::to_value(entry(2, 0)).expect("serialize");
        assert_eq!(json["count"], 2);
        assert!(json.get("displayName").is_some());
        assert!(json.get("lastSeen").is_some());
    }
}
