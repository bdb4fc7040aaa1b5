//! Firebase Realtime Database presence over its REST interface.
//!
//! Layout: `{database_url}/devices/{device_id}.json` holds one [`PeerEntry`].
//! Writes are spawned onto the runtime and never awaited by the caller. The
//! device list is polled on a fixed interval and cached; each poll that
//! succeeds replaces the cache and is broadcast to subscribers.
//!
//! REST has no server-side remove-on-disconnect, so the key is deleted on
//! `disconnect`/drop and peers that stop refreshing age out via the TTL.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{AutoscanError, Result};
use crate::presence::{PeerEntry, PresenceSnapshot, PresenceSync, DEFAULT_PEER_TTL_SECS};

const SNAPSHOT_CAP: usize = 64;

#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    /// e.g. `https://my-project-default-rtdb.firebaseio.com`
    pub database_url: String,
    /// Database secret or ID token appended as `?auth=`.
    pub auth: Option<String>,
    pub display_name: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub peer_ttl: ChronoDuration,
}

impl FirebaseConfig {
    pub fn new(database_url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            auth: None,
            display_name: display_name.into(),
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(5),
            peer_ttl: ChronoDuration::seconds(DEFAULT_PEER_TTL_SECS),
        }
    }

    fn collection_url(&self) -> String {
        self.with_auth(format!("{}/devices.json", self.base()))
    }

    fn device_url(&self, device_id: &str) -> String {
        self.with_auth(format!("{}/devices/{device_id}.json", self.base()))
    }

    fn base(&self) -> &str {
        self.database_url.trim_end_matches('/')
    }

    fn with_auth(&self, url: String) -> String {
        match self.auth.as_deref().filter(|a| !a.is_empty()) {
            Some(auth) => format!("{url}?auth={auth}"),
            None => url,
        }
    }
}

pub struct FirebasePresence {
    inner: Arc<Inner>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    client: reqwest::Client,
    config: FirebaseConfig,
    device_id: String,
    runtime: Handle,
    cache: RwLock<PresenceSnapshot>,
    tx: broadcast::Sender<PresenceSnapshot>,
    connected: AtomicBool,
}

impl FirebasePresence {
    /// Connect and start polling the device list.
    ///
    /// # Errors
    /// `AutoscanError::Presence` when called outside a tokio runtime or the
    /// HTTP client cannot be built.
    pub fn connect(config: FirebaseConfig, device_id: impl Into<String>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| AutoscanError::Presence(format!("no async runtime: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AutoscanError::Presence(format!("http client build failed: {e}")))?;
        let (tx, _) = broadcast::channel(SNAPSHOT_CAP);
        let inner = Arc::new(Inner {
            client,
            config,
            device_id: device_id.into(),
            runtime,
            cache: RwLock::new(PresenceSnapshot::default()),
            tx,
            connected: AtomicBool::new(true),
        });

        info!(
            device = %inner.device_id,
            url = %inner.config.database_url,
            "presence connected"
        );
        let poller = inner.runtime.spawn(poll_loop(inner.clone()));
        Ok(Self {
            inner,
            poller: Mutex::new(Some(poller)),
        })
    }
}

impl PresenceSync for FirebasePresence {
    fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    fn publish(&self, count: usize) {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return;
        }
        let entry = PeerEntry {
            count,
            display_name: self.inner.config.display_name.clone(),
            last_seen: Utc::now(),
        };
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let url = inner.config.device_url(&inner.device_id);
            match inner.client.put(&url).json(&entry).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(count, "presence published");
                }
                Ok(resp) => warn!(status = %resp.status(), "presence publish rejected"),
                Err(e) => warn!(error = %e, "presence publish failed"),
            }
        });
    }

    fn snapshot(&self) -> PresenceSnapshot {
        let mut snap = self.inner.cache.read().clone();
        snap.prune_stale(Utc::now(), self.inner.config.peer_ttl);
        snap
    }

    fn subscribe(&self) -> broadcast::Receiver<PresenceSnapshot> {
        self.inner.tx.subscribe()
    }

    fn disconnect(&self) {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let url = inner.config.device_url(&inner.device_id);
            if let Err(e) = inner.client.delete(&url).send().await {
                warn!(error = %e, "presence removal failed");
            }
        });
        info!(device = %self.inner.device_id, "presence disconnected");
    }
}

impl Drop for FirebasePresence {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn poll_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    while inner.connected.load(Ordering::SeqCst) {
        ticker.tick().await;
        let url = inner.config.collection_url();
        let payload = match inner.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<Value>().await,
            Ok(resp) => {
                warn!(status = %resp.status(), "presence poll rejected");
                continue;
            }
            Err(e) => {
                debug!(error = %e, "presence poll failed");
                continue;
            }
        };
        match payload {
            Ok(value) => {
                let mut snap = parse_devices(&value);
                snap.prune_stale(Utc::now(), inner.config.peer_ttl);
                *inner.cache.write() = snap.clone();
                let _ = inner.tx.send(snap);
            }
            Err(e) => warn!(error = %e, "presence payload undecodable"),
        }
    }
}

/// Decode the `devices` collection. `null` is an empty store; malformed
/// entries are skipped.
fn parse_devices(value: &Value) -> PresenceSnapshot {
    let mut snap = PresenceSnapshot::default();
    let Some(map) = value.as_object() else {
        return snap;
    };
    for (id, raw) in map {
        match serde_json::from_value::<PeerEntry>(raw.clone()) {
            Ok(entry) => {
                snap.peers.insert(id.clone(), entry);
            }
            Err(e) => debug!(device = %id, error = %e, "skipping malformed presence entry"),
        }
    }
    snap
}
