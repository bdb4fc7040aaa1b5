//! Events broadcast by [`AutoscanEngine`](crate::AutoscanEngine).
//!
//! ## Channels
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `CountEvent` | `subscribe_counts()` |
//! | `EngineStatusEvent` | `subscribe_status()` |
//! | `ActivityEvent` | `subscribe_activity()` |
//! | `PresenceEvent` | built by the host from `PresenceSync::subscribe()` |

use serde::{Deserialize, Serialize};

use crate::detect::BoundingBox;
use crate::overlay::PixelRect;
use crate::presence::PresenceSnapshot;

// ---------------------------------------------------------------------------
// Count events
// ---------------------------------------------------------------------------

/// Emitted once per completed detection cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Session number; increments on every successful `start()`.
    pub session: u64,
    /// Displayed count. Zero for invalid and failed cycles.
    pub count: usize,
    pub outcome: CycleOutcomeKind,
    /// Boxes in normalised frame coordinates.
    pub boxes: Vec<BoundingBox>,
    /// The same boxes scaled to the frame's pixel size.
    pub rects: Vec<PixelRect>,
    /// Failure or invalid-payload reason, if any.
    pub detail: Option<String>,
}

/// How a cycle resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcomeKind {
    /// Well-formed result, possibly empty.
    Detected,
    /// Response arrived but was not a usable detection list.
    Invalid,
    /// Request failed (transport, status, or service error).
    Failed,
}

// ---------------------------------------------------------------------------
// Activity events
// ---------------------------------------------------------------------------

/// Emitted when a detection request is dispatched and when it resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub seq: u64,
    /// `true` while a request is in flight.
    pub detecting: bool,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Human-readable detail; the user-facing banner text on `Error`.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Acquiring the camera.
    Starting,
    /// Camera live and the detection loop running.
    Running,
    /// Session ended; engine may be restarted.
    Stopped,
    /// Camera acquisition failed; engine may be restarted.
    Error,
}

// ---------------------------------------------------------------------------
// Presence events
// ---------------------------------------------------------------------------

/// Aggregate view across all devices sharing a presence store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub aggregate: usize,
    pub devices: Vec<PresenceDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceDevice {
    pub device_id: String,
    pub display_name: String,
    pub count: usize,
}

impl From<&PresenceSnapshot> for PresenceEvent {
    fn from(snapshot: &PresenceSnapshot) -> Self {
        Self {
            aggregate: snapshot.aggregate_count(),
            devices: snapshot
                .devices()
                .into_iter()
                .map(|(device_id, display_name, count)| PresenceDevice {
                    device_id,
                    display_name,
                    count,
                })
                .collect(),
        }
    }
}
