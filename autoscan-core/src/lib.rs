//! # autoscan-core
//!
//! Real-time vehicle counting engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Camera → FrameSource ─(JPEG)─► Detection loop (tokio task per session)
//!                                     │
//!                               Detector::detect  (own task, detachable)
//!                                     │
//!              ┌──────────────┬───────┴────────┬───────────────┐
//!      OverlayRenderer    Announcer    broadcast::Sender   PresenceSync
//!       (RGBA layer)    (drop if busy)   <CountEvent>    (fire-and-forget)
//! ```
//!
//! At most one detection request is outstanding per session. Per-cycle
//! failures are absorbed into a zero count; only camera acquisition errors
//! reach the caller.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod capture;
pub mod detect;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod overlay;
pub mod presence;
pub mod speech;

// Convenience re-exports for downstream crates
pub use capture::{Camera, CameraRequest, DirectoryCamera, FrameSource, SyntheticCamera};
pub use detect::{BoundingBox, DetectionResponse, Detector, DetectorHandle};
pub use engine::{AutoscanEngine, EngineConfig};
pub use error::{AutoscanError, DetectionError};
pub use ipc::events::{
    ActivityEvent, CountEvent, CycleOutcomeKind, EngineStatus, EngineStatusEvent, PresenceEvent,
};
pub use overlay::{OverlayFrame, OverlayRenderer, RgbaSurface, SurfaceHandle};
pub use presence::{LocalPresenceHub, PresenceSnapshot, PresenceSync};
pub use speech::{Announcer, CommandSpeaker, LogSpeaker, SpeechBackend, VoiceConfig};

#[cfg(feature = "cloud")]
pub use detect::{GeminiConfig, GeminiDetector};

#[cfg(feature = "cloud")]
pub use presence::{FirebaseConfig, FirebasePresence};

#[cfg(feature = "camera-v4l2")]
pub use capture::V4l2Camera;
