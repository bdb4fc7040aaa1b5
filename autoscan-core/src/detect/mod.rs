//! Detection client abstraction.
//!
//! The `Detector` trait decouples the detection loop from any specific vision
//! backend (scripted replay, Gemini over HTTP, ...). A detector is stateless
//! request/response: one encoded frame in, one validated box list out. Retries
//! are never done here.
//!
//! `detect` returns a `'static` future so the loop can hand the request to its
//! own task. When a session stops mid-request the task is detached, completes
//! in the background, and its result is dropped on arrival.

pub mod stub;

#[cfg(feature = "cloud")]
pub mod gemini;

#[cfg(feature = "cloud")]
pub use gemini::{GeminiConfig, GeminiDetector};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capture::EncodedFrame;
use crate::error::DetectionError;

/// Object keys that may wrap the box array in a service response.
const WRAPPER_KEYS: &[&str] = &["cars", "vehicles", "boxes", "detections"];

/// One detected vehicle in frame-relative coordinates, each in `[0.0, 1.0]`.
///
/// `y_min <= y_max` and `x_min <= x_max` are expected but not enforced: the
/// service contract does not guarantee ordering, and an inverted box simply
/// yields a zero-or-negative-area rectangle downstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub y_min: f32,
    pub x_min: f32,
    pub y_max: f32,
    pub x_max: f32,
}

impl BoundingBox {
    pub fn new(y_min: f32, x_min: f32, y_max: f32, x_max: f32) -> Self {
        Self {
            y_min,
            x_min,
            y_max,
            x_max,
        }
    }

    /// Validate one raw service element: exactly four finite numbers in `[0, 1]`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let coords = value.as_array()?;
        if coords.len() != 4 {
            return None;
        }
        let mut out = [0f32; 4];
        for (slot, coord) in out.iter_mut().zip(coords) {
            let v = coord.as_f64()?;
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return None;
            }
            *slot = v as f32;
        }
        Some(Self::new(out[0], out[1], out[2], out[3]))
    }
}

/// Result of validating one service payload.
///
/// `Invalid` displays as zero detections but is kept apart from a genuine
/// empty `Valid(vec![])` so the loop can report it as a processing failure.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionResponse {
    Valid {
        boxes: Vec<BoundingBox>,
        /// Elements dropped by per-box validation.
        dropped: usize,
    },
    Invalid {
        reason: String,
    },
}

impl DetectionResponse {
    pub fn valid(boxes: Vec<BoundingBox>) -> Self {
        DetectionResponse::Valid { boxes, dropped: 0 }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        DetectionResponse::Invalid {
            reason: reason.into(),
        }
    }

    /// Boxes to display. Empty for an invalid payload.
    pub fn boxes(&self) -> &[BoundingBox] {
        match self {
            DetectionResponse::Valid { boxes, .. } => boxes,
            DetectionResponse::Invalid { .. } => &[],
        }
    }

    pub fn count(&self) -> usize {
        self.boxes().len()
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, DetectionResponse::Valid { .. })
    }
}

/// Validate a decoded service payload.
///
/// Accepts a bare array of boxes, or an object wrapping that array under one
/// of `cars`, `vehicles`, `boxes`, `detections`. Malformed boxes are dropped
/// one by one; only a missing or non-array result invalidates the payload.
pub fn parse_detections(payload: &Value) -> DetectionResponse {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(map) => match WRAPPER_KEYS.iter().find_map(|k| map.get(*k)) {
            Some(Value::Array(items)) => items,
            Some(_) => return DetectionResponse::invalid("wrapped result is not an array"),
            None => return DetectionResponse::invalid("no box array in response object"),
        },
        Value::Null => return DetectionResponse::invalid("empty response"),
        _ => return DetectionResponse::invalid("response is neither array nor object"),
    };

    let boxes: Vec<BoundingBox> = items.iter().filter_map(BoundingBox::from_value).collect();
    let dropped = items.len() - boxes.len();
    DetectionResponse::Valid { boxes, dropped }
}

/// Parse a raw JSON text payload. Unparseable text is an `Invalid` response.
pub fn parse_detections_text(text: &str) -> DetectionResponse {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return DetectionResponse::invalid("empty response text");
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => parse_detections(&value),
        Err(e) => DetectionResponse::invalid(format!("response is not JSON: {e}")),
    }
}

/// Future returned by [`Detector::detect`].
pub type DetectFuture =
    Pin<Box<dyn Future<Output = Result<DetectionResponse, DetectionError>> + Send + 'static>>;

/// Contract for vision detection backends.
pub trait Detector: Send + Sync + 'static {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Send one encoded frame and validate the response.
    ///
    /// # Errors
    /// `DetectionError` on any transport, status or service failure.
    fn detect(&self, frame: EncodedFrame) -> DetectFuture;
}

/// Thread-safe reference-counted handle to any `Detector` implementor.
#[derive(Clone)]
pub struct DetectorHandle(pub Arc<dyn Detector>);

impl DetectorHandle {
    /// Wrap any `Detector` in a `DetectorHandle`.
    pub fn new<D: Detector>(detector: D) -> Self {
        Self(Arc::new(detector))
    }

    pub fn detect(&self, frame: EncodedFrame) -> DetectFuture {
        self.0.detect(frame)
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }
}

impl std::fmt::Debug for DetectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorHandle")
            .field("backend", &self.0.name())
            .finish_non_exhaustive()
    }
}
