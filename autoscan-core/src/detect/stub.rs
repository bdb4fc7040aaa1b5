//! `ScriptedDetector`: replay backend that needs no network.
//!
//! Used by tests and by the app's offline mode. Replays a fixed script of
//! responses in order, looping when `repeat` is set, so the full loop and UI
//! path can be exercised end-to-end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::capture::EncodedFrame;
use crate::detect::{BoundingBox, DetectFuture, DetectionResponse, Detector};
use crate::error::DetectionError;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(DetectionResponse),
    Fail(DetectionError),
}

impl ScriptStep {
    pub fn boxes(boxes: Vec<BoundingBox>) -> Self {
        ScriptStep::Respond(DetectionResponse::valid(boxes))
    }

    pub fn fail(message: &str) -> Self {
        ScriptStep::Fail(DetectionError::Transport(message.into()))
    }
}

/// Detector that replays a script with an optional artificial latency.
pub struct ScriptedDetector {
    script: Vec<ScriptStep>,
    cursor: Mutex<usize>,
    repeat: bool,
    latency: Duration,
    /// Requests currently awaiting their reply.
    in_flight: Arc<AtomicUsize>,
    /// Highest number of simultaneous requests observed.
    peak_in_flight: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedDetector {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            cursor: Mutex::new(0),
            repeat: false,
            latency: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Loop back to the first step once the script runs out.
    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shared counter of total `detect` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Shared high-water mark of concurrently outstanding requests.
    pub fn peak_in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak_in_flight)
    }

    fn next_step(&self) -> ScriptStep {
        let mut cursor = self.cursor.lock();
        if self.script.is_empty() {
            return ScriptStep::Respond(DetectionResponse::valid(vec![]));
        }
        let idx = if self.repeat {
            *cursor % self.script.len()
        } else {
            (*cursor).min(self.script.len() - 1)
        };
        *cursor += 1;
        self.script[idx].clone()
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&self, frame: EncodedFrame) -> DetectFuture {
        let step = self.next_step();
        let latency = self.latency;
        let in_flight = Arc::clone(&self.in_flight);
        let peak = Arc::clone(&self.peak_in_flight);
        self.calls.fetch_add(1, Ordering::SeqCst);

        Box::pin(async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            debug!(
                width = frame.width,
                height = frame.height,
                bytes = frame.jpeg.len(),
                "ScriptedDetector::detect"
            );
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
            match step {
                ScriptStep::Respond(response) => Ok(response),
                ScriptStep::Fail(err) => Err(err),
            }
        })
    }
}
