//! Frame capture.
//!
//! A [`Camera`] acquires a live stream for one session and hands back a
//! [`FrameSource`]. The loop only ever reads from the source: it polls the
//! stream state, asks for the current frame as a JPEG, and releases the
//! stream when the session ends.
//!
//! # Ownership
//!
//! The source lives in a [`StreamSlot`] shared by the engine and the loop
//! task. Whoever ends the session first takes it out of the slot and calls
//! `release()`; later releases find the slot empty and do nothing.

pub mod directory;
pub mod synthetic;

#[cfg(feature = "camera-v4l2")]
pub mod v4l2;

pub use directory::DirectoryCamera;
pub use synthetic::SyntheticCamera;

#[cfg(feature = "camera-v4l2")]
pub use v4l2::V4l2Camera;

use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Which physical camera to prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    /// Outward-facing (rear) camera.
    Environment,
    /// Front camera.
    User,
}

/// Acquisition request. Resolution is a hint; hardware decides the actual size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraRequest {
    pub facing: Facing,
    pub ideal_width: u32,
    pub ideal_height: u32,
    /// Always `false` for this application; kept so backends can assert it.
    pub audio: bool,
}

impl Default for CameraRequest {
    fn default() -> Self {
        Self {
            facing: Facing::Environment,
            ideal_width: 1280,
            ideal_height: 720,
            audio: false,
        }
    }
}

/// Playback state of an acquired stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Acquired, no frame available yet (metadata/playback pending).
    Loading,
    Playing,
    /// Stream ended or was released.
    Ended,
}

/// One still frame, JPEG-encoded at the frame's own resolution.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A live stream owned by one session.
pub trait FrameSource: Send + 'static {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Current playback state. May advance internal readiness bookkeeping.
    fn state(&mut self) -> StreamState;

    /// Encode the current frame. `Ok(None)` when the stream is not playing.
    ///
    /// Reading a frame must not advance or otherwise disturb the stream.
    fn current_frame(&mut self, quality: u8) -> Result<Option<EncodedFrame>>;

    /// Stop all underlying tracks. Idempotent.
    fn release(&mut self);
}

/// Acquisition entry point for a camera backend.
pub trait Camera: Send + Sync + 'static {
    /// Acquire a stream matching `request`.
    ///
    /// # Errors
    /// - `AutoscanError::CameraPermissionDenied` when access is refused.
    /// - `AutoscanError::NoMatchingCamera` when no device fits the request.
    /// - `AutoscanError::Camera` for any other hardware failure.
    fn open(&self, request: &CameraRequest) -> Result<Box<dyn FrameSource>>;
}

/// Shared, releasable home of a session's stream.
#[derive(Clone, Default)]
pub struct StreamSlot(Arc<Mutex<Option<Box<dyn FrameSource>>>>);

impl StreamSlot {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self(Arc::new(Mutex::new(Some(source))))
    }

    /// Run `f` against the source if it has not been released.
    pub fn with_source<T>(&self, f: impl FnOnce(&mut dyn FrameSource) -> T) -> Option<T> {
        let mut guard = self.0.lock();
        guard.as_mut().map(|source| f(source.as_mut()))
    }

    /// Release the stream. Returns `true` only for the call that actually released it.
    pub fn release(&self) -> bool {
        let taken = self.0.lock().take();
        match taken {
            Some(mut source) => {
                debug!(source = %source.describe(), "releasing camera stream");
                source.release();
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.0.lock().is_none()
    }
}

impl std::fmt::Debug for StreamSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSlot")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Encode RGB pixels as JPEG. `quality` is clamped to `1..=100`.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder.encode_image(image)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        releases: Arc<AtomicUsize>,
    }

    impl FrameSource for CountingSource {
        fn describe(&self) -> String {
            "counting".into()
        }

        fn state(&mut self) -> StreamState {
            StreamState::Playing
        }

        fn current_frame(&mut self, _quality: u8) -> Result<Option<EncodedFrame>> {
            Ok(None)
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn slot_release_is_idempotent() {
        let releases = Arc::new(AtomicUsize::new(0));
        let slot = StreamSlot::new(Box::new(CountingSource {
            releases: Arc::clone(&releases),
        }));

        assert!(slot.release());
        assert!(!slot.release());
        assert!(slot.is_released());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(slot.with_source(|s| s.state()).is_none());
    }

    #[test]
    fn empty_slot_release_is_safe() {
        let slot = StreamSlot::default();
        assert!(!slot.release());
    }

    #[test]
    fn jpeg_encoding_produces_soi_marker() {
        let image = RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        let jpeg = encode_jpeg(&image, 0).expect("encode");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn default_request_prefers_rear_camera_at_720p_without_audio() {
        let req = CameraRequest::default();
        assert_eq!(req.facing, Facing::Environment);
        assert_eq!((req.ideal_width, req.ideal_height), (1280, 720));
        assert!(!req.audio);
    }
}
