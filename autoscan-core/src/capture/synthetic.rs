//! Synthetic camera for tests and offline runs.
//!
//! Produces a gradient frame at the requested resolution. Playback starts
//! after a configurable number of state polls, so the loop's not-ready path
//! is exercised the same way a real stream waiting for metadata would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::{Rgb, RgbImage};
use tracing::info;

use crate::capture::{encode_jpeg, Camera, CameraRequest, EncodedFrame, FrameSource, StreamState};
use crate::error::{AutoscanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailMode {
    Denied,
    Missing,
    Hardware,
}

/// Camera backend that never touches hardware.
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    warmup_polls: u32,
    end_after_frames: Option<u64>,
    fail: Option<FailMode>,
    opens: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self {
            warmup_polls: 0,
            end_after_frames: None,
            fail: None,
            opens: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report `Loading` for the first `polls` state checks of each stream.
    pub fn with_warmup(mut self, polls: u32) -> Self {
        self.warmup_polls = polls;
        self
    }

    /// End the stream after `frames` captured frames.
    pub fn ending_after(mut self, frames: u64) -> Self {
        self.end_after_frames = Some(frames);
        self
    }

    /// Refuse acquisition as if the user denied permission.
    pub fn denied() -> Self {
        Self {
            fail: Some(FailMode::Denied),
            ..Self::new()
        }
    }

    /// Refuse acquisition as if no rear camera exists.
    pub fn missing() -> Self {
        Self {
            fail: Some(FailMode::Missing),
            ..Self::new()
        }
    }

    /// Refuse acquisition with a generic hardware error.
    pub fn broken() -> Self {
        Self {
            fail: Some(FailMode::Hardware),
            ..Self::new()
        }
    }

    /// Number of streams successfully acquired.
    pub fn opens(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }

    /// Number of streams whose tracks were stopped.
    pub fn releases(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.releases)
    }
}

impl Camera for SyntheticCamera {
    fn open(&self, request: &CameraRequest) -> Result<Box<dyn FrameSource>> {
        match self.fail {
            Some(FailMode::Denied) => {
                return Err(AutoscanError::CameraPermissionDenied(
                    "synthetic camera: permission refused".into(),
                ))
            }
            Some(FailMode::Missing) => {
                return Err(AutoscanError::NoMatchingCamera(format!(
                    "synthetic camera: no {:?}-facing device",
                    request.facing
                )))
            }
            Some(FailMode::Hardware) => {
                return Err(AutoscanError::Camera("synthetic camera: device busy".into()))
            }
            None => {}
        }

        let width = request.ideal_width.max(1);
        let height = request.ideal_height.max(1);
        self.opens.fetch_add(1, Ordering::SeqCst);
        info!(width, height, "synthetic camera opened");

        Ok(Box::new(SyntheticSource {
            frame: gradient(width, height),
            polls_left: self.warmup_polls,
            frames_left: self.end_after_frames,
            released: false,
            releases: Arc::clone(&self.releases),
        }))
    }
}

struct SyntheticSource {
    frame: RgbImage,
    polls_left: u32,
    frames_left: Option<u64>,
    released: bool,
    releases: Arc<AtomicUsize>,
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("synthetic {}x{}", self.frame.width(), self.frame.height())
    }

    fn state(&mut self) -> StreamState {
        if self.released || self.frames_left == Some(0) {
            return StreamState::Ended;
        }
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return StreamState::Loading;
        }
        StreamState::Playing
    }

    fn current_frame(&mut self, quality: u8) -> Result<Option<EncodedFrame>> {
        if self.released || self.polls_left > 0 || self.frames_left == Some(0) {
            return Ok(None);
        }
        if let Some(left) = self.frames_left.as_mut() {
            *left -= 1;
        }
        Ok(Some(EncodedFrame {
            jpeg: encode_jpeg(&self.frame, quality)?,
            width: self.frame.width(),
            height: self.frame.height(),
        }))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let r = (x * 255 / width.max(1)) as u8;
        let g = (y * 255 / height.max(1)) as u8;
        Rgb([r, g, 96])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_reports_loading_then_playing() {
        let camera = SyntheticCamera::new().with_warmup(2);
        let mut source = camera
            .open(&CameraRequest {
                ideal_width: 32,
                ideal_height: 16,
                ..CameraRequest::default()
            })
            .expect("open");

        assert!(source.current_frame(50).expect("frame").is_none());
        assert_eq!(source.state(), StreamState::Loading);
        assert_eq!(source.state(), StreamState::Loading);
        assert_eq!(source.state(), StreamState::Playing);

        let frame = source.current_frame(50).expect("frame").expect("playing");
        assert_eq!((frame.width, frame.height), (32, 16));
    }

    #[test]
    fn release_ends_stream_once() {
        let camera = SyntheticCamera::new();
        let releases = camera.releases();
        let mut source = camera
            .open(&CameraRequest {
                ideal_width: 8,
                ideal_height: 8,
                ..CameraRequest::default()
            })
            .expect("open");

        source.release();
        source.release();
        assert_eq!(source.state(), StreamState::Ended);
        assert!(source.current_frame(50).expect("frame").is_none());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_modes_classify_acquisition_errors() {
        let req = CameraRequest::default();
        assert!(matches!(
            SyntheticCamera::denied().open(&req).err(),
            Some(AutoscanError::CameraPermissionDenied(_))
        ));
        assert!(matches!(
            SyntheticCamera::missing().open(&req).err(),
            Some(AutoscanError::NoMatchingCamera(_))
        ));
        assert!(matches!(
            SyntheticCamera::broken().open(&req).err(),
            Some(AutoscanError::Camera(_))
        ));
    }

    #[test]
    fn stream_ends_after_frame_budget() {
        let camera = SyntheticCamera::new().ending_after(1);
        let mut source = camera
            .open(&CameraRequest {
                ideal_width: 8,
                ideal_height: 8,
                ..CameraRequest::default()
            })
            .expect("open");
        assert!(source.current_frame(50).expect("frame").is_some());
        assert_eq!(source.state(), StreamState::Ended);
        assert!(source.current_frame(50).expect("frame").is_none());
    }
}
