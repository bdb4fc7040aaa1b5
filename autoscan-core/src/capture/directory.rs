//! Still-image replay camera.
//!
//! Treats a directory of JPEG/PNG files as a looping video feed: every
//! `current_frame` call re-encodes the next image in name order. Useful for
//! recorded traffic footage exported as stills and for demos without a
//! camera attached.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::capture::{encode_jpeg, Camera, CameraRequest, EncodedFrame, FrameSource, StreamState};
use crate::error::{AutoscanError, Result};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Debug, Clone)]
pub struct DirectoryCamera {
    dir: PathBuf,
}

impl DirectoryCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Camera for DirectoryCamera {
    fn open(&self, _request: &CameraRequest) -> Result<Box<dyn FrameSource>> {
        let files = list_images(&self.dir).map_err(|e| classify_io(&self.dir, e))?;
        if files.is_empty() {
            return Err(AutoscanError::NoMatchingCamera(format!(
                "no images in {}",
                self.dir.display()
            )));
        }
        info!(dir = %self.dir.display(), frames = files.len(), "directory camera opened");
        Ok(Box::new(DirectorySource {
            dir: self.dir.clone(),
            files,
            cursor: 0,
            released: false,
        }))
    }
}

struct DirectorySource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    released: bool,
}

impl FrameSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }

    fn state(&mut self) -> StreamState {
        if self.released {
            StreamState::Ended
        } else {
            StreamState::Playing
        }
    }

    fn current_frame(&mut self, quality: u8) -> Result<Option<EncodedFrame>> {
        if self.released || self.files.is_empty() {
            return Ok(None);
        }
        let path = &self.files[self.cursor % self.files.len()];
        self.cursor = self.cursor.wrapping_add(1);

        let rgb = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable frame");
                return Ok(None);
            }
        };
        Ok(Some(EncodedFrame {
            width: rgb.width(),
            height: rgb.height(),
            jpeg: encode_jpeg(&rgb, quality)?,
        }))
    }

    fn release(&mut self) {
        self.released = true;
    }
}

fn list_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn classify_io(dir: &Path, err: io::Error) -> AutoscanError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => {
            AutoscanError::CameraPermissionDenied(format!("{}: {err}", dir.display()))
        }
        io::ErrorKind::NotFound => {
            AutoscanError::NoMatchingCamera(format!("{}: {err}", dir.display()))
        }
        _ => AutoscanError::Camera(format!("{}: {err}", dir.display())),
    }
}
