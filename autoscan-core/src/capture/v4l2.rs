//! V4L2 webcam capture (Linux).
//!
//! # Threading note
//!
//! `v4l::MmapStream` borrows its `Device`, so both live on a dedicated capture
//! thread that owns them for the whole session. The thread keeps only the most
//! recent RGB frame in a shared slot; `current_frame` encodes that copy and
//! never touches the device. A sync channel reports the open result back to
//! `open()` so acquisition errors surface synchronously.

use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use image::RgbImage;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::capture::{encode_jpeg, Camera, CameraRequest, EncodedFrame, FrameSource, StreamState};
use crate::error::{AutoscanError, Result};

const BUFFER_COUNT: u32 = 4;
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// V4L2 device camera. `device` is a node path such as `/dev/video0`.
///
/// V4L2 exposes no facing information, so the configured node is taken as
/// the outward-facing camera.
#[derive(Debug, Clone)]
pub struct V4l2Camera {
    device: String,
}

impl V4l2Camera {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl Default for V4l2Camera {
    fn default() -> Self {
        Self::new("/dev/video0")
    }
}

impl Camera for V4l2Camera {
    fn open(&self, request: &CameraRequest) -> Result<Box<dyn FrameSource>> {
        let running = Arc::new(AtomicBool::new(true));
        let latest: Arc<Mutex<Option<RgbImage>>> = Arc::new(Mutex::new(None));
        let ended = Arc::new(AtomicBool::new(false));
        let (open_tx, open_rx) = mpsc::channel::<Result<(u32, u32)>>();

        let device_path = self.device.clone();
        let (width, height) = (request.ideal_width, request.ideal_height);
        let thread_running = Arc::clone(&running);
        let thread_latest = Arc::clone(&latest);
        let thread_ended = Arc::clone(&ended);

        let handle = std::thread::Builder::new()
            .name("autoscan-v4l2".into())
            .spawn(move || {
                capture_thread(
                    &device_path,
                    width,
                    height,
                    open_tx,
                    thread_running,
                    thread_latest,
                    thread_ended,
                )
            })
            .map_err(|e| AutoscanError::Camera(format!("spawn capture thread: {e}")))?;

        match open_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok((w, h))) => {
                info!(device = %self.device, width = w, height = h, "v4l2 camera opened");
                Ok(Box::new(V4l2Source {
                    device: self.device.clone(),
                    running,
                    latest,
                    ended,
                    handle: Some(handle),
                }))
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                Err(AutoscanError::Camera(format!(
                    "{}: device did not open within {:?}",
                    self.device, OPEN_TIMEOUT
                )))
            }
        }
    }
}

fn capture_thread(
    device_path: &str,
    width: u32,
    height: u32,
    open_tx: mpsc::Sender<Result<(u32, u32)>>,
    running: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<RgbImage>>>,
    ended: Arc<AtomicBool>,
) {
    use v4l::buffer::Type;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;

    let device = match v4l::Device::with_path(device_path) {
        Ok(d) => d,
        Err(e) => {
            let _ = open_tx.send(Err(classify_io(device_path, e)));
            return;
        }
    };

    let format = match device.format().and_then(|mut fmt| {
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = v4l::FourCC::new(b"RGB3");
        device.set_format(&fmt)
    }) {
        Ok(f) => f,
        Err(e) => {
            let _ = open_tx.send(Err(classify_io(device_path, e)));
            return;
        }
    };
    if format.fourcc != v4l::FourCC::new(b"RGB3") {
        let _ = open_tx.send(Err(AutoscanError::Camera(format!(
            "{device_path}: device does not support RGB3 capture (got {})",
            format.fourcc
        ))));
        return;
    }

    let mut stream =
        match v4l::prelude::MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT) {
            Ok(s) => s,
            Err(e) => {
                let _ = open_tx.send(Err(classify_io(device_path, e)));
                return;
            }
        };

    let _ = open_tx.send(Ok((format.width, format.height)));
    let frame_len = (format.width * format.height * 3) as usize;

    while running.load(Ordering::Relaxed) {
        match stream.next() {
            Ok((buf, _meta)) => {
                if buf.len() < frame_len {
                    warn!(got = buf.len(), expected = frame_len, "short v4l2 frame");
                    continue;
                }
                if let Some(img) =
                    RgbImage::from_raw(format.width, format.height, buf[..frame_len].to_vec())
                {
                    *latest.lock() = Some(img);
                }
            }
            Err(e) => {
                error!(device = device_path, error = %e, "v4l2 capture failed; stream ended");
                break;
            }
        }
    }

    ended.store(true, Ordering::SeqCst);
    // Stream and device drop here, on the thread that created them.
}

struct V4l2Source {
    device: String,
    running: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<RgbImage>>>,
    ended: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        format!("v4l2 {}", self.device)
    }

    fn state(&mut self) -> StreamState {
        if !self.running.load(Ordering::Relaxed) || self.ended.load(Ordering::Relaxed) {
            StreamState::Ended
        } else if self.latest.lock().is_none() {
            StreamState::Loading
        } else {
            StreamState::Playing
        }
    }

    fn current_frame(&mut self, quality: u8) -> Result<Option<EncodedFrame>> {
        if self.state() != StreamState::Playing {
            return Ok(None);
        }
        let snapshot = self.latest.lock().clone();
        match snapshot {
            Some(img) => Ok(Some(EncodedFrame {
                width: img.width(),
                height: img.height(),
                jpeg: encode_jpeg(&img, quality)?,
            })),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            reap_capture_thread(handle, self.device.clone());
        }
    }
}

/// Join a stopped capture thread without stalling async workers.
///
/// The thread may sit in `stream.next()` for up to a frame interval after
/// `running` drops, so on a runtime the join moves to the blocking pool.
fn reap_capture_thread(handle: JoinHandle<()>, device: String) {
    let join = move || {
        if handle.join().is_err() {
            warn!(device = %device, "v4l2 capture thread panicked");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.release();
    }
}

fn classify_io(device: &str, err: io::Error) -> AutoscanError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => {
            AutoscanError::CameraPermissionDenied(format!("{device}: {err}"))
        }
        io::ErrorKind::NotFound => AutoscanError::NoMatchingCamera(format!("{device}: {err}")),
        _ => AutoscanError::Camera(format!("{device}: {err}")),
    }
}
