//! `AutoscanEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! AutoscanEngine::new()
//!     └─► start()   → camera acquired, "Cámara iniciada.", loop spawned, status = Running
//!         └─► stop() → stop signalled, stream released, status = Stopped
//! ```
//!
//! `stop()` is idempotent and returns whether a session was actually active.
//! A failed acquisition leaves the engine in `Error` with the banner text as
//! status detail; `start()` may be called again afterwards.
//!
//! ## Threading
//!
//! `start()` must be called from inside a tokio runtime: the detection loop
//! and every detection request run as tokio tasks. The camera is opened on
//! the caller's thread so acquisition errors reach the caller directly.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    capture::{Camera, CameraRequest, StreamSlot},
    detect::DetectorHandle,
    error::{AutoscanError, Result},
    ipc::events::{ActivityEvent, CountEvent, EngineStatus, EngineStatusEvent},
    overlay::{OverlayFrame, OverlayRenderer, SurfaceHandle},
    presence::PresenceSync,
    speech::{Announcer, SpeechCategory, CAMERA_STARTED},
};

use pipeline::{DiagnosticsSnapshot, LoopState, PipelineContext, PipelineDiagnostics};

/// Broadcast channel capacity for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration for `AutoscanEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause after each completed cycle before the next frame is taken.
    /// Default: 750 ms.
    pub settle_delay: Duration,
    /// Re-check interval while the stream is not playing yet. Default: 33 ms.
    pub not_ready_poll: Duration,
    /// JPEG quality for uploaded frames, 1..=100. Default: 50.
    pub jpeg_quality: u8,
    pub camera_request: CameraRequest,
    /// Speak "Error al procesar la imagen." on invalid or failed cycles.
    pub announce_errors: bool,
    /// Speak "Cámara iniciada." once the camera is acquired.
    pub announce_camera_started: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(750),
            not_ready_poll: Duration::from_millis(33),
            jpeg_quality: 50,
            camera_request: CameraRequest::default(),
            announce_errors: true,
            announce_camera_started: true,
        }
    }
}

struct ActiveSession {
    id: u64,
    stop_tx: watch::Sender<bool>,
    stream: StreamSlot,
    task: JoinHandle<LoopState>,
}

/// The top-level engine handle.
///
/// `AutoscanEngine` is `Send + Sync`; all fields use interior mutability.
/// Wrap in `Arc<AutoscanEngine>` to share it with event-forwarding tasks.
pub struct AutoscanEngine {
    config: EngineConfig,
    camera: Arc<dyn Camera>,
    detector: DetectorHandle,
    announcer: Announcer,
    surface: SurfaceHandle,
    renderer: OverlayRenderer,
    presence: Option<Arc<dyn PresenceSync>>,
    session: Mutex<Option<ActiveSession>>,
    sessions_started: AtomicU64,
    /// Id of the newest session; older loop tasks leave shared state alone.
    active_session: Arc<AtomicU64>,
    status: Arc<Mutex<EngineStatus>>,
    count_tx: broadcast::Sender<CountEvent>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    /// Monotonically increasing count event sequence.
    seq: Arc<AtomicU64>,
    current_count: Arc<AtomicUsize>,
    last_overlay: Arc<Mutex<OverlayFrame>>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl AutoscanEngine {
    /// Create an engine. Nothing is acquired until `start()`.
    pub fn new(
        config: EngineConfig,
        camera: Arc<dyn Camera>,
        detector: DetectorHandle,
        announcer: Announcer,
        surface: SurfaceHandle,
    ) -> Self {
        let (count_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            camera,
            detector,
            announcer,
            surface,
            renderer: OverlayRenderer::default(),
            presence: None,
            session: Mutex::new(None),
            sessions_started: AtomicU64::new(0),
            active_session: Arc::new(AtomicU64::new(0)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            count_tx,
            status_tx,
            activity_tx,
            seq: Arc::new(AtomicU64::new(0)),
            current_count: Arc::new(AtomicUsize::new(0)),
            last_overlay: Arc::new(Mutex::new(OverlayFrame::default())),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        }
    }

    /// Publish each cycle's count to `presence`.
    pub fn with_presence(mut self, presence: Arc<dyn PresenceSync>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Acquire the camera and start a detection session.
    ///
    /// Returns the new session number.
    ///
    /// # Errors
    /// - `AutoscanError::AlreadyRunning` if a session is active.
    /// - Acquisition errors from the camera backend; status becomes `Error`.
    /// - `AutoscanError::Other` when called outside a tokio runtime.
    pub fn start(&self) -> Result<u64> {
        let mut active = self.session.lock();
        if active.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Err(AutoscanError::AlreadyRunning);
        }
        // A session whose stream ended on its own leaves its record behind.
        if let Some(finished) = active.take() {
            finished.stream.release();
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            AutoscanError::Other(anyhow::anyhow!("engine must start inside a tokio runtime: {e}"))
        })?;

        self.set_status(EngineStatus::Starting, None);
        let source = match self.camera.open(&self.config.camera_request) {
            Ok(source) => source,
            Err(e) => {
                error!(error = %e, "camera acquisition failed");
                self.set_status(EngineStatus::Error, Some(e.user_message()));
                return Err(e);
            }
        };
        let described = source.describe();

        let id = self.sessions_started.fetch_add(1, Ordering::SeqCst) + 1;
        self.active_session.store(id, Ordering::SeqCst);
        self.diagnostics.reset();
        self.current_count.store(0, Ordering::Relaxed);
        *self.last_overlay.lock() = OverlayFrame::default();

        if self.config.announce_camera_started {
            self.announcer
                .announce(CAMERA_STARTED, SpeechCategory::System);
        }

        let stream = StreamSlot::new(source);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = PipelineContext {
            config: self.config.clone(),
            session: id,
            stream: stream.clone(),
            detector: self.detector.clone(),
            announcer: self.announcer.clone(),
            surface: self.surface.clone(),
            renderer: self.renderer,
            presence: self.presence.clone(),
            stop_rx,
            count_tx: self.count_tx.clone(),
            activity_tx: self.activity_tx.clone(),
            status_tx: self.status_tx.clone(),
            status: Arc::clone(&self.status),
            seq: Arc::clone(&self.seq),
            active_session: Arc::clone(&self.active_session),
            current_count: Arc::clone(&self.current_count),
            last_overlay: Arc::clone(&self.last_overlay),
            diagnostics: Arc::clone(&self.diagnostics),
        };

        self.set_status(EngineStatus::Running, None);
        let task = runtime.spawn(pipeline::run(ctx));
        *active = Some(ActiveSession {
            id,
            stop_tx,
            stream,
            task,
        });

        info!(
            session = id,
            camera = %described,
            detector = self.detector.name(),
            "engine started"
        );
        Ok(id)
    }

    /// End the current session.
    ///
    /// Signals the loop, releases the stream, and returns immediately. An
    /// outstanding detection request is left to finish; its result is
    /// discarded. Returns `false` when no session was running.
    pub fn stop(&self) -> bool {
        self.end_session().is_some()
    }

    /// `stop()` and wait for the loop task to exit.
    ///
    /// Returns the session's final loop state, if a session was running.
    pub async fn shutdown(&self) -> Option<LoopState> {
        let task = self.end_session()?;
        match task.await {
            Ok(state) => Some(state),
            Err(e) => {
                error!(error = %e, "detection loop task failed");
                None
            }
        }
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Subscribe to per-cycle count events.
    pub fn subscribe_counts(&self) -> broadcast::Receiver<CountEvent> {
        self.count_tx.subscribe()
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to request-in-flight events.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.activity_tx.subscribe()
    }

    /// Count currently displayed; zero before the first cycle of a session.
    pub fn current_count(&self) -> usize {
        self.current_count.load(Ordering::Relaxed)
    }

    /// Rectangles currently on the overlay and the frame size they fit.
    pub fn overlay_snapshot(&self) -> OverlayFrame {
        self.last_overlay.lock().clone()
    }

    /// Snapshot of loop counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn presence(&self) -> Option<&Arc<dyn PresenceSync>> {
        self.presence.as_ref()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Take the active session, signal it, release its stream.
    fn end_session(&self) -> Option<JoinHandle<LoopState>> {
        let session = self.session.lock().take()?;
        let was_running = !session.task.is_finished();
        let _ = session.stop_tx.send(true);
        session.stream.release();

        if !was_running {
            return None;
        }
        self.set_status(EngineStatus::Stopped, None);
        info!(session = session.id, "engine stop requested");
        Some(session.task)
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}

impl Drop for AutoscanEngine {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            let _ = session.stop_tx.send(true);
            session.stream.release();
        }
    }
}
