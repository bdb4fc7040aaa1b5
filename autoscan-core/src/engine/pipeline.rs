//! Detection loop.
//!
//! ## One cycle
//!
//! ```text
//! Idle ──(stream playing)──► Capturing ──(frame encoded)──► Detecting
//!  ▲                            │ no frame                      │ request resolves
//!  │                            ▼                               ▼
//!  └──────(settle delay)─── Idle ◄──────────────────────── Updating
//!                                                  overlay, count, speech, presence
//!
//! stop signalled at any await point ──► Stopped (stream released)
//! ```
//!
//! The loop is one task per session and the only writer of [`LoopState`].
//! Each detection request runs on its own spawned task: when stop arrives
//! while a request is outstanding, the loop stops waiting, and the request
//! finishes in the background with its result discarded. The next cycle is
//! armed only after the previous one completes plus `settle_delay`, so the
//! cadence follows the service's real latency.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    capture::{EncodedFrame, StreamSlot, StreamState},
    detect::{BoundingBox, DetectionResponse, DetectorHandle},
    engine::EngineConfig,
    error::{AutoscanError, DetectionError},
    ipc::events::{
        ActivityEvent, CountEvent, CycleOutcomeKind, EngineStatus, EngineStatusEvent,
    },
    overlay::{OverlayFrame, OverlayRenderer, SurfaceHandle},
    presence::PresenceSync,
    speech::{count_phrase, AnnounceOutcome, Announcer, SpeechCategory, PROCESSING_ERROR},
};

pub struct PipelineDiagnostics {
    pub frames_captured: AtomicUsize,
    pub not_ready_polls: AtomicUsize,
    pub capture_errors: AtomicUsize,
    pub detection_calls: AtomicUsize,
    pub detection_errors: AtomicUsize,
    pub invalid_responses: AtomicUsize,
    pub dropped_boxes: AtomicUsize,
    pub announcements: AtomicUsize,
    pub announcements_dropped: AtomicUsize,
    pub discarded_results: AtomicUsize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            frames_captured: AtomicUsize::new(0),
            not_ready_polls: AtomicUsize::new(0),
            capture_errors: AtomicUsize::new(0),
            detection_calls: AtomicUsize::new(0),
            detection_errors: AtomicUsize::new(0),
            invalid_responses: AtomicUsize::new(0),
            dropped_boxes: AtomicUsize::new(0),
            announcements: AtomicUsize::new(0),
            announcements_dropped: AtomicUsize::new(0),
            discarded_results: AtomicUsize::new(0),
        }
    }
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.not_ready_polls.store(0, Ordering::Relaxed);
        self.capture_errors.store(0, Ordering::Relaxed);
        self.detection_calls.store(0, Ordering::Relaxed);
        self.detection_errors.store(0, Ordering::Relaxed);
        self.invalid_responses.store(0, Ordering::Relaxed);
        self.dropped_boxes.store(0, Ordering::Relaxed);
        self.announcements.store(0, Ordering::Relaxed);
        self.announcements_dropped.store(0, Ordering::Relaxed);
        self.discarded_results.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            not_ready_polls: self.not_ready_polls.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            detection_calls: self.detection_calls.load(Ordering::Relaxed),
            detection_errors: self.detection_errors.load(Ordering::Relaxed),
            invalid_responses: self.invalid_responses.load(Ordering::Relaxed),
            dropped_boxes: self.dropped_boxes.load(Ordering::Relaxed),
            announcements: self.announcements.load(Ordering::Relaxed),
            announcements_dropped: self.announcements_dropped.load(Ordering::Relaxed),
            discarded_results: self.discarded_results.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub not_ready_polls: usize,
    pub capture_errors: usize,
    pub detection_calls: usize,
    pub detection_errors: usize,
    pub invalid_responses: usize,
    pub dropped_boxes: usize,
    pub announcements: usize,
    pub announcements_dropped: usize,
    pub discarded_results: usize,
}

// ---------------------------------------------------------------------------
// Per-session state
// ---------------------------------------------------------------------------

/// How one detection request resolved.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Well-formed result; may be empty.
    Detected(Vec<BoundingBox>),
    /// The service answered with something that is not a box list.
    Invalid { reason: String },
    /// The request itself failed.
    Failed { error: DetectionError },
}

impl CycleOutcome {
    /// Boxes to draw. Empty for invalid and failed cycles.
    pub fn boxes(&self) -> &[BoundingBox] {
        match self {
            CycleOutcome::Detected(boxes) => boxes,
            _ => &[],
        }
    }

    /// Count shown to the user.
    pub fn display_count(&self) -> usize {
        self.boxes().len()
    }

    pub fn kind(&self) -> CycleOutcomeKind {
        match self {
            CycleOutcome::Detected(_) => CycleOutcomeKind::Detected,
            CycleOutcome::Invalid { .. } => CycleOutcomeKind::Invalid,
            CycleOutcome::Failed { .. } => CycleOutcomeKind::Failed,
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            CycleOutcome::Detected(_) => None,
            CycleOutcome::Invalid { reason } => Some(reason.clone()),
            CycleOutcome::Failed { error } => Some(error.to_string()),
        }
    }
}

impl From<Result<DetectionResponse, DetectionError>> for CycleOutcome {
    fn from(result: Result<DetectionResponse, DetectionError>) -> Self {
        match result {
            Ok(DetectionResponse::Valid { boxes, .. }) => CycleOutcome::Detected(boxes),
            Ok(DetectionResponse::Invalid { reason }) => CycleOutcome::Invalid { reason },
            Err(error) => CycleOutcome::Failed { error },
        }
    }
}

/// A phrase the loop decided to speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub phrase: String,
    pub category: SpeechCategory,
}

impl Announcement {
    fn count(count: usize) -> Self {
        Self {
            phrase: count_phrase(count),
            category: SpeechCategory::Detection,
        }
    }

    fn processing_error() -> Self {
        Self {
            phrase: PROCESSING_ERROR.to_string(),
            category: SpeechCategory::System,
        }
    }
}

/// Mutable state of one camera session. A new session starts from `default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopState {
    in_flight: bool,
    /// Count of the last successful cycle; `None` until the baseline exists.
    last_count: Option<usize>,
    cycles: u64,
}

impl LoopState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn last_count(&self) -> Option<usize> {
        self.last_count
    }

    /// Completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Mark a request as dispatched. Returns `false` if one is already outstanding.
    pub fn begin_cycle(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        true
    }

    /// Forget the outstanding request without touching the baseline.
    pub fn abort_cycle(&mut self) {
        self.in_flight = false;
    }

    /// Close the outstanding cycle and decide what to say about it.
    ///
    /// Successful cycles announce only when the count differs from the
    /// previous one; the first one sets the baseline silently. Invalid and
    /// failed cycles leave the baseline alone.
    pub fn finish_cycle(
        &mut self,
        outcome: &CycleOutcome,
        announce_errors: bool,
    ) -> Option<Announcement> {
        self.in_flight = false;
        self.cycles += 1;
        match outcome {
            CycleOutcome::Detected(boxes) => {
                let count = boxes.len();
                match self.last_count.replace(count) {
                    Some(previous) if previous != count => Some(Announcement::count(count)),
                    _ => None,
                }
            }
            CycleOutcome::Invalid { .. } | CycleOutcome::Failed { .. } => {
                announce_errors.then(Announcement::processing_error)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// All context one session's loop needs.
pub struct PipelineContext {
    pub config: EngineConfig,
    pub session: u64,
    pub stream: StreamSlot,
    pub detector: DetectorHandle,
    pub announcer: Announcer,
    pub surface: SurfaceHandle,
    pub renderer: OverlayRenderer,
    pub presence: Option<Arc<dyn PresenceSync>>,
    pub stop_rx: watch::Receiver<bool>,
    pub count_tx: broadcast::Sender<CountEvent>,
    pub activity_tx: broadcast::Sender<ActivityEvent>,
    pub status_tx: broadcast::Sender<EngineStatusEvent>,
    pub status: Arc<Mutex<EngineStatus>>,
    pub seq: Arc<AtomicU64>,
    /// Newest session id. Shared overlay and activity belong to it alone.
    pub active_session: Arc<AtomicU64>,
    pub current_count: Arc<AtomicUsize>,
    pub last_overlay: Arc<Mutex<OverlayFrame>>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

enum Capture {
    Frame(EncodedFrame),
    NotReady,
    Ended,
    Failed(AutoscanError),
}

/// Run one session until stop is signalled or the stream ends.
///
/// The stream is released on every exit path. Returns the final loop state.
pub async fn run(ctx: PipelineContext) -> LoopState {
    let span = info_span!(
        "detection_session",
        session = ctx.session,
        detector = ctx.detector.name()
    );
    run_session(ctx).instrument(span).await
}

async fn run_session(mut ctx: PipelineContext) -> LoopState {
    info!("detection loop started");

    let mut state = LoopState::new();
    let mut activity_seq = 0u64;
    let mut stopped = false;

    loop {
        if stop_signalled(&ctx.stop_rx) {
            stopped = true;
            break;
        }

        // ── Idle → Capturing ─────────────────────────────────────────────
        let frame = match capture(&ctx.stream, ctx.config.jpeg_quality) {
            Capture::Frame(frame) => frame,
            Capture::NotReady => {
                ctx.diagnostics
                    .not_ready_polls
                    .fetch_add(1, Ordering::Relaxed);
                if !pause(&mut ctx.stop_rx, ctx.config.not_ready_poll).await {
                    stopped = true;
                    break;
                }
                continue;
            }
            Capture::Failed(e) => {
                ctx.diagnostics
                    .capture_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "frame capture failed");
                if !pause(&mut ctx.stop_rx, ctx.config.settle_delay).await {
                    stopped = true;
                    break;
                }
                continue;
            }
            Capture::Ended => {
                // `stop()` releases the slot, which also reads as ended.
                stopped = stop_signalled(&ctx.stop_rx);
                if !stopped {
                    info!("camera stream ended");
                }
                break;
            }
        };
        ctx.diagnostics
            .frames_captured
            .fetch_add(1, Ordering::Relaxed);

        // ── Capturing → Detecting ────────────────────────────────────────
        let dispatched = state.begin_cycle();
        debug_assert!(dispatched, "a detection request is already in flight");

        let (width, height) = (frame.width, frame.height);
        emit_activity(&ctx, &mut activity_seq, true);
        ctx.diagnostics
            .detection_calls
            .fetch_add(1, Ordering::Relaxed);
        let mut request = tokio::spawn(ctx.detector.detect(frame));

        let joined = tokio::select! {
            biased;
            _ = stop_requested(&mut ctx.stop_rx) => None,
            joined = &mut request => Some(joined),
        };

        let result = match joined {
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                error!(error = %e, "detection task ended abnormally");
                Err(DetectionError::Cancelled)
            }
            None => {
                state.abort_cycle();
                discard_when_done(request, Arc::clone(&ctx.diagnostics));
                emit_activity(&ctx, &mut activity_seq, false);
                stopped = true;
                break;
            }
        };

        if stop_signalled(&ctx.stop_rx) {
            state.abort_cycle();
            ctx.diagnostics
                .discarded_results
                .fetch_add(1, Ordering::Relaxed);
            debug!("session stopped as the request resolved; result discarded");
            emit_activity(&ctx, &mut activity_seq, false);
            stopped = true;
            break;
        }

        // ── Detecting → Updating ─────────────────────────────────────────
        let outcome = record_outcome(&ctx, result);
        apply_outcome(&ctx, &mut state, outcome, width, height);
        emit_activity(&ctx, &mut activity_seq, false);

        // ── Updating → Idle ──────────────────────────────────────────────
        if !pause(&mut ctx.stop_rx, ctx.config.settle_delay).await {
            stopped = true;
            break;
        }
    }

    ctx.stream.release();
    let current = {
        let mut surface = ctx.surface.0.lock();
        let current = is_current(&ctx);
        if current {
            ctx.renderer.clear(&mut *surface);
            ctx.last_overlay.lock().rects.clear();
        } else {
            debug!("newer session owns the overlay; leaving it");
        }
        current
    };

    if !stopped && current {
        *ctx.status.lock() = EngineStatus::Stopped;
        let _ = ctx.status_tx.send(EngineStatusEvent {
            status: EngineStatus::Stopped,
            detail: Some("camera stream ended".into()),
        });
    }

    info!(
        cycles = state.cycles(),
        last_count = ?state.last_count(),
        stopped,
        "detection loop finished"
    );
    state
}

fn capture(stream: &StreamSlot, quality: u8) -> Capture {
    stream
        .with_source(|source| match source.state() {
            StreamState::Loading => Capture::NotReady,
            StreamState::Ended => Capture::Ended,
            StreamState::Playing => match source.current_frame(quality) {
                Ok(Some(frame)) => Capture::Frame(frame),
                Ok(None) => Capture::NotReady,
                Err(e) => Capture::Failed(e),
            },
        })
        .unwrap_or(Capture::Ended)
}

fn record_outcome(
    ctx: &PipelineContext,
    result: Result<DetectionResponse, DetectionError>,
) -> CycleOutcome {
    match &result {
        Ok(DetectionResponse::Valid { boxes, dropped }) => {
            if *dropped > 0 {
                ctx.diagnostics
                    .dropped_boxes
                    .fetch_add(*dropped, Ordering::Relaxed);
                debug!(dropped, kept = boxes.len(), "malformed boxes dropped");
            }
        }
        Ok(DetectionResponse::Invalid { reason }) => {
            ctx.diagnostics
                .invalid_responses
                .fetch_add(1, Ordering::Relaxed);
            warn!(reason = %reason, "detection response invalid");
        }
        Err(e) => {
            ctx.diagnostics
                .detection_errors
                .fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "detection request failed");
        }
    }
    CycleOutcome::from(result)
}

fn apply_outcome(
    ctx: &PipelineContext,
    state: &mut LoopState,
    outcome: CycleOutcome,
    width: u32,
    height: u32,
) {
    let rects = {
        let mut surface = ctx.surface.0.lock();
        ctx.renderer
            .draw(&mut *surface, outcome.boxes(), width, height)
    };
    *ctx.last_overlay.lock() = OverlayFrame {
        width,
        height,
        rects: rects.clone(),
    };

    let count = outcome.display_count();
    ctx.current_count.store(count, Ordering::Relaxed);

    if let Some(announcement) = state.finish_cycle(&outcome, ctx.config.announce_errors) {
        match ctx
            .announcer
            .announce(&announcement.phrase, announcement.category)
        {
            AnnounceOutcome::Spoken => {
                ctx.diagnostics
                    .announcements
                    .fetch_add(1, Ordering::Relaxed);
            }
            AnnounceOutcome::Busy => {
                ctx.diagnostics
                    .announcements_dropped
                    .fetch_add(1, Ordering::Relaxed);
            }
            AnnounceOutcome::Empty | AnnounceOutcome::Failed => {}
        }
    }

    if let Some(presence) = &ctx.presence {
        presence.publish(count);
    }

    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
    let kind = outcome.kind();
    let emitted = ctx
        .count_tx
        .send(CountEvent {
            seq,
            session: ctx.session,
            count,
            outcome: kind,
            boxes: outcome.boxes().to_vec(),
            rects,
            detail: outcome.detail(),
        })
        .is_ok();
    info!(count, outcome = ?kind, emitted, "cycle complete");
}

fn is_current(ctx: &PipelineContext) -> bool {
    ctx.active_session.load(Ordering::SeqCst) == ctx.session
}

fn emit_activity(ctx: &PipelineContext, activity_seq: &mut u64, detecting: bool) {
    if !is_current(ctx) {
        return;
    }
    let _ = ctx.activity_tx.send(ActivityEvent {
        seq: *activity_seq,
        detecting,
    });
    *activity_seq += 1;
}

/// Let an abandoned request finish on its own and drop its result.
fn discard_when_done(
    request: JoinHandle<Result<DetectionResponse, DetectionError>>,
    diagnostics: Arc<PipelineDiagnostics>,
) {
    tokio::spawn(async move {
        if let Ok(result) = request.await {
            diagnostics
                .discarded_results
                .fetch_add(1, Ordering::Relaxed);
            debug!(ok = result.is_ok(), "late detection result discarded");
        }
    });
}

/// Stop was requested, or the engine side of the channel is gone.
fn stop_signalled(stop_rx: &watch::Receiver<bool>) -> bool {
    *stop_rx.borrow() || stop_rx.has_changed().is_err()
}

async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay` unless stop comes first. Returns `false` on stop.
async fn pause(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = stop_requested(stop_rx) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    use crate::capture::{Camera, CameraRequest, FrameSource, SyntheticCamera};
    use crate::detect::stub::{ScriptStep, ScriptedDetector};
    use crate::error::Result;
    use crate::overlay::RgbaSurface;
    use crate::speech::{SpeechBackend, Utterance, VoiceConfig};

    #[derive(Default)]
    struct RecordingSpeaker {
        spoken: Mutex<Vec<(String, SpeechCategory)>>,
    }

    impl SpeechBackend for RecordingSpeaker {
        fn is_speaking(&self) -> bool {
            false
        }

        fn speak(&self, utterance: &Utterance) -> Result<()> {
            self.spoken
                .lock()
                .push((utterance.text.clone(), utterance.category));
            Ok(())
        }
    }

    struct Harness {
        ctx: PipelineContext,
        stop_tx: watch::Sender<bool>,
        counts: broadcast::Receiver<CountEvent>,
        activity: broadcast::Receiver<ActivityEvent>,
        statuses: broadcast::Receiver<EngineStatusEvent>,
        speaker: Arc<RecordingSpeaker>,
        releases: Arc<AtomicUsize>,
        diagnostics: Arc<PipelineDiagnostics>,
    }

    fn boxes(n: usize) -> Vec<BoundingBox> {
        (0..n)
            .map(|i| {
                let o = i as f32 * 0.1;
                BoundingBox::new(o, o, o + 0.1, o + 0.1)
            })
            .collect()
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            settle_delay: Duration::from_millis(5),
            not_ready_poll: Duration::from_millis(2),
            camera_request: CameraRequest {
                ideal_width: 64,
                ideal_height: 48,
                ..CameraRequest::default()
            },
            ..EngineConfig::default()
        }
    }

    fn harness(camera: SyntheticCamera, detector: ScriptedDetector) -> Harness {
        let config = test_config();
        let releases = camera.releases();
        let source = camera
            .open(&config.camera_request)
            .expect("synthetic camera opens");
        let (stop_tx, stop_rx) = watch::channel(false);
        let (count_tx, counts) = broadcast::channel(64);
        let (activity_tx, activity) = broadcast::channel(64);
        let (status_tx, statuses) = broadcast::channel(64);
        let speaker = Arc::new(RecordingSpeaker::default());
        let diagnostics = Arc::new(PipelineDiagnostics::default());

        let ctx = PipelineContext {
            config,
            session: 1,
            stream: StreamSlot::new(source),
            detector: DetectorHandle::new(detector),
            announcer: Announcer::new(speaker.clone(), VoiceConfig::default()),
            surface: SurfaceHandle::new(RgbaSurface::default()),
            renderer: OverlayRenderer::default(),
            presence: None,
            stop_rx,
            count_tx,
            activity_tx,
            status_tx,
            status: Arc::new(Mutex::new(EngineStatus::Running)),
            seq: Arc::new(AtomicU64::new(0)),
            active_session: Arc::new(AtomicU64::new(1)),
            current_count: Arc::new(AtomicUsize::new(0)),
            last_overlay: Arc::new(Mutex::new(OverlayFrame::default())),
            diagnostics: Arc::clone(&diagnostics),
        };

        Harness {
            ctx,
            stop_tx,
            counts,
            activity,
            statuses,
            speaker,
            releases,
            diagnostics,
        }
    }

    async fn next_count(rx: &mut broadcast::Receiver<CountEvent>) -> CountEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for count event")
            .expect("count channel closed")
    }

    fn spoken(speaker: &RecordingSpeaker) -> Vec<String> {
        speaker.spoken.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    // ── LoopState ────────────────────────────────────────────────────────

    fn finish_detected(state: &mut LoopState, n: usize) -> Option<Announcement> {
        assert!(state.begin_cycle());
        state.finish_cycle(&CycleOutcome::Detected(boxes(n)), true)
    }

    #[test]
    fn announces_only_when_count_changes() {
        let mut state = LoopState::new();
        assert_eq!(finish_detected(&mut state, 2), None, "baseline is silent");

        let said: Vec<Option<String>> = [2, 2, 3, 3, 0]
            .into_iter()
            .map(|n| finish_detected(&mut state, n).map(|a| a.phrase))
            .collect();

        assert_eq!(
            said,
            vec![
                None,
                None,
                Some("3 autos detectados.".to_string()),
                None,
                Some("0 autos detectados.".to_string()),
            ]
        );
    }

    #[test]
    fn first_cycle_sets_baseline_silently_even_for_zero() {
        let mut state = LoopState::new();
        assert_eq!(finish_detected(&mut state, 0), None);
        assert_eq!(state.last_count(), Some(0));
        assert_eq!(state.cycles(), 1);
    }

    #[test]
    fn second_dispatch_is_refused_while_in_flight() {
        let mut state = LoopState::new();
        assert!(state.begin_cycle());
        assert!(!state.begin_cycle());
        state.abort_cycle();
        assert!(!state.in_flight());
        assert!(state.begin_cycle());
    }

    #[test]
    fn failures_announce_processing_error_and_keep_baseline() {
        let mut state = LoopState::new();
        finish_detected(&mut state, 2);

        assert!(state.begin_cycle());
        let failed = CycleOutcome::Failed {
            error: DetectionError::Transport("connection reset".into()),
        };
        let said = state.finish_cycle(&failed, true).expect("error is announced");
        assert_eq!(said.phrase, PROCESSING_ERROR);
        assert_eq!(said.category, SpeechCategory::System);
        assert_eq!(state.last_count(), Some(2));
        assert!(!state.in_flight());

        // Same count after the failure is not a change.
        assert_eq!(finish_detected(&mut state, 2), None);

        assert!(state.begin_cycle());
        let invalid = CycleOutcome::Invalid {
            reason: "not JSON".into(),
        };
        assert_eq!(state.finish_cycle(&invalid, false), None);
    }

    #[test]
    fn invalid_and_failed_outcomes_display_zero() {
        let invalid = CycleOutcome::from(Ok(DetectionResponse::invalid("empty")));
        assert_eq!(invalid.display_count(), 0);
        assert_eq!(invalid.kind(), CycleOutcomeKind::Invalid);

        let failed = CycleOutcome::from(Err(DetectionError::Status {
            code: 503,
            body: "unavailable".into(),
        }));
        assert_eq!(failed.display_count(), 0);
        assert!(failed.detail().is_some_and(|d| d.contains("503")));
    }

    // ── run() ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_box_is_silent_then_change_to_zero_is_announced() {
        let detector = ScriptedDetector::new(vec![
            ScriptStep::boxes(vec![BoundingBox::new(0.1, 0.1, 0.5, 0.5)]),
            ScriptStep::boxes(vec![]),
        ]);
        let mut h = harness(SyntheticCamera::new(), detector);
        let last_overlay = Arc::clone(&h.ctx.last_overlay);
        let task = tokio::spawn(run(h.ctx));

        let first = next_count(&mut h.counts).await;
        assert_eq!(first.count, 1);
        assert_eq!(first.outcome, CycleOutcomeKind::Detected);
        let rect = first.rects[0];
        assert_relative_eq!(rect.x, 0.1 * 64.0, epsilon = 1e-4);
        assert_relative_eq!(rect.y, 0.1 * 48.0, epsilon = 1e-4);
        assert_relative_eq!(rect.w, 0.4 * 64.0, epsilon = 1e-4);
        assert_relative_eq!(rect.h, 0.4 * 48.0, epsilon = 1e-4);
        assert!(spoken(&h.speaker).is_empty(), "baseline cycle is silent");

        let second = next_count(&mut h.counts).await;
        assert_eq!(second.count, 0);
        assert!(second.rects.is_empty());
        assert_eq!(spoken(&h.speaker), vec!["0 autos detectados.".to_string()]);
        assert_eq!(last_overlay.lock().width, 64);

        h.stop_tx.send(true).expect("loop alive");
        let state = task.await.expect("loop task");
        assert!(state.cycles() >= 2);
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_failure_shows_zero_and_loop_continues() {
        let detector = ScriptedDetector::new(vec![
            ScriptStep::boxes(boxes(2)),
            ScriptStep::fail("network unreachable"),
            ScriptStep::boxes(boxes(2)),
        ]);
        let mut h = harness(SyntheticCamera::new(), detector);
        let task = tokio::spawn(run(h.ctx));

        assert_eq!(next_count(&mut h.counts).await.count, 2);
        let failed = next_count(&mut h.counts).await;
        assert_eq!(failed.count, 0);
        assert_eq!(failed.outcome, CycleOutcomeKind::Failed);
        assert!(failed.boxes.is_empty());
        let recovered = next_count(&mut h.counts).await;
        assert_eq!(recovered.count, 2);
        assert_eq!(recovered.outcome, CycleOutcomeKind::Detected);

        h.stop_tx.send(true).expect("loop alive");
        task.await.expect("loop task");

        // Baseline survived the failure, so 2 → 2 was never announced.
        let said = spoken(&h.speaker);
        assert_eq!(said.first().map(String::as_str), Some(PROCESSING_ERROR));
        assert!(!said.iter().any(|p| p.starts_with('2')));
        assert!(h.diagnostics.snapshot().detection_errors >= 1);
    }

    #[tokio::test]
    async fn loop_waits_for_stream_to_start_playing() {
        let detector = ScriptedDetector::new(vec![ScriptStep::boxes(boxes(1))]);
        let mut h = harness(SyntheticCamera::new().with_warmup(3), detector);
        let task = tokio::spawn(run(h.ctx));

        next_count(&mut h.counts).await;
        let snap = h.diagnostics.snapshot();
        assert!(snap.not_ready_polls >= 3);
        assert_eq!(snap.frames_captured, snap.detection_calls);

        h.stop_tx.send(true).expect("loop alive");
        task.await.expect("loop task");
    }

    #[tokio::test]
    async fn stop_during_request_detaches_it_and_discards_the_result() {
        let detector = ScriptedDetector::new(vec![ScriptStep::boxes(boxes(3))])
            .with_latency(Duration::from_millis(150));
        let mut h = harness(SyntheticCamera::new(), detector);
        let task = tokio::spawn(run(h.ctx));

        let dispatched = tokio::time::timeout(Duration::from_secs(1), h.activity.recv())
            .await
            .expect("activity event")
            .expect("activity channel");
        assert!(dispatched.detecting);

        h.stop_tx.send(true).expect("loop alive");
        let state = tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("stop must not wait for the request")
            .expect("loop task");
        assert_eq!(state.cycles(), 0);
        assert!(!state.in_flight());
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.diagnostics.snapshot().discarded_results, 1);
        assert!(h.counts.try_recv().is_err(), "no count from a stopped session");
    }

    #[tokio::test]
    async fn stream_end_stops_the_session_on_its_own() {
        let detector = ScriptedDetector::new(vec![ScriptStep::boxes(boxes(1))]);
        let mut h = harness(SyntheticCamera::new().ending_after(2), detector);
        let status = Arc::clone(&h.ctx.status);
        let state = tokio::time::timeout(Duration::from_secs(2), run(h.ctx))
            .await
            .expect("loop ends with the stream");

        assert_eq!(state.cycles(), 2);
        assert_eq!(*status.lock(), EngineStatus::Stopped);
        let event = h.statuses.try_recv().expect("status event");
        assert_eq!(event.status, EngineStatus::Stopped);
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);
    }

    struct StopOnPoll {
        stop_tx: watch::Sender<bool>,
    }

    impl FrameSource for StopOnPoll {
        fn describe(&self) -> String {
            "stop-on-poll".into()
        }

        fn state(&mut self) -> StreamState {
            // Stop lands and the stream goes away between two polls.
            let _ = self.stop_tx.send(true);
            StreamState::Ended
        }

        fn current_frame(&mut self, _quality: u8) -> Result<Option<EncodedFrame>> {
            Ok(None)
        }

        fn release(&mut self) {}
    }

    #[tokio::test]
    async fn stop_racing_the_capture_is_not_reported_as_stream_end() {
        let mut h = harness(SyntheticCamera::new(), ScriptedDetector::new(vec![]));
        h.ctx.stream = StreamSlot::new(Box::new(StopOnPoll { stop_tx: h.stop_tx }));
        let status = Arc::clone(&h.ctx.status);

        let state = tokio::time::timeout(Duration::from_secs(2), run(h.ctx))
            .await
            .expect("loop exits");

        assert_eq!(state.cycles(), 0);
        assert_eq!(*status.lock(), EngineStatus::Running, "stop() owns the status");
        assert!(h.statuses.try_recv().is_err());
    }

    #[tokio::test]
    async fn superseded_session_leaves_the_shared_overlay_alone() {
        let detector = ScriptedDetector::new(vec![ScriptStep::boxes(boxes(1))])
            .with_latency(Duration::from_millis(150));
        let mut h = harness(SyntheticCamera::new(), detector);
        let raster = Arc::new(Mutex::new(RgbaSurface::default()));
        h.ctx.surface = SurfaceHandle(raster.clone());
        let active = Arc::clone(&h.ctx.active_session);
        let overlay = Arc::clone(&h.ctx.last_overlay);
        let task = tokio::spawn(run(h.ctx));

        let dispatched = tokio::time::timeout(Duration::from_secs(1), h.activity.recv())
            .await
            .expect("activity event")
            .expect("activity channel");
        assert!(dispatched.detecting);

        // Session 2 starts and draws before session 1's task winds down.
        active.store(2, Ordering::SeqCst);
        let rects = OverlayRenderer::default().draw(&mut *raster.lock(), &boxes(1), 64, 48);
        *overlay.lock() = OverlayFrame {
            width: 64,
            height: 48,
            rects,
        };

        h.stop_tx.send(true).expect("loop alive");
        task.await.expect("loop task");

        assert_eq!(overlay.lock().rects.len(), 1);
        assert_ne!(raster.lock().pixel(1, 1), Some([0, 0, 0, 0]));
        assert!(h.activity.try_recv().is_err(), "no activity from session 1");
    }
}
