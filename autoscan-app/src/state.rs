//! Shared application state.
//!
//! One `AppState` is built in `main` and shared (via `Arc`) with the command
//! handlers and the event-forwarding tasks.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use autoscan_core::{AutoscanEngine, PresenceSync, RgbaSurface};
use parking_lot::Mutex;
use serde::Serialize;

use crate::settings::AppSettings;

pub struct AppState {
    /// The core engine. Wrapped in `Arc` so it can be cloned into
    /// event-forwarding tasks.
    pub engine: Arc<AutoscanEngine>,
    /// Presence session shared with the engine, disconnected on shutdown.
    pub presence: Option<Arc<dyn PresenceSync>>,
    /// Raster the engine draws boxes onto.
    pub surface: Arc<Mutex<RgbaSurface>>,
    /// Persisted app settings cache.
    pub settings: Arc<Mutex<AppSettings>>,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
    /// Count of toggles accepted from the console.
    pub toggles_executed: Arc<AtomicUsize>,
    /// Count of `start` attempts that failed to acquire the camera.
    pub start_failures: Arc<AtomicUsize>,
    /// Count of overlay PNGs written.
    pub overlay_dumps: Arc<AtomicUsize>,
    /// Count of overlay PNG writes that failed.
    pub overlay_dump_errors: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        engine: AutoscanEngine,
        surface: Arc<Mutex<RgbaSurface>>,
        settings: AppSettings,
        settings_path: PathBuf,
    ) -> Self {
        let presence = engine.presence().cloned();
        Self {
            engine: Arc::new(engine),
            presence,
            surface,
            settings: Arc::new(Mutex::new(settings)),
            settings_path,
            toggles_executed: Arc::new(AtomicUsize::new(0)),
            start_failures: Arc::new(AtomicUsize::new(0)),
            overlay_dumps: Arc::new(AtomicUsize::new(0)),
            overlay_dump_errors: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn diagnostics_snapshot(&self) -> AppDiagnostics {
        let pipeline = self.engine.diagnostics_snapshot();
        AppDiagnostics {
            toggles_executed: self.toggles_executed.load(Ordering::Relaxed),
            start_failures: self.start_failures.load(Ordering::Relaxed),
            overlay_dumps: self.overlay_dumps.load(Ordering::Relaxed),
            overlay_dump_errors: self.overlay_dump_errors.load(Ordering::Relaxed),
            pipeline_frames_captured: pipeline.frames_captured,
            pipeline_detection_calls: pipeline.detection_calls,
            pipeline_detection_errors: pipeline.detection_errors,
            pipeline_invalid_responses: pipeline.invalid_responses,
            pipeline_announcements: pipeline.announcements,
            pipeline_announcements_dropped: pipeline.announcements_dropped,
            pipeline_discarded_results: pipeline.discarded_results,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDiagnostics {
    pub toggles_executed: usize,
    pub start_failures: usize,
    pub overlay_dumps: usize,
    pub overlay_dump_errors: usize,
    pub pipeline_frames_captured: usize,
    pub pipeline_detection_calls: usize,
    pub pipeline_detection_errors: usize,
    pub pipeline_invalid_responses: usize,
    pub pipeline_announcements: usize,
    pub pipeline_announcements_dropped: usize,
    pub pipeline_discarded_results: usize,
}
