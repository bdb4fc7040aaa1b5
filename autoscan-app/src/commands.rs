//! Console command handlers.
//!
//! The terminal loop in `main` maps key presses onto these functions; they
//! are plain functions over `AppState` so they can be driven from tests.

use std::sync::atomic::Ordering;

use autoscan_core::ipc::events::EngineStatus;
use tracing::{info, warn};

use crate::settings::save_settings;
use crate::state::AppState;

/// What a toggle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Started { session: u64 },
    Stopped,
}

/// Acquire the camera and start detecting.
///
/// Acquisition failures come back as the Spanish banner text.
pub fn start_engine(state: &AppState) -> Result<u64, String> {
    match state.engine.start() {
        Ok(session) => Ok(session),
        Err(e) => {
            state.start_failures.fetch_add(1, Ordering::Relaxed);
            if e.is_acquisition() {
                Err(e.user_message())
            } else {
                Err(e.to_string())
            }
        }
    }
}

/// Stop detecting. Returns whether a session was running.
pub fn stop_engine(state: &AppState) -> bool {
    let stopped = state.engine.stop();
    let diag = state.diagnostics_snapshot();
    info!(
        stopped,
        toggles_executed = diag.toggles_executed,
        start_failures = diag.start_failures,
        frames_captured = diag.pipeline_frames_captured,
        detection_calls = diag.pipeline_detection_calls,
        detection_errors = diag.pipeline_detection_errors,
        discarded_results = diag.pipeline_discarded_results,
        overlay_dumps = diag.overlay_dumps,
        "app diagnostics snapshot on stop"
    );
    stopped
}

/// Start when idle, stop when running.
pub fn toggle(state: &AppState) -> Result<ToggleOutcome, String> {
    state.toggles_executed.fetch_add(1, Ordering::Relaxed);
    if state.engine.is_running() {
        stop_engine(state);
        Ok(ToggleOutcome::Stopped)
    } else {
        start_engine(state).map(|session| ToggleOutcome::Started { session })
    }
}

pub fn get_status(state: &AppState) -> EngineStatus {
    state.engine.status()
}

/// Change the name peers see for this device and persist it.
pub fn set_display_name(state: &AppState, name: &str) -> Result<String, String> {
    let mut settings = state.settings.lock();
    settings.display_name = name.to_string();
    settings.normalize();
    save_settings(&state.settings_path, &settings).map_err(|e| e.to_string())?;
    if state.presence.is_some() {
        warn!("display name change applies to presence after restart");
    }
    Ok(settings.display_name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use autoscan_core::detect::stub::{ScriptStep, ScriptedDetector};
    use autoscan_core::{
        Announcer, AutoscanEngine, BoundingBox, CameraRequest, DetectorHandle, EngineConfig,
        RgbaSurface, SurfaceHandle, SyntheticCamera,
    };
    use parking_lot::Mutex;

    use crate::settings::{load_settings, AppSettings};

    fn state_with(camera: SyntheticCamera, dir: &std::path::Path) -> AppState {
        let surface = Arc::new(Mutex::new(RgbaSurface::default()));
        let engine = AutoscanEngine::new(
            EngineConfig {
                settle_delay: std::time::Duration::from_millis(5),
                camera_request: CameraRequest {
                    ideal_width: 64,
                    ideal_height: 48,
                    ..CameraRequest::default()
                },
                ..EngineConfig::default()
            },
            Arc::new(camera),
            DetectorHandle::new(
                ScriptedDetector::new(vec![ScriptStep::boxes(vec![BoundingBox::new(
                    0.1, 0.1, 0.5, 0.5,
                )])])
                .repeating(),
            ),
            Announcer::silent(),
            SurfaceHandle(surface.clone()),
        );
        AppState::new(
            engine,
            surface,
            AppSettings::default(),
            dir.join("settings.json"),
        )
    }

    #[tokio::test]
    async fn toggle_starts_then_stops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_with(SyntheticCamera::new(), dir.path());

        assert_eq!(toggle(&state), Ok(ToggleOutcome::Started { session: 1 }));
        assert_eq!(get_status(&state), EngineStatus::Running);
        assert_eq!(toggle(&state), Ok(ToggleOutcome::Stopped));
        assert_eq!(get_status(&state), EngineStatus::Stopped);
        assert_eq!(state.diagnostics_snapshot().toggles_executed, 2);
    }

    #[tokio::test]
    async fn denied_camera_returns_banner_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_with(SyntheticCamera::denied(), dir.path());

        let err = toggle(&state).expect_err("permission denied");
        assert!(err.contains("otorga permiso"), "{err}");
        assert_eq!(get_status(&state), EngineStatus::Error);
        assert_eq!(state.diagnostics_snapshot().start_failures, 1);
        assert!(!stop_engine(&state));
    }

    #[tokio::test]
    async fn display_name_is_normalized_and_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_with(SyntheticCamera::new(), dir.path());

        assert_eq!(set_display_name(&state, "  Caseta 3 "), Ok("Caseta 3".into()));
        assert_eq!(load_settings(&state.settings_path).display_name, "Caseta 3");
    }
}
