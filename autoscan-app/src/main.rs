//! autoscan terminal application entry point.
//!
//! Wires settings, camera, detector, speech and presence into an
//! `AutoscanEngine`, forwards engine events to the console, and maps key
//! presses onto start/stop. Enter toggles the camera, `q` quits.

mod commands;
mod console;
mod settings;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use autoscan_core::detect::stub::{ScriptStep, ScriptedDetector};
use autoscan_core::presence::{generate_device_id, HubSession};
use autoscan_core::{
    Announcer, AutoscanEngine, BoundingBox, Camera, CommandSpeaker, DetectorHandle,
    DirectoryCamera, FirebaseConfig, FirebasePresence, GeminiConfig, GeminiDetector,
    LocalPresenceHub, LogSpeaker, PresenceEvent, PresenceSync, RgbaSurface, SpeechBackend,
    SurfaceHandle, SyntheticCamera,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{info, warn};

use commands::ToggleOutcome;
use console::ConsoleView;
use settings::{default_settings_path, load_settings, AppSettings};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autoscan=info,autoscan_core=info".into()),
        )
        .init();

    let settings_path = default_settings_path();
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();
    info!(
        path = %settings_path.display(),
        camera = %settings.camera_source,
        detector = %settings.detector,
        presence = %settings.presence,
        "settings loaded"
    );

    let camera = build_camera(&settings);
    let detector = build_detector(&settings)?;
    let speaker: Arc<dyn SpeechBackend> = if settings.speech_enabled {
        Arc::new(CommandSpeaker::new(settings.speech_program.clone()))
    } else {
        Arc::new(LogSpeaker)
    };
    let announcer = Announcer::new(speaker, settings.voice_config());
    let surface = Arc::new(Mutex::new(RgbaSurface::default()));

    let mut engine = AutoscanEngine::new(
        settings.engine_config(),
        camera,
        detector,
        announcer,
        SurfaceHandle(surface.clone()),
    );
    if let Some(presence) = build_presence(&settings)? {
        info!(device = presence.device_id(), "presence enabled");
        engine = engine.with_presence(presence);
    }

    let state = Arc::new(AppState::new(engine, surface, settings, settings_path));
    let view = Arc::new(Mutex::new(ConsoleView::default()));
    spawn_forwarders(&state, &view);

    console::redraw(&view.lock());
    let mut input = spawn_stdin_reader();
    loop {
        tokio::select! {
            line = input.recv() => {
                let Some(line) = line else { break };
                if !handle_line(&state, &view, line.trim()) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!();
    if let Some(loop_state) = state.engine.shutdown().await {
        info!(cycles = loop_state.cycles(), "detection loop finished");
    }
    if let Some(presence) = &state.presence {
        presence.disconnect();
    }
    let diag = state.diagnostics_snapshot();
    info!(
        toggles_executed = diag.toggles_executed,
        detection_calls = diag.pipeline_detection_calls,
        announcements = diag.pipeline_announcements,
        "autoscan shut down"
    );
    Ok(())
}

/// Handle one line of console input. Returns `false` to quit.
fn handle_line(state: &AppState, view: &Mutex<ConsoleView>, line: &str) -> bool {
    match line {
        "" => {
            match commands::toggle(state) {
                Ok(ToggleOutcome::Started { session }) => info!(session, "camera on"),
                Ok(ToggleOutcome::Stopped) => info!("camera off"),
                // Acquisition failures also arrive as an `Error` status event,
                // which raises the banner.
                Err(message) => warn!(error = %message, "toggle failed"),
            }
        }
        "q" | "quit" | "salir" => return false,
        "p" => {
            let view = view.lock();
            for line in view.peer_lines() {
                console::print_above(&view, &line);
            }
        }
        "s" => {
            let view = view.lock();
            let mut line = format!("estado: {:?}", commands::get_status(state));
            if let Some(banner) = view.banner() {
                line.push_str(" | ");
                line.push_str(banner);
            }
            console::print_above(&view, &line);
        }
        "d" => {
            let diag = state.diagnostics_snapshot();
            let rendered = serde_json::to_string(&diag).unwrap_or_default();
            console::print_above(&view.lock(), &rendered);
        }
        other => {
            if let Some(name) = other.strip_prefix("name ") {
                match commands::set_display_name(state, name) {
                    Ok(saved) => info!(display_name = %saved, "display name saved"),
                    Err(e) => warn!(error = %e, "could not save display name"),
                }
            } else {
                console::print_above(
                    &view.lock(),
                    "Enter: iniciar/detener | s: estado | p: dispositivos | d: diagnóstico | name <nombre> | q: salir",
                );
            }
        }
    }
    console::redraw(&view.lock());
    true
}

fn build_camera(settings: &AppSettings) -> Arc<dyn Camera> {
    match settings.camera_source.as_str() {
        "directory" => match &settings.frames_dir {
            Some(dir) => Arc::new(DirectoryCamera::new(dir)),
            None => {
                warn!("camera source `directory` needs framesDir; using synthetic frames");
                Arc::new(SyntheticCamera::new())
            }
        },
        "v4l2" => v4l2_camera(settings),
        _ => Arc::new(SyntheticCamera::new()),
    }
}

#[cfg(feature = "camera-v4l2")]
fn v4l2_camera(settings: &AppSettings) -> Arc<dyn Camera> {
    Arc::new(autoscan_core::V4l2Camera::new(settings.camera_device.clone()))
}

#[cfg(not(feature = "camera-v4l2"))]
fn v4l2_camera(settings: &AppSettings) -> Arc<dyn Camera> {
    warn!(
        device = %settings.camera_device,
        "built without camera-v4l2; using synthetic frames"
    );
    Arc::new(SyntheticCamera::new())
}

fn build_detector(settings: &AppSettings) -> anyhow::Result<DetectorHandle> {
    if settings.detector == "stub" {
        info!("offline mode: scripted detections");
        return Ok(DetectorHandle::new(demo_detector()));
    }

    let mut config = match GeminiConfig::from_env() {
        Ok(config) => config,
        Err(env_err) => match &settings.api_key {
            Some(key) => GeminiConfig::new(key.clone()),
            None => return Err(env_err).context("no API key for the vision service"),
        },
    };
    config.model = settings.model.clone();
    config.timeout = Duration::from_secs(settings.request_timeout_secs);
    let detector = GeminiDetector::new(config).context("building detection client")?;
    Ok(DetectorHandle::new(detector))
}

/// A slow loop through a few traffic scenes.
fn demo_detector() -> ScriptedDetector {
    let lane = |x: f32| BoundingBox::new(0.45, x, 0.75, x + 0.2);
    ScriptedDetector::new(vec![
        ScriptStep::boxes(vec![lane(0.05)]),
        ScriptStep::boxes(vec![lane(0.05), lane(0.4)]),
        ScriptStep::boxes(vec![lane(0.05), lane(0.4)]),
        ScriptStep::boxes(vec![lane(0.05), lane(0.4), lane(0.75)]),
        ScriptStep::boxes(vec![lane(0.4)]),
        ScriptStep::boxes(vec![]),
    ])
    .repeating()
    .with_latency(Duration::from_millis(400))
}

fn build_presence(settings: &AppSettings) -> anyhow::Result<Option<Arc<dyn PresenceSync>>> {
    let device_id = generate_device_id();
    match settings.presence.as_str() {
        "local" => {
            let session: HubSession =
                LocalPresenceHub::default().connect(device_id, settings.display_name.clone());
            Ok(Some(Arc::new(session)))
        }
        "firebase" => {
            let Some(url) = &settings.presence_url else {
                return Ok(None);
            };
            let mut config = FirebaseConfig::new(url.clone(), settings.display_name.clone());
            config.auth = settings.presence_auth.clone();
            let presence =
                FirebasePresence::connect(config, device_id).context("connecting presence")?;
            Ok(Some(Arc::new(presence)))
        }
        _ => Ok(None),
    }
}

fn spawn_forwarders(state: &Arc<AppState>, view: &Arc<Mutex<ConsoleView>>) {
    // counts → live line, overlay dump
    {
        let mut rx = state.engine.subscribe_counts();
        let view = Arc::clone(view);
        let state = Arc::clone(state);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        {
                            let mut view = view.lock();
                            view.on_count(&event);
                            console::redraw(&view);
                        }
                        dump_overlay(&state);
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("count receiver lagged by {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // status → banner / notices
    {
        let mut rx = state.engine.subscribe_status();
        let view = Arc::clone(view);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let mut view = view.lock();
                        match view.on_status(&event) {
                            Some(line) => console::print_above(&view, &line),
                            None => console::redraw(&view),
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("status receiver lagged by {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // activity → "Analizando..."
    {
        let mut rx = state.engine.subscribe_activity();
        let view = Arc::clone(view);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let mut view = view.lock();
                        view.on_activity(&event);
                        console::redraw(&view);
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("activity receiver lagged by {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // presence → aggregate line
    if let Some(presence) = &state.presence {
        let mut rx = presence.subscribe();
        let view = Arc::clone(view);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(snapshot) => {
                        let mut view = view.lock();
                        view.on_presence(PresenceEvent::from(&snapshot));
                        console::redraw(&view);
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("presence receiver lagged by {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Write the overlay raster to `overlayOutput`, off the async threads.
fn dump_overlay(state: &Arc<AppState>) {
    let Some(path) = state.settings.lock().overlay_output_path() else {
        return;
    };
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || {
        let result = state.surface.lock().save_png(&path);
        match result {
            Ok(()) => {
                state
                    .overlay_dumps
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Err(e) => {
                state
                    .overlay_dump_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(path = %path.display(), error = %e, "overlay dump failed");
            }
        }
    });
}

/// Console input on a plain thread; process exit does not wait for it.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("autoscan-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| warn!(error = %e, "could not start console input thread"))
        .ok();
    rx
}
