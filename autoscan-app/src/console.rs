//! Terminal rendering.
//!
//! `ConsoleView` folds engine events into what the screen shows: one live
//! status line that is redrawn in place, plus permanent lines for the error
//! banner and stream notices. Formatting is pure so it can be tested without
//! a terminal.

use std::io::Write;

use autoscan_core::ipc::events::{
    ActivityEvent, CountEvent, EngineStatus, EngineStatusEvent, PresenceEvent,
};

const RED: &str = "\x1b[31m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";
const CLEAR_LINE: &str = "\r\x1b[2K";

#[derive(Debug, Clone)]
pub struct ConsoleView {
    status: EngineStatus,
    count: usize,
    detecting: bool,
    banner: Option<String>,
    presence: Option<PresenceEvent>,
}

impl Default for ConsoleView {
    fn default() -> Self {
        Self {
            status: EngineStatus::Idle,
            count: 0,
            detecting: false,
            banner: None,
            presence: None,
        }
    }
}

impl ConsoleView {
    pub fn on_count(&mut self, event: &CountEvent) {
        self.count = event.count;
    }

    pub fn on_activity(&mut self, event: &ActivityEvent) {
        self.detecting = event.detecting;
    }

    /// Apply a status change. Returns a line to print permanently above the
    /// live line, if the change warrants one.
    pub fn on_status(&mut self, event: &EngineStatusEvent) -> Option<String> {
        self.status = event.status;
        match event.status {
            EngineStatus::Starting => {
                self.banner = None;
                None
            }
            EngineStatus::Running => None,
            EngineStatus::Error => {
                // Only acquisition failures put the engine into `Error`.
                let message = event
                    .detail
                    .clone()
                    .unwrap_or_else(|| "No se pudo acceder a la cámara.".into());
                self.banner = Some(message.clone());
                self.reset_live();
                Some(banner_line(&message))
            }
            EngineStatus::Stopped | EngineStatus::Idle => {
                self.reset_live();
                event
                    .detail
                    .as_deref()
                    .map(|detail| format!("{DIM}{detail}{RESET}"))
            }
        }
    }

    pub fn on_presence(&mut self, event: PresenceEvent) {
        self.presence = Some(event);
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    pub fn camera_on(&self) -> bool {
        matches!(self.status, EngineStatus::Starting | EngineStatus::Running)
    }

    /// The line redrawn on every update.
    pub fn status_line(&self) -> String {
        if !self.camera_on() {
            return "Cámara Desactivada | Enter: Iniciar Cámara | q: salir".into();
        }
        let mut line = count_label(self.count);
        if self.detecting {
            line.push_str(" | Analizando...");
        }
        if let Some(presence) = &self.presence {
            line.push_str(" | ");
            line.push_str(&aggregate_label(presence));
        }
        line.push_str(" | Enter: Detener Cámara");
        line
    }

    /// Per-device breakdown, one line each.
    pub fn peer_lines(&self) -> Vec<String> {
        self.presence
            .iter()
            .flat_map(|p| p.devices.iter())
            .map(|d| format!("  {} ({}): {}", d.display_name, d.device_id, d.count))
            .collect()
    }

    fn reset_live(&mut self) {
        self.count = 0;
        self.detecting = false;
    }
}

pub fn count_label(count: usize) -> String {
    format!("Autos detectados: {count}")
}

pub fn aggregate_label(presence: &PresenceEvent) -> String {
    let devices = presence.devices.len();
    let noun = if devices == 1 {
        "dispositivo"
    } else {
        "dispositivos"
    };
    format!(
        "Total en todos los dispositivos: {} ({devices} {noun})",
        presence.aggregate
    )
}

pub fn banner_line(message: &str) -> String {
    format!("{RED}⚠ {message}{RESET}")
}

/// Redraw the live line in place.
pub fn redraw(view: &ConsoleView) {
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "{CLEAR_LINE}{}", view.status_line());
    let _ = out.flush();
}

/// Print a permanent line, then restore the live line under it.
pub fn print_above(view: &ConsoleView, line: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{CLEAR_LINE}{line}");
    let _ = write!(out, "{}", view.status_line());
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscan_core::ipc::events::{CycleOutcomeKind, PresenceDevice};

    fn status(status: EngineStatus, detail: Option<&str>) -> EngineStatusEvent {
        EngineStatusEvent {
            status,
            detail: detail.map(str::to_string),
        }
    }

    fn count(n: usize) -> CountEvent {
        CountEvent {
            seq: 1,
            session: 1,
            count: n,
            outcome: CycleOutcomeKind::Detected,
            boxes: Vec::new(),
            rects: Vec::new(),
            detail: None,
        }
    }

    #[test]
    fn idle_view_offers_to_start() {
        let view = ConsoleView::default();
        assert!(view.status_line().starts_with("Cámara Desactivada"));
        assert!(view.banner().is_none());
    }

    #[test]
    fn running_view_shows_count_and_loading() {
        let mut view = ConsoleView::default();
        view.on_status(&status(EngineStatus::Running, None));
        view.on_count(&count(3));
        view.on_activity(&ActivityEvent {
            seq: 2,
            detecting: true,
        });

        let line = view.status_line();
        assert!(line.starts_with("Autos detectados: 3 | Analizando..."), "{line}");
        assert!(line.ends_with("Detener Cámara"));
    }

    #[test]
    fn acquisition_error_raises_banner_until_next_start() {
        let mut view = ConsoleView::default();
        let printed = view
            .on_status(&status(
                EngineStatus::Error,
                Some("No se pudo acceder a la cámara. Por favor, otorga permiso para usar la cámara."),
            ))
            .expect("banner printed");
        assert!(printed.starts_with(RED));
        assert!(view.banner().is_some_and(|b| b.contains("otorga permiso")));
        assert!(!view.camera_on());

        view.on_status(&status(EngineStatus::Starting, None));
        assert!(view.banner().is_none());
    }

    #[test]
    fn stopping_resets_count_and_prints_notice_only_with_detail() {
        let mut view = ConsoleView::default();
        view.on_status(&status(EngineStatus::Running, None));
        view.on_count(&count(4));

        assert!(view.on_status(&status(EngineStatus::Stopped, None)).is_none());
        assert_eq!(view.count, 0);

        view.on_status(&status(EngineStatus::Running, None));
        let notice = view.on_status(&status(EngineStatus::Stopped, Some("camera stream ended")));
        assert!(notice.is_some_and(|n| n.contains("camera stream ended")));
        assert!(view.banner().is_none());
    }

    #[test]
    fn presence_adds_aggregate_and_peer_lines() {
        let mut view = ConsoleView::default();
        view.on_status(&status(EngineStatus::Running, None));
        view.on_presence(PresenceEvent {
            aggregate: 5,
            devices: vec![
                PresenceDevice {
                    device_id: "device-a".into(),
                    display_name: "Norte".into(),
                    count: 2,
                },
                PresenceDevice {
                    device_id: "device-b".into(),
                    display_name: "Sur".into(),
                    count: 3,
                },
            ],
        });

        assert!(view
            .status_line()
            .contains("Total en todos los dispositivos: 5 (2 dispositivos)"));
        assert_eq!(view.peer_lines(), vec!["  Norte (device-a): 2", "  Sur (device-b): 3"]);
    }

    #[test]
    fn aggregate_label_uses_singular_for_one_device() {
        let presence = PresenceEvent {
            aggregate: 1,
            devices: vec![PresenceDevice {
                device_id: "device-a".into(),
                display_name: "Norte".into(),
                count: 1,
            }],
        };
        assert!(aggregate_label(&presence).ends_with("(1 dispositivo)"));
    }
}
