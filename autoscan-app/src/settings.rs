//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use autoscan_core::capture::CameraRequest;
use autoscan_core::detect::gemini::DEFAULT_MODEL;
use autoscan_core::speech::VoiceConfig;
use autoscan_core::EngineConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// `synthetic`, `directory` or `v4l2`.
    pub camera_source: String,
    pub camera_device: String,
    pub frames_dir: Option<String>,
    pub frame_width: u32,
    pub frame_height: u32,
    /// `gemini` or `stub`.
    pub detector: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub jpeg_quality: u8,
    pub settle_delay_ms: u64,
    pub announce_errors: bool,
    pub speech_enabled: bool,
    pub speech_program: String,
    pub speech_lang: String,
    /// `off`, `local` or `firebase`.
    pub presence: String,
    pub presence_url: Option<String>,
    pub presence_auth: Option<String>,
    pub display_name: String,
    pub overlay_output: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            camera_source: "synthetic".into(),
            camera_device: "/dev/video0".into(),
            frames_dir: None,
            frame_width: 1280,
            frame_height: 720,
            detector: "gemini".into(),
            model: DEFAULT_MODEL.into(),
            api_key: None,
            request_timeout_secs: 20,
            jpeg_quality: 50,
            settle_delay_ms: 750,
            announce_errors: true,
            speech_enabled: true,
            speech_program: "espeak-ng".into(),
            speech_lang: "es-MX".into(),
            presence: "off".into(),
            presence_url: None,
            presence_auth: None,
            display_name: "autoscan".into(),
            overlay_output: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.camera_source = normalize_camera_source(&self.camera_source);
        self.camera_device = non_empty_or(&self.camera_device, "/dev/video0");
        self.frames_dir = trimmed(self.frames_dir.as_deref());
        self.frame_width = self.frame_width.clamp(160, 3840);
        self.frame_height = self.frame_height.clamp(120, 2160);
        self.detector = normalize_detector(&self.detector);
        self.model = non_empty_or(&self.model, DEFAULT_MODEL);
        self.api_key = trimmed(self.api_key.as_deref());
        self.request_timeout_secs = self.request_timeout_secs.clamp(2, 120);
        self.jpeg_quality = self.jpeg_quality.clamp(10, 95);
        self.settle_delay_ms = self.settle_delay_ms.clamp(100, 10_000);
        self.speech_program = non_empty_or(&self.speech_program, "espeak-ng");
        self.speech_lang = normalize_speech_lang(&self.speech_lang);
        self.presence = normalize_presence(&self.presence);
        self.presence_url = trimmed(self.presence_url.as_deref())
            .map(|url| url.trim_end_matches('/').to_string());
        self.presence_auth = trimmed(self.presence_auth.as_deref());
        self.display_name = non_empty_or(&self.display_name, "autoscan");
        self.overlay_output = trimmed(self.overlay_output.as_deref());
        // Firebase without a database URL has nowhere to write.
        if self.presence == "firebase" && self.presence_url.is_none() {
            self.presence = "off".into();
        }
    }

    /// Apply `AUTOSCAN_*` overrides from the process environment. Values
    /// that fail to parse are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
        self.normalize();
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("AUTOSCAN_CAMERA") {
            self.camera_source = v;
        }
        if let Some(v) = get("AUTOSCAN_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = get("AUTOSCAN_FRAMES_DIR") {
            self.frames_dir = Some(v);
        }
        if let Some(v) = get("AUTOSCAN_DETECTOR") {
            self.detector = v;
        }
        if let Some(v) = get("AUTOSCAN_MODEL") {
            self.model = v;
        }
        if let Some(v) = get("AUTOSCAN_SETTLE_MS") {
            match v.trim().parse() {
                Ok(ms) => self.settle_delay_ms = ms,
                Err(e) => warn!(value = %v, "ignoring AUTOSCAN_SETTLE_MS: {e}"),
            }
        }
        if let Some(v) = get("AUTOSCAN_JPEG_QUALITY") {
            match v.trim().parse() {
                Ok(q) => self.jpeg_quality = q,
                Err(e) => warn!(value = %v, "ignoring AUTOSCAN_JPEG_QUALITY: {e}"),
            }
        }
        if let Some(v) = get("AUTOSCAN_SPEECH") {
            match parse_flag(&v) {
                Some(flag) => self.speech_enabled = flag,
                None => warn!(value = %v, "ignoring AUTOSCAN_SPEECH"),
            }
        }
        if let Some(v) = get("AUTOSCAN_PRESENCE") {
            self.presence = v;
        }
        if let Some(v) = get("AUTOSCAN_PRESENCE_URL") {
            self.presence_url = Some(v);
        }
        if let Some(v) = get("AUTOSCAN_DISPLAY_NAME") {
            self.display_name = v;
        }
        if let Some(v) = get("AUTOSCAN_OVERLAY_OUTPUT") {
            self.overlay_output = Some(v);
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            jpeg_quality: self.jpeg_quality,
            camera_request: CameraRequest {
                ideal_width: self.frame_width,
                ideal_height: self.frame_height,
                ..CameraRequest::default()
            },
            announce_errors: self.announce_errors,
            ..EngineConfig::default()
        }
    }

    pub fn voice_config(&self) -> VoiceConfig {
        let mut voices = VoiceConfig::default();
        voices.detection.lang = self.speech_lang.clone();
        voices.system.lang = self.speech_lang.clone();
        voices
    }

    pub fn overlay_output_path(&self) -> Option<PathBuf> {
        self.overlay_output.as_ref().map(PathBuf::from)
    }
}

pub fn normalize_camera_source(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "dir" | "directory" | "frames" => "directory".into(),
        "v4l2" | "v4l" | "webcam" | "device" => "v4l2".into(),
        _ => "synthetic".into(),
    }
}

pub fn normalize_detector(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "stub" | "offline" | "scripted" | "demo" => "stub".into(),
        _ => "gemini".into(),
    }
}

pub fn normalize_presence(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "local" => "local".into(),
        "firebase" | "cloud" | "rtdb" => "firebase".into(),
        _ => "off".into(),
    }
}

pub fn normalize_speech_lang(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "es-es" => "es-ES".into(),
        "es-us" => "es-US".into(),
        _ => "es-MX".into(),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

fn non_empty_or(raw: &str, fallback: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        fallback.into()
    } else {
        value.into()
    }
}

fn trimmed(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("autoscan")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("autoscan")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
