//! Gemini `generateContent` backend.
//!
//! Sends one inline JPEG plus a fixed instruction and asks for a JSON array of
//! `[ymin, xmin, ymax, xmax]` boxes. The reply text is decoded and validated
//! by [`parse_detections_text`]; an empty reply is an invalid payload, not a
//! transport error.

use std::time::Duration;

use base64::Engine as _;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::capture::EncodedFrame;
use crate::detect::{parse_detections_text, DetectFuture, DetectionResponse, Detector};
use crate::error::{AutoscanError, DetectionError, Result};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";

/// Environment variables checked for the API key, in order.
pub const API_KEY_ENV_VARS: &[&str] = &["AUTOSCAN_API_KEY", "GEMINI_API_KEY", "API_KEY"];

pub const VEHICLE_PROMPT: &str = "Detect all cars, trucks, and buses in this image. \
Provide ONLY a JSON array of bounding boxes. \
Each box must be in the format [ymin, xmin, ymax, xmax] with normalized coordinates from 0.0 to 1.0. \
If no vehicles are found, return an empty array [].";

/// Maximum number of response body characters kept in a status error.
const ERROR_BODY_PREVIEW: usize = 240;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    /// Base URL up to and including the API version segment.
    pub endpoint: String,
    pub timeout: Duration,
    pub prompt: String,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.into(),
            endpoint: DEFAULT_ENDPOINT.into(),
            timeout: Duration::from_secs(20),
            prompt: VEHICLE_PROMPT.into(),
        }
    }

    /// Build a config from the first non-empty key in [`API_KEY_ENV_VARS`].
    ///
    /// # Errors
    /// `AutoscanError::Other` when no key is set; the detector cannot work
    /// without one.
    pub fn from_env() -> Result<Self> {
        let key = API_KEY_ENV_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
            .ok_or_else(|| {
                AutoscanError::Other(anyhow::anyhow!(
                    "API key environment variable is not set (tried {})",
                    API_KEY_ENV_VARS.join(", ")
                ))
            })?;
        let mut config = Self::new(key);
        if let Ok(model) = std::env::var("AUTOSCAN_MODEL") {
            if !model.trim().is_empty() {
                config.model = model.trim().to_string();
            }
        }
        Ok(config)
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        )
    }
}

pub struct GeminiDetector {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiDetector {
    /// # Errors
    /// `AutoscanError::Other` if the HTTP client cannot be built.
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AutoscanError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self { client, config })
    }
}

impl Detector for GeminiDetector {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn detect(&self, frame: EncodedFrame) -> DetectFuture {
        let client = self.client.clone();
        let url = self.config.url();
        let api_key = self.config.api_key.clone();
        let body = request_body(&frame, &self.config.prompt);

        Box::pin(async move {
            let response = client
                .post(&url)
                .header("x-goog-api-key", api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| DetectionError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(status = %status, "detection request returned non-success status");
                return Err(DetectionError::Status {
                    code: status.as_u16(),
                    body: body.chars().take(ERROR_BODY_PREVIEW).collect(),
                });
            }

            let payload: Value = response
                .json()
                .await
                .map_err(|e| DetectionError::Parse(e.to_string()))?;
            interpret_payload(&payload)
        })
    }
}

fn request_body(frame: &EncodedFrame, prompt: &str) -> Value {
    let data = base64::engine::general_purpose::STANDARD.encode(&frame.jpeg);
    json!({
        "contents": [{
            "parts": [
                { "inline_data": { "mime_type": "image/jpeg", "data": data } },
                { "text": prompt }
            ]
        }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": {
                "type": "ARRAY",
                "items": { "type": "ARRAY", "items": { "type": "NUMBER" } }
            }
        }
    })
}

/// Turn a decoded `generateContent` reply into a validated response.
fn interpret_payload(payload: &Value) -> std::result::Result<DetectionResponse, DetectionError> {
    if let Some(err) = payload.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown service error");
        return Err(DetectionError::Service(message.to_string()));
    }

    if let Some(reason) = payload
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(DetectionError::Service(format!("prompt blocked: {reason}")));
    }

    let text: String = payload
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        warn!("detection service returned an empty response");
        return Ok(DetectionResponse::invalid("empty response text"));
    }

    let parsed = parse_detections_text(&text);
    debug!(count = parsed.count(), valid = parsed.is_valid(), "detection payload parsed");
    Ok(parsed)
}
