use thiserror::Error;

/// All errors produced by autoscan-core.
#[derive(Debug, Error)]
pub enum AutoscanError {
    #[error("camera permission denied: {0}")]
    CameraPermissionDenied(String),

    #[error("no matching camera found: {0}")]
    NoMatchingCamera(String),

    #[error("camera error: {0}")]
    Camera(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("speech error: {0}")]
    Speech(String),

    #[error("presence store error: {0}")]
    Presence(String),

    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AutoscanError {
    /// Whether this error came from camera acquisition (fatal to the session).
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self,
            AutoscanError::CameraPermissionDenied(_)
                | AutoscanError::NoMatchingCamera(_)
                | AutoscanError::Camera(_)
        )
    }

    /// Banner text shown to the user when a session cannot start.
    pub fn user_message(&self) -> String {
        const PREFIX: &str = "No se pudo acceder a la cámara.";
        match self {
            AutoscanError::CameraPermissionDenied(_) => {
                format!("{PREFIX} Por favor, otorga permiso para usar la cámara.")
            }
            AutoscanError::NoMatchingCamera(_) => {
                format!("{PREFIX} No se encontró una cámara trasera en el dispositivo.")
            }
            AutoscanError::Camera(detail) => format!("{PREFIX} Detalle: {detail}"),
            other => format!("{PREFIX} Detalle: {other}"),
        }
    }
}

/// Failure of a single detection request. Always recoverable at the loop level.
#[derive(Debug, Clone, Error)]
pub enum DetectionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("service returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("malformed service payload: {0}")]
    Parse(String),

    #[error("service error: {0}")]
    Service(String),

    #[error("request task ended before completing")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AutoscanError>;
