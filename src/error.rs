use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Plugin error [{plugin}]: {reason}")]
    Plugin { plugin: String, reason: String },

    #[error("Plugin handle is gone")]
    HandleGone,

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("STUN error: {0}")]
    Stun(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Short text suitable for the status line of a stream view
    pub fn status_text(&self) -> String {
        match self {
            AppError::Signaling(reason) => reason.clone(),
            AppError::Plugin { reason, .. } => reason.clone(),
            AppError::WebRtcError(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Signaling(err.to_string())
    }
}

impl From<webrtc::Error> for AppError {
    fn from(err: webrtc::Error) -> Self {
        AppError::WebRtcError(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
