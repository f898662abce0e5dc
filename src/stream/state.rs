use serde::Serialize;

/// Lifecycle state of a stream controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Nothing requested yet
    #[default]
    Idle,
    /// Session being opened, handle being attached, or retry pending
    Ensuring,
    /// Plugin handle attached
    Attached,
    /// Stopped on request; no automatic retries
    Stopped,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::Ensuring => write!(f, "ensuring"),
            StreamState::Attached => write!(f, "attached"),
            StreamState::Stopped => write!(f, "stopped"),
        }
    }
}
