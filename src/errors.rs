use thiserror::Error;

/// Errors surfaced by the coordination core
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// Report or verdict older than the allowed age. The gate turns this into a denial reason.
    #[error("stale input: {reason}")]
    StaleInput { reason: String },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("integrity check failed for {path}: {reason}")]
    Integrity { path: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FleetError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        FleetError::NotFound { kind, id: id.into() }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        FleetError::Conflict { reason: reason.into() }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        FleetError::InvalidRequest { reason: reason.into() }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        FleetError::Transport { reason: reason.into() }
    }

    /// Wire label used in API envelopes
    pub fn status_label(&self) -> &'static str {
        match self {
            FleetError::NotFound { .. } => "not_found",
            FleetError::Conflict { .. } => "conflict",
            FleetError::InvalidRequest { .. } => "invalid",
            _ => "error",
        }
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(err: reqwest::Error) -> Self {
        FleetError::Transport { reason: err.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
