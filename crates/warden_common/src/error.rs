//! Error types for Warden.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Certificate authority not initialized: {0}")]
    CaNotInitialized(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Baseline error: {0}")]
    Baseline(String),

    #[error("Observation fault: {0}")]
    Observation(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Evidence chain error: {0}")]
    Chain(String),

    #[error("Anchor error: {0}")]
    Anchor(String),

    #[error("Time source error: {0}")]
    TimeSource(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Action registry error: {0}")]
    Registry(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Rejected by central: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("X.509 generation error: {0}")]
    Rcgen(#[from] rcgen::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl WardenError {
    /// Integrity faults are surfaced as tamper alerts rather than retried
    pub fn is_integrity_fault(&self) -> bool {
        matches!(self, WardenError::Signature(_) | WardenError::Chain(_))
    }

    /// Sending the same bytes again cannot succeed
    pub fn is_permanent(&self) -> bool {
        self.is_integrity_fault() || matches!(self, WardenError::Json(_) | WardenError::Rejected(_))
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
