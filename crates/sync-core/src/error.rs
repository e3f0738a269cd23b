//! Error type shared by the remote clients and the sync manager.

use crate::fs::FsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Request failed with HTTP {status}: {message}")]
    RequestFailed { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("No API token configured")]
    AuthMissing,

    #[error("Service error {code}: {message}")]
    ApplicationError { code: i64, message: String },

    #[error("Conflict detected in {0}, resolve manually")]
    ConflictDetected(String),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] FsError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("State persistence error: {0}")]
    State(String),

    #[error("A sync is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout
        } else if let Some(status) = e.status() {
            SyncError::RequestFailed {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}
