//! Shared error type and time helpers

use std::time::{SystemTime, UNIX_EPOCH};

/// Everything that can go wrong while a worker talks to the remote service.
///
/// Each variant is a distinct failure kind; the classifier in
/// [`crate::classifier`] maps kinds onto recovery actions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScanError {
    /// The egress path (proxy / circuit) was rejected by the remote.
    #[error("Egress path rejected by remote")]
    EgressBanned,

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Session is not authenticated")]
    NotAuthenticated,

    #[error("Remote busy or offline")]
    ServerBusy,

    #[error("Remote is throttling requests")]
    Throttled,

    #[error("Account banned")]
    AccountBanned,

    #[error("Challenge required: {0}")]
    ChallengeRequired(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;

impl From<std::io::Error> for ScanError {
    fn from(e: std::io::Error) -> Self {
        ScanError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(e: serde_json::Error) -> Self {
        ScanError::MalformedResponse(e.to_string())
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock seconds since the Unix epoch
pub fn now_secs() -> u64 {
    now_ms() / 1000
}
