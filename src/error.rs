use thiserror::Error;

/// Failures that reach the session status.
///
/// Decode and close failures never appear here; they are logged where they
/// happen and the session carries on.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a live session is already active")]
    AlreadyActive,

    #[error("failed to acquire audio device: {0}")]
    Acquisition(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no API key configured (set GEMINI_API_KEY or network.api_key)")]
    MissingApiKey,
}

pub type SessionResult<T> = Result<T, SessionError>;
