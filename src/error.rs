//! # Error Handling
//!
//! This module defines the session's error type and the taxonomy used to decide how
//! each failure is presented to the user.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of failure
//! - **Data**: Each variant holds a message describing what went wrong
//! - **Pattern matching**: Use `match` to map a failure to its category
//!
//! ### Traits for Error Conversion
//! - **From trait**: Lets `?` convert library errors into `SessionError`
//! - **Display trait**: Defines how errors are formatted as strings
//!
//! ## Propagation policy:
//! Failures are caught at the boundary where they happen (socket task, media adapter,
//! capture task) and turned into a `SessionError`. The session then places one
//! user-facing message in its error slot and logs the details; nothing is allowed to
//! escape as a panic across task boundaries.

use std::fmt;
use tokio_tungstenite::tungstenite;

/// Custom error types for the voice session.
///
/// ## Error Categories:
/// - **Connectivity**: No socket, connect timeout, abnormal close (recoverable, auto-reconnect)
/// - **Unauthorized**: Token rejected (fatal to the session, forces logout)
/// - **Media**: Microphone denied, decode failure, candidate not playable
/// - **FormatUnsupported**: Too many chunks could not be played in any format
/// - **Protocol**: Malformed or unexpected messages (logged and ignored)
/// - **Backend**: The voice service reported an error for the current turn
/// - **InvalidState**: A command that is not legal in the current phase
/// - **Config**: Configuration file or environment variable problems
/// - **Internal**: Anything else (task failures, bugs)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Connectivity(String),
    Unauthorized(String),
    Media(String),
    FormatUnsupported(String),
    Protocol(String),
    Backend(String),
    InvalidState(String),
    Config(String),
    Internal(String),
}

/// Coarse error classes that drive recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    Authorization,
    Media,
    Protocol,
    Backend,
    Internal,
}

impl SessionError {
    /// Map the error onto the taxonomy used by the error slot.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connectivity(_) => ErrorKind::Connectivity,
            SessionError::Unauthorized(_) => ErrorKind::Authorization,
            SessionError::Media(_) | SessionError::FormatUnsupported(_) => ErrorKind::Media,
            SessionError::Protocol(_) => ErrorKind::Protocol,
            SessionError::Backend(_) => ErrorKind::Backend,
            SessionError::InvalidState(_) | SessionError::Config(_) | SessionError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// The bare message without the category prefix, suitable for a banner.
    pub fn message(&self) -> &str {
        match self {
            SessionError::Connectivity(msg)
            | SessionError::Unauthorized(msg)
            | SessionError::Media(msg)
            | SessionError::FormatUnsupported(msg)
            | SessionError::Protocol(msg)
            | SessionError::Backend(msg)
            | SessionError::InvalidState(msg)
            | SessionError::Config(msg)
            | SessionError::Internal(msg) => msg,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Connectivity(msg) => write!(f, "Connection error: {}", msg),
            SessionError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            SessionError::Media(msg) => write!(f, "Media error: {}", msg),
            SessionError::FormatUnsupported(msg) => write!(f, "Unsupported audio format: {}", msg),
            SessionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SessionError::Backend(msg) => write!(f, "Voice service error: {}", msg),
            SessionError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            SessionError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SessionError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// Malformed JSON from the backend is a protocol problem, never a crash.
impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(format!("JSON parsing error: {}", err))
    }
}

/// Audio payloads arrive base64-encoded; a bad payload is a per-chunk media failure.
impl From<base64::DecodeError> for SessionError {
    fn from(err: base64::DecodeError) -> Self {
        SessionError::Media(format!("Audio payload is not valid base64: {}", err))
    }
}

impl From<config::ConfigError> for SessionError {
    fn from(err: config::ConfigError) -> Self {
        SessionError::Config(err.to_string())
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        SessionError::Internal(err.to_string())
    }
}

/// Handshake rejections with 401/403 are authorization failures; everything else
/// the socket can report is a connectivity failure.
impl From<tungstenite::Error> for SessionError {
    fn from(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(response)
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                SessionError::Unauthorized(format!(
                    "Voice endpoint rejected credentials ({})",
                    response.status()
                ))
            }
            _ => SessionError::Connectivity(err.to_string()),
        }
    }
}

/// Type alias for Results that use the session error type.
pub type SessionResult<T> = Result<T, SessionError>;
