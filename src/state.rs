//! # Session State Snapshots
//!
//! Everything the UI needs to render a voice session, published by the session task
//! after every event it handles.
//!
//! ## Ownership model:
//! The session task is the only writer. It owns the live state as plain fields and
//! publishes an immutable `SessionSnapshot` through a `tokio::sync::watch` channel, so
//! readers never hold a lock on state the session is mutating.
//!
//! ## Rust Concepts:
//! - **#[derive(Clone)]**: Snapshots are cloned out to each observer
//! - **Option<T>**: The error slot and pending navigation are either present or not
//! - **Default**: Counters start at zero without hand-written constructors

use crate::error::{ErrorKind, SessionError};
use crate::navigation::NavigationTarget;
use crate::session::phase::Phase;
use chrono::{DateTime, Utc};

/// Lifecycle of the duplex channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// Follow-up the UI can offer next to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Reconnect,
}

/// One user-visible error.
#[derive(Debug, Clone, PartialEq)]
pub struct UserError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry: Option<RetryAction>,
    pub raised_at: DateTime<Utc>,
}

impl UserError {
    pub fn new(error: &SessionError, retry: Option<RetryAction>) -> Self {
        Self {
            kind: error.kind(),
            message: error.message().to_string(),
            retry,
            raised_at: Utc::now(),
        }
    }
}

/// Holds at most one error at a time; a newer error replaces the older one.
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot {
    current: Option<UserError>,
}

impl ErrorSlot {
    pub fn raise(&mut self, error: &SessionError, retry: Option<RetryAction>) {
        self.current = Some(UserError::new(error, retry));
    }

    /// Clear the banner (user pressed the close button).
    pub fn dismiss(&mut self) -> bool {
        self.current.take().is_some()
    }

    /// Clear the banner only if it belongs to the given class, e.g. connectivity
    /// errors once the channel is back.
    pub fn clear_kind(&mut self, kind: ErrorKind) {
        if self.current.as_ref().is_some_and(|e| e.kind == kind) {
            self.current = None;
        }
    }

    pub fn current(&self) -> Option<&UserError> {
        self.current.as_ref()
    }
}

/// Counters collected over the lifetime of a session.
///
/// ## Why these metrics matter:
/// - **chunks_played / chunks_dropped**: Verify every chunk is played or accounted for
/// - **format_failures**: Shows how close the session is to abandoning playback
/// - **reconnect_attempts**: Bounded by the channel's reconnect budget
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub chunks_played: u64,
    pub chunks_dropped: u64,
    pub format_failures: u32,
    pub reconnect_attempts: u32,
    pub turns_completed: u64,
}

/// Read-only view of the session published to observers.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub connection: ConnectionStatus,
    pub phase: Phase,
    /// Finalized plus interim transcript of the user's speech
    pub transcript: String,
    /// Assistant text with navigation markers removed
    pub response: String,
    pub error: Option<UserError>,
    pub queued_chunks: usize,
    pub pending_navigation: Option<NavigationTarget>,
    pub metrics: SessionMetrics,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionStatus::Connected
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_slot_holds_one_error() {
        let mut slot = ErrorSlot::default();
        slot.raise(&SessionError::Connectivity("lost".into()), Some(RetryAction::Reconnect));
        slot.raise(&SessionError::Backend("mic busy".into()), None);

        let current = slot.current().unwrap();
        assert_eq!(current.message, "mic busy");
        assert_eq!(current.retry, None);

        assert!(slot.dismiss());
        assert!(slot.current().is_none());
        assert!(!slot.dismiss());
    }

    #[test]
    fn test_clear_kind_only_matches_same_kind() {
        let mut slot = ErrorSlot::default();
        slot.raise(&SessionError::Media("denied".into()), None);
        slot.clear_kind(ErrorKind::Connectivity);
        assert!(slot.current().is_some());
        slot.clear_kind(ErrorKind::Media);
        assert!(slot.current().is_none());
    }
}
