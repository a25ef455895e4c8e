//! # Session Phases
//!
//! The lifecycle of one conversational turn, as a fixed transition table.
//!
//! ## Turn Lifecycle:
//! 1. **Idle**: Ready; recording is available while the channel is connected
//! 2. **Recording**: Microphone audio is streamed to the backend
//! 3. **Processing**: Waiting for the backend to answer the turn
//! 4. **AwaitingPlayback**: Speech arrived but playback needs a user gesture
//! 5. **Playing / Paused**: Speech is being played
//! 6. **Cancelled / Error**: Recoverable detours that route straight back to Idle

use crate::error::{SessionError, SessionResult};
use std::fmt;
use tracing::warn;

/// Current phase of the session.
///
/// ## Rust Concepts:
/// - **#[derive(Copy)]**: Phases are plain tags, copied rather than borrowed
/// - **#[default]**: A fresh session starts idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Recording,
    Processing,
    AwaitingPlayback,
    Playing,
    Paused,
    Cancelled,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Recording => "recording",
            Phase::Processing => "processing",
            Phase::AwaitingPlayback => "awaiting-playback",
            Phase::Playing => "playing",
            Phase::Paused => "paused",
            Phase::Cancelled => "cancelled",
            Phase::Error => "error",
        }
    }

    /// Whether `self → to` appears in the transition table.
    pub fn can_transition(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Idle, Recording | AwaitingPlayback | Playing)
                | (Recording, Processing | Cancelled | Error | Idle)
                | (Processing, AwaitingPlayback | Playing | Idle | Error | Cancelled)
                | (AwaitingPlayback, Playing | Idle | Error)
                | (Playing, Paused | Idle | Error)
                | (Paused, Playing | Idle | Error)
                | (Cancelled, Idle)
                | (Error, Idle)
        )
    }

    /// Speech for the current turn is queued or playing.
    pub fn is_playback(self) -> bool {
        matches!(self, Phase::AwaitingPlayback | Phase::Playing | Phase::Paused)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns the current phase and enforces the transition table.
#[derive(Debug, Default)]
pub struct PhaseMachine {
    current: Phase,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn is(&self, phase: Phase) -> bool {
        self.current == phase
    }

    /// Move to `to`, or reject the move without changing anything.
    ///
    /// Self-transitions are accepted as no-ops so that repeated events
    /// (e.g. two `play` presses) are harmless.
    pub fn transition(&mut self, to: Phase) -> SessionResult<()> {
        if self.current == to {
            return Ok(());
        }
        if !self.current.can_transition(to) {
            let err = SessionError::InvalidState(format!(
                "Cannot move from {} to {}",
                self.current, to
            ));
            warn!(from = %self.current, to = %to, "Rejected phase transition");
            return Err(err);
        }
        self.current = to;
        Ok(())
    }

    /// Take a recoverable detour (`cancelled` / `error`) and settle back in `idle`.
    pub fn detour_to_idle(&mut self, via: Phase) -> SessionResult<()> {
        self.transition(via)?;
        self.transition(Phase::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_turn_is_legal() {
        let mut machine = PhaseMachine::new();
        for phase in [
            Phase::Recording,
            Phase::Processing,
            Phase::AwaitingPlayback,
            Phase::Playing,
            Phase::Paused,
            Phase::Playing,
            Phase::Idle,
        ] {
            machine.transition(phase).unwrap();
        }
        assert!(machine.is(Phase::Idle));
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let mut machine = PhaseMachine::new();
        let err = machine.transition(Phase::Processing).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert_eq!(machine.current(), Phase::Idle);

        machine.transition(Phase::Recording).unwrap();
        assert!(machine.transition(Phase::Paused).is_err());
        assert_eq!(machine.current(), Phase::Recording);
    }

    #[test]
    fn test_detours_return_to_idle() {
        let mut machine = PhaseMachine::new();
        machine.transition(Phase::Recording).unwrap();
        machine.detour_to_idle(Phase::Cancelled).unwrap();
        assert!(machine.is(Phase::Idle));

        machine.transition(Phase::Recording).unwrap();
        machine.transition(Phase::Processing).unwrap();
        machine.detour_to_idle(Phase::Error).unwrap();
        assert!(machine.is(Phase::Idle));

        // Cancelled and error only lead back to idle
        assert!(!Phase::Cancelled.can_transition(Phase::Recording));
        assert!(!Phase::Error.can_transition(Phase::Playing));
    }

    #[test]
    fn test_server_initiated_speech_from_idle() {
        let mut machine = PhaseMachine::new();
        assert!(machine.transition(Phase::Playing).is_ok());
        assert!(Phase::Playing.is_playback());
        assert!(!Phase::Processing.is_playback());
    }
}
