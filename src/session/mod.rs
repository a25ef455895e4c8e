//! # Voice Session
//!
//! One voice conversation with the backend, run as a single tokio task that owns
//! the channel, the capture pipeline, the playback queue and all session state.
//!
//! ## Architecture:
//! ```text
//!   SessionHandle ── Command ──▶ ┌──────────────────────┐ ◀── SessionEvent ── socket task
//!        ▲                       │  VoiceSession (actor) │ ◀── SessionEvent ── capture ticker
//!        └── watch<Snapshot> ─── └──────────────────────┘ ◀── SessionEvent ── playback / timers
//! ```
//! Every asynchronous completion is posted into the actor's event queue and handled
//! one at a time, so no state is ever shared or locked. Completions that belong to
//! something the session has moved past (an old socket generation, a cancelled turn,
//! a flushed queue) carry a token that no longer matches and are dropped.
//!
//! ## Lifetime:
//! The actor ends on `shutdown`, or when every `SessionHandle` has been dropped.
//! Either way it releases the microphone, stops playback, revokes media and closes
//! the channel before exiting.

pub mod orchestrator;
pub mod phase;

use crate::audio::capture::CaptureEvent;
use crate::audio::media::MediaRegistry;
use crate::audio::output::AudioOutput;
use crate::audio::playback::PlaybackEvent;
use crate::audio::source::AudioSource;
use crate::channel::{ChannelEvent, Connectivity};
use crate::error::{SessionError, SessionResult};
use crate::navigation::{NavigationTarget, Navigator};
use crate::state::SessionSnapshot;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub use orchestrator::VoiceSession;
pub use phase::{Phase, PhaseMachine};

/// Everything that can wake the session task up besides a user command.
#[derive(Debug)]
pub enum SessionEvent {
    Channel(ChannelEvent),
    Capture(CaptureEvent),
    Playback(PlaybackEvent),
    Timer(TimerEvent),
}

#[derive(Debug)]
pub enum TimerEvent {
    Reconnect,
    ProcessingTimeout { turn: u64 },
    ApplyNavigation(NavigationTarget),
    ForcedLogout,
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// User intents, sent through a `SessionHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    /// The *Reconnect* action offered next to a connectivity error
    Retry,
    StartRecording,
    SendRecording,
    CancelRecording,
    Play,
    Pause,
    Resume,
    Stop,
    DismissError,
    /// The host regained network connectivity
    NetworkOnline,
    Shutdown,
}

/// Platform pieces a session runs against.
pub struct SessionParts {
    pub source: Box<dyn AudioSource>,
    pub output: Box<dyn AudioOutput>,
    pub navigator: Box<dyn Navigator>,
    pub connectivity: Arc<dyn Connectivity>,
    pub media: MediaRegistry,
}

/// Controls one running session and observes its state.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        snapshot: watch::Receiver<SessionSnapshot>,
    ) -> Self {
        Self { commands, snapshot }
    }

    pub fn send(&self, command: Command) -> SessionResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::InvalidState("Voice session has ended".to_string()))
    }

    pub fn connect(&self) -> SessionResult<()> {
        self.send(Command::Connect)
    }

    pub fn disconnect(&self) -> SessionResult<()> {
        self.send(Command::Disconnect)
    }

    pub fn retry(&self) -> SessionResult<()> {
        self.send(Command::Retry)
    }

    pub fn start_recording(&self) -> SessionResult<()> {
        self.send(Command::StartRecording)
    }

    pub fn send_recording(&self) -> SessionResult<()> {
        self.send(Command::SendRecording)
    }

    pub fn cancel(&self) -> SessionResult<()> {
        self.send(Command::CancelRecording)
    }

    pub fn play(&self) -> SessionResult<()> {
        self.send(Command::Play)
    }

    pub fn pause(&self) -> SessionResult<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> SessionResult<()> {
        self.send(Command::Resume)
    }

    pub fn stop(&self) -> SessionResult<()> {
        self.send(Command::Stop)
    }

    pub fn dismiss_error(&self) -> SessionResult<()> {
        self.send(Command::DismissError)
    }

    pub fn network_online(&self) -> SessionResult<()> {
        self.send(Command::NetworkOnline)
    }

    /// The most recently published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that wakes up on every published state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the published state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionResult<SessionSnapshot> {
        let mut receiver = self.snapshot.clone();
        let snapshot = receiver
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| SessionError::InvalidState("Voice session has ended".to_string()))?;
        Ok(snapshot.clone())
    }

    /// Stop the session and wait until it has released everything.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        let mut receiver = self.snapshot;
        while receiver.changed().await.is_ok() {}
    }
}
