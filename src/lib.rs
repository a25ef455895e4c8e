//! # Voice Session Client
//!
//! Runs one real-time voice conversation with a backend agent over a persistent
//! WebSocket channel: microphone audio goes up in fixed-interval chunks, synthesized
//! speech comes back in chunks and is played in order, and the assistant can steer
//! the surrounding application to a section once it has finished speaking.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config.toml, environment variables)
//! - **error**: The session error type and the taxonomy used for user-facing errors
//! - **protocol**: The JSON wire contract with the voice backend
//! - **channel**: The WebSocket connection, its reconnection and auth-failure policy
//! - **audio**: Capture, playback and the platform seams behind them
//! - **navigation**: Navigation markers in assistant text and the app shell hooks
//! - **session**: The per-session actor, its phase machine and the control handle
//! - **state**: Snapshots published to observers
//!
//! ## Usage:
//! ```no_run
//! use std::sync::Arc;
//! use voice_session::audio::{media::MediaRegistry, output::WavOutput, source::WavFileSource};
//! use voice_session::{AlwaysOnline, AppConfig, LoggingNavigator, SessionParts, VoiceSession};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = AppConfig::load()?;
//! let session = VoiceSession::spawn(
//!     config,
//!     SessionParts {
//!         source: Box::new(WavFileSource::new("question.wav")),
//!         output: Box::new(WavOutput::new()),
//!         navigator: Box::new(LoggingNavigator),
//!         connectivity: Arc::new(AlwaysOnline),
//!         media: MediaRegistry::new(),
//!     },
//! )?;
//! session.start_recording()?;
//! # Ok(())
//! # }
//! ```

pub mod audio;       // Capture pipeline, playback queue, sources and outputs
pub mod channel;     // WebSocket channel manager
pub mod config;      // Configuration management (config.rs)
pub mod error;       // Error handling types (error.rs)
pub mod navigation;  // Navigation directives
pub mod protocol;    // Wire messages
pub mod session;     // Session actor and handle
pub mod state;       // Published session state

pub use channel::{AlwaysOnline, Connectivity};
pub use config::AppConfig;
pub use error::{ErrorKind, SessionError, SessionResult};
pub use navigation::{LoggingNavigator, NavigationTarget, Navigator};
pub use session::{Command, Phase, SessionHandle, SessionParts, VoiceSession};
pub use state::{ConnectionStatus, SessionSnapshot};
