//! # Voice Session - Command Line Client
//!
//! Runs a voice session against the configured backend and drives it from stdin.
//! The microphone is a WAV file (`capture.source_path`) and speech is played through
//! a paced WAV player, so the whole conversation loop can run headless.
//!
//! ## Commands:
//! `connect`, `record`, `send`, `cancel`, `play`, `pause`, `resume`, `stop`,
//! `dismiss`, `retry`, `online`, `status`, `quit`
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The session runs as a background task on the tokio runtime
//! - **tokio::select!**: Races stdin, state changes and Ctrl+C
//! - **Result<T, E>**: `anyhow::Result` at the top level, `?` everywhere else

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_session::audio::media::MediaRegistry;
use voice_session::audio::output::{AudioOutput, PrimedOutput, WavOutput};
use voice_session::audio::source::WavFileSource;
use voice_session::{
    AlwaysOnline, AppConfig, Command, LoggingNavigator, SessionHandle, SessionParts, SessionSnapshot,
    VoiceSession,
};

/// The application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from .env, config.toml and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Spawns the voice session** with file-backed audio
/// 4. **Maps stdin lines to session commands** until `quit` or Ctrl+C
#[tokio::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-session v{}", env!("CARGO_PKG_VERSION"));
    info!("Voice endpoint: {}", config.server.endpoint);

    let source_path = config
        .capture
        .source_path
        .clone()
        .context("capture.source_path must point at a WAV file to use as the microphone")?;

    let output: Box<dyn AudioOutput> = match config.playback.prime_duration() {
        Some(prime) => Box::new(PrimedOutput::new(WavOutput::new(), prime)),
        None => Box::new(WavOutput::new()),
    };

    let session = VoiceSession::spawn(
        config,
        SessionParts {
            source: Box::new(WavFileSource::new(source_path)),
            output,
            navigator: Box::new(LoggingNavigator),
            connectivity: Arc::new(AlwaysOnline),
            media: MediaRegistry::new(),
        },
    )?;

    run_console(&session).await?;

    info!("Shutting down voice session...");
    session.shutdown().await;
    info!("Voice session stopped");
    Ok(())
}

/// Read commands from stdin until `quit`, end of input or Ctrl+C.
async fn run_console(session: &SessionHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut updates = session.subscribe();
    let mut last_phase = updates.borrow().phase;
    let mut last_error = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                match parse_command(line.trim()) {
                    Some(Input::Quit) => return Ok(()),
                    Some(Input::Status) => print_status(&session.snapshot()),
                    Some(Input::Session(command)) => session.send(command)?,
                    None if line.trim().is_empty() => {}
                    None => warn!("Unknown command '{}'", line.trim()),
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.phase != last_phase {
                    println!("[{}]", snapshot.phase);
                    last_phase = snapshot.phase;
                }
                let error = snapshot.error_message().map(str::to_string);
                if error.is_some() && error != last_error {
                    println!("! {}", error.as_deref().unwrap_or_default());
                }
                last_error = error;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                return Ok(());
            }
        }
    }
}

enum Input {
    Session(Command),
    Status,
    Quit,
}

fn parse_command(line: &str) -> Option<Input> {
    let command = match line.to_ascii_lowercase().as_str() {
        "connect" => Command::Connect,
        "disconnect" => Command::Disconnect,
        "retry" | "reconnect" => Command::Retry,
        "record" | "r" => Command::StartRecording,
        "send" | "s" => Command::SendRecording,
        "cancel" | "c" => Command::CancelRecording,
        "play" | "p" => Command::Play,
        "pause" => Command::Pause,
        "resume" => Command::Resume,
        "stop" => Command::Stop,
        "dismiss" => Command::DismissError,
        "online" => Command::NetworkOnline,
        "status" => return Some(Input::Status),
        "quit" | "exit" | "q" => return Some(Input::Quit),
        _ => return None,
    };
    Some(Input::Session(command))
}

fn print_status(snapshot: &SessionSnapshot) {
    println!(
        "connection={} phase={} session={} queued={}",
        snapshot.connection.as_str(),
        snapshot.phase,
        snapshot.session_id.as_deref().unwrap_or("-"),
        snapshot.queued_chunks
    );
    if !snapshot.transcript.is_empty() {
        println!("you: {}", snapshot.transcript);
    }
    if !snapshot.response.is_empty() {
        println!("assistant: {}", snapshot.response);
    }
    if let Some(target) = &snapshot.pending_navigation {
        println!("navigating after this turn: {}", target);
    }
    if let Some(message) = snapshot.error_message() {
        println!("error: {}", message);
    }
    let m = &snapshot.metrics;
    println!(
        "sent={} received={} played={} dropped={} format_failures={} reconnects={} turns={}",
        m.chunks_sent,
        m.chunks_received,
        m.chunks_played,
        m.chunks_dropped,
        m.format_failures,
        m.reconnect_attempts,
        m.turns_completed
    );
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_session=trace")
/// - If not set, defaults to "voice_session=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
