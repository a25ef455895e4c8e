//! # Capture Pipeline
//!
//! Turns an `AudioSource` into a stream of fixed-interval chunks for the current turn.
//!
//! ## How it works:
//! 1. `start` negotiates an encoding and acquires the source (fails fast on denial)
//! 2. A ticker task cuts one chunk per interval and posts it to the session
//! 3. `stop` aborts the ticker and releases the source, on every path
//!
//! Every event carries the turn it was captured for. Once the session has moved on,
//! chunks that were already in flight are recognized as stale and discarded.
//!
//! ## Rust Concepts:
//! - **Arc<Mutex<Box<dyn AudioSource>>>**: The ticker task and the pipeline share the source
//! - **JoinHandle::abort**: Stops the ticker without waiting for the next tick
//! - **Drop**: A pipeline that goes away mid-recording still releases the microphone

use crate::audio::format::{select_format, AudioFormat};
use crate::audio::source::AudioSource;
use crate::error::{SessionError, SessionResult};
use crate::protocol::now_millis;
use crate::session::{EventSender, SessionEvent};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Results of the ticker task, delivered through the session's event queue.
#[derive(Debug)]
pub enum CaptureEvent {
    Chunk {
        turn: u64,
        data: Vec<u8>,
        captured_at: i64,
    },
    /// The source has no more audio to give
    Exhausted { turn: u64 },
    /// The recorder failed mid-turn
    Failed { turn: u64, error: SessionError },
}

impl CaptureEvent {
    pub fn turn(&self) -> u64 {
        match self {
            CaptureEvent::Chunk { turn, .. }
            | CaptureEvent::Exhausted { turn }
            | CaptureEvent::Failed { turn, .. } => *turn,
        }
    }
}

type SharedSource = Arc<Mutex<Box<dyn AudioSource>>>;

pub struct CapturePipeline {
    source: SharedSource,
    interval: Duration,
    preferences: Vec<AudioFormat>,
    task: Option<JoinHandle<()>>,
    active_turn: Option<u64>,
}

impl CapturePipeline {
    pub fn new(source: Box<dyn AudioSource>, interval: Duration, preferences: Vec<AudioFormat>) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            interval,
            preferences,
            task: None,
            active_turn: None,
        }
    }

    pub fn active_turn(&self) -> Option<u64> {
        self.active_turn
    }

    pub fn is_recording(&self) -> bool {
        self.active_turn.is_some()
    }

    /// Acquire the source and start chunking for `turn`.
    ///
    /// Returns the negotiated format; the caller announces it to the backend.
    pub fn start(&mut self, turn: u64, events: EventSender) -> SessionResult<AudioFormat> {
        if let Some(active) = self.active_turn {
            return Err(SessionError::InvalidState(format!(
                "Capture already running for turn {}",
                active
            )));
        }

        let format = {
            let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
            let supported = source.supported_formats();
            let format = select_format(&self.preferences, &supported).ok_or_else(|| {
                SessionError::Media("No supported recording format on this device".to_string())
            })?;

            if let Err(err) = source.acquire(&format) {
                source.release();
                return Err(err);
            }
            format
        };

        info!(turn, format = %format, interval_ms = self.interval.as_millis() as u64, "Recording started");

        let source = self.source.clone();
        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; a chunk covers a full interval.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let result = source
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .next_chunk(interval);

                let event = match result {
                    Ok(Some(data)) => CaptureEvent::Chunk {
                        turn,
                        data,
                        captured_at: now_millis(),
                    },
                    Ok(None) => CaptureEvent::Exhausted { turn },
                    Err(error) => CaptureEvent::Failed { turn, error },
                };
                let last = !matches!(event, CaptureEvent::Chunk { .. });

                if events.send(SessionEvent::Capture(event)).is_err() {
                    debug!(turn, "Session gone, stopping capture");
                    break;
                }
                if last {
                    break;
                }
            }
        }));
        self.active_turn = Some(turn);

        Ok(format)
    }

    /// Stop chunking and release the source. Safe to call when not recording.
    pub fn stop(&mut self) -> Option<u64> {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();

        let turn = self.active_turn.take();
        if let Some(turn) = turn {
            debug!(turn, "Recording stopped");
        }
        turn
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if self.active_turn.is_some() {
            warn!("Capture pipeline dropped while recording");
        }
        self.stop();
    }
}
