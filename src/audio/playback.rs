//! # Playback Queue
//!
//! Plays the assistant's synthesized speech chunk by chunk, in arrival order.
//!
//! ## Chunk Lifecycle:
//! 1. **Enqueue**: The base64 payload is decoded once and exposed as one `MediaUrl`
//!    per candidate format
//! 2. **Attempt**: The head chunk's next candidate is opened on the output, loaded
//!    under a timeout and played, all inside a spawned task
//! 3. **Report**: The task posts an `AttemptReport` tagged `(epoch, seq, attempt)`;
//!    anything that does not match the live attempt is stale and ignored
//! 4. **Advance**: Success pops the chunk, failure tries the next candidate, and a
//!    chunk with no candidates left is dropped and counted as a format failure
//! 5. **Settle**: A short delay separates chunks so the output can let go of the last one
//!
//! ## Ownership:
//! The queue owns every `MediaUrl` it created. Dropping a chunk, finishing an attempt
//! or flushing the queue drops the handles, which revokes them.

use crate::audio::format::AudioFormat;
use crate::audio::media::{MediaRegistry, MediaUrl};
use crate::audio::output::{AudioOutput, PlayEnd, PlaybackControl};
use crate::error::{SessionError, SessionResult};
use crate::session::{EventSender, SessionEvent};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Completions from playback tasks, delivered through the session's event queue.
#[derive(Debug)]
pub enum PlaybackEvent {
    Attempt(AttemptReport),
    Settled { epoch: u64 },
}

#[derive(Debug)]
pub struct AttemptReport {
    pub epoch: u64,
    pub seq: u64,
    pub attempt: usize,
    pub format: AudioFormat,
    pub outcome: AttemptOutcome,
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Played,
    Stopped,
    Failed(SessionError),
    TimedOut,
}

/// What the session needs to hear about after feeding the queue an event.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueSignal {
    ChunkPlayed { seq: u64, text: Option<String> },
    ChunkDropped { seq: u64 },
    /// Too many chunks were unplayable; the queue was discarded
    FormatUnsupported { failures: u32 },
}

/// Per-chunk record of the candidates tried so far and the ones left.
#[derive(Debug, Default)]
pub struct FormatRetry {
    pub attempted: Vec<AudioFormat>,
    pub remaining: VecDeque<MediaUrl>,
}

#[derive(Debug)]
struct QueuedChunk {
    seq: u64,
    text: Option<String>,
    retry: FormatRetry,
}

/// The attempt in flight. Dropping it stops the adapter and revokes its media.
struct ActiveAttempt {
    seq: u64,
    attempt: usize,
    media: MediaUrl,
    control: watch::Sender<PlaybackControl>,
    task: JoinHandle<()>,
}

impl Drop for ActiveAttempt {
    fn drop(&mut self) {
        let _ = self.control.send(PlaybackControl::Stop);
        self.task.abort();
    }
}

/// Tuning for one queue, taken from the playback configuration.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub candidates: Vec<AudioFormat>,
    pub load_timeout: Duration,
    pub settle_delay: Duration,
    pub max_format_failures: u32,
}

pub struct PlaybackQueue {
    queue: VecDeque<QueuedChunk>,
    active: Option<ActiveAttempt>,
    settling: Option<JoinHandle<()>>,
    output: Box<dyn AudioOutput>,
    registry: MediaRegistry,
    settings: QueueSettings,
    events: EventSender,
    epoch: u64,
    next_seq: u64,
    running: bool,
    paused: bool,
    format_failures: u32,
    abandoned: bool,
}

impl PlaybackQueue {
    pub fn new(
        output: Box<dyn AudioOutput>,
        registry: MediaRegistry,
        settings: QueueSettings,
        events: EventSender,
    ) -> Self {
        Self {
            queue: VecDeque::new(),
            active: None,
            settling: None,
            output,
            registry,
            settings,
            events,
            epoch: 0,
            next_seq: 0,
            running: false,
            paused: false,
            format_failures: 0,
            abandoned: false,
        }
    }

    /// Decode one inbound chunk and append it to the tail.
    ///
    /// The chunk only starts playing if the queue is running; otherwise it waits
    /// for `start`.
    pub fn enqueue(&mut self, audio: &str, text: Option<String>) -> SessionResult<u64> {
        if self.abandoned {
            return Err(SessionError::FormatUnsupported(
                "Playback was abandoned for this session".to_string(),
            ));
        }

        let bytes: Arc<[u8]> = Arc::from(STANDARD.decode(audio.trim())?);
        if bytes.is_empty() {
            return Err(SessionError::Media("Received an empty audio chunk".to_string()));
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let remaining = self
            .settings
            .candidates
            .iter()
            .map(|format| self.registry.create(format.clone(), bytes.clone()))
            .collect();

        debug!(seq, bytes = bytes.len(), queued = self.queue.len() + 1, "Audio chunk queued");
        self.queue.push_back(QueuedChunk {
            seq,
            text,
            retry: FormatRetry {
                attempted: Vec::new(),
                remaining,
            },
        });

        self.pump();
        Ok(seq)
    }

    /// Begin (or keep) playing queued chunks.
    pub fn start(&mut self) {
        self.running = true;
        self.paused = false;
        self.pump();
    }

    pub fn pause(&mut self) -> bool {
        if !self.running || self.paused {
            return false;
        }
        self.paused = true;
        if let Some(active) = &self.active {
            let _ = active.control.send(PlaybackControl::Pause);
        }
        info!(queued = self.queue.len(), "Playback paused");
        true
    }

    pub fn resume(&mut self) -> bool {
        if !self.paused {
            return false;
        }
        self.paused = false;
        if let Some(active) = &self.active {
            let _ = active.control.send(PlaybackControl::Play);
        }
        info!(queued = self.queue.len(), "Playback resumed");
        self.pump();
        true
    }

    /// Stop the current attempt, discard every queued chunk and revoke its media.
    ///
    /// Reports from attempts started before the flush are stale afterwards.
    pub fn flush(&mut self) -> usize {
        self.epoch += 1;
        self.active = None;
        if let Some(settling) = self.settling.take() {
            settling.abort();
        }
        let discarded = self.queue.len();
        self.queue.clear();
        self.running = false;
        self.paused = false;
        if discarded > 0 {
            debug!(discarded, epoch = self.epoch, "Playback queue flushed");
        }
        discarded
    }

    /// Nothing queued, nothing playing and not between chunks.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.active.is_none() && self.settling.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn format_failures(&self) -> u32 {
        self.format_failures
    }

    /// Handle the outcome of a playback task.
    pub fn on_attempt(&mut self, report: AttemptReport) -> Vec<QueueSignal> {
        let live = report.epoch == self.epoch
            && self
                .active
                .as_ref()
                .is_some_and(|a| a.seq == report.seq && a.attempt == report.attempt);
        if !live {
            debug!(
                seq = report.seq,
                attempt = report.attempt,
                epoch = report.epoch,
                "Ignoring stale playback report"
            );
            return Vec::new();
        }
        // Ends the attempt and revokes the candidate that was tried.
        self.active = None;

        let mut signals = Vec::new();
        match report.outcome {
            AttemptOutcome::Played => {
                if let Some(chunk) = self.queue.pop_front() {
                    debug!(seq = chunk.seq, format = %report.format, "Audio chunk played");
                    signals.push(QueueSignal::ChunkPlayed {
                        seq: chunk.seq,
                        text: chunk.text,
                    });
                }
                self.settle();
            }
            AttemptOutcome::Stopped => {
                if let Some(chunk) = self.queue.pop_front() {
                    debug!(seq = chunk.seq, format = %report.format, "Audio chunk stopped by the output");
                    signals.push(QueueSignal::ChunkDropped { seq: chunk.seq });
                }
                self.settle();
            }
            AttemptOutcome::Failed(_) | AttemptOutcome::TimedOut => {
                let reason = match &report.outcome {
                    AttemptOutcome::Failed(err) => err.to_string(),
                    _ => format!("not playable within {:?}", self.settings.load_timeout),
                };
                warn!(seq = report.seq, format = %report.format, %reason, "Audio candidate failed");

                let exhausted = match self.queue.front_mut() {
                    Some(chunk) => {
                        chunk.retry.attempted.push(report.format);
                        chunk.retry.remaining.is_empty()
                    }
                    None => true,
                };

                if !exhausted {
                    self.pump();
                    return signals;
                }

                if let Some(chunk) = self.queue.pop_front() {
                    self.format_failures += 1;
                    warn!(
                        seq = chunk.seq,
                        attempted = ?chunk.retry.attempted,
                        failures = self.format_failures,
                        "Dropping audio chunk, no candidate format played"
                    );
                    signals.push(QueueSignal::ChunkDropped { seq: chunk.seq });
                }

                if self.format_failures >= self.settings.max_format_failures {
                    let discarded = self.flush();
                    self.abandoned = true;
                    warn!(
                        failures = self.format_failures,
                        discarded, "Abandoning playback, audio format unsupported"
                    );
                    signals.push(QueueSignal::FormatUnsupported {
                        failures: self.format_failures,
                    });
                } else {
                    self.settle();
                }
            }
        }
        signals
    }

    /// The settling delay after a chunk has elapsed.
    pub fn on_settled(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        self.settling = None;
        self.pump();
    }

    fn settle(&mut self) {
        let epoch = self.epoch;
        let delay = self.settings.settle_delay;
        let events = self.events.clone();
        self.settling = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::Playback(PlaybackEvent::Settled { epoch }));
        }));
    }

    /// Start an attempt on the head chunk if nothing else is going on.
    fn pump(&mut self) {
        if !self.running || self.paused || self.active.is_some() || self.settling.is_some() {
            return;
        }
        let Some(chunk) = self.queue.front_mut() else {
            return;
        };
        let Some(media) = chunk.retry.remaining.pop_front() else {
            return;
        };

        let seq = chunk.seq;
        let attempt = chunk.retry.attempted.len() + 1;
        let format = media.format().clone();
        let epoch = self.epoch;
        let load_timeout = self.settings.load_timeout;
        let events = self.events.clone();

        let mut adapter = self.output.open(&media);
        let (control, control_rx) = watch::channel(PlaybackControl::Play);

        debug!(seq, attempt, format = %format, uri = %media.as_uri(), "Trying audio candidate");
        let task_format = format.clone();
        let task = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(load_timeout, adapter.load()).await {
                Err(_) => AttemptOutcome::TimedOut,
                Ok(Err(err)) => AttemptOutcome::Failed(err),
                Ok(Ok(())) => match adapter.play(control_rx).await {
                    Ok(PlayEnd::Completed) => AttemptOutcome::Played,
                    Ok(PlayEnd::Stopped) => AttemptOutcome::Stopped,
                    Err(err) => AttemptOutcome::Failed(err),
                },
            };
            let report = AttemptReport {
                epoch,
                seq,
                attempt,
                format: task_format,
                outcome,
            };
            let _ = events.send(SessionEvent::Playback(PlaybackEvent::Attempt(report)));
        });

        self.active = Some(ActiveAttempt {
            seq,
            attempt,
            media,
            control,
            task,
        });
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.flush();
    }
}
