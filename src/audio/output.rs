//! # Audio Outputs
//!
//! The speaker seam of the playback queue, modelled on a media element: an output
//! opens one adapter per candidate, the adapter loads (becomes playable or fails) and
//! then plays until the audio ends or it is told to stop.
//!
//! ## Rust Concepts:
//! - **BoxFuture**: Trait methods return boxed futures so adapters stay object safe
//! - **watch::Receiver**: Pause/resume/stop reach a playing adapter without a lock
//! - **Decorator**: `PrimedOutput` wraps any output behind the same trait

use crate::audio::format::AudioFormat;
use crate::audio::media::MediaUrl;
use crate::error::{SessionError, SessionResult};
use futures_util::future::BoxFuture;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Commands the queue sends to the adapter that is currently playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackControl {
    Play,
    Pause,
    Stop,
}

/// How a `play` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayEnd {
    Completed,
    Stopped,
}

/// One attempt at playing one candidate.
pub trait PlaybackAdapter: Send {
    /// Resolve once the media is playable; an error means this candidate failed.
    fn load(&mut self) -> BoxFuture<'_, SessionResult<()>>;

    /// Play to the end, honouring pause and stop from `control`.
    fn play(&mut self, control: watch::Receiver<PlaybackControl>) -> BoxFuture<'_, SessionResult<PlayEnd>>;
}

pub trait AudioOutput: Send {
    fn open(&mut self, media: &MediaUrl) -> Box<dyn PlaybackAdapter>;
}

/// Wait out `length` of playback, stretching it across pauses.
///
/// Returns `Stopped` as soon as a stop arrives or the controlling queue goes away.
pub async fn paced_playback(
    length: Duration,
    mut control: watch::Receiver<PlaybackControl>,
) -> PlayEnd {
    let mut remaining = length;
    loop {
        let state = *control.borrow_and_update();
        match state {
            PlaybackControl::Stop => return PlayEnd::Stopped,
            PlaybackControl::Pause => {
                if control.changed().await.is_err() {
                    return PlayEnd::Stopped;
                }
            }
            PlaybackControl::Play => {
                let started = Instant::now();
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => return PlayEnd::Completed,
                    changed = control.changed() => {
                        if changed.is_err() {
                            return PlayEnd::Stopped;
                        }
                        remaining = remaining.saturating_sub(started.elapsed());
                    }
                }
            }
        }
    }
}

/// Paced player for WAV candidates.
///
/// Other containers fail to load, which is what a device without the codec does.
#[derive(Debug, Default)]
pub struct WavOutput;

impl WavOutput {
    pub fn new() -> Self {
        Self
    }
}

impl AudioOutput for WavOutput {
    fn open(&mut self, media: &MediaUrl) -> Box<dyn PlaybackAdapter> {
        Box::new(WavAdapter {
            uri: media.as_uri(),
            format: media.format().clone(),
            bytes: media.bytes(),
            length: None,
        })
    }
}

struct WavAdapter {
    uri: String,
    format: AudioFormat,
    bytes: Arc<[u8]>,
    length: Option<Duration>,
}

impl WavAdapter {
    fn probe(&self) -> SessionResult<Duration> {
        if !self.format.is_wav() {
            return Err(SessionError::Media(format!("Cannot play {}", self.format)));
        }

        let (header, data) = wav::read(&mut Cursor::new(&self.bytes[..]))
            .map_err(|e| SessionError::Media(format!("Not playable as {}: {}", self.format, e)))?;

        let samples = match &data {
            wav::BitDepth::Eight(s) => s.len(),
            wav::BitDepth::Sixteen(s) => s.len(),
            _ => {
                return Err(SessionError::Media(format!(
                    "{} uses an unsupported sample format ({} bits)",
                    self.uri, header.bits_per_sample
                )))
            }
        };
        let rate = header.sampling_rate as u64 * header.channel_count.max(1) as u64;
        if rate == 0 {
            return Err(SessionError::Media(format!("{} has a zero sample rate", self.uri)));
        }
        Ok(Duration::from_micros(samples as u64 * 1_000_000 / rate))
    }
}

impl PlaybackAdapter for WavAdapter {
    fn load(&mut self) -> BoxFuture<'_, SessionResult<()>> {
        Box::pin(async move {
            let length = self.probe()?;
            trace!(uri = %self.uri, length_ms = length.as_millis() as u64, "Media loaded");
            self.length = Some(length);
            Ok(())
        })
    }

    fn play(&mut self, control: watch::Receiver<PlaybackControl>) -> BoxFuture<'_, SessionResult<PlayEnd>> {
        Box::pin(async move {
            let length = self
                .length
                .ok_or_else(|| SessionError::Media(format!("{} played before loading", self.uri)))?;
            Ok(paced_playback(length, control).await)
        })
    }
}

/// Plays a stretch of silence before the first successful chunk of a session.
///
/// Some outputs clip the start of the first sound they play; priming wakes them up.
pub struct PrimedOutput<O> {
    inner: O,
    prime: Duration,
    primed: Arc<AtomicBool>,
}

impl<O: AudioOutput> PrimedOutput<O> {
    pub fn new(inner: O, prime: Duration) -> Self {
        Self {
            inner,
            prime,
            primed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<O: AudioOutput> AudioOutput for PrimedOutput<O> {
    fn open(&mut self, media: &MediaUrl) -> Box<dyn PlaybackAdapter> {
        let adapter = self.inner.open(media);
        if self.primed.load(Ordering::SeqCst) {
            return adapter;
        }
        Box::new(PrimedAdapter {
            inner: adapter,
            prime: self.prime,
            primed: self.primed.clone(),
        })
    }
}

struct PrimedAdapter {
    inner: Box<dyn PlaybackAdapter>,
    prime: Duration,
    primed: Arc<AtomicBool>,
}

impl PlaybackAdapter for PrimedAdapter {
    fn load(&mut self) -> BoxFuture<'_, SessionResult<()>> {
        self.inner.load()
    }

    fn play(&mut self, control: watch::Receiver<PlaybackControl>) -> BoxFuture<'_, SessionResult<PlayEnd>> {
        Box::pin(async move {
            if !self.primed.swap(true, Ordering::SeqCst) {
                debug!(prime_ms = self.prime.as_millis() as u64, "Priming audio output");
                if paced_playback(self.prime, control.clone()).await == PlayEnd::Stopped {
                    return Ok(PlayEnd::Stopped);
                }
            }
            self.inner.play(control).await
        })
    }
}
