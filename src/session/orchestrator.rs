//! # Session Orchestrator
//!
//! The actor behind a `SessionHandle`. It reacts to user commands and to completions
//! from the channel, the capture pipeline, the playback queue and its own timers,
//! and keeps the phase, the transcript, the error slot and the metrics consistent.
//!
//! ## Turn Walkthrough:
//! 1. `record`: acquire the microphone, announce `start_stream`, stream `audio_data`
//! 2. `send`: stop capture, send `end_stream`, wait for the backend (processing)
//! 3. Inbound `audio_chunk`s are queued and played in order, with or without a
//!    user gesture depending on configuration
//! 4. Once `processing_complete` arrived *and* the queue drained, the turn is
//!    finalized and any navigation the assistant asked for is applied

use crate::audio::capture::{CaptureEvent, CapturePipeline};
use crate::audio::format::AudioFormat;
use crate::audio::playback::{PlaybackEvent, PlaybackQueue, QueueSettings, QueueSignal};
use crate::channel::{classify_close, ChannelEvent, ChannelManager, CloseClass, Connectivity, ReconnectPolicy};
use crate::config::AppConfig;
use crate::error::{ErrorKind, SessionError, SessionResult};
use crate::navigation::{find_directive, from_tools_update, strip_markers, NavigationTarget, Navigator};
use crate::protocol::{now_millis, InboundMessage, OutboundMessage};
use crate::session::phase::{Phase, PhaseMachine};
use crate::session::{Command, EventSender, SessionEvent, SessionHandle, SessionParts, TimerEvent};
use crate::state::{ErrorSlot, RetryAction, SessionMetrics, SessionSnapshot};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// How a recording ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    /// The user pressed send: `end_stream`, then processing
    EndOfTurn,
    /// Discard the turn: `cancel`, no `end_stream`
    Cancel,
    /// Stop without telling the backend anything
    Silent,
}

/// Pending timers. Replacing or dropping one aborts it.
#[derive(Default)]
struct Timers {
    reconnect: Option<JoinHandle<()>>,
    processing: Option<JoinHandle<()>>,
    navigation: Option<JoinHandle<()>>,
    logout: Option<JoinHandle<()>>,
}

impl Timers {
    fn set(slot: &mut Option<JoinHandle<()>>, handle: JoinHandle<()>) {
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn clear(slot: &mut Option<JoinHandle<()>>) {
        if let Some(previous) = slot.take() {
            previous.abort();
        }
    }

    fn clear_all(&mut self) {
        Self::clear(&mut self.reconnect);
        Self::clear(&mut self.processing);
        Self::clear(&mut self.navigation);
        Self::clear(&mut self.logout);
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear_all();
    }
}

pub struct VoiceSession {
    config: AppConfig,
    session_id: Option<String>,
    phase: PhaseMachine,
    channel: ChannelManager,
    capture: CapturePipeline,
    playback: PlaybackQueue,
    navigator: Box<dyn Navigator>,
    connectivity: Arc<dyn Connectivity>,
    reconnect: ReconnectPolicy,
    errors: ErrorSlot,
    metrics: SessionMetrics,
    events: EventSender,
    snapshot: watch::Sender<SessionSnapshot>,
    timers: Timers,

    /// Incremented per recording; capture events for older turns are stale
    turn: u64,
    /// Correlates log lines of one turn
    turn_id: Option<Uuid>,
    recording_format: Option<AudioFormat>,
    transcript_final: String,
    transcript_interim: String,
    response: String,
    pending_navigation: Option<NavigationTarget>,
    processing_complete: bool,
    /// The rest of the current turn's backend output is unwanted (cancel or stop)
    discard_turn: bool,
    /// A manual play happened; later turns may start playback on their own
    audio_unlocked: bool,
    intentional_close: bool,
    waiting_for_network: bool,
    unauthorized: bool,
}

impl VoiceSession {
    /// Start a session task on the current tokio runtime.
    pub fn spawn(config: AppConfig, parts: SessionParts) -> SessionResult<SessionHandle> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let session = VoiceSession::new(config, parts, events_tx, snapshot_tx)?;
        tokio::spawn(session.run(commands_rx, events_rx));

        Ok(SessionHandle::new(commands_tx, snapshot_rx))
    }

    pub(crate) fn new(
        config: AppConfig,
        parts: SessionParts,
        events: EventSender,
        snapshot: watch::Sender<SessionSnapshot>,
    ) -> SessionResult<Self> {
        let channel = ChannelManager::new(
            &config.server.endpoint,
            config.server.auth_token.clone(),
            config.channel.connect_timeout(),
            events.clone(),
        )?;

        let capture = CapturePipeline::new(
            parts.source,
            config.capture.chunk_interval(),
            AudioFormat::from_list(&config.capture.preferred_formats),
        );

        let playback = PlaybackQueue::new(
            parts.output,
            parts.media,
            QueueSettings {
                candidates: AudioFormat::from_list(&config.playback.candidate_formats),
                load_timeout: config.playback.load_timeout(),
                settle_delay: config.playback.settle_delay(),
                max_format_failures: config.playback.max_format_failures,
            },
            events.clone(),
        );

        let reconnect = ReconnectPolicy::new(
            config.channel.max_reconnect_attempts,
            config.channel.reconnect_backoff(),
        );

        Ok(Self {
            session_id: config.server.session_id.clone(),
            config,
            phase: PhaseMachine::new(),
            channel,
            capture,
            playback,
            navigator: parts.navigator,
            connectivity: parts.connectivity,
            reconnect,
            errors: ErrorSlot::default(),
            metrics: SessionMetrics::default(),
            events,
            snapshot,
            timers: Timers::default(),
            turn: 0,
            turn_id: None,
            recording_format: None,
            transcript_final: String::new(),
            transcript_interim: String::new(),
            response: String::new(),
            pending_navigation: None,
            processing_complete: false,
            discard_turn: false,
            audio_unlocked: false,
            intentional_close: false,
            waiting_for_network: false,
            unauthorized: false,
        })
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        info!(session_id = self.session_label(), endpoint = %self.config.server.endpoint, "Voice session started");
        if self.config.channel.auto_connect {
            self.connect();
        }
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
            self.publish();
        }

        self.teardown().await;
        self.publish();
        info!(session_id = self.session_label(), "Voice session ended");
    }

    fn handle_command(&mut self, command: Command) {
        debug!(?command, phase = %self.phase.current(), "Command");
        match command {
            Command::Connect => {
                self.intentional_close = false;
                self.unauthorized = false;
                self.waiting_for_network = false;
                self.connect();
            }
            Command::Retry => {
                self.intentional_close = false;
                self.waiting_for_network = false;
                self.reconnect.reset();
                self.errors.clear_kind(ErrorKind::Connectivity);
                self.connect();
            }
            Command::Disconnect => self.disconnect(),
            Command::StartRecording => self.start_recording(),
            Command::SendRecording => self.stop_recording(StopMode::EndOfTurn),
            Command::CancelRecording => self.cancel(),
            Command::Play => self.play(),
            Command::Pause => {
                if self.phase.is(Phase::Playing) && self.playback.pause() {
                    self.transition(Phase::Paused);
                }
            }
            Command::Resume => {
                if self.phase.is(Phase::Paused) && self.playback.resume() {
                    self.transition(Phase::Playing);
                }
            }
            Command::Stop => self.stop_playback(),
            Command::DismissError => {
                self.errors.dismiss();
            }
            Command::NetworkOnline => {
                if self.waiting_for_network {
                    info!("Network is back");
                    self.waiting_for_network = false;
                    self.errors.clear_kind(ErrorKind::Connectivity);
                    self.schedule_reconnect();
                }
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Channel(event) => self.on_channel_event(event),
            SessionEvent::Capture(event) => self.on_capture_event(event),
            SessionEvent::Playback(PlaybackEvent::Attempt(report)) => {
                for signal in self.playback.on_attempt(report) {
                    self.on_queue_signal(signal);
                }
                self.maybe_finalize();
            }
            SessionEvent::Playback(PlaybackEvent::Settled { epoch }) => {
                self.playback.on_settled(epoch);
                self.maybe_finalize();
            }
            SessionEvent::Timer(timer) => self.on_timer(timer),
        }
    }

    // ---- channel -------------------------------------------------------

    fn connect(&mut self) {
        if self.unauthorized {
            warn!("Not connecting, the session is unauthorized");
            return;
        }
        let session_id = self.session_id.clone();
        if self.channel.connect(session_id.as_deref()) {
            debug!(generation = self.channel.generation(), "Connecting");
        }
    }

    fn disconnect(&mut self) {
        info!(session_id = self.session_label(), "Disconnecting");
        self.intentional_close = true;
        self.waiting_for_network = false;
        Timers::clear(&mut self.timers.reconnect);

        match self.phase.current() {
            Phase::Recording => self.stop_recording(StopMode::Cancel),
            Phase::Processing | Phase::AwaitingPlayback | Phase::Playing | Phase::Paused => self.cancel_turn(),
            _ => {}
        }
        self.channel.close();
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        if !self.channel.accept(&event) {
            return;
        }

        match event {
            ChannelEvent::Opened { generation } => {
                info!(generation, session_id = self.session_label(), "Connected to voice service");
                self.reconnect.reset();
                self.waiting_for_network = false;
                Timers::clear(&mut self.timers.reconnect);
                self.errors.clear_kind(ErrorKind::Connectivity);
            }
            ChannelEvent::Failed { generation, error } => {
                warn!(generation, error = %error, "Could not open voice channel");
                if matches!(error, SessionError::Unauthorized(_)) {
                    self.on_unauthorized(error);
                } else if !self.intentional_close {
                    self.after_unexpected_close();
                }
            }
            ChannelEvent::Message { text, .. } => self.on_message(&text),
            ChannelEvent::Closed { generation, code, reason } => {
                warn!(generation, ?code, %reason, "Voice channel closed");
                self.on_connection_lost();
                if self.intentional_close {
                    return;
                }
                match classify_close(code, &reason) {
                    CloseClass::Normal => info!("Voice service closed the channel"),
                    CloseClass::Unauthorized => {
                        let message = if reason.is_empty() {
                            "Your session has expired".to_string()
                        } else {
                            reason
                        };
                        self.on_unauthorized(SessionError::Unauthorized(message));
                    }
                    CloseClass::Abnormal => self.after_unexpected_close(),
                }
            }
        }
    }

    /// Wind down whatever the turn was doing when the channel went away.
    fn on_connection_lost(&mut self) {
        match self.phase.current() {
            Phase::Recording => {
                info!(turn = self.turn, "Channel lost while recording, stopping");
                self.stop_recording(StopMode::Silent);
            }
            Phase::Processing => {
                info!(turn = self.turn, "Channel lost while processing");
                Timers::clear(&mut self.timers.processing);
                self.transition(Phase::Idle);
            }
            Phase::AwaitingPlayback | Phase::Playing | Phase::Paused => {
                // Nothing more is coming; play out what is queued.
                self.processing_complete = true;
                self.maybe_finalize();
            }
            _ => {}
        }
    }

    fn after_unexpected_close(&mut self) {
        if !self.connectivity.is_online() {
            info!("Offline, waiting for the network before reconnecting");
            self.waiting_for_network = true;
            self.errors.raise(
                &SessionError::Connectivity("You are offline".to_string()),
                None,
            );
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.next_delay() {
            Some(delay) => {
                self.metrics.reconnect_attempts += 1;
                info!(
                    attempt = self.reconnect.attempts(),
                    max_attempts = self.reconnect.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                let timer = self.schedule(delay, TimerEvent::Reconnect);
                Timers::set(&mut self.timers.reconnect, timer);
            }
            None => {
                warn!(attempts = self.reconnect.attempts(), "Reconnect attempts exhausted");
                self.errors.raise(
                    &SessionError::Connectivity("Lost connection to the voice service".to_string()),
                    Some(RetryAction::Reconnect),
                );
            }
        }
    }

    fn on_unauthorized(&mut self, error: SessionError) {
        warn!(error = %error, "Voice service rejected the session");
        self.unauthorized = true;
        self.intentional_close = true;
        Timers::clear(&mut self.timers.reconnect);
        self.errors.raise(&error, None);
        self.channel.close();

        let timer = self.schedule(self.config.channel.logout_delay(), TimerEvent::ForcedLogout);
        Timers::set(&mut self.timers.logout, timer);
    }

    // ---- inbound protocol ---------------------------------------------

    fn on_message(&mut self, raw: &str) {
        let message = match InboundMessage::parse(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Ignoring malformed message");
                return;
            }
        };
        trace!(kind = message.kind(), "Inbound message");

        if self.phase.is(Phase::Processing) {
            // The backend is alive; restart the silence timer.
            self.arm_processing_timeout();
        }

        match message {
            InboundMessage::Transcript { text } => {
                self.transcript_interim = text;
            }
            InboundMessage::TranscriptFinal { text } => {
                append_text(&mut self.transcript_final, &text);
                self.transcript_interim.clear();
            }
            InboundMessage::AiResponse { text } => {
                if self.discard_turn {
                    return;
                }
                self.note_directive(find_directive(&text));
                append_text(&mut self.response, &strip_markers(&text));
            }
            InboundMessage::AudioChunk { audio, text } => self.on_audio_chunk(&audio, text),
            InboundMessage::ProcessingComplete => {
                if self.discard_turn {
                    debug!(turn = self.turn, "Discarded turn completed on the backend");
                    self.discard_turn = false;
                    return;
                }
                let phase = self.phase.current();
                if phase != Phase::Processing && !phase.is_playback() {
                    debug!(turn = self.turn, %phase, "Ignoring completion outside a pending turn");
                    return;
                }
                Timers::clear(&mut self.timers.processing);
                self.processing_complete = true;
                if self.phase.is(Phase::Processing) {
                    // Nothing to play for this turn.
                    self.finalize();
                } else {
                    self.maybe_finalize();
                }
            }
            InboundMessage::StreamStarted { session_id } => {
                if let Some(session_id) = session_id {
                    info!(%session_id, "Voice service assigned session");
                    self.session_id = Some(session_id);
                }
            }
            InboundMessage::Error { message } => self.on_backend_error(message),
            InboundMessage::NoSpeechDetected => {
                if self.phase.is(Phase::Processing) {
                    Timers::clear(&mut self.timers.processing);
                    self.errors.raise(
                        &SessionError::Backend("No speech detected, please try again".to_string()),
                        None,
                    );
                    self.transition(Phase::Idle);
                }
            }
            InboundMessage::Cancelled => {
                debug!(turn = self.turn, "Cancel acknowledged");
                self.discard_turn = false;
            }
            InboundMessage::ToolsUpdate { action, target, text } => {
                self.note_directive(from_tools_update(
                    action.as_deref(),
                    target.as_deref(),
                    text.as_deref(),
                ));
            }
            InboundMessage::Unknown => debug!("Ignoring unknown message type"),
        }
    }

    fn on_audio_chunk(&mut self, audio: &str, text: Option<String>) {
        if self.discard_turn {
            debug!(turn = self.turn, "Discarding audio from a cancelled turn");
            return;
        }
        if self.phase.is(Phase::Recording) {
            debug!(turn = self.turn, "Ignoring audio while recording");
            return;
        }

        self.metrics.chunks_received += 1;
        if let Some(text) = &text {
            self.note_directive(find_directive(text));
        }

        let seq = match self.playback.enqueue(audio, text) {
            Ok(seq) => seq,
            Err(err) => {
                self.metrics.chunks_dropped += 1;
                warn!(error = %err, "Audio chunk rejected");
                return;
            }
        };
        trace!(seq, queued = self.playback.len(), "Audio chunk received");
        Timers::clear(&mut self.timers.processing);

        if matches!(self.phase.current(), Phase::Idle | Phase::Processing) {
            if self.can_autoplay() {
                self.transition(Phase::Playing);
                self.playback.start();
            } else {
                info!(turn = self.turn, "Audio ready, waiting for play");
                self.transition(Phase::AwaitingPlayback);
            }
        }
    }

    fn on_backend_error(&mut self, message: String) {
        let message = if message.trim().is_empty() {
            "The voice service reported an error".to_string()
        } else {
            message
        };
        warn!(turn = self.turn, phase = %self.phase.current(), %message, "Voice service error");
        self.errors.raise(&SessionError::Backend(message), None);

        match self.phase.current() {
            Phase::Recording => {
                self.capture.stop();
                self.recording_format = None;
                self.detour_to_idle(Phase::Error);
            }
            Phase::Processing => {
                Timers::clear(&mut self.timers.processing);
                self.detour_to_idle(Phase::Error);
            }
            Phase::AwaitingPlayback | Phase::Playing | Phase::Paused => {
                self.processing_complete = true;
                self.maybe_finalize();
            }
            _ => {}
        }
    }

    /// Defer a navigation directive until the turn is over, or apply it soon if
    /// nothing is in flight.
    fn note_directive(&mut self, target: Option<NavigationTarget>) {
        let Some(target) = target else {
            return;
        };
        if self.phase.is(Phase::Idle) && self.playback.is_drained() {
            debug!(route = %target.route(), "Navigation directive, nothing in flight");
            self.schedule_navigation(target);
        } else {
            debug!(route = %target.route(), phase = %self.phase.current(), "Navigation deferred until the turn ends");
            self.pending_navigation = Some(target);
        }
    }

    // ---- capture -------------------------------------------------------

    fn start_recording(&mut self) {
        if !self.channel.is_open() {
            self.errors.raise(
                &SessionError::Connectivity("Not connected to the voice service".to_string()),
                Some(RetryAction::Reconnect),
            );
            return;
        }
        if !self.phase.is(Phase::Idle) {
            warn!(phase = %self.phase.current(), "Cannot start recording now");
            return;
        }

        self.turn += 1;
        let turn_id = Uuid::new_v4();
        self.turn_id = Some(turn_id);
        self.transcript_final.clear();
        self.transcript_interim.clear();
        self.response.clear();
        self.pending_navigation = None;
        self.processing_complete = false;
        self.discard_turn = false;

        match self.capture.start(self.turn, self.events.clone()) {
            Ok(format) => {
                info!(turn = self.turn, %turn_id, format = %format, "Recording");
                self.recording_format = Some(format);
                self.transition(Phase::Recording);
                self.errors.clear_kind(ErrorKind::Media);
                self.channel.send(&OutboundMessage::StartStream {
                    session_id: self.session_id.clone(),
                });
            }
            Err(err) => {
                warn!(turn = self.turn, error = %err, "Could not start recording");
                self.errors.raise(&err, None);
            }
        }
    }

    fn stop_recording(&mut self, mode: StopMode) {
        if !self.phase.is(Phase::Recording) {
            debug!(?mode, phase = %self.phase.current(), "Not recording");
            return;
        }
        self.capture.stop();
        self.recording_format = None;

        match mode {
            StopMode::EndOfTurn => {
                let sent = self.channel.send(&OutboundMessage::EndStream {
                    session_id: self.session_id.clone(),
                    timestamp: now_millis(),
                });
                if !sent {
                    self.errors.raise(
                        &SessionError::Connectivity("Could not send your message".to_string()),
                        Some(RetryAction::Reconnect),
                    );
                    self.transition(Phase::Idle);
                    return;
                }
                info!(turn = self.turn, chunks_sent = self.metrics.chunks_sent, "Turn sent");
                self.transition(Phase::Processing);
                self.arm_processing_timeout();
            }
            StopMode::Cancel => {
                self.channel.send(&OutboundMessage::Cancel {
                    session_id: self.session_id.clone(),
                    timestamp: now_millis(),
                });
                info!(turn = self.turn, "Recording cancelled");
                self.detour_to_idle(Phase::Cancelled);
            }
            StopMode::Silent => self.transition(Phase::Idle),
        }
    }

    fn on_capture_event(&mut self, event: CaptureEvent) {
        let turn = event.turn();
        if turn != self.turn || !self.phase.is(Phase::Recording) || self.capture.active_turn() != Some(turn) {
            trace!(turn, current = self.turn, "Discarding capture event for a finished turn");
            return;
        }

        match event {
            CaptureEvent::Chunk { data, captured_at, .. } => {
                let Some(format) = &self.recording_format else {
                    return;
                };
                let message = OutboundMessage::AudioData {
                    audio: STANDARD.encode(&data),
                    format: format.mime().to_string(),
                    timestamp: captured_at,
                };
                if self.channel.send(&message) {
                    self.metrics.chunks_sent += 1;
                    trace!(turn, bytes = data.len(), "Audio chunk sent");
                }
            }
            CaptureEvent::Exhausted { .. } => {
                info!(turn, "Audio input ended, sending turn");
                self.stop_recording(StopMode::EndOfTurn);
            }
            CaptureEvent::Failed { error, .. } => {
                warn!(turn, error = %error, "Recorder failed");
                self.stop_recording(StopMode::Cancel);
                self.errors.raise(&error, None);
            }
        }
    }

    /// Cancel a turn the backend is already working on.
    fn cancel(&mut self) {
        match self.phase.current() {
            Phase::Recording => self.stop_recording(StopMode::Cancel),
            Phase::Processing | Phase::AwaitingPlayback | Phase::Playing | Phase::Paused => self.cancel_turn(),
            phase => debug!(%phase, "Nothing to cancel"),
        }
    }

    fn cancel_turn(&mut self) {
        info!(turn = self.turn, phase = %self.phase.current(), "Cancelling turn");
        self.channel.send(&OutboundMessage::Cancel {
            session_id: self.session_id.clone(),
            timestamp: now_millis(),
        });
        self.discard_turn = true;
        self.processing_complete = false;
        self.pending_navigation = None;
        Timers::clear(&mut self.timers.processing);
        self.playback.flush();

        if self.phase.is(Phase::Processing) {
            self.detour_to_idle(Phase::Cancelled);
        } else {
            self.transition(Phase::Idle);
        }
    }

    fn arm_processing_timeout(&mut self) {
        let timer = self.schedule(
            self.config.session.processing_timeout(),
            TimerEvent::ProcessingTimeout { turn: self.turn },
        );
        Timers::set(&mut self.timers.processing, timer);
    }

    // ---- playback ------------------------------------------------------

    fn can_autoplay(&self) -> bool {
        !self.config.playback.require_user_gesture || self.audio_unlocked
    }

    fn play(&mut self) {
        match self.phase.current() {
            Phase::AwaitingPlayback => {
                if !self.audio_unlocked {
                    info!("Audio unlocked by user gesture");
                }
                self.audio_unlocked = true;
                self.transition(Phase::Playing);
                self.playback.start();
            }
            Phase::Paused => {
                if self.playback.resume() {
                    self.transition(Phase::Playing);
                }
            }
            phase => debug!(%phase, "Nothing to play"),
        }
    }

    fn stop_playback(&mut self) {
        if !self.phase.current().is_playback() {
            debug!(phase = %self.phase.current(), "Nothing to stop");
            return;
        }
        info!(turn = self.turn, queued = self.playback.len(), "Playback stopped");
        // Chunks the backend is still sending for this turn are unwanted now.
        self.discard_turn = !self.processing_complete;
        self.finalize();
    }

    fn on_queue_signal(&mut self, signal: QueueSignal) {
        match signal {
            QueueSignal::ChunkPlayed { seq, text } => {
                self.metrics.chunks_played += 1;
                trace!(seq, text = text.as_deref().unwrap_or(""), "Chunk played");
            }
            QueueSignal::ChunkDropped { seq } => {
                self.metrics.chunks_dropped += 1;
                self.metrics.format_failures = self.playback.format_failures();
                debug!(seq, failures = self.metrics.format_failures, "Chunk dropped");
            }
            QueueSignal::FormatUnsupported { failures } => {
                self.metrics.format_failures = failures;
                self.errors.raise(
                    &SessionError::FormatUnsupported("Audio format unsupported on this device".to_string()),
                    None,
                );
                self.finalize();
            }
        }
    }

    /// Finalize once the backend is done *and* everything queued has played.
    fn maybe_finalize(&mut self) {
        if self.phase.current().is_playback() && self.processing_complete && self.playback.is_drained() {
            self.finalize();
        }
    }

    fn finalize(&mut self) {
        Timers::clear(&mut self.timers.processing);
        let discarded = self.playback.flush();
        self.processing_complete = false;
        self.recording_format = None;
        self.transcript_interim.clear();

        if !self.phase.is(Phase::Idle) {
            self.transition(Phase::Idle);
        }
        self.metrics.turns_completed += 1;
        info!(
            turn = self.turn,
            turn_id = %self.turn_id.map(|id| id.to_string()).unwrap_or_default(),
            discarded,
            played = self.metrics.chunks_played,
            "Turn finalized"
        );

        if let Some(target) = self.pending_navigation.take() {
            self.schedule_navigation(target);
        }
    }

    fn schedule_navigation(&mut self, target: NavigationTarget) {
        let timer = self.schedule(
            self.config.session.navigation_delay(),
            TimerEvent::ApplyNavigation(target),
        );
        Timers::set(&mut self.timers.navigation, timer);
    }

    // ---- timers ----------------------------------------------------------

    fn schedule(&self, delay: Duration, event: TimerEvent) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::Timer(event));
        })
    }

    fn on_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::Reconnect => {
                self.timers.reconnect = None;
                if self.intentional_close || self.unauthorized {
                    return;
                }
                if !self.connectivity.is_online() {
                    info!("Still offline, waiting for the network");
                    self.waiting_for_network = true;
                    return;
                }
                info!(attempt = self.reconnect.attempts(), "Reconnecting");
                self.connect();
            }
            TimerEvent::ProcessingTimeout { turn } => {
                self.timers.processing = None;
                if turn != self.turn || !self.phase.is(Phase::Processing) {
                    return;
                }
                warn!(turn, "Voice service did not answer in time");
                self.channel.send(&OutboundMessage::Cancel {
                    session_id: self.session_id.clone(),
                    timestamp: now_millis(),
                });
                self.discard_turn = true;
                self.errors.raise(
                    &SessionError::Backend("The voice service took too long to respond".to_string()),
                    None,
                );
                self.detour_to_idle(Phase::Error);
            }
            TimerEvent::ApplyNavigation(target) => {
                self.timers.navigation = None;
                info!(route = %target.route(), "Applying navigation");
                self.navigator.navigate(&target);
            }
            TimerEvent::ForcedLogout => {
                self.timers.logout = None;
                self.navigator.force_logout();
            }
        }
    }

    // ---- state ---------------------------------------------------------

    fn transition(&mut self, to: Phase) {
        let from = self.phase.current();
        if self.phase.transition(to).is_ok() && from != to {
            debug!(%from, %to, turn = self.turn, "Phase changed");
        }
    }

    fn detour_to_idle(&mut self, via: Phase) {
        let from = self.phase.current();
        if self.phase.detour_to_idle(via).is_ok() {
            debug!(%from, %via, turn = self.turn, "Phase changed");
        }
    }

    fn session_label(&self) -> &str {
        self.session_id.as_deref().unwrap_or("-")
    }

    fn transcript(&self) -> String {
        let mut transcript = self.transcript_final.clone();
        append_text(&mut transcript, &self.transcript_interim);
        transcript
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            session_id: self.session_id.clone(),
            connection: self.channel.status(),
            phase: self.phase.current(),
            transcript: self.transcript(),
            response: self.response.clone(),
            error: self.errors.current().cloned(),
            queued_chunks: self.playback.len(),
            pending_navigation: self.pending_navigation.clone(),
            metrics: self.metrics.clone(),
        });
    }

    async fn teardown(&mut self) {
        if self.phase.is(Phase::Recording) {
            self.stop_recording(StopMode::Cancel);
        }
        self.capture.stop();
        self.playback.flush();
        self.timers.clear_all();
        self.intentional_close = true;
        self.channel.shutdown().await;
        if !self.phase.is(Phase::Idle) {
            self.transition(Phase::Idle);
        }
    }
}

fn append_text(buffer: &mut String, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_text() {
        let mut buffer = String::new();
        append_text(&mut buffer, "  Hello");
        append_text(&mut buffer, "");
        append_text(&mut buffer, "world ");
        assert_eq!(buffer, "Hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_a_timer_aborts_it() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut timers = Timers::default();
        Timers::set(
            &mut timers.navigation,
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let _ = tx.send(());
            }),
        );
        Timers::set(&mut timers.navigation, tokio::spawn(async {}));
        assert!(rx.await.is_err());
    }
}
