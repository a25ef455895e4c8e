#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use voice_session::audio::format::AudioFormat;
use voice_session::audio::media::{MediaRegistry, MediaUrl};
use voice_session::audio::output::{paced_playback, AudioOutput, PlayEnd, PlaybackAdapter, PlaybackControl};
use voice_session::audio::source::AudioSource;
use voice_session::{
    AlwaysOnline, AppConfig, Connectivity, NavigationTarget, Navigator, Phase, SessionError, SessionHandle,
    SessionParts, SessionResult, SessionSnapshot, VoiceSession,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::future::BoxFuture;
use tokio::sync::watch;

pub const WAIT: Duration = Duration::from_secs(5);

/// What the mock backend should do on its live connection.
#[derive(Debug)]
pub enum ServerAction {
    Send(Value),
    Raw(String),
    Close(u16, String),
    /// Drop the TCP connection without a close frame
    Drop,
}

/// In-process voice backend speaking the JSON protocol over a real WebSocket.
pub struct MockBackend {
    url: String,
    received: Arc<Mutex<Vec<Value>>>,
    uris: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<ServerAction>>>>,
    listener: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/voice", listener.local_addr().unwrap());

        let received = Arc::new(Mutex::new(Vec::new()));
        let uris = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(Mutex::new(None));

        let task = {
            let received = received.clone();
            let uris = uris.clone();
            let connections = connections.clone();
            let current = current.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let received = received.clone();
                    let uris = uris.clone();
                    let current = current.clone();
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                            uris.lock().unwrap().push(request.uri().to_string());
                            Ok(response)
                        };
                        let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                            return;
                        };
                        let (mut write, mut read) = ws.split();
                        let (tx, mut rx) = mpsc::unbounded_channel();
                        *current.lock().unwrap() = Some(tx);

                        loop {
                            tokio::select! {
                                incoming = read.next() => match incoming {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                            received.lock().unwrap().push(value);
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                },
                                action = rx.recv() => match action {
                                    Some(ServerAction::Send(value)) => {
                                        let _ = write.send(Message::Text(value.to_string())).await;
                                    }
                                    Some(ServerAction::Raw(text)) => {
                                        let _ = write.send(Message::Text(text)).await;
                                    }
                                    Some(ServerAction::Close(code, reason)) => {
                                        let _ = write
                                            .send(Message::Close(Some(CloseFrame {
                                                code: CloseCode::from(code),
                                                reason: reason.into(),
                                            })))
                                            .await;
                                    }
                                    Some(ServerAction::Drop) | None => break,
                                },
                            }
                        }
                    });
                }
            })
        };

        Self {
            url,
            received,
            uris,
            connections,
            current,
            listener: task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_types(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|m| m["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.received_types().iter().filter(|t| *t == kind).count()
    }

    /// Poll until at least `n` messages of `kind` arrived.
    pub async fn wait_for_count(&self, kind: &str, n: usize) {
        tokio::time::timeout(WAIT, async {
            while self.count(kind) < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never received {} x {}; got {:?}", n, kind, self.received_types()));
    }

    pub fn act(&self, action: ServerAction) {
        let current = self.current.lock().unwrap();
        current
            .as_ref()
            .expect("no live connection")
            .send(action)
            .expect("connection task gone");
    }

    pub fn send(&self, value: Value) {
        self.act(ServerAction::Send(value));
    }

    /// Stop accepting new connections; the port is released.
    pub fn stop_listening(&self) {
        self.listener.abort();
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Base64 payload whose first byte identifies the chunk.
pub fn audio_payload(label: u8) -> String {
    STANDARD.encode([label, 1, 2, 3, 4, 5, 6, 7])
}

/// Microphone that produces numbered chunks.
pub struct ScriptedSource {
    pub chunks: Option<usize>,
    pub deny: bool,
    produced: usize,
    released: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(chunks: Option<usize>) -> (Self, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(true));
        (
            Self {
                chunks,
                deny: false,
                produced: 0,
                released: released.clone(),
            },
            released,
        )
    }
}

impl AudioSource for ScriptedSource {
    fn supported_formats(&self) -> Vec<AudioFormat> {
        vec![AudioFormat::new("audio/pcm")]
    }

    fn acquire(&mut self, _format: &AudioFormat) -> SessionResult<()> {
        if self.deny {
            return Err(SessionError::Media("Microphone permission denied".into()));
        }
        self.produced = 0;
        self.released.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn next_chunk(&mut self, _interval: Duration) -> SessionResult<Option<Vec<u8>>> {
        if self.chunks.is_some_and(|max| self.produced >= max) {
            return Ok(None);
        }
        self.produced += 1;
        Ok(Some(vec![self.produced as u8; 16]))
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Output that plays `audio/wav` candidates for a fixed time and fails everything
/// else; records the label byte of every chunk that finished.
#[derive(Clone)]
pub struct ScriptedOutput {
    pub length: Duration,
    /// When false no candidate loads, like a device without any usable codec
    pub accepts_wav: bool,
    played: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedOutput {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            accepts_wav: true,
            played: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn unplayable() -> Self {
        Self {
            accepts_wav: false,
            ..Self::new(Duration::from_millis(100))
        }
    }

    pub fn played(&self) -> Vec<u8> {
        self.played.lock().unwrap().clone()
    }
}

struct ScriptedAdapter {
    playable: bool,
    length: Duration,
    label: u8,
    played: Arc<Mutex<Vec<u8>>>,
}

impl AudioOutput for ScriptedOutput {
    fn open(&mut self, media: &MediaUrl) -> Box<dyn PlaybackAdapter> {
        Box::new(ScriptedAdapter {
            playable: self.accepts_wav && media.format().is_wav(),
            length: self.length,
            label: media.bytes()[0],
            played: self.played.clone(),
        })
    }
}

impl PlaybackAdapter for ScriptedAdapter {
    fn load(&mut self) -> BoxFuture<'_, SessionResult<()>> {
        Box::pin(async move {
            if self.playable {
                Ok(())
            } else {
                Err(SessionError::Media("unsupported container".into()))
            }
        })
    }

    fn play(&mut self, control: watch::Receiver<PlaybackControl>) -> BoxFuture<'_, SessionResult<PlayEnd>> {
        Box::pin(async move {
            let end = paced_playback(self.length, control).await;
            if end == PlayEnd::Completed {
                self.played.lock().unwrap().push(self.label);
            }
            Ok(end)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Navigate(String),
    Logout,
}

#[derive(Clone, Default)]
pub struct RecordingNavigator {
    events: Arc<Mutex<Vec<ShellEvent>>>,
}

impl RecordingNavigator {
    pub fn events(&self) -> Vec<ShellEvent> {
        self.events.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, event: ShellEvent) {
        tokio::time::timeout(WAIT, async {
            while !self.events().contains(&event) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{:?} never happened; saw {:?}", event, self.events()));
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&mut self, target: &NavigationTarget) {
        self.events.lock().unwrap().push(ShellEvent::Navigate(target.route()));
    }

    fn force_logout(&mut self) {
        self.events.lock().unwrap().push(ShellEvent::Logout);
    }
}

/// Connectivity the test flips by hand.
#[derive(Clone)]
pub struct NetworkSwitch {
    online: Arc<AtomicBool>,
}

impl NetworkSwitch {
    pub fn new() -> Self {
        Self {
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Connectivity for NetworkSwitch {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Short timings so scenarios run in well under a second.
pub fn test_config(url: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.endpoint = url.to_string();
    config.channel.connect_timeout_ms = 2_000;
    config.channel.reconnect_backoff_ms = 100;
    config.channel.logout_delay_ms = 100;
    config.capture.chunk_interval_ms = 50;
    config.capture.preferred_formats = vec!["audio/webm;codecs=opus".into(), "audio/pcm".into()];
    config.playback.candidate_formats = vec!["audio/mpeg".into(), "audio/wav".into()];
    config.playback.load_timeout_ms = 500;
    config.playback.settle_delay_ms = 20;
    config.session.processing_timeout_ms = 5_000;
    config.session.navigation_delay_ms = 50;
    config
}

/// A running session wired to scripted platform pieces.
pub struct Harness {
    pub session: SessionHandle,
    pub output: ScriptedOutput,
    pub navigator: RecordingNavigator,
    pub media: MediaRegistry,
    pub released: Arc<AtomicBool>,
}

impl Harness {
    pub fn spawn(config: AppConfig, source_chunks: Option<usize>) -> Self {
        Self::spawn_with_output(config, source_chunks, Duration::from_millis(100))
    }

    pub fn spawn_with_output(config: AppConfig, source_chunks: Option<usize>, chunk_length: Duration) -> Self {
        Self::spawn_with(
            config,
            source_chunks,
            ScriptedOutput::new(chunk_length),
            Arc::new(AlwaysOnline),
        )
    }

    pub fn spawn_with(
        config: AppConfig,
        source_chunks: Option<usize>,
        output: ScriptedOutput,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        let (source, released) = ScriptedSource::new(source_chunks);
        let navigator = RecordingNavigator::default();
        let media = MediaRegistry::new();

        let session = VoiceSession::spawn(
            config,
            SessionParts {
                source: Box::new(source),
                output: Box::new(output.clone()),
                navigator: Box::new(navigator.clone()),
                connectivity,
                media: media.clone(),
            },
        )
        .unwrap();

        Self {
            session,
            output,
            navigator,
            media,
            released,
        }
    }

    pub async fn wait(&self, what: &str, predicate: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        tokio::time::timeout(WAIT, self.session.wait_for(predicate))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}; last state {:?}", what, self.session.snapshot()))
            .unwrap()
    }

    pub async fn wait_phase(&self, phase: Phase) -> SessionSnapshot {
        self.wait(phase.as_str(), |s| s.phase == phase).await
    }

    pub async fn wait_connected(&self) {
        self.wait("connected", |s| s.is_connected()).await;
    }

    /// Connect, record, stream a few chunks and send the turn.
    pub async fn send_turn(&self, backend: &MockBackend, chunks: usize) {
        self.wait_connected().await;
        let before = backend.count("audio_data");
        self.session.start_recording().unwrap();
        self.wait_phase(Phase::Recording).await;
        backend.wait_for_count("audio_data", before + chunks).await;
        self.session.send_recording().unwrap();
        self.wait_phase(Phase::Processing).await;
    }
}
