//! # Channel Manager
//!
//! Owns the one duplex WebSocket connection a voice session has to its backend.
//!
//! ## Connection Lifecycle:
//! 1. **connect**: A socket task is spawned for a new *generation*; it opens the
//!    connection under a timeout and then pumps frames in both directions
//! 2. **send**: Outbound messages are serialized and queued on the socket writer
//! 3. **events**: Open, frames, failures and closes come back to the session as
//!    `ChannelEvent`s tagged with the generation that produced them
//! 4. **close**: A normal close (1000) is sent and the generation is retired, so
//!    nothing the old socket still reports can affect the session
//!
//! ## Rust Concepts:
//! - **tokio::select!**: One task drives the writer and the reader of a split stream
//! - **Generations**: A plain counter replaces "is this callback still current?" checks
//! - **Drop**: Losing the manager aborts its socket task

use crate::error::{SessionError, SessionResult};
use crate::protocol::OutboundMessage;
use crate::session::{EventSender, SessionEvent};
use crate::state::ConnectionStatus;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// What the socket task reports back to the session.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened { generation: u64 },
    /// The connection could not be opened
    Failed { generation: u64, error: SessionError },
    Message { generation: u64, text: String },
    Closed {
        generation: u64,
        code: Option<u16>,
        reason: String,
    },
}

impl ChannelEvent {
    pub fn generation(&self) -> u64 {
        match self {
            ChannelEvent::Opened { generation }
            | ChannelEvent::Failed { generation, .. }
            | ChannelEvent::Message { generation, .. }
            | ChannelEvent::Closed { generation, .. } => *generation,
        }
    }
}

/// How a close should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// 1000: nothing to recover
    Normal,
    /// The backend rejected our credentials
    Unauthorized,
    /// Anything else: eligible for reconnection
    Abnormal,
}

pub fn classify_close(code: Option<u16>, reason: &str) -> CloseClass {
    let reason = reason.to_ascii_lowercase();
    let auth_reason = ["unauthorized", "forbidden", "401"]
        .iter()
        .any(|needle| reason.contains(needle));

    match code {
        Some(4001) | Some(4003) => CloseClass::Unauthorized,
        _ if auth_reason => CloseClass::Unauthorized,
        Some(1000) => CloseClass::Normal,
        _ => CloseClass::Abnormal,
    }
}

/// Fixed-backoff reconnection budget.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    backoff: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            attempts: 0,
        }
    }

    /// Spend one attempt; `None` once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.backoff)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Whether the device currently has network connectivity.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// For hosts without a connectivity signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

pub struct ChannelManager {
    endpoint: Url,
    token: Option<String>,
    connect_timeout: Duration,
    events: EventSender,
    status: ConnectionStatus,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
    /// Socket task of a retired generation finishing its close handshake
    closing: Option<JoinHandle<()>>,
}

impl ChannelManager {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        connect_timeout: Duration,
        events: EventSender,
    ) -> SessionResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| SessionError::Config(format!("Invalid voice endpoint '{}': {}", endpoint, e)))?;

        Ok(Self {
            endpoint,
            token,
            connect_timeout,
            events,
            status: ConnectionStatus::Disconnected,
            generation: 0,
            outbound: None,
            task: None,
            closing: None,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Endpoint with the `token` and `session_id` query parameters attached.
    pub fn connection_url(&self, session_id: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        if self.token.is_some() || session_id.is_some() {
            let mut pairs = url.query_pairs_mut();
            if let Some(token) = &self.token {
                pairs.append_pair("token", token);
            }
            if let Some(session_id) = session_id {
                pairs.append_pair("session_id", session_id);
            }
        }
        url
    }

    /// Open a new connection. Returns `false` if one is already open or opening.
    pub fn connect(&mut self, session_id: Option<&str>) -> bool {
        if self.status != ConnectionStatus::Disconnected {
            debug!(status = self.status.as_str(), "Connect ignored, channel busy");
            return false;
        }

        self.retire();
        self.generation += 1;
        let generation = self.generation;
        let url = self.connection_url(session_id);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);
        self.status = ConnectionStatus::Connecting;

        info!(generation, endpoint = %self.endpoint, "Opening voice channel");
        self.task = Some(tokio::spawn(run_socket(
            url,
            generation,
            self.connect_timeout,
            outbound_rx,
            self.events.clone(),
        )));
        true
    }

    /// Queue a message on the open socket.
    ///
    /// Never fails loudly: when the channel is not open the message is dropped
    /// with a warning and `false` is returned.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        let Some(outbound) = self.outbound.as_ref().filter(|_| self.is_open()) else {
            warn!(kind = message.kind(), status = self.status.as_str(), "Channel not open, message dropped");
            return false;
        };

        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(kind = message.kind(), error = %err, "Could not serialize message");
                return false;
            }
        };

        if outbound.send(Message::Text(json)).is_err() {
            warn!(kind = message.kind(), "Socket writer gone, message dropped");
            return false;
        }
        true
    }

    /// Close normally (1000). No reconnect follows.
    pub fn close(&mut self) {
        if self.status == ConnectionStatus::Disconnected && self.task.is_none() {
            return;
        }
        info!(generation = self.generation, "Closing voice channel");
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed("client closed"),
            })));
        }
        self.retire();
        self.generation += 1;
        self.status = ConnectionStatus::Disconnected;
    }

    /// Close and give the socket task a moment to finish the close handshake.
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.closing.take() {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                debug!("Socket task did not finish closing in time");
            }
        }
    }

    /// Apply an event to the connection status.
    ///
    /// Returns `false` for events from a retired generation, which the session
    /// must ignore.
    pub fn accept(&mut self, event: &ChannelEvent) -> bool {
        if event.generation() != self.generation {
            debug!(
                event_generation = event.generation(),
                generation = self.generation,
                "Ignoring event from a retired channel"
            );
            return false;
        }

        match event {
            ChannelEvent::Opened { .. } => {
                self.status = ConnectionStatus::Connected;
            }
            ChannelEvent::Failed { .. } | ChannelEvent::Closed { .. } => {
                self.status = ConnectionStatus::Disconnected;
                self.outbound = None;
                self.task = None;
            }
            ChannelEvent::Message { .. } => {}
        }
        true
    }

    /// Detach the current socket task; it ends on its own once its writer queue closes.
    fn retire(&mut self) {
        self.outbound = None;
        if let Some(previous) = self.closing.take() {
            previous.abort();
        }
        self.closing = self.task.take();
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(task) = self.closing.take() {
            task.abort();
        }
    }
}

async fn run_socket(
    url: Url,
    generation: u64,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: EventSender,
) {
    let post = |event: ChannelEvent| {
        let _ = events.send(SessionEvent::Channel(event));
    };

    let stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Err(_) => {
            post(ChannelEvent::Failed {
                generation,
                error: SessionError::Connectivity(format!(
                    "Connection timed out after {}ms",
                    connect_timeout.as_millis()
                )),
            });
            return;
        }
        Ok(Err(err)) => {
            post(ChannelEvent::Failed {
                generation,
                error: err.into(),
            });
            return;
        }
        Ok(Ok((stream, _response))) => stream,
    };

    debug!(generation, "Voice channel open");
    post(ChannelEvent::Opened { generation });

    let (mut write, mut read) = stream.split();
    let (code, reason) = loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(err) = write.send(message).await {
                        break (None, err.to_string());
                    }
                    if closing {
                        break (Some(1000), "client closed".to_string());
                    }
                }
                // The manager retired this generation without an explicit close frame
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break (Some(1000), "client closed".to_string());
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => post(ChannelEvent::Message { generation, text }),
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break (None, err.to_string()),
                None => break (None, "connection ended".to_string()),
            },
        }
    };

    debug!(generation, ?code, %reason, "Voice channel closed");
    post(ChannelEvent::Closed {
        generation,
        code,
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_classification() {
        assert_eq!(classify_close(Some(1000), ""), CloseClass::Normal);
        assert_eq!(classify_close(Some(1006), ""), CloseClass::Abnormal);
        assert_eq!(classify_close(None, "connection reset"), CloseClass::Abnormal);
        assert_eq!(classify_close(Some(4001), ""), CloseClass::Unauthorized);
        assert_eq!(classify_close(Some(1008), "Unauthorized: token expired"), CloseClass::Unauthorized);
        assert_eq!(classify_close(Some(1008), "policy violation"), CloseClass::Abnormal);
        assert_eq!(classify_close(Some(1011), "HTTP 401"), CloseClass::Unauthorized);
    }

    #[test]
    fn test_reconnect_budget_is_bounded() {
        let mut policy = ReconnectPolicy::new(3, Duration::from_secs(2));
        for _ in 0..3 {
            assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
        }
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempts(), 3);

        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
    }

    fn manager(token: Option<&str>) -> ChannelManager {
        let (tx, _rx) = mpsc::unbounded_channel();
        ChannelManager::new(
            "ws://127.0.0.1:8000/ws/voice",
            token.map(str::to_string),
            Duration::from_secs(10),
            tx,
        )
        .unwrap()
    }

    #[test]
    fn test_connection_url_parameters() {
        let channel = manager(Some("abc def"));
        assert_eq!(
            channel.connection_url(Some("s-1")).as_str(),
            "ws://127.0.0.1:8000/ws/voice?token=abc+def&session_id=s-1"
        );
        assert_eq!(
            manager(None).connection_url(None).as_str(),
            "ws://127.0.0.1:8000/ws/voice"
        );
    }

    #[test]
    fn test_send_when_closed_is_dropped() {
        let channel = manager(None);
        let sent = channel.send(&OutboundMessage::Cancel {
            session_id: None,
            timestamp: 0,
        });
        assert!(!sent);
        assert_eq!(channel.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_noop_while_connecting() {
        let (tx, _rx) = mpsc::unbounded_channel();
        // Port 9 (discard) is not listening; the attempt will fail, but only later
        let mut channel =
            ChannelManager::new("ws://127.0.0.1:9/ws", None, Duration::from_secs(10), tx).unwrap();
        assert!(channel.connect(None));
        assert_eq!(channel.status(), ConnectionStatus::Connecting);
        assert!(!channel.connect(None));
        assert_eq!(channel.generation(), 1);

        let stale = ChannelEvent::Opened { generation: 0 };
        assert!(!channel.accept(&stale));
        assert!(channel.accept(&ChannelEvent::Opened { generation: 1 }));
        assert!(channel.is_open());
    }
}
