//! # Voice Channel Wire Protocol
//!
//! JSON messages exchanged with the voice backend over the WebSocket channel.
//! Both directions are discriminated by a `type` field.
//!
//! ## Message Flow:
//! 1. **Client → Server**: `start_stream`, then `audio_data` chunks while recording
//! 2. **Client → Server**: `end_stream` (send) or `cancel` (discard the turn)
//! 3. **Server → Client**: transcripts, response text, `audio_chunk`s of synthesized speech
//! 4. **Server → Client**: `processing_complete` once every chunk of the turn was pushed

use crate::error::SessionResult;
use serde::{Deserialize, Serialize};

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Start of a user turn, sent before the first audio chunk
    StartStream {
        session_id: Option<String>,
    },

    /// One captured chunk of microphone audio
    AudioData {
        /// Base64 encoded audio bytes
        audio: String,
        /// Encoding label (MIME type) chosen when recording started
        format: String,
        /// Capture time, Unix milliseconds
        timestamp: i64,
    },

    /// The user finished speaking; the backend should process the turn
    EndStream {
        session_id: Option<String>,
        timestamp: i64,
    },

    /// Discard the turn in progress
    Cancel {
        session_id: Option<String>,
        timestamp: i64,
    },
}

impl OutboundMessage {
    /// Name of the `type` discriminator, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::StartStream { .. } => "start_stream",
            OutboundMessage::AudioData { .. } => "audio_data",
            OutboundMessage::EndStream { .. } => "end_stream",
            OutboundMessage::Cancel { .. } => "cancel",
        }
    }

    pub fn to_json(&self) -> SessionResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages pushed by the voice backend.
///
/// Unknown `type` values decode as [`InboundMessage::Unknown`] so that newer
/// servers can add message types without breaking older clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Interim transcript of what the user said
    Transcript {
        #[serde(default, alias = "transcript")]
        text: String,
    },

    /// Final transcript for a segment of the user's speech
    TranscriptFinal {
        #[serde(default, alias = "transcript")]
        text: String,
    },

    /// Assistant response text
    AiResponse {
        #[serde(default, alias = "response")]
        text: String,
    },

    /// One unit of synthesized speech
    AudioChunk {
        /// Base64 encoded audio bytes
        audio: String,
        /// Text spoken in this chunk, if the backend sends it
        #[serde(default)]
        text: Option<String>,
    },

    /// The backend has pushed everything for the current turn
    ProcessingComplete,

    /// The backend accepted `start_stream`
    StreamStarted {
        #[serde(default)]
        session_id: Option<String>,
    },

    Error {
        #[serde(default)]
        message: String,
    },

    NoSpeechDetected,

    /// The backend acknowledged a `cancel`
    Cancelled,

    /// Side-channel instructions from agent tools, used for navigation
    ToolsUpdate {
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Parse one text frame from the channel.
    pub fn parse(raw: &str) -> SessionResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Name of the `type` discriminator, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Transcript { .. } => "transcript",
            InboundMessage::TranscriptFinal { .. } => "transcript_final",
            InboundMessage::AiResponse { .. } => "ai_response",
            InboundMessage::AudioChunk { .. } => "audio_chunk",
            InboundMessage::ProcessingComplete => "processing_complete",
            InboundMessage::StreamStarted { .. } => "stream_started",
            InboundMessage::Error { .. } => "error",
            InboundMessage::NoSpeechDetected => "no_speech_detected",
            InboundMessage::Cancelled => "cancelled",
            InboundMessage::ToolsUpdate { .. } => "tools_update",
            InboundMessage::Unknown => "unknown",
        }
    }
}

/// Current wall-clock time in Unix milliseconds, the timestamp unit of the protocol.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_shapes() {
        let start = OutboundMessage::StartStream { session_id: Some("s-1".into()) };
        let value: serde_json::Value = serde_json::from_str(&start.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "start_stream", "session_id": "s-1"}));

        let audio = OutboundMessage::AudioData {
            audio: "AAAA".into(),
            format: "audio/wav".into(),
            timestamp: 42,
        };
        let value: serde_json::Value = serde_json::from_str(&audio.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "audio_data", "audio": "AAAA", "format": "audio/wav", "timestamp": 42})
        );

        let cancel = OutboundMessage::Cancel { session_id: None, timestamp: 7 };
        let value: serde_json::Value = serde_json::from_str(&cancel.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "cancel");
        assert!(value["session_id"].is_null());
    }

    #[test]
    fn test_inbound_parsing() {
        let chunk = InboundMessage::parse(r#"{"type":"audio_chunk","audio":"UklGRg==","text":"hi"}"#).unwrap();
        assert_eq!(
            chunk,
            InboundMessage::AudioChunk { audio: "UklGRg==".into(), text: Some("hi".into()) }
        );

        let done = InboundMessage::parse(r#"{"type":"processing_complete","session_id":"abc"}"#).unwrap();
        assert_eq!(done, InboundMessage::ProcessingComplete);

        let error = InboundMessage::parse(r#"{"type":"error","message":"mic busy"}"#).unwrap();
        assert_eq!(error, InboundMessage::Error { message: "mic busy".into() });

        let tools = InboundMessage::parse(r#"{"type":"tools_update","action":"navigate","target":"section/labs"}"#).unwrap();
        assert_eq!(tools.kind(), "tools_update");
    }

    #[test]
    fn test_unknown_types_are_tolerated() {
        let msg = InboundMessage::parse(r#"{"type":"server_heartbeat","seq":3}"#).unwrap();
        assert_eq!(msg, InboundMessage::Unknown);
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(InboundMessage::parse("not json").is_err());
        // Known type with the wrong payload shape
        assert!(InboundMessage::parse(r#"{"type":"audio_chunk","audio":5}"#).is_err());
        // No discriminator at all
        assert!(InboundMessage::parse(r#"{"audio":"AAAA"}"#).is_err());
    }
}
