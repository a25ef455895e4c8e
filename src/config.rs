//! # Configuration Management
//!
//! This module handles loading and managing the voice session configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, nested keys joined by `__`)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment shortcuts (VOICE_WS_URL, VOICE_AUTH_TOKEN)
//! 2. Environment variables (APP_SERVER__ENDPOINT, APP_PLAYBACK__LOAD_TIMEOUT_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables
use std::time::Duration;
use url::Url;

/// Main configuration for one voice session.
///
/// ## Why separate config structs:
/// Each cooperating part of the session (channel, capture, playback, state machine)
/// reads only its own section, which keeps the knobs for one concern in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub channel: ChannelConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
}

/// Where the voice backend lives and how we authenticate against it.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the voice endpoint (`ws://` or `wss://`)
/// - `auth_token`: Bearer token passed as the `token` query parameter
/// - `session_id`: Session to resume; the server assigns one when absent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub endpoint: String,
    pub auth_token: Option<String>,
    pub session_id: Option<String>,
}

/// Connection lifecycle tuning for the Channel Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Fail a connection attempt if the socket has not opened in this time
    pub connect_timeout_ms: u64,
    /// Automatic reconnection attempts after an unexpected close
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts
    pub reconnect_backoff_ms: u64,
    /// Grace period between an unauthorized close and the forced logout
    pub logout_delay_ms: u64,
    /// Open the channel as soon as the session is spawned
    pub auto_connect: bool,
}

/// Microphone capture settings.
///
/// ## Fields:
/// - `chunk_interval_ms`: How often a chunk is cut and sent (250ms ≈ 4 chunks per second)
/// - `preferred_formats`: Ordered encoding preference; the first one the source supports wins
/// - `source_path`: WAV file backing the file-based microphone used by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub chunk_interval_ms: u64,
    pub preferred_formats: Vec<String>,
    pub source_path: Option<String>,
}

/// Playback queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Container formats materialized for every inbound chunk, tried in order
    pub candidate_formats: Vec<String>,
    /// A candidate that is not playable within this time counts as failed
    pub load_timeout_ms: u64,
    /// Pause between chunks so the output can release the previous one
    pub settle_delay_ms: u64,
    /// Dropped chunks tolerated before playback is abandoned for the session
    pub max_format_failures: u32,
    /// Wait for an explicit `play` before the first turn's audio starts
    pub require_user_gesture: bool,
    /// Silence played once before the first chunk; 0 disables priming
    pub prime_output_ms: u64,
}

/// Session state machine timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Give up on a turn if the backend stays silent this long after `end_stream`
    pub processing_timeout_ms: u64,
    /// Delay between finalization and applying a deferred navigation
    pub navigation_delay_ms: u64,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure a session can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                endpoint: "ws://127.0.0.1:8000/ws/voice".to_string(),
                auth_token: None,
                session_id: None,
            },
            channel: ChannelConfig {
                connect_timeout_ms: 10_000,
                max_reconnect_attempts: 3,
                reconnect_backoff_ms: 2_000,
                logout_delay_ms: 2_000,
                auto_connect: true,
            },
            capture: CaptureConfig {
                chunk_interval_ms: 250,
                preferred_formats: vec![
                    "audio/webm;codecs=opus".to_string(),
                    "audio/ogg;codecs=opus".to_string(),
                    "audio/wav".to_string(),
                    "audio/pcm".to_string(),
                ],
                source_path: None,
            },
            playback: PlaybackConfig {
                candidate_formats: vec![
                    "audio/mpeg".to_string(),
                    "audio/wav".to_string(),
                    "audio/webm".to_string(),
                ],
                load_timeout_ms: 3_000,
                settle_delay_ms: 150,
                max_format_failures: 3,
                require_user_gesture: false,
                prime_output_ms: 0,
            },
            session: SessionConfig {
                processing_timeout_ms: 30_000,
                navigation_delay_ms: 500,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle the VOICE_WS_URL / VOICE_AUTH_TOKEN shortcuts
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__ENDPOINT=wss://api.example.com/ws/voice`
    /// - `APP_PLAYBACK__REQUIRE_USER_GESTURE=true`
    /// - `VOICE_AUTH_TOKEN=eyJhbGciOi...`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            // Field names contain underscores, so nesting uses a double underscore
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(endpoint) = env::var("VOICE_WS_URL") {
            settings = settings.set_override("server.endpoint", endpoint)?;
        }

        if let Ok(token) = env::var("VOICE_AUTH_TOKEN") {
            settings = settings.set_override("server.auth_token", token)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The endpoint parses as a `ws://` or `wss://` URL
    /// - Every interval and limit that is used as a divisor or loop bound is non-zero
    /// - At least one capture preference and one playback candidate exist
    pub fn validate(&self) -> Result<()> {
        let endpoint = Url::parse(&self.server.endpoint)
            .map_err(|e| anyhow::anyhow!("Invalid voice endpoint '{}': {}", self.server.endpoint, e))?;
        if endpoint.scheme() != "ws" && endpoint.scheme() != "wss" {
            return Err(anyhow::anyhow!(
                "Voice endpoint must use ws:// or wss://, got {}://",
                endpoint.scheme()
            ));
        }

        if self.channel.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.capture.chunk_interval_ms == 0 {
            return Err(anyhow::anyhow!("Chunk interval must be greater than 0"));
        }

        if self.capture.preferred_formats.is_empty() {
            return Err(anyhow::anyhow!("At least one capture format must be configured"));
        }

        if self.playback.candidate_formats.is_empty() {
            return Err(anyhow::anyhow!("At least one playback candidate format must be configured"));
        }

        if self.playback.load_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Playback load timeout must be greater than 0"));
        }

        if self.playback.max_format_failures == 0 {
            return Err(anyhow::anyhow!("Max format failures must be greater than 0"));
        }

        Ok(())
    }
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn logout_delay(&self) -> Duration {
        Duration::from_millis(self.logout_delay_ms)
    }
}

impl CaptureConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }
}

impl PlaybackConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn prime_duration(&self) -> Option<Duration> {
        (self.prime_output_ms > 0).then(|| Duration::from_millis(self.prime_output_ms))
    }
}

impl SessionConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn navigation_delay(&self) -> Duration {
        Duration::from_millis(self.navigation_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.channel.max_reconnect_attempts, 3);
        assert_eq!(config.capture.chunk_interval(), Duration::from_millis(250));
        assert_eq!(config.playback.load_timeout(), Duration::from_secs(3));
        assert_eq!(config.playback.candidate_formats.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_validation() {
        let mut config = AppConfig::default();
        config.server.endpoint = "https://example.com/voice".to_string();
        assert!(config.validate().is_err());

        config.server.endpoint = "not a url".to_string();
        assert!(config.validate().is_err());

        config.server.endpoint = "wss://example.com/ws/voice".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = AppConfig::default();
        config.capture.chunk_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.playback.max_format_failures = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.playback.candidate_formats.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_priming_disabled_by_default() {
        let mut config = AppConfig::default();
        assert_eq!(config.playback.prime_duration(), None);
        config.playback.prime_output_ms = 120;
        assert_eq!(config.playback.prime_duration(), Some(Duration::from_millis(120)));
    }
}
