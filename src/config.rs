//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//! - Vendor credential variables (DEEPGRAM_API_KEY, ELEVENLABS_API_KEY)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Credential and platform variables (DEEPGRAM_API_KEY, HOST, PORT, ...)
//! 2. Environment variables (APP_SERVER__PORT, APP_SESSION__GRACE_PERIOD_MS, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Negotiated audio defaults
//! The `[audio]` section holds the defaults applied to a client's handshake. A field
//! left unset here (by default only `sample_rate`) has no default at all, which makes
//! it a required handshake field. Deployments that serve a single known client can set
//! `APP_AUDIO__SAMPLE_RATE=44100` (or 16000) and let clients omit it.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Upper bounds for the session tunables. Values past these are operator
/// mistakes, and some would overflow the timer arithmetic.
const MAX_TIMEOUT_MS: u64 = 3_600_000;
const MAX_HEARTBEAT_SECS: u64 = 3_600;
const MAX_RETRY_BACKOFF_MS: u64 = 60_000;
const MAX_SEND_RETRIES: u32 = 10;
const MAX_SESSIONS_LIMIT: usize = 100_000;
const MAX_QUEUE_CAPACITY: usize = 65_536;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern (HTTP listener, recognition upstream, handshake
/// defaults, per-session tunables, text-to-speech upstream), so a deployment can
/// override one section without touching the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub audio: AudioDefaults,
    pub session: SessionConfig,
    pub tts: TtsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (container deployments)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech-recognition upstream (Deepgram live transcription).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// WebSocket endpoint; recognition options are appended as query parameters
    pub url: String,
    /// Sent as `Authorization: Token <key>`
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
}

/// Defaults applied to fields the client leaves out of its handshake.
///
/// `None` means "no default": the client must supply the field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDefaults {
    pub language: Option<String>,
    pub model: Option<String>,
    pub smart_format: Option<bool>,
    pub interim_results: Option<bool>,
    pub punctuate: Option<bool>,
    pub diarize: Option<bool>,
    pub utterances: Option<bool>,
    pub encoding: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// Per-session tunables for the relay core.
///
/// ## Tuning guidelines:
/// - `grace_period_ms` bounds how long trailing results may flush after either side
///   closes; larger values lose fewer trailing finals but hold resources longer.
/// - `outbound_queue_capacity` bounds buffered results for a slow client; only
///   interim results are ever evicted when it fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub max_concurrent_sessions: usize,
    pub outbound_queue_capacity: usize,
    pub inbound_queue_capacity: usize,
    pub send_retry_attempts: u32,
    pub send_retry_backoff_ms: u64,
    pub heartbeat_interval_secs: u64,
}

/// Text-to-speech upstream (ElevenLabs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub base_url: String,
    /// Sent as `xi-api-key`
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start with nothing but the
/// `DEEPGRAM_API_KEY` variable set. They also document reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            upstream: UpstreamConfig {
                url: "wss://api.deepgram.com/v1/listen".to_string(),
                api_key: None,
                connect_timeout_ms: 10_000,
            },
            audio: AudioDefaults::default(),
            session: SessionConfig::default(),
            tts: TtsConfig {
                base_url: "https://api.elevenlabs.io/v1".to_string(),
                api_key: None,
                request_timeout_secs: 30,
            },
        }
    }
}

impl Default for AudioDefaults {
    fn default() -> Self {
        Self {
            language: Some("en-US".to_string()),
            model: Some("nova-3".to_string()),
            smart_format: Some(true),
            interim_results: Some(true),
            punctuate: Some(true),
            diarize: Some(false),
            utterances: Some(true),
            encoding: Some("linear16".to_string()),
            // Clients disagree between 16 kHz and 44.1 kHz, so there is no safe default.
            sample_rate: None,
            channels: Some(1),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            grace_period_ms: 3_000,
            shutdown_timeout_ms: 5_000,
            max_concurrent_sessions: 100,
            outbound_queue_capacity: 64,
            inbound_queue_capacity: 256,
            send_retry_attempts: 3,
            send_retry_backoff_ms: 50,
            heartbeat_interval_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn send_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.send_retry_backoff_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle the platform variables HOST and PORT
    /// 5. Pick up the vendor credential variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SESSION__IDLE_TIMEOUT_MS=30000`: Override the idle timeout
    /// - `APP_AUDIO__SAMPLE_RATE=44100`: Give the handshake a sample-rate default
    /// - `DEEPGRAM_API_KEY=...`: Recognition credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Section and key are split on a double underscore so that keys such as
            // `grace_period_ms` survive intact.
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("DEEPGRAM_API_KEY") {
            settings = settings.set_override("upstream.api_key", key)?;
        }

        if let Ok(key) = env::var("ELEVENLABS_API_KEY") {
            settings = settings.set_override("tts.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The recognition credential is present (the relay is useless without it)
    /// - Every session timeout and queue capacity is non-zero
    ///
    /// A missing TTS key is not an error: the TTS routes answer 503 instead.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.upstream.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(anyhow::anyhow!(
                "DEEPGRAM_API_KEY environment variable is not set"
            ));
        }

        self.validate_session()
    }

    fn validate_session(&self) -> Result<()> {
        let session = &self.session;

        if session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }
        if session.max_concurrent_sessions > MAX_SESSIONS_LIMIT {
            return Err(anyhow::anyhow!(
                "Max concurrent sessions cannot exceed {}",
                MAX_SESSIONS_LIMIT
            ));
        }

        for (name, value) in [
            ("outbound_queue_capacity", session.outbound_queue_capacity),
            ("inbound_queue_capacity", session.inbound_queue_capacity),
        ] {
            if value == 0 || value > MAX_QUEUE_CAPACITY {
                return Err(anyhow::anyhow!(
                    "session.{} must be between 1 and {}",
                    name,
                    MAX_QUEUE_CAPACITY
                ));
            }
        }

        let timeouts = [
            ("handshake_timeout_ms", session.handshake_timeout_ms, MAX_TIMEOUT_MS),
            ("idle_timeout_ms", session.idle_timeout_ms, MAX_TIMEOUT_MS),
            ("grace_period_ms", session.grace_period_ms, MAX_TIMEOUT_MS),
            ("shutdown_timeout_ms", session.shutdown_timeout_ms, MAX_TIMEOUT_MS),
            ("heartbeat_interval_secs", session.heartbeat_interval_secs, MAX_HEARTBEAT_SECS),
        ];
        for (name, value, max) in timeouts {
            if value == 0 || value > max {
                return Err(anyhow::anyhow!("session.{} must be between 1 and {}", name, max));
            }
        }

        if session.send_retry_attempts > MAX_SEND_RETRIES {
            return Err(anyhow::anyhow!(
                "session.send_retry_attempts cannot exceed {}",
                MAX_SEND_RETRIES
            ));
        }
        if session.send_retry_backoff_ms > MAX_RETRY_BACKOFF_MS {
            return Err(anyhow::anyhow!(
                "session.send_retry_backoff_ms cannot exceed {}",
                MAX_RETRY_BACKOFF_MS
            ));
        }

        if let Some(rate) = self.audio.sample_rate {
            if rate == 0 {
                return Err(anyhow::anyhow!("audio.sample_rate default cannot be 0"));
            }
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the session tunables and the handshake defaults can change at runtime;
    /// listener address and credentials are fixed for the life of the process.
    /// Sessions already streaming keep the settings they started with.
    ///
    /// ## Partial updates:
    /// `{"session": {"idle_timeout_ms": 30000}}` changes only the idle timeout.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(session) = partial_config.get("session") {
            let fields: [(&str, &mut u64); 6] = [
                ("handshake_timeout_ms", &mut self.session.handshake_timeout_ms),
                ("idle_timeout_ms", &mut self.session.idle_timeout_ms),
                ("grace_period_ms", &mut self.session.grace_period_ms),
                ("shutdown_timeout_ms", &mut self.session.shutdown_timeout_ms),
                ("send_retry_backoff_ms", &mut self.session.send_retry_backoff_ms),
                ("heartbeat_interval_secs", &mut self.session.heartbeat_interval_secs),
            ];
            for (name, slot) in fields {
                if let Some(value) = session.get(name).and_then(|v| v.as_u64()) {
                    *slot = value;
                }
            }

            let counts: [(&str, &mut usize); 3] = [
                ("max_concurrent_sessions", &mut self.session.max_concurrent_sessions),
                ("outbound_queue_capacity", &mut self.session.outbound_queue_capacity),
                ("inbound_queue_capacity", &mut self.session.inbound_queue_capacity),
            ];
            for (name, slot) in counts {
                if let Some(value) = session.get(name).and_then(|v| v.as_u64()) {
                    *slot = usize::try_from(value)
                        .map_err(|_| anyhow::anyhow!("session.{} is out of range", name))?;
                }
            }
            if let Some(value) = session.get("send_retry_attempts").and_then(|v| v.as_u64()) {
                self.session.send_retry_attempts = u32::try_from(value)
                    .map_err(|_| anyhow::anyhow!("session.send_retry_attempts is out of range"))?;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            // Merge onto the current defaults; an explicit null clears a default.
            let mut current = serde_json::to_value(&self.audio)?;
            if let (Some(target), Some(patch)) = (current.as_object_mut(), audio.as_object()) {
                for (key, value) in patch {
                    if target.contains_key(key) {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
            self.audio = serde_json::from_value(current)?;
        }

        self.validate_session()?;
        Ok(())
    }

    /// Configuration as JSON with credentials replaced by a presence flag.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port
            },
            "upstream": {
                "url": self.upstream.url,
                "api_key_configured": self.upstream.api_key.is_some(),
                "connect_timeout_ms": self.upstream.connect_timeout_ms
            },
            "audio": self.audio,
            "session": self.session,
            "tts": {
                "base_url": self.tts.base_url,
                "api_key_configured": self.tts.api_key.is_some(),
                "request_timeout_secs": self.tts.request_timeout_secs
            }
        })
    }
}
