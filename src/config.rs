//! # Configuration Management
//!
//! This module loads the relay configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Deployment variables (HOST, PORT, API_do_BACK, WEBSOCKET_URL, ALLOWED_ORIGINS)
//! - Default values (built into the code)
//!
//! The configuration is read once at startup and never mutated afterwards. Every component
//! receives the section it needs in its constructor.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (PORT=3000, API_do_BACK=https://...)
//! 2. Environment variables (APP_SERVER__PORT, APP_DIALOGUE__TIMEOUT_SECS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::speech::whisper::{self, DevicePreference, ModelSize};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Longest utterance Whisper can transcribe in one window.
const MAX_WHISPER_WINDOW_MS: u32 = 30_000;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub dialogue: DialogueConfig,
    pub audio: AudioConfig,
    pub speech: SpeechConfig,
    pub endpointing: EndpointConfig,
    pub synthesis: SynthesisConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host` / `port`: address the HTTP server binds to
/// - `allowed_origins`: CORS origins; an empty list accepts any origin
/// - `public_websocket_url`: URL advertised to clients by `GET /config`
/// - `heartbeat_interval_secs` / `client_timeout_secs`: websocket liveness checks
/// - `max_frame_bytes`: largest websocket message accepted, whether it arrives in one frame
///   or is reassembled from fragments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub public_websocket_url: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_frame_bytes: usize,
}

/// Remote conversational backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// Base URL of the backend; `None` means every turn gets the "not configured" reply
    pub base_url: Option<String>,
    /// Route appended to the base URL
    pub path: String,
    /// Persona sent with every question
    pub persona: String,
    /// Upper bound for one question/answer round trip
    pub timeout_secs: u64,
}

/// Buffering and normalization of the incoming audio stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate of the PCM fed to the recognizer (Hz)
    pub sample_rate: u32,
    /// Bytes accumulated before a processing cycle runs
    pub buffer_threshold_bytes: usize,
    /// Feed the raw buffer to the recognizer when it cannot be decoded
    pub raw_fallback: bool,
}

/// Speech recognition model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Whisper model size ("tiny", "base", "small", "medium", "large")
    pub model: String,
    /// Language spoken by the clients (ISO 639-1)
    pub language: String,
    /// "cpu" or "auto" (CUDA when available)
    pub device: String,
}

/// Utterance boundary detection inside the recognizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Analysis frame length in milliseconds
    pub frame_ms: u32,
    /// RMS level (0.0 to 1.0) above which a frame counts as speech
    pub energy_threshold: f32,
    /// Consecutive voiced frames needed to open an utterance
    pub open_voiced_frames: usize,
    /// Trailing silence that closes an utterance
    pub close_silence_ms: u32,
    /// Utterances are closed unconditionally at this length
    pub max_utterance_ms: u32,
}

/// Text-to-speech settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Voice language
    pub language: String,
    /// Top-level domain of the translate host (regional accent)
    pub tld: String,
    /// Slower speech
    pub slow: bool,
    /// Override of `https://translate.google.<tld>`
    pub base_url: Option<String>,
    /// Upper bound for one synthesis request
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 10000,
                allowed_origins: Vec::new(),
                public_websocket_url: None,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                max_frame_bytes: 1024 * 1024,
            },
            dialogue: DialogueConfig {
                base_url: None,
                path: "/Lyria/conversar".to_string(),
                persona: "professora".to_string(),
                timeout_secs: 30,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                buffer_threshold_bytes: 4096,
                raw_fallback: true,
            },
            speech: SpeechConfig {
                model: "tiny".to_string(),
                language: "pt".to_string(),
                device: "cpu".to_string(),
            },
            endpointing: EndpointConfig {
                frame_ms: 30,
                energy_threshold: 0.015,
                open_voiced_frames: 3,
                close_silence_ms: 600,
                max_utterance_ms: 15_000,
            },
            synthesis: SynthesisConfig {
                language: "pt".to_string(),
                tld: "com".to_string(),
                slow: false,
                base_url: None,
                timeout_secs: 15,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_AUDIO__BUFFER_THRESHOLD_BYTES=8192`: Override segmentation threshold
    /// - `API_do_BACK=https://backend.example`: Dialogue backend base URL
    /// - `WEBSOCKET_URL=wss://relay.example/ws`: URL advertised to clients
    /// - `ALLOWED_ORIGINS=http://localhost:8080,https://front.example`: CORS origins
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(base_url) = env::var("API_do_BACK") {
            settings = settings.set_override("dialogue.base_url", base_url)?;
        }

        if let Ok(url) = env::var("WEBSOCKET_URL") {
            settings = settings.set_override("server.public_websocket_url", url)?;
        }

        if let Ok(origins) = env::var("ALLOWED_ORIGINS") {
            settings = settings.set_override("server.allowed_origins", parse_origins(&origins))?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup keeps per-session code free of
    /// impossible states (zero thresholds, zero timeouts, unreachable URLs).
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.server.heartbeat_interval_secs == 0
            || self.server.client_timeout_secs <= self.server.heartbeat_interval_secs
        {
            return Err(anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.server.max_frame_bytes == 0 {
            return Err(anyhow!("Websocket frame size limit must be greater than 0"));
        }

        if self.audio.buffer_threshold_bytes == 0 {
            return Err(anyhow!("Audio buffer threshold must be greater than 0"));
        }

        if self.audio.sample_rate != whisper::SAMPLE_RATE {
            return Err(anyhow!(
                "The recognizer expects {}Hz PCM, got a sample rate of {}",
                whisper::SAMPLE_RATE,
                self.audio.sample_rate
            ));
        }

        if self.dialogue.timeout_secs == 0 || self.synthesis.timeout_secs == 0 {
            return Err(anyhow!("Dialogue and synthesis timeouts must be greater than 0"));
        }

        self.dialogue.endpoint().transpose()?;

        if let Some(base_url) = &self.synthesis.base_url {
            reqwest::Url::parse(base_url)
                .map_err(|e| anyhow!("Invalid synthesis base URL '{}': {}", base_url, e))?;
        }

        self.speech.model_size()?;
        self.speech.device_preference()?;

        let endpointing = &self.endpointing;
        if endpointing.frame_ms == 0 {
            return Err(anyhow!("Endpointing frame length must be greater than 0"));
        }
        if endpointing.open_voiced_frames == 0 {
            return Err(anyhow!("At least one voiced frame must open an utterance"));
        }
        if endpointing.close_silence_ms < endpointing.frame_ms {
            return Err(anyhow!("Closing silence must be at least one frame long"));
        }
        if endpointing.max_utterance_ms > MAX_WHISPER_WINDOW_MS {
            return Err(anyhow!(
                "Utterances longer than {}ms do not fit one recognition window",
                MAX_WHISPER_WINDOW_MS
            ));
        }

        Ok(())
    }

    /// URL advertised to clients for the audio websocket.
    pub fn websocket_url(&self) -> String {
        self.server
            .public_websocket_url
            .clone()
            .unwrap_or_else(|| format!("ws://{}:{}/ws", self.server.host, self.server.port))
    }
}

impl DialogueConfig {
    /// Full URL of the question endpoint, if a backend is configured.
    ///
    /// Returns `Some(Err(..))` when the base URL is set but cannot be parsed.
    pub fn endpoint(&self) -> Option<Result<reqwest::Url>> {
        let base = self.base_url.as_deref().map(str::trim).filter(|b| !b.is_empty())?;
        let joined = format!("{}{}", base.trim_end_matches('/'), self.path);
        Some(
            reqwest::Url::parse(&joined)
                .map_err(|e| anyhow!("Invalid dialogue URL '{}': {}", joined, e)),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SpeechConfig {
    pub fn model_size(&self) -> Result<ModelSize> {
        self.model.parse()
    }

    pub fn device_preference(&self) -> Result<DevicePreference> {
        self.device.parse()
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}
