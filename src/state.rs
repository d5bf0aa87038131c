//! # Application State Management
//!
//! This module holds everything the HTTP handlers and the websocket sessions share.
//!
//! ## What is shared and how:
//!
//! ### Configuration
//! - Read once at startup, never mutated afterwards
//! - `Arc<AppConfig>`: many handlers hold a reference, nobody needs a lock
//!
//! ### Collaborators (`RelayServices`)
//! - Decoder, recognizer factory, dialogue client and synthesizer behind trait objects
//! - All of them are stateless or internally synchronized, so sessions never contend on them
//! - Recognizers are NOT shared: the factory hands every connection a fresh one
//!
//! ### Metrics (`RelayMetrics`)
//! - Plain atomic counters updated by every session
//! - No lock is held across sessions; `snapshot()` reads each counter independently

use crate::audio::decoder::AudioDecode;
use crate::config::AppConfig;
use crate::dialogue::DialogueClient;
use crate::speech::tts::Synthesizer;
use crate::speech::RecognizerFactory;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: cloning only bumps reference counts, the data is not copied
/// - **Arc<dyn Trait>**: shared ownership of a value whose concrete type is chosen in `main`
///   (and replaced by stubs in tests)
#[derive(Clone)]
pub struct AppState {
    /// Validated configuration
    pub config: Arc<AppConfig>,

    /// Processing stages used by every session
    pub services: RelayServices,

    /// Relay-wide counters
    pub metrics: Arc<RelayMetrics>,

    /// When the server started
    pub start_time: Instant,
}

/// The external collaborators of a voice turn.
#[derive(Clone)]
pub struct RelayServices {
    pub decoder: Arc<dyn AudioDecode>,
    pub recognizers: Arc<dyn RecognizerFactory>,
    pub dialogue: Arc<dyn DialogueClient>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// Counters collected across all sessions.
///
/// ## Why these metrics matter:
/// - **decode_fallbacks**: how often raw bytes were fed to the recognizer unchanged
/// - **dialogue_failures**: turns answered with a fallback sentence
/// - **synthesis_failures**: turns that ended with an error notification instead of audio
#[derive(Debug, Default)]
pub struct RelayMetrics {
    active_sessions: AtomicU64,
    sessions_opened: AtomicU64,
    processing_cycles: AtomicU64,
    transcripts: AtomicU64,
    decode_fallbacks: AtomicU64,
    cycle_errors: AtomicU64,
    dialogue_failures: AtomicU64,
    synthesis_failures: AtomicU64,
    replies_sent: AtomicU64,
}

/// Point-in-time copy of `RelayMetrics`, ready to be serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: u64,
    pub sessions_opened: u64,
    pub processing_cycles: u64,
    pub transcripts: u64,
    pub decode_fallbacks: u64,
    pub cycle_errors: u64,
    pub dialogue_failures: u64,
    pub synthesis_failures: u64,
    pub replies_sent: u64,
}

impl RelayMetrics {
    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        // Saturating: a stray double close must not wrap the gauge.
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_cycle(&self) {
        self.processing_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transcript(&self) {
        self.transcripts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_fallback(&self) {
        self.decode_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_error(&self) {
        self.cycle_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dialogue_failure(&self) {
        self.dialogue_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_synthesis_failure(&self) {
        self.synthesis_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            processing_cycles: self.processing_cycles.load(Ordering::Relaxed),
            transcripts: self.transcripts.load(Ordering::Relaxed),
            decode_fallbacks: self.decode_fallbacks.load(Ordering::Relaxed),
            cycle_errors: self.cycle_errors.load(Ordering::Relaxed),
            dialogue_failures: self.dialogue_failures.load(Ordering::Relaxed),
            synthesis_failures: self.synthesis_failures.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Create the shared state from a validated configuration and the collaborators
    /// built in `main`.
    pub fn new(config: AppConfig, services: RelayServices) -> Self {
        Self {
            config: Arc::new(config),
            services,
            metrics: Arc::new(RelayMetrics::default()),
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Whether a dialogue backend address was configured.
    pub fn dialogue_configured(&self) -> bool {
        self.config.dialogue.endpoint().is_some()
    }
}
