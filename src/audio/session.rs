//! # Stream Session
//!
//! One `StreamSession` exists per websocket connection. It owns the connection's recognizer
//! and accumulation buffer and runs the voice turn:
//!
//! 1. **Accumulate** incoming chunks until the byte threshold is reached
//! 2. **Decode** the whole buffer to PCM (raw bytes are used when decoding fails and
//!    raw fallback is enabled)
//! 3. **Recognize**: feed the PCM to the recognizer; most calls yield nothing
//! 4. **Ask** the dialogue backend, substituting a fixed sentence on any failure
//! 5. **Synthesize** the answer and emit the audio, or a `{error, text}` notification
//!
//! The buffer is moved out before step 2, so it is empty after every cycle whatever
//! the outcome. A failed cycle is logged and the session keeps going.
//!
//! ## Concurrency:
//! Chunks are handled strictly in arrival order by a single task (`run`). Decode and
//! recognition are CPU bound and run on the blocking pool; the dialogue and synthesis calls
//! are awaited. Nothing here is shared with other sessions except read-only collaborators
//! and atomic counters.

use crate::audio::buffer::TurnBuffer;
use crate::config::AppConfig;
use crate::error::{RecognitionError, TurnError};
use crate::speech::Recognizer;
use crate::state::{RelayMetrics, RelayServices};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Error string sent to the client when the reply could not be synthesized.
pub const SYNTHESIS_FAILED: &str = "Falha ao gerar áudio";

/// A message for the client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Synthesized reply, one complete audio file
    Audio(Vec<u8>),
    /// Structured notification sent as a JSON text frame
    Notification(Notification),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub error: String,
    pub text: String,
}

impl Notification {
    pub fn synthesis_failed(text: String) -> Self {
        Self {
            error: SYNTHESIS_FAILED.to_string(),
            text,
        }
    }
}

/// Per-session knobs taken from the configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub buffer_threshold_bytes: usize,
    pub raw_fallback: bool,
    pub dialogue_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            buffer_threshold_bytes: config.audio.buffer_threshold_bytes,
            raw_fallback: config.audio.raw_fallback,
            dialogue_timeout: config.dialogue.timeout(),
        }
    }
}

/// Counters kept for the teardown summary.
#[derive(Debug)]
struct SessionPerformance {
    created_at: DateTime<Utc>,
    bytes_received: usize,
    cycles: u32,
    transcripts: u32,
    errors: u32,
}

pub struct StreamSession {
    id: Uuid,
    buffer: TurnBuffer,
    /// Locked only by this session's blocking recognition step
    recognizer: Arc<Mutex<Box<dyn Recognizer>>>,
    services: RelayServices,
    settings: SessionSettings,
    metrics: Arc<RelayMetrics>,
    performance: SessionPerformance,
}

impl StreamSession {
    pub fn new(
        recognizer: Box<dyn Recognizer>,
        services: RelayServices,
        settings: SessionSettings,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        metrics.session_opened();
        let id = Uuid::new_v4();
        tracing::info!(session = %id, "Session opened");

        Self {
            id,
            buffer: TurnBuffer::new(settings.buffer_threshold_bytes),
            recognizer: Arc::new(Mutex::new(recognizer)),
            services,
            settings,
            metrics,
            performance: SessionPerformance {
                created_at: Utc::now(),
                bytes_received: 0,
                cycles: 0,
                transcripts: 0,
                errors: 0,
            },
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bytes waiting for the next processing cycle.
    #[cfg(test)]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Consume chunks until the transport goes away.
    ///
    /// `disconnected` resolves (or its sender is dropped) when the connection closes; no
    /// further chunk is processed after that, even if some are still queued. A cycle that
    /// is already running completes first.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        mut disconnected: oneshot::Receiver<()>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = &mut disconnected => break,
                chunk = inbound.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            for message in self.on_chunk(&chunk).await {
                if outbound.send(message).is_err() {
                    tracing::debug!(session = %self.id, "Transport closed, reply dropped");
                    return;
                }
            }
        }
    }

    /// Handle one inbound chunk and return the messages to send back (usually none).
    pub async fn on_chunk(&mut self, chunk: &[u8]) -> Vec<OutboundMessage> {
        self.performance.bytes_received += chunk.len();
        if !self.buffer.push(chunk) {
            return Vec::new();
        }

        let raw = self.buffer.take();
        self.performance.cycles += 1;
        self.metrics.record_cycle();
        tracing::debug!(session = %self.id, bytes = raw.len(), "Processing cycle started");

        match self.run_cycle(raw).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(session = %self.id, "Processing cycle failed: {}", e);
                self.performance.errors += 1;
                self.metrics.record_cycle_error();
                Vec::new()
            }
        }
    }

    async fn run_cycle(&mut self, raw: Vec<u8>) -> Result<Vec<OutboundMessage>, TurnError> {
        let transcript = self.recognize(raw).await?;
        let Some(question) = transcript
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
        else {
            return Ok(Vec::new());
        };

        self.performance.transcripts += 1;
        self.metrics.record_transcript();
        tracing::info!(session = %self.id, "Transcript: '{}'", question);

        let reply = match self
            .services
            .dialogue
            .ask(&question, self.settings.dialogue_timeout)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(session = %self.id, "Dialogue backend failed: {}", e);
                self.metrics.record_dialogue_failure();
                e.fallback_reply().to_string()
            }
        };
        tracing::debug!(session = %self.id, reply_chars = reply.chars().count(), "Reply ready");

        match self.services.synthesizer.speak(&reply).await {
            Some(audio) => {
                self.metrics.record_reply();
                Ok(vec![OutboundMessage::Audio(audio)])
            }
            None => {
                self.metrics.record_synthesis_failure();
                Ok(vec![OutboundMessage::Notification(
                    Notification::synthesis_failed(reply),
                )])
            }
        }
    }

    /// Decode and recognize on the blocking pool.
    async fn recognize(&self, raw: Vec<u8>) -> Result<Option<String>, TurnError> {
        let id = self.id;
        let decoder = self.services.decoder.clone();
        let recognizer = self.recognizer.clone();
        let metrics = self.metrics.clone();
        let raw_fallback = self.settings.raw_fallback;

        tokio::task::spawn_blocking(move || {
            let pcm = match decoder.decode(&raw) {
                Ok(pcm) => pcm,
                Err(e) if raw_fallback => {
                    tracing::warn!(
                        session = %id,
                        "Audio decode failed ({}), using {} raw bytes as PCM",
                        e,
                        raw.len()
                    );
                    metrics.record_decode_fallback();
                    raw
                }
                Err(e) => return Err(TurnError::Decode(e)),
            };

            let mut recognizer = recognizer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Ok(recognizer.accept_waveform(&pcm)?)
        })
        .await
        .map_err(|e| TurnError::Recognition(RecognitionError::Task(e.to_string())))?
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.metrics.session_closed();
        let duration = Utc::now().signed_duration_since(self.performance.created_at);
        tracing::info!(
            session = %self.id,
            duration_secs = duration.num_seconds(),
            bytes = self.performance.bytes_received,
            cycles = self.performance.cycles,
            transcripts = self.performance.transcripts,
            errors = self.performance.errors,
            "Session closed"
        );
    }
}
