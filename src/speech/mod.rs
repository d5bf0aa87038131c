//! # Speech Module
//!
//! Speech-to-text and text-to-speech collaborators of the relay.
//!
//! ## Key Components:
//! - **Recognizer**: stateful, per-connection speech recognizer fed with PCM
//! - **Endpointer**: energy-based utterance boundary detection used by the recognizer
//! - **Whisper**: Candle-based recognizer implementation (model shared by all sessions)
//! - **TTS**: text-to-speech client producing MP3 bytes

pub mod endpoint;
pub mod tts;
pub mod whisper;

use crate::error::RecognitionError;

/// A speech recognizer bound to exactly one session.
///
/// Implementations keep internal state across calls (pending audio, open utterances),
/// so an instance must never be shared between connections.
pub trait Recognizer: Send {
    /// Feed 16-bit little-endian mono PCM.
    ///
    /// Returns `Ok(Some(text))` when an utterance was finalized by this input and
    /// `Ok(None)` when more audio is needed.
    fn accept_waveform(&mut self, pcm: &[u8]) -> Result<Option<String>, RecognitionError>;
}

/// Creates a fresh recognizer for every new connection.
pub trait RecognizerFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Recognizer>, RecognitionError>;
}
