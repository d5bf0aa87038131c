//! # Audio Processing Module
//!
//! This module handles the inbound half of a voice turn: buffering the websocket audio,
//! normalizing it for the recognizer, and orchestrating the turn per connection.
//!
//! ## Key Components:
//! - **Turn Buffer**: byte accumulation with a fixed processing threshold
//! - **Audio Decoder**: container decoding, downmix, resampling, 16-bit quantization
//! - **Stream Session**: per-connection orchestrator (decode → recognize → ask → synthesize)
//!
//! ## Recognizer Audio Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;
pub mod decoder;
pub mod session;
