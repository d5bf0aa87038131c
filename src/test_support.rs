//! Stub collaborators shared by the HTTP handler tests.

use crate::audio::decoder::AudioDecode;
use crate::dialogue::DialogueClient;
use crate::error::{DecodeError, DialogueError, RecognitionError};
use crate::speech::tts::Synthesizer;
use crate::speech::{Recognizer, RecognizerFactory};
use crate::state::RelayServices;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

struct PassthroughDecoder;

impl AudioDecode for PassthroughDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Vec<u8>, DecodeError> {
        Ok(raw.to_vec())
    }
}

struct SilentRecognizer;

impl Recognizer for SilentRecognizer {
    fn accept_waveform(&mut self, _pcm: &[u8]) -> Result<Option<String>, RecognitionError> {
        Ok(None)
    }
}

struct StubFactory {
    available: bool,
}

impl RecognizerFactory for StubFactory {
    fn create(&self) -> Result<Box<dyn Recognizer>, RecognitionError> {
        if self.available {
            Ok(Box::new(SilentRecognizer))
        } else {
            Err(RecognitionError::Engine("model not loaded".to_string()))
        }
    }
}

struct EchoDialogue;

#[async_trait]
impl DialogueClient for EchoDialogue {
    async fn ask(&self, question: &str, _timeout: Duration) -> Result<String, DialogueError> {
        Ok(question.to_string())
    }
}

struct FixedSynthesizer;

#[async_trait]
impl Synthesizer for FixedSynthesizer {
    async fn speak(&self, _text: &str) -> Option<Vec<u8>> {
        Some(vec![0xFF, 0xFB])
    }
}

pub fn stub_services(recognizer_available: bool) -> RelayServices {
    RelayServices {
        decoder: Arc::new(PassthroughDecoder),
        recognizers: Arc::new(StubFactory {
            available: recognizer_available,
        }),
        dialogue: Arc::new(EchoDialogue),
        synthesizer: Arc::new(FixedSynthesizer),
    }
}
