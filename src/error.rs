//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **`AppError`**: returned by HTTP handlers and converted into JSON responses.
//! - **Stage errors**: one type per processing stage of a voice turn
//!   (decode, recognize, dialogue, synthesize). None of them is fatal to a session;
//!   the session decides how each one degrades.
//!
//! ## Stage error policy:
//! - **DecodeError**: the raw buffer is used as PCM instead (unless raw fallback is disabled)
//! - **RecognitionError**: logged, buffer already cleared, session continues
//! - **DialogueError**: replaced by a fixed spoken fallback sentence
//! - **SynthesisError**: reported to the client as a structured notification

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the HTTP layer.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "unavailable",
///     "message": "speech engine failure: ...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
#[derive(Debug, Error)]
pub enum AppError {
    /// A collaborator needed to serve the request is not available right now
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<RecognitionError> for AppError {
    fn from(err: RecognitionError) -> Self {
        AppError::Unavailable(err.to_string())
    }
}

/// The incoming buffer could not be parsed as a known audio container/codec.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("audio buffer is empty")]
    Empty,

    #[error("unsupported or malformed audio container: {0}")]
    Unsupported(String),

    #[error("decoded audio has no sample rate")]
    MissingSampleRate,

    #[error("decoded audio contains no samples")]
    NoSamples,

    #[error("resampling failed: {0}")]
    Resample(String),
}

/// The speech engine failed on one unit of audio.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("speech engine failure: {0}")]
    Engine(String),

    #[error("recognizer task failed: {0}")]
    Task(String),
}

impl From<candle_core::Error> for RecognitionError {
    fn from(err: candle_core::Error) -> Self {
        RecognitionError::Engine(err.to_string())
    }
}

/// One failed call to the dialogue backend.
#[derive(Debug, Error)]
pub enum DialogueError {
    #[error("dialogue backend is not configured")]
    Unconfigured,

    #[error("dialogue backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("dialogue backend unreachable: {0}")]
    Connection(String),

    #[error("dialogue backend answered with status {0}")]
    Status(u16),

    #[error("malformed dialogue response: {0}")]
    Malformed(String),
}

/// Reply used when the backend takes too long.
pub const TIMEOUT_REPLY: &str = "Desculpe, a resposta está demorando muito.";
/// Reply used when the backend address was never configured.
pub const UNCONFIGURED_REPLY: &str = "Erro: API do backend não configurada.";
/// Reply used for every other backend failure.
pub const UNREACHABLE_REPLY: &str = "Desculpe, não consegui me conectar com a IA.";

impl DialogueError {
    /// The sentence spoken back to the user instead of the backend's answer.
    pub fn fallback_reply(&self) -> &'static str {
        match self {
            DialogueError::Timeout(_) => TIMEOUT_REPLY,
            DialogueError::Unconfigured => UNCONFIGURED_REPLY,
            DialogueError::Connection(_)
            | DialogueError::Status(_)
            | DialogueError::Malformed(_) => UNREACHABLE_REPLY,
        }
    }
}

/// Text-to-speech failures.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("synthesis request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("synthesis endpoint answered with status {0}")]
    Status(u16),

    #[error("synthesis response carried no audio")]
    NoAudio,

    #[error("synthesis audio is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid synthesis request: {0}")]
    Request(String),
}

/// Reasons one processing cycle of a session ends without a reply.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Recognition(#[from] RecognitionError),
}
