//! # Dialogue Backend Client
//!
//! Asks the remote conversational backend one question per turn.
//!
//! ## Wire Format:
//! ```json
//! POST <base_url>/Lyria/conversar
//! {"pergunta": "qual é a capital do Brasil?", "persona": "professora"}
//!
//! 200 OK
//! {"resposta": "A capital do Brasil é Brasília."}
//! ```
//!
//! A single attempt is made per turn and it never outlives the timeout. The caller owns the
//! fallback sentence; this module only reports which kind of failure happened.

use crate::config::DialogueConfig;
use crate::error::DialogueError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Answer used when the backend replies successfully but without an answer.
pub const MISSING_ANSWER_REPLY: &str = "Desculpe, não consegui entender.";

#[async_trait]
pub trait DialogueClient: Send + Sync {
    async fn ask(&self, question: &str, timeout: Duration) -> Result<String, DialogueError>;
}

#[derive(Debug, Serialize)]
struct QuestionRequest<'a> {
    pergunta: &'a str,
    persona: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnswerResponse {
    #[serde(default, alias = "answer")]
    resposta: Option<String>,
}

/// HTTP implementation of `DialogueClient`.
pub struct HttpDialogueClient {
    client: reqwest::Client,
    endpoint: Option<reqwest::Url>,
    persona: String,
}

impl HttpDialogueClient {
    pub fn new(config: &DialogueConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            endpoint: config.endpoint().transpose()?,
            persona: config.persona.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[async_trait]
impl DialogueClient for HttpDialogueClient {
    async fn ask(&self, question: &str, timeout: Duration) -> Result<String, DialogueError> {
        let endpoint = self.endpoint.clone().ok_or(DialogueError::Unconfigured)?;

        let response = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .json(&QuestionRequest {
                pergunta: question,
                persona: &self.persona,
            })
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DialogueError::Status(status.as_u16()));
        }

        let answer: AnswerResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                DialogueError::Timeout(timeout)
            } else {
                DialogueError::Malformed(e.to_string())
            }
        })?;

        Ok(answer
            .resposta
            .unwrap_or_else(|| MISSING_ANSWER_REPLY.to_string()))
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> DialogueError {
    if err.is_timeout() {
        DialogueError::Timeout(timeout)
    } else {
        DialogueError::Connection(err.to_string())
    }
}
