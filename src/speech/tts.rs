//! # Speech Synthesis
//!
//! Text-to-speech through the Google Translate batch RPC endpoint, the same voice the
//! clients of this relay were built against. Replies come back as MP3 bytes.
//!
//! ## Request Flow:
//! 1. Split the text into parts of at most 100 characters (punctuation first, then whitespace)
//! 2. Send one `jQ1olc` RPC per part as an urlencoded `f.req` form
//! 3. Extract the base64 audio from the RPC response line and decode it
//! 4. Concatenate the MP3 parts (MP3 frames are self-delimiting)

use crate::config::SynthesisConfig;
use crate::error::SynthesisError;
use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use serde_json::{json, Value};
use std::time::Duration;

const RPC_ID: &str = "jQ1olc";
const MAX_PART_CHARS: usize = 100;
const PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '¡', '¿', '…', '\n'];
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Renders reply text as encoded audio.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Returns `None` for empty text (without doing any work) and on failure.
    async fn speak(&self, text: &str) -> Option<Vec<u8>>;
}

pub struct GoogleTranslateTts {
    client: reqwest::Client,
    endpoint: String,
    language: String,
    slow: bool,
    audio_pattern: Regex,
}

impl GoogleTranslateTts {
    pub fn new(config: &SynthesisConfig) -> Result<Self, SynthesisError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://translate.google.{}", config.tld));
        let endpoint = format!(
            "{}/_/TranslateWebserverUi/data/batchexecute",
            base_url.trim_end_matches('/')
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;
        let audio_pattern = Regex::new(r#"jQ1olc","\[\\"(.*)\\"]"#)
            .map_err(|e| SynthesisError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            language: config.language.clone(),
            slow: config.slow,
            audio_pattern,
        })
    }

    /// Synthesize the whole text, failing if any part fails.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        let mut audio = Vec::new();
        for part in split_text(text, MAX_PART_CHARS) {
            audio.extend(self.synthesize_part(&part).await?);
        }
        if audio.is_empty() {
            return Err(SynthesisError::NoAudio);
        }
        Ok(audio)
    }

    async fn synthesize_part(&self, part: &str) -> Result<Vec<u8>, SynthesisError> {
        let speed = if self.slow { Value::Bool(true) } else { Value::Null };
        let parameter = json!([part, self.language, speed, "null"]).to_string();
        let rpc = json!([[[RPC_ID, parameter, Value::Null, "generic"]]]).to_string();

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::REFERER, "http://translate.google.com/")
            .form(&[("f.req", rpc)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SynthesisError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        let mut audio = Vec::new();
        for line in body.lines().filter(|line| line.contains(RPC_ID)) {
            if let Some(captures) = self.audio_pattern.captures(line) {
                audio.extend(base64::engine::general_purpose::STANDARD.decode(&captures[1])?);
            }
        }

        if audio.is_empty() {
            return Err(SynthesisError::NoAudio);
        }
        Ok(audio)
    }
}

#[async_trait]
impl Synthesizer for GoogleTranslateTts {
    async fn speak(&self, text: &str) -> Option<Vec<u8>> {
        if text.trim().is_empty() {
            return None;
        }

        let start = std::time::Instant::now();
        match self.synthesize(text).await {
            Ok(audio) => {
                tracing::debug!(
                    "Synthesized {} chars into {} bytes in {}ms",
                    text.chars().count(),
                    audio.len(),
                    start.elapsed().as_millis()
                );
                Some(audio)
            }
            Err(e) => {
                tracing::warn!("Speech synthesis failed: {}", e);
                None
            }
        }
    }
}

/// Split text into parts no longer than `max_chars`, preferring punctuation boundaries.
fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if PUNCTUATION.contains(&ch) {
            push_trimmed(&mut pieces, &current);
            current.clear();
        }
    }
    push_trimmed(&mut pieces, &current);

    let mut bounded = Vec::new();
    for piece in pieces {
        if piece.chars().count() <= max_chars {
            bounded.push(piece);
        } else {
            split_on_whitespace(&piece, max_chars, &mut bounded);
        }
    }

    // Merge short neighbours to save round trips.
    let mut parts: Vec<String> = Vec::new();
    for piece in bounded {
        match parts.last_mut() {
            Some(last) if last.chars().count() + 1 + piece.chars().count() <= max_chars => {
                last.push(' ');
                last.push_str(&piece);
            }
            _ => parts.push(piece),
        }
    }
    parts
}

fn push_trimmed(pieces: &mut Vec<String>, piece: &str) {
    let trimmed = piece.trim();
    if !trimmed.is_empty() {
        pieces.push(trimmed.to_string());
    }
}

fn split_on_whitespace(piece: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut current = String::new();
    for word in piece.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_chars {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = word.chars().collect();
            out.extend(chars.chunks(max_chars).map(|chunk| chunk.iter().collect::<String>()));
            continue;
        }

        let current_len = current.chars().count();
        if current.is_empty() {
            current.push_str(word);
        } else if current_len + 1 + word_len <= max_chars {
            current.push(' ');
            current.push_str(word);
        } else {
            out.push(std::mem::replace(&mut current, word.to_string()));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpResponse, HttpServer};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const FAKE_MP3: &[u8] = b"ID3\x03\x00fake-mp3-frame";

    async fn batchexecute(
        form: web::Form<HashMap<String, String>>,
        hits: web::Data<Arc<AtomicUsize>>,
    ) -> HttpResponse {
        hits.fetch_add(1, Ordering::SeqCst);
        let Some(request) = form.get("f.req") else {
            return HttpResponse::BadRequest().finish();
        };
        if !request.contains(RPC_ID) || !request.contains("pt") {
            return HttpResponse::BadRequest().finish();
        }

        let audio = base64::engine::general_purpose::STANDARD.encode(FAKE_MP3);
        let body = format!(
            ")]}}'\n\n104\n[[\"wrb.fr\",\"jQ1olc\",\"[\\\"{}\\\"]\",null,null,null,\"generic\"]]\n",
            audio
        );
        HttpResponse::Ok().body(body)
    }

    async fn start_server(hits: Arc<AtomicUsize>) -> String {
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(hits.clone()))
                .route(
                    "/_/TranslateWebserverUi/data/batchexecute",
                    web::post().to(batchexecute),
                )
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        format!("http://{}", addr)
    }

    fn config(base_url: String) -> SynthesisConfig {
        SynthesisConfig {
            language: "pt".to_string(),
            tld: "com".to_string(),
            slow: false,
            base_url: Some(base_url),
            timeout_secs: 5,
        }
    }

    #[actix_web::test]
    async fn test_speak_returns_decoded_audio() {
        let hits = Arc::new(AtomicUsize::new(0));
        let tts = GoogleTranslateTts::new(&config(start_server(hits.clone()).await)).unwrap();

        let audio = tts.speak("Olá, tudo bem?").await.unwrap();
        assert_eq!(audio, FAKE_MP3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn test_long_text_is_sent_in_parts() {
        let hits = Arc::new(AtomicUsize::new(0));
        let tts = GoogleTranslateTts::new(&config(start_server(hits.clone()).await)).unwrap();

        let text = "palavra ".repeat(40);
        let audio = tts.speak(&text).await.unwrap();
        let calls = hits.load(Ordering::SeqCst);
        assert!(calls >= 3);
        assert_eq!(audio.len(), FAKE_MP3.len() * calls);
    }

    #[actix_web::test]
    async fn test_blank_text_makes_no_request() {
        let hits = Arc::new(AtomicUsize::new(0));
        let tts = GoogleTranslateTts::new(&config(start_server(hits.clone()).await)).unwrap();

        assert!(tts.speak("   \n").await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn test_unreachable_endpoint_yields_none() {
        let tts = GoogleTranslateTts::new(&config("http://127.0.0.1:9".to_string())).unwrap();
        assert!(tts.speak("oi").await.is_none());
    }

    #[test]
    fn test_short_text_is_one_part() {
        assert_eq!(split_text("Olá, tudo bem?", 100), vec!["Olá, tudo bem?"]);
    }

    #[test]
    fn test_parts_respect_the_limit_and_keep_every_word() {
        let text = "Uma frase bem comprida sem pontuação nenhuma ".repeat(8);
        let parts = split_text(&text, 100);

        assert!(parts.len() > 1);
        assert!(parts.iter().all(|part| part.chars().count() <= 100));

        let rejoined: Vec<&str> = parts.iter().flat_map(|p| p.split_whitespace()).collect();
        let original: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(rejoined, original);
    }

    #[test]
    fn test_oversized_word_is_cut() {
        let word = "a".repeat(250);
        let parts = split_text(&word, 100);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 50);
    }
}
