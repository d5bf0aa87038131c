//! # Voice Relay - Main Application Entry Point
//!
//! This is the main entry point for the voice-relay web server.
//! It sets up an Actix-web HTTP server that relays spoken questions to a conversational
//! backend and speaks the answers back:
//!
//! ```text
//! client audio ─ws─▶ buffer ▶ decode ▶ Whisper ▶ dialogue backend ▶ TTS ─ws─▶ client
//! ```
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (optional config file + environment variables)
//! - **state**: Shared read-only state and relay metrics
//! - **health** / **handlers**: small JSON endpoints (`/`, `/health`, `/config`)
//! - **websocket**: the `/ws` endpoint, one actor and one session task per connection
//! - **audio**: buffering, decoding and the per-connection session
//! - **speech**: Whisper recognition and speech synthesis
//! - **dialogue**: the conversational backend client
//! - **error**: Custom error types and HTTP error responses

mod audio;
mod config;
mod dialogue;
mod error;
mod handlers;
mod health;
mod speech;
mod state;
mod websocket;

#[cfg(test)]
mod test_support;

use crate::audio::decoder::AudioDecoder;
use crate::config::AppConfig;
use crate::dialogue::HttpDialogueClient;
use crate::speech::tts::GoogleTranslateTts;
use crate::speech::whisper::{SpeechModel, WhisperRecognizerFactory};
use crate::state::{AppState, RelayServices};
use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from `.env`, an optional config file and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Loads the speech model**; the relay cannot work without it, so failure aborts startup
/// 4. **Builds the processing stages** shared by every connection
/// 5. **Runs the HTTP server** until SIGINT/SIGTERM (actix stops gracefully on both)
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let model = SpeechModel::load(&config.speech)
        .await
        .context("Speech recognition model is unavailable")?;
    info!("Speech model ready: whisper {}", model.size());

    let dialogue = HttpDialogueClient::new(&config.dialogue)?;
    if dialogue.is_configured() {
        info!("Dialogue backend configured");
    } else {
        warn!("API_do_BACK is not set, every turn will be answered with the fallback sentence");
    }

    let services = RelayServices {
        decoder: Arc::new(AudioDecoder::new(config.audio.sample_rate)),
        recognizers: Arc::new(WhisperRecognizerFactory::new(
            model,
            config.endpointing.clone(),
        )),
        dialogue: Arc::new(dialogue),
        synthesizer: Arc::new(GoogleTranslateTts::new(&config.synthesis)?),
    };

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let allowed_origins = config.server.allowed_origins.clone();
    info!("WebSocket endpoint advertised as {}", config.websocket_url());

    let app_state = AppState::new(config, services);

    info!("Starting HTTP server on {}", bind_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(build_cors(&allowed_origins))
            .wrap(TracingLogger::default())
            .route("/", web::get().to(health::root_info))
            .route("/health", web::get().to(health::health_check))
            .route("/config", web::get().to(handlers::get_config))
            .route("/ws", web::get().to(websocket::voice_websocket))
    })
    .bind(&bind_addr)?
    .run()
    .await?;

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "voice_relay=debug")
/// - If not set, defaults to "voice_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// CORS for browser clients: the configured origins, or any origin when none are configured.
fn build_cors(allowed_origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        .max_age(3600);

    if allowed_origins.is_empty() {
        return cors.allow_any_origin();
    }

    allowed_origins
        .iter()
        .fold(cors, |cors, origin| cors.allowed_origin(origin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::header, test};

    async fn allow_origin_header(allowed: &[String], origin: &str) -> Option<String> {
        let app = test::init_service(
            App::new()
                .wrap(build_cors(allowed))
                .route("/", web::get().to(health::root_info)),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/")
            .insert_header((header::ORIGIN, origin))
            .to_request();
        let resp = test::call_service(&app, req).await;
        resp.headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    #[actix_web::test]
    async fn test_any_origin_when_unconfigured() {
        assert!(allow_origin_header(&[], "https://anywhere.example").await.is_some());
    }

    #[actix_web::test]
    async fn test_configured_origin_is_allowed() {
        let allowed = vec!["https://app.example".to_string()];
        assert_eq!(
            allow_origin_header(&allowed, "https://app.example").await.as_deref(),
            Some("https://app.example")
        );
    }
}
