use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

const SERVICE_NAME: &str = "voice-relay";

pub async fn root_info() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "websocket": "/ws",
            "config": "/config",
            "health": "/health"
        }
    }))
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "api_back_configured": state.dialogue_configured(),
        "service": {
            "name": SERVICE_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "host": state.config.server.host,
            "port": state.config.server.port
        },
        "sessions": {
            "active": metrics.active_sessions,
            "opened": metrics.sessions_opened
        },
        "metrics": metrics
    }))
}
