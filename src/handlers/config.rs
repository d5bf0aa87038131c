use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Client bootstrap: where to open the audio websocket.
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "websocket_url": state.config.websocket_url(),
        "status": "online"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::test_support::stub_services;
    use actix_web::{test, App};
    use serde_json::Value;

    async fn fetch(config: AppConfig) -> Value {
        let state = AppState::new(config, stub_services(true));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;
        test::call_and_read_body_json(&app, test::TestRequest::get().uri("/config").to_request())
            .await
    }

    #[actix_web::test]
    async fn test_default_websocket_url() {
        let body = fetch(AppConfig::default()).await;
        assert_eq!(body["websocket_url"], "ws://127.0.0.1:10000/ws");
        assert_eq!(body["status"], "online");
    }

    #[actix_web::test]
    async fn test_public_websocket_url() {
        let mut config = AppConfig::default();
        config.server.public_websocket_url = Some("wss://relay.example.com/ws".to_string());
        let body = fetch(config).await;
        assert_eq!(body["websocket_url"], "wss://relay.example.com/ws");
    }
}
