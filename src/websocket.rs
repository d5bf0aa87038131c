//! # WebSocket Voice Relay Handler
//!
//! Binds one `StreamSession` to one websocket connection at `/ws`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: a recognizer is created for the connection before the upgrade;
//!    if the speech engine cannot provide one the request fails with 503
//! 2. **Audio Streaming**: every binary message is an opaque audio chunk; fragmented messages
//!    are reassembled first, and messages up to `server.max_frame_bytes` are accepted
//! 3. **Replies**: binary messages carry synthesized reply audio (one MP3 per turn);
//!    text messages carry `{"error": ..., "text": ...}` when synthesis failed
//! 4. **Heartbeat**: the server pings periodically and closes silent connections
//!
//! ## Actor Model:
//! The actor only moves frames. Chunks go to the session task through an unbounded
//! channel, replies come back through a second channel consumed as an actor stream.
//! When the actor stops, the session task is told through a oneshot and drops the session
//! (and with it the recognizer).

use crate::audio::session::{OutboundMessage, SessionSettings, StreamSession};
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_http::ws::Item;
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Session pieces handed over to the task when the actor starts.
struct PendingSession {
    session: StreamSession,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    disconnected: oneshot::Receiver<()>,
}

/// A message arriving in several frames.
struct FragmentedMessage {
    binary: bool,
    data: Vec<u8>,
}

/// WebSocket actor for one relay connection.
pub struct VoiceRelaySocket {
    session_id: Uuid,

    /// Taken in `started`
    pending: Option<PendingSession>,

    /// Chunks for the session task
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,

    /// Dropped (or fired) when the connection ends
    disconnect: Option<oneshot::Sender<()>>,

    /// Fragments of the message being received
    fragments: Option<FragmentedMessage>,
    max_message_bytes: usize,

    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl VoiceRelaySocket {
    pub fn new(session: StreamSession, server: &ServerConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnect_rx) = oneshot::channel();

        Self {
            session_id: session.id(),
            pending: Some(PendingSession {
                session,
                inbound: inbound_rx,
                disconnected: disconnect_rx,
            }),
            inbound: Some(inbound_tx),
            disconnect: Some(disconnect_tx),
            fragments: None,
            max_message_bytes: server.max_frame_bytes,
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(server.client_timeout_secs),
            last_heartbeat: Instant::now(),
        }
    }

    fn forward_chunk(&mut self, chunk: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = &self.inbound else {
            return;
        };
        if inbound.send(chunk).is_err() {
            warn!(session = %self.session_id, "Session task is gone, closing connection");
            ctx.stop();
        }
    }

    fn on_fragment(&mut self, item: Item, ctx: &mut ws::WebsocketContext<Self>) {
        let (data, last) = match item {
            Item::FirstBinary(data) => {
                self.start_fragments(true);
                (data, false)
            }
            Item::FirstText(data) => {
                self.start_fragments(false);
                (data, false)
            }
            Item::Continue(data) => (data, false),
            Item::Last(data) => (data, true),
        };

        let Some(message) = self.fragments.as_mut() else {
            debug!(session = %self.session_id, "Continuation frame outside a fragmented message");
            return;
        };
        if message.data.len() + data.len() > self.max_message_bytes {
            warn!(
                session = %self.session_id,
                "Fragmented message exceeds {} bytes, discarding it",
                self.max_message_bytes
            );
            self.fragments = None;
            return;
        }
        message.data.extend_from_slice(&data);

        if !last {
            return;
        }
        if let Some(message) = self.fragments.take() {
            if message.binary {
                self.forward_chunk(message.data, ctx);
            } else {
                warn!(
                    session = %self.session_id,
                    "Ignoring {} byte fragmented text message, audio must be sent as binary",
                    message.data.len()
                );
            }
        }
    }

    fn start_fragments(&mut self, binary: bool) {
        if self.fragments.is_some() {
            warn!(session = %self.session_id, "Fragmented message interrupted by a new one");
        }
        self.fragments = Some(FragmentedMessage {
            binary,
            data: Vec::new(),
        });
    }
}

impl Actor for VoiceRelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session = %self.session_id, "WebSocket connection started");

        if let Some(pending) = self.pending.take() {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            ctx.add_stream(UnboundedReceiverStream::new(outbound_rx));
            actix_web::rt::spawn(pending.session.run(
                pending.inbound,
                pending.disconnected,
                outbound_tx,
            ));
        }

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session = %self.session_id, "WebSocket connection stopped");
        self.inbound.take();
        if let Some(disconnect) = self.disconnect.take() {
            let _ = disconnect.send(());
        }
    }
}

/// Handle incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceRelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward_chunk(data.to_vec(), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                warn!(
                    session = %self.session_id,
                    "Ignoring {} byte text frame, audio must be sent as binary",
                    text.len()
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                self.last_heartbeat = Instant::now();
                info!(session = %self.session_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(item)) => {
                self.last_heartbeat = Instant::now();
                self.on_fragment(item, ctx);
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Deliver session replies to the client.
impl StreamHandler<OutboundMessage> for VoiceRelaySocket {
    fn handle(&mut self, msg: OutboundMessage, ctx: &mut Self::Context) {
        match msg {
            OutboundMessage::Audio(audio) => {
                debug!(session = %self.session_id, bytes = audio.len(), "Sending reply audio");
                ctx.binary(audio);
            }
            OutboundMessage::Notification(notification) => {
                match serde_json::to_string(&notification) {
                    Ok(json) => ctx.text(json),
                    Err(e) => error!(session = %self.session_id, "Failed to encode notification: {}", e),
                }
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session = %self.session_id, "Session task finished");
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// The recognizer is created here, before the upgrade, so an unavailable speech engine is
/// reported as a normal HTTP error instead of a socket that closes immediately.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    info!(
        "New WebSocket connection request from: {:?} ({} sessions active)",
        req.connection_info().peer_addr(),
        state.metrics.active_sessions()
    );

    let recognizer = state.services.recognizers.create().map_err(|e| {
        error!("Could not create a recognizer for the connection: {}", e);
        AppError::from(e)
    })?;

    let session = StreamSession::new(
        recognizer,
        state.services.clone(),
        SessionSettings::from_config(&state.config),
        state.metrics.clone(),
    );

    ws::WsResponseBuilder::new(VoiceRelaySocket::new(session, &state.config.server), &req, stream)
        .frame_size(state.config.server.max_frame_bytes)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::test_support::stub_services;
    use crate::state::RelayMetrics;
    use actix_web::{http::StatusCode, test, App, HttpServer};
    use futures_util::SinkExt;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
    use tokio_tungstenite::tungstenite::protocol::frame::Frame;
    use tokio_tungstenite::tungstenite::Message;

    fn app_state(recognizer_available: bool) -> AppState {
        AppState::new(AppConfig::default(), stub_services(recognizer_available))
    }

    #[actix_web::test]
    async fn test_unavailable_recognizer_is_503() {
        let state = app_state(false);
        let metrics = state.metrics.clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/ws").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(metrics.snapshot().sessions_opened, 0);
    }

    #[actix_web::test]
    async fn test_plain_get_is_rejected_and_session_released() {
        let state = app_state(true);
        let metrics = state.metrics.clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/ws").to_request()).await;
        assert!(resp.status().is_client_error());
        assert_eq!(metrics.active_sessions(), 0);
    }

    async fn start_relay(state: AppState) -> String {
        let state = web::Data::new(state);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .route("/ws", web::get().to(voice_websocket))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        format!("ws://{}/ws", addr)
    }

    async fn wait_for_cycles(metrics: &RelayMetrics, expected: u64) -> u64 {
        for _ in 0..100 {
            let cycles = metrics.snapshot().processing_cycles;
            if cycles >= expected {
                return cycles;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        metrics.snapshot().processing_cycles
    }

    #[actix_web::test]
    async fn test_chunk_larger_than_default_codec_limit_is_processed() {
        let state = app_state(true);
        let metrics = state.metrics.clone();
        let (mut socket, _) = tokio_tungstenite::connect_async(start_relay(state).await)
            .await
            .unwrap();

        socket
            .send(Message::Binary(vec![7u8; 70_000].into()))
            .await
            .unwrap();

        assert_eq!(wait_for_cycles(&metrics, 1).await, 1);
    }

    #[actix_web::test]
    async fn test_fragmented_binary_message_is_reassembled() {
        let state = app_state(true);
        let metrics = state.metrics.clone();
        let (mut socket, _) = tokio_tungstenite::connect_async(start_relay(state).await)
            .await
            .unwrap();

        let first = Frame::message(vec![1u8; 3000], OpCode::Data(Data::Binary), false);
        let last = Frame::message(vec![2u8; 3000], OpCode::Data(Data::Continue), true);
        socket.send(Message::Frame(first)).await.unwrap();
        socket.send(Message::Frame(last)).await.unwrap();

        assert_eq!(wait_for_cycles(&metrics, 1).await, 1);
    }

    #[actix_web::test]
    async fn test_text_frames_do_not_reach_the_session() {
        let state = app_state(true);
        let metrics = state.metrics.clone();
        let (mut socket, _) = tokio_tungstenite::connect_async(start_relay(state).await)
            .await
            .unwrap();

        socket
            .send(Message::Text("x".repeat(5000).into()))
            .await
            .unwrap();
        socket
            .send(Message::Binary(vec![0u8; 100].into()))
            .await
            .unwrap();
        socket
            .send(Message::Binary(vec![0u8; 4000].into()))
            .await
            .unwrap();

        // Only the 4100 binary bytes count towards the threshold.
        assert_eq!(wait_for_cycles(&metrics, 2).await, 1);
    }
}
