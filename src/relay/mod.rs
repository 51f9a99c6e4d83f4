//! Relay server: rooms keyed by session id, a state copy per room, host failover.

pub mod hub;
pub mod liveness;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::config::RelayConfig;
pub use hub::{ConnId, Outbound, RelayHub};

/// Plain-text answer on `/`
pub const INDEX_TEXT: &str = "Planning Poker WebSocket Server is running";

/// Build the relay's HTTP router
pub fn router(hub: Arc<RelayHub>, config: &RelayConfig) -> Router {
    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .with_state(hub);

    let app = match &config.static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    };

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn index() -> &'static str {
    INDEX_TEXT
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<RelayHub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<RelayHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut outbox) = hub.register().await;

    loop {
        tokio::select! {
            out = outbox.recv() => {
                match out {
                    Some(Outbound::Envelope(envelope)) => {
                        let Some(json) = envelope.to_json() else { continue };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Terminate) | None => break,
                }
            }

            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => hub.handle_text(&conn_id, text.as_str()).await,
                    Some(Ok(Message::Pong(_))) => hub.mark_alive(&conn_id).await,
                    Some(Ok(Message::Ping(data))) => {
                        hub.mark_alive(&conn_id).await;
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!(conn_id = %conn_id, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    hub.leave(&conn_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_index_placeholder() {
        let app = router(Arc::new(RelayHub::new()), &RelayConfig::default());
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], INDEX_TEXT.as_bytes());
    }
}
