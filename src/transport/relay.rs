//! WebSocket client for the relay server.
//!
//! One background task owns the socket. Outgoing envelopes go through an
//! unbounded channel, so anything sent while the socket is down waits there
//! and is flushed right after the next `join_room`.

use super::{Endpoint, Transport, TransportEvent};
use crate::config::{SyncConfig, TransportKind};
use crate::engine::schedule::TaskSet;
use crate::error::TransportError;
use crate::protocol::{relay_kind, Payload, RelayEnvelope};
use crate::types::*;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;

/// Reconnect delay before attempt `attempt` (0-based): `min(cap, base * 2^attempt)`
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(cap)
}

/// How a socket session ended
enum SocketEnd {
    /// Dropped by the server or the network; reconnect
    Lost,
    /// The transport was disconnected or dropped; stop
    Shutdown,
}

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct Link {
    endpoint: Endpoint,
    config: SyncConfig,
    display_name: RwLock<String>,
    /// Connection id the server assigned in `welcome`
    server_client_id: RwLock<Option<String>>,
}

impl Link {
    async fn envelope(&self, payload: Payload) -> Result<RelayEnvelope, TransportError> {
        let msg = self.endpoint.stamp(payload).await?;
        let room_id = msg.sender.session_id.clone().unwrap_or_default();
        let name = self.display_name.read().await.clone();
        Ok(RelayEnvelope::from_sync(msg, &room_id, &name))
    }

    /// Connect, serve, and reconnect with backoff until shut down or out of attempts
    async fn run(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<RelayEnvelope>) {
        let base = self.config.reconnect_base;
        let cap = self.config.reconnect_cap;
        let mut attempt = 0u32;

        loop {
            self.endpoint.set_status(ConnectionStatus::Connecting);
            match tokio_tungstenite::connect_async(self.config.relay_url.as_str()).await {
                Ok((socket, _response)) => {
                    tracing::info!(url = %self.config.relay_url, "Connected to relay");
                    attempt = 0;
                    match self.serve(socket, &mut outbound).await {
                        SocketEnd::Shutdown => return,
                        SocketEnd::Lost => tracing::warn!("Relay connection lost"),
                    }
                }
                Err(e) => {
                    let err = TransportError::Connect(e.to_string());
                    tracing::warn!(url = %self.config.relay_url, "{}", err);
                }
            }
            self.endpoint.set_status(ConnectionStatus::Disconnected);

            if attempt >= self.config.max_reconnect_attempts {
                let err = TransportError::ReconnectExhausted {
                    attempts: attempt,
                    last_delay: backoff_delay(attempt.saturating_sub(1), base, cap),
                };
                tracing::error!("{}", err);
                return;
            }

            let delay = backoff_delay(attempt, base, cap);
            attempt += 1;
            tracing::info!(attempt, ?delay, "Reconnecting to relay");
            tokio::time::sleep(delay).await;
        }
    }

    async fn serve(
        &self,
        socket: Socket,
        outbound: &mut mpsc::UnboundedReceiver<RelayEnvelope>,
    ) -> SocketEnd {
        let (mut sink, mut stream) = socket.split();

        let name = self.display_name.read().await.clone();
        let join = self
            .envelope(Payload::JoinRoom {
                display_name: name,
                is_host: self.endpoint.is_host(),
            })
            .await;
        match join {
            Ok(envelope) => {
                if send_envelope(&mut sink, &envelope).await.is_err() {
                    return SocketEnd::Lost;
                }
            }
            Err(e) => {
                tracing::error!("Cannot join room: {}", e);
                return SocketEnd::Shutdown;
            }
        }
        self.endpoint.set_status(ConnectionStatus::Connected);

        let period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                envelope = outbound.recv() => {
                    let Some(envelope) = envelope else {
                        let _ = sink.close().await;
                        return SocketEnd::Shutdown;
                    };
                    if send_envelope(&mut sink, &envelope).await.is_err() {
                        return SocketEnd::Lost;
                    }
                }

                _ = ping.tick() => {
                    if let Ok(envelope) = self.envelope(Payload::Ping {}).await {
                        if send_envelope(&mut sink, &envelope).await.is_err() {
                            return SocketEnd::Lost;
                        }
                    }
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_frame(&text).await {
                                if send_envelope(&mut sink, &reply).await.is_err() {
                                    return SocketEnd::Lost;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return SocketEnd::Lost,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("Relay socket error: {}", e);
                            return SocketEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Handle one inbound frame; returns a reply to send, if any
    async fn handle_frame(&self, text: &str) -> Option<RelayEnvelope> {
        let envelope: RelayEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!("Ignoring unreadable relay frame: {}", e);
                return None;
            }
        };

        match envelope.kind.as_str() {
            relay_kind::WELCOME => {
                let id = envelope.data.get("clientId").and_then(|v| v.as_str()).map(str::to_string);
                tracing::debug!(server_client_id = ?id, "Relay welcome");
                *self.server_client_id.write().await = id;
                None
            }
            relay_kind::ROOM_JOINED => {
                let members = envelope
                    .data
                    .get("clients")
                    .and_then(|c| c.as_array())
                    .map(|c| c.len())
                    .unwrap_or(0);
                tracing::info!(members, "Joined relay room");
                None
            }
            relay_kind::PING => self.envelope(Payload::Pong {}).await.ok(),
            relay_kind::PONG => None,
            relay_kind::PROMOTED_TO_HOST => {
                tracing::info!("Relay promoted us to host");
                self.endpoint.announce_role(true);
                None
            }
            _ => {
                if let Some(msg) = envelope.into_sync() {
                    self.endpoint.deliver(msg);
                }
                None
            }
        }
    }
}

async fn send_envelope<S>(sink: &mut S, envelope: &RelayEnvelope) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let Some(json) = envelope.to_json() else {
        return Ok(());
    };
    sink.send(Message::Text(json.into())).await.map_err(|e| {
        tracing::warn!("Failed to send {} to relay: {}", envelope.kind, e);
    })
}

/// Relay-server transport
pub struct RelayTransport {
    link: Arc<Link>,
    outbound: RwLock<Option<mpsc::UnboundedSender<RelayEnvelope>>>,
    tasks: TaskSet,
}

impl RelayTransport {
    pub fn new(client_id: &str, config: SyncConfig) -> Self {
        Self {
            link: Arc::new(Link {
                endpoint: Endpoint::new(client_id),
                config,
                display_name: RwLock::new(String::new()),
                server_client_id: RwLock::new(None),
            }),
            outbound: RwLock::new(None),
            tasks: TaskSet::new(),
        }
    }

    /// Connection id the relay assigned to us, once welcomed
    pub async fn server_client_id(&self) -> Option<String> {
        self.link.server_client_id.read().await.clone()
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn client_id(&self) -> &str {
        self.link.endpoint.client_id()
    }

    async fn connect(
        &self,
        session_id: &str,
        display_name: &str,
        is_host: bool,
    ) -> Result<(), TransportError> {
        self.disconnect().await;
        self.link.endpoint.join(session_id, is_host).await;
        *self.link.display_name.write().await = display_name.to_string();

        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.write().await = Some(tx);
        self.tasks.spawn(self.link.clone().run(rx));

        tracing::info!(
            client_id = %self.client_id(),
            session_id = %session_id,
            url = %self.link.config.relay_url,
            "Connecting to relay"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        self.outbound.write().await.take();
        self.tasks.shutdown().await;
        self.link.endpoint.leave().await;
    }

    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        let connected = *self.link.endpoint.status().borrow() == ConnectionStatus::Connected;
        if matches!(payload, Payload::Ping {}) && !connected {
            // Pings are never queued
            return Ok(());
        }

        let envelope = self.link.envelope(payload).await?;
        let outbound = self.outbound.read().await;
        let tx = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        if !connected {
            tracing::debug!("Relay down, queueing {}", envelope.kind);
        }
        tx.send(envelope).map_err(|_| TransportError::NotConnected)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.link.endpoint.subscribe()
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.link.endpoint.status()
    }

    fn set_host(&self, is_host: bool) {
        self.link.endpoint.assume_role(is_host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        let delays: Vec<u64> = (0..7).map(|n| backoff_delay(n, base, cap).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff_delay(200, base, cap), cap);
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = RelayTransport::new("c1", SyncConfig::default());
        assert!(matches!(
            transport.send(Payload::Reveal {}).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_server_frames() {
        let transport = RelayTransport::new("c1", SyncConfig::default());
        let link = transport.link.clone();
        link.endpoint.join("room-1", false).await;
        let mut events = transport.subscribe();

        let ping = r#"{"type":"ping","timestamp":1}"#;
        let reply = link.handle_frame(ping).await.unwrap();
        assert_eq!(reply.kind, relay_kind::PONG);
        assert_eq!(reply.sender_id, "c1");

        let welcome = r#"{"type":"welcome","data":{"clientId":"conn-7"},"senderId":"server"}"#;
        assert!(link.handle_frame(welcome).await.is_none());
        assert_eq!(transport.server_client_id().await.as_deref(), Some("conn-7"));

        let promoted = r#"{"type":"promoted_to_host","roomId":"room-1","data":{"isHost":true},"senderId":"server"}"#;
        link.handle_frame(promoted).await;
        assert!(matches!(
            events.try_recv().unwrap(),
            TransportEvent::RoleChanged { is_host: true }
        ));

        let vote = r#"{"type":"vote","roomId":"room-1","data":{"participantId":"c2","cardValue":5},"senderId":"c2"}"#;
        link.handle_frame(vote).await;
        match events.try_recv().unwrap() {
            TransportEvent::Message(msg) => assert_eq!(msg.kind(), "vote"),
            other => panic!("unexpected event {:?}", other),
        }

        // Our own messages echoed back are dropped
        let echo = r#"{"type":"reveal","roomId":"room-1","data":{},"senderId":"c1"}"#;
        link.handle_frame(echo).await;
        assert!(events.try_recv().is_err());
    }
}
