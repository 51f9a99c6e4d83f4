//! Broadcast media behind one send/receive contract.
//!
//! Every variant stamps outgoing messages with our sender identity, drops
//! inbound messages we sent ourselves, and publishes what is left as
//! [`TransportEvent`]s. Merging and retries live in the engine, not here.

pub mod broadcast;
pub mod relay;
pub mod storage;

pub use self::broadcast::{BroadcastHub, BroadcastTransport};
pub use self::relay::{backoff_delay, RelayTransport};
pub use self::storage::{elect_host, ClientRecord, StorageArea, StorageTransport};

use crate::config::{SyncConfig, TransportKind};
use crate::error::TransportError;
use crate::protocol::{Payload, Sender, SyncMessage};
use crate::types::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast as channel, watch, RwLock};

/// What a transport hands to its subscribers
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer's message (never one of our own)
    Message(SyncMessage),
    /// The medium decided our role (storage election, relay promotion)
    RoleChanged { is_host: bool },
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn client_id(&self) -> &str;

    /// Join the session's channel
    async fn connect(
        &self,
        session_id: &str,
        display_name: &str,
        is_host: bool,
    ) -> Result<(), TransportError>;

    /// Leave the channel and stop every background task
    async fn disconnect(&self);

    /// Best-effort broadcast to the other members of the session
    async fn send(&self, payload: Payload) -> Result<(), TransportError>;

    fn subscribe(&self) -> channel::Receiver<TransportEvent>;

    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    /// Role used when tagging outgoing messages
    fn set_host(&self, is_host: bool);
}

/// In-process media shared by every client of one process (one "browser")
#[derive(Clone, Default)]
pub struct SharedMedia {
    pub hub: Arc<BroadcastHub>,
    pub area: Arc<StorageArea>,
}

impl SharedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the transport selected by `config`
    pub fn transport(&self, config: &SyncConfig, client_id: &str) -> Arc<dyn Transport> {
        match config.transport {
            TransportKind::Broadcast => Arc::new(BroadcastTransport::new(
                self.hub.clone(),
                client_id,
                config.clone(),
            )),
            TransportKind::Storage => Arc::new(StorageTransport::new(
                self.area.clone(),
                client_id,
                config.clone(),
            )),
            TransportKind::Relay => Arc::new(RelayTransport::new(client_id, config.clone())),
        }
    }
}

/// Identity and outbound channels shared by every transport variant
pub(crate) struct Endpoint {
    client_id: ClientId,
    is_host: AtomicBool,
    session_id: RwLock<Option<SessionId>>,
    events: channel::Sender<TransportEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl Endpoint {
    pub(crate) fn new(client_id: &str) -> Self {
        let (events, _rx) = channel::channel(256);
        let (status, _rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            client_id: client_id.to_string(),
            is_host: AtomicBool::new(false),
            session_id: RwLock::new(None),
            events,
            status,
        }
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn is_host(&self) -> bool {
        self.is_host.load(Ordering::SeqCst)
    }

    /// Set our role without telling subscribers (the caller decided it)
    pub(crate) fn assume_role(&self, is_host: bool) {
        self.is_host.store(is_host, Ordering::SeqCst);
    }

    /// Set our role and tell subscribers when it changed
    pub(crate) fn announce_role(&self, is_host: bool) {
        if self.is_host.swap(is_host, Ordering::SeqCst) != is_host {
            tracing::info!(client_id = %self.client_id, is_host, "Transport changed our role");
            let _ = self.events.send(TransportEvent::RoleChanged { is_host });
        }
    }

    pub(crate) async fn join(&self, session_id: &str, is_host: bool) {
        *self.session_id.write().await = Some(session_id.to_string());
        self.assume_role(is_host);
    }

    pub(crate) async fn leave(&self) {
        *self.session_id.write().await = None;
        self.set_status(ConnectionStatus::Disconnected);
    }

    pub(crate) async fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().await.clone()
    }

    /// Wrap a payload in an envelope carrying our identity
    pub(crate) async fn stamp(&self, payload: Payload) -> Result<SyncMessage, TransportError> {
        let session_id = self.session_id().await.ok_or(TransportError::NotConnected)?;
        Ok(SyncMessage::new(
            payload,
            Sender {
                id: self.client_id.clone(),
                is_host: self.is_host(),
                session_id: Some(session_id),
            },
        ))
    }

    /// Hand an inbound message to subscribers unless we sent it
    pub(crate) fn deliver(&self, msg: SyncMessage) {
        if msg.is_from(&self.client_id) {
            tracing::trace!("Dropping own {} message", msg.kind());
            return;
        }
        tracing::debug!(
            client_id = %self.client_id,
            from = %msg.sender.id,
            "Received {}",
            msg.kind()
        );
        // No subscribers yet is fine
        let _ = self.events.send(TransportEvent::Message(msg));
    }

    pub(crate) fn subscribe(&self) -> channel::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                tracing::debug!(client_id = %self.client_id, ?status, "Connection status");
                *current = status;
                true
            }
        });
    }

    pub(crate) fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_from(id: &str) -> SyncMessage {
        SyncMessage::new(
            Payload::Reveal {},
            Sender {
                id: id.to_string(),
                is_host: false,
                session_id: Some("s1".to_string()),
            },
        )
    }

    #[tokio::test]
    async fn test_endpoint_drops_own_messages() {
        let endpoint = Endpoint::new("me");
        let mut rx = endpoint.subscribe();

        endpoint.deliver(message_from("me"));
        endpoint.deliver(message_from("peer"));

        match rx.recv().await.unwrap() {
            TransportEvent::Message(msg) => assert_eq!(msg.sender.id, "peer"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stamp_requires_session() {
        let endpoint = Endpoint::new("me");
        assert!(matches!(
            endpoint.stamp(Payload::Ping {}).await,
            Err(TransportError::NotConnected)
        ));

        endpoint.join("s1", true).await;
        let msg = endpoint.stamp(Payload::Ping {}).await.unwrap();
        assert!(msg.sender.is_host);
        assert_eq!(msg.sender.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_announce_role_only_on_change() {
        let endpoint = Endpoint::new("me");
        let mut rx = endpoint.subscribe();

        endpoint.announce_role(false);
        endpoint.announce_role(true);
        endpoint.announce_role(true);

        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportEvent::RoleChanged { is_host: true }
        ));
        assert!(rx.try_recv().is_err());
    }
}
