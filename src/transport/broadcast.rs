use super::{Endpoint, Transport, TransportEvent};
use crate::config::{SyncConfig, TransportKind};
use crate::engine::schedule::TaskSet;
use crate::error::TransportError;
use crate::protocol::{Payload, SyncMessage};
use crate::types::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};

/// Per-session pub/sub channels for clients living in one process
#[derive(Default)]
pub struct BroadcastHub {
    channels: RwLock<HashMap<SessionId, broadcast::Sender<SyncMessage>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel for a session, created on first use
    pub async fn channel(&self, session_id: &str) -> broadcast::Sender<SyncMessage> {
        if let Some(tx) = self.channels.read().await.get(session_id) {
            return tx.clone();
        }
        self.channels
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    /// Drop channels nobody listens to any more
    pub async fn prune(&self) {
        self.channels
            .write()
            .await
            .retain(|_, tx| tx.receiver_count() > 0);
    }

    pub async fn session_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

/// In-process broadcast transport.
///
/// High-value messages are posted several times at staggered delays because
/// late subscribers and lagging receivers otherwise miss them.
pub struct BroadcastTransport {
    hub: Arc<BroadcastHub>,
    endpoint: Arc<Endpoint>,
    config: SyncConfig,
    channel: RwLock<Option<broadcast::Sender<SyncMessage>>>,
    tasks: TaskSet,
}

impl BroadcastTransport {
    pub fn new(hub: Arc<BroadcastHub>, client_id: &str, config: SyncConfig) -> Self {
        Self {
            hub,
            endpoint: Arc::new(Endpoint::new(client_id)),
            config,
            channel: RwLock::new(None),
            tasks: TaskSet::new(),
        }
    }

    /// Delays at which a message is posted
    fn redundancy_for(&self, msg: &SyncMessage) -> Vec<Duration> {
        if !msg.payload.is_high_value() {
            return vec![Duration::ZERO];
        }
        let mut delays = self.config.broadcast_redundancy.clone();
        if msg.sender.is_host && matches!(msg.payload, Payload::UpdateIssues { .. }) {
            delays.extend(self.config.host_issue_redundancy.iter().copied());
        }
        delays
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn client_id(&self) -> &str {
        self.endpoint.client_id()
    }

    async fn connect(
        &self,
        session_id: &str,
        _display_name: &str,
        is_host: bool,
    ) -> Result<(), TransportError> {
        self.disconnect().await;
        self.endpoint.set_status(ConnectionStatus::Connecting);
        self.endpoint.join(session_id, is_host).await;

        let tx = self.hub.channel(session_id).await;
        let mut rx = tx.subscribe();
        *self.channel.write().await = Some(tx);

        let endpoint = self.endpoint.clone();
        self.tasks.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => endpoint.deliver(msg),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Broadcast receiver lagged, skipped {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.endpoint.set_status(ConnectionStatus::Connected);
        tracing::info!(
            client_id = %self.endpoint.client_id(),
            session_id = %session_id,
            "Joined broadcast channel"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        self.tasks.shutdown().await;
        if self.channel.write().await.take().is_some() {
            self.endpoint.leave().await;
            self.hub.prune().await;
        }
    }

    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        let tx = self
            .channel
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let msg = self.endpoint.stamp(payload).await?;

        for delay in self.redundancy_for(&msg) {
            if delay.is_zero() {
                // No receivers is not an error for a broadcast medium
                let _ = tx.send(msg.clone());
            } else {
                let tx = tx.clone();
                let msg = msg.clone();
                self.tasks.spawn_after(delay, async move {
                    let _ = tx.send(msg);
                });
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.endpoint.subscribe()
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.endpoint.status()
    }

    fn set_host(&self, is_host: bool) {
        self.endpoint.assume_role(is_host);
    }
}
