//! Cross-tab transport over a shared storage area.
//!
//! Tabs of one origin share a key/value area and are told about each other's
//! writes through change events (never about their own). One tab is elected
//! host of record and is the only one allowed to write the shared state key;
//! everything else travels as short-lived event keys.

use super::{Endpoint, Transport, TransportEvent};
use crate::clock::now_ms;
use crate::config::{SyncConfig, TransportKind};
use crate::engine::schedule::TaskSet;
use crate::error::TransportError;
use crate::protocol::{Payload, SyncMessage};
use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};

/// Latest host-written state message
pub const SYNC_KEY: &str = "poker-game-sync";
/// Registry of tabs and their liveness
pub const CLIENTS_KEY: &str = "poker-clients";
/// Prefix of short-lived event keys
pub const EVENT_PREFIX: &str = "poker-event-";

/// Notification of a write, delivered to every tab except the writer
#[derive(Debug, Clone)]
pub struct StorageChange {
    pub key: String,
    pub new_value: Option<String>,
    origin: ClientId,
}

/// Key/value area shared by every tab of one origin
pub struct StorageArea {
    entries: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

impl Default for StorageArea {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            changes: broadcast::channel(1024).0,
        }
    }
}

impl StorageArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: String, origin: &str) {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.clone());
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            new_value: Some(value),
            origin: origin.to_string(),
        });
    }

    pub async fn remove(&self, key: &str, origin: &str) {
        if self.entries.write().await.remove(key).is_some() {
            let _ = self.changes.send(StorageChange {
                key: key.to_string(),
                new_value: None,
                origin: origin.to_string(),
            });
        }
    }

    /// Every entry whose key starts with `prefix`
    pub async fn scan(&self, prefix: &str) -> Vec<(String, String)> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

/// A tab's entry in the client registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub id: ClientId,
    #[serde(default)]
    pub session_id: SessionId,
    #[serde(default)]
    pub is_host: bool,
    pub last_seen: i64,
    #[serde(default)]
    pub display_name: String,
}

impl ClientRecord {
    fn is_live(&self, now: i64, window_ms: i64) -> bool {
        now - self.last_seen < window_ms
    }
}

/// Host of record: the smallest client id among clients seen within the window
pub fn elect_host<'a>(
    clients: impl IntoIterator<Item = &'a ClientRecord>,
    now: i64,
    window_ms: i64,
) -> Option<ClientId> {
    clients
        .into_iter()
        .filter(|c| c.is_live(now, window_ms))
        .map(|c| &c.id)
        .min()
        .cloned()
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRecord {
    version: u64,
    host_id: ClientId,
    message: SyncMessage,
}

#[derive(Default)]
struct TabState {
    session_id: SessionId,
    display_name: String,
    /// Version of the last sync record seen or written
    current_version: u64,
    /// Event keys already handed to subscribers
    seen_events: HashSet<String>,
}

/// Everything the background tasks need
struct Tab {
    area: Arc<StorageArea>,
    endpoint: Endpoint,
    config: SyncConfig,
    state: Mutex<TabState>,
}

impl Tab {
    fn me(&self) -> &str {
        self.endpoint.client_id()
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.config.liveness_window.as_millis()).unwrap_or(i64::MAX)
    }

    async fn clients(&self) -> HashMap<ClientId, ClientRecord> {
        let Some(raw) = self.area.get(CLIENTS_KEY).await else {
            return HashMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("Ignoring corrupt client registry: {}", e);
            HashMap::new()
        })
    }

    /// Clients registered for our session
    async fn session_clients(&self) -> Vec<ClientRecord> {
        let session_id = self.state.lock().await.session_id.clone();
        self.clients()
            .await
            .into_values()
            .filter(|c| c.session_id == session_id)
            .collect()
    }

    async fn write_clients(&self, clients: &HashMap<ClientId, ClientRecord>) {
        match serde_json::to_string(clients) {
            Ok(json) => self.area.set(CLIENTS_KEY, json, self.me()).await,
            Err(e) => tracing::error!("Failed to serialize client registry: {}", e),
        }
    }

    /// Record our claim; the election settles who actually hosts
    async fn register(&self, claims_host: bool) {
        let (session_id, display_name) = {
            let state = self.state.lock().await;
            (state.session_id.clone(), state.display_name.clone())
        };
        let mut clients = self.clients().await;
        clients.insert(
            self.me().to_string(),
            ClientRecord {
                id: self.me().to_string(),
                session_id,
                is_host: claims_host,
                last_seen: now_ms(),
                display_name,
            },
        );
        self.write_clients(&clients).await;
    }

    async fn unregister(&self) {
        let mut clients = self.clients().await;
        if clients.remove(self.me()).is_some() {
            self.write_clients(&clients).await;
        }
    }

    /// Refresh our liveness
    async fn touch(&self) {
        let mut clients = self.clients().await;
        match clients.get_mut(self.me()) {
            Some(record) => {
                record.last_seen = now_ms();
                self.write_clients(&clients).await;
            }
            // Pruned while we were asleep
            None => self.register(self.endpoint.is_host()).await,
        }
    }

    /// The smallest live id in the session hosts, incumbent or not
    async fn run_election(&self) {
        let clients = self.session_clients().await;
        match elect_host(&clients, now_ms(), self.window_ms()) {
            Some(id) if id != self.me() => {
                tracing::debug!(client_id = %self.me(), host = %id, "Another tab is host");
                self.step_down().await;
            }
            _ => {
                let sole_host = clients
                    .iter()
                    .filter(|c| c.is_host)
                    .all(|c| c.id == self.me());
                let recorded = clients.iter().any(|c| c.id == self.me() && c.is_host);
                if recorded && sole_host {
                    self.endpoint.announce_role(true);
                } else {
                    self.become_host().await;
                }
            }
        }
    }

    async fn step_down(&self) {
        let mut clients = self.clients().await;
        if let Some(record) = clients.get_mut(self.me()).filter(|r| r.is_host) {
            record.is_host = false;
            self.write_clients(&clients).await;
        }
        self.endpoint.announce_role(false);
    }

    async fn become_host(&self) {
        let session_id = self.state.lock().await.session_id.clone();
        let mut clients = self.clients().await;
        for record in clients.values_mut().filter(|c| c.session_id == session_id) {
            record.is_host = record.id == self.me();
        }
        if let Some(record) = clients.get_mut(self.me()) {
            record.last_seen = now_ms();
        }
        self.write_clients(&clients).await;
        tracing::info!(client_id = %self.me(), "Tab became host of record");
        self.endpoint.announce_role(true);
    }

    /// Host has gone missing or stale
    async fn host_is_stale(&self) -> bool {
        let now = now_ms();
        let window = self.window_ms();
        match self.session_clients().await.iter().find(|c| c.is_host) {
            Some(host) => !host.is_live(now, window),
            None => true,
        }
    }

    async fn write_state(&self, msg: SyncMessage) -> Result<(), TransportError> {
        if !self.endpoint.is_host() {
            tracing::warn!(
                client_id = %self.me(),
                "Non-host tab attempted to write {}, dropping",
                msg.kind()
            );
            return Err(TransportError::Rejected(format!(
                "only the host tab may write {}",
                SYNC_KEY
            )));
        }

        let stored = self.stored_record().await.map(|r| r.version).unwrap_or(0);
        let mut state = self.state.lock().await;
        let version = state.current_version.max(stored) + 1;
        let record = SyncRecord {
            version,
            host_id: self.me().to_string(),
            message: msg,
        };
        let json = serde_json::to_string(&record).map_err(|e| TransportError::Rejected(e.to_string()))?;
        state.current_version = version;
        drop(state);

        self.area.set(SYNC_KEY, json, self.me()).await;
        Ok(())
    }

    async fn stored_record(&self) -> Option<SyncRecord> {
        let raw = self.area.get(SYNC_KEY).await?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Ignoring unreadable sync record: {}", e);
                None
            }
        }
    }

    async fn post_event(&self, msg: SyncMessage) -> Result<String, TransportError> {
        let key = format!(
            "{}{}-{}-{}",
            EVENT_PREFIX,
            msg.kind(),
            msg.timestamp,
            rand::random::<u32>()
        );
        let json = serde_json::to_string(&msg).map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.state.lock().await.seen_events.insert(key.clone());
        self.area.set(&key, json, self.me()).await;
        Ok(key)
    }

    /// Pass a sync record on if it is newer than what we have
    async fn apply_record(&self, record: SyncRecord) {
        let mut state = self.state.lock().await;
        if record.version <= state.current_version || record.host_id == self.me() {
            return;
        }
        state.current_version = record.version;
        let in_session = record.message.sender.session_id.as_deref() == Some(state.session_id.as_str());
        drop(state);

        if in_session {
            self.endpoint.deliver(record.message);
        }
    }

    /// Pass an event on, at most once per tab
    async fn apply_event(&self, key: &str, raw: &str) {
        let msg: SyncMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Ignoring unreadable event {}: {}", key, e);
                return;
            }
        };

        let mut state = self.state.lock().await;
        if !state.seen_events.insert(key.to_string()) {
            return;
        }
        let in_session = msg.sender.session_id.as_deref() == Some(state.session_id.as_str());
        drop(state);

        if in_session {
            self.endpoint.deliver(msg);
        }
    }

    async fn handle_change(&self, change: StorageChange) {
        if change.origin == self.me() {
            return;
        }
        let Some(value) = change.new_value else {
            return;
        };

        if change.key == SYNC_KEY {
            match serde_json::from_str::<SyncRecord>(&value) {
                Ok(record) => self.apply_record(record).await,
                Err(e) => tracing::warn!("Ignoring unreadable sync record: {}", e),
            }
        } else if change.key == CLIENTS_KEY {
            // A second host claim: let the election sort it out
            if self.endpoint.is_host() {
                let other_host = self
                    .session_clients()
                    .await
                    .into_iter()
                    .any(|c| c.is_host && c.id != self.me());
                if other_host {
                    self.run_election().await;
                }
            }
        } else if change.key.starts_with(EVENT_PREFIX) {
            self.apply_event(&change.key, &value).await;
        }
    }

    /// Catch up on anything the change feed missed
    async fn poll(&self) {
        if !self.endpoint.is_host() {
            if let Some(record) = self.stored_record().await {
                self.apply_record(record).await;
            }
        }

        for (key, raw) in self.area.scan(EVENT_PREFIX).await {
            self.apply_event(&key, &raw).await;
        }

        if self.host_is_stale().await {
            self.run_election().await;
        }
    }

    /// Drop stale clients and expired events
    async fn cleanup(&self) {
        let now = now_ms();
        let ttl = i64::try_from(self.config.client_ttl.as_millis()).unwrap_or(i64::MAX);
        let mut clients = self.clients().await;
        let before = clients.len();
        clients.retain(|_, c| now - c.last_seen <= ttl);

        if clients.len() != before {
            tracing::debug!("Pruned {} stale tabs", before - clients.len());
            self.write_clients(&clients).await;

            let session_id = self.state.lock().await.session_id.clone();
            let remaining: Vec<_> = clients.values().filter(|c| c.session_id == session_id).collect();
            if !remaining.is_empty() && !remaining.iter().any(|c| c.is_host) {
                self.run_election().await;
            }
        }

        let event_ttl = i64::try_from(self.config.event_ttl.as_millis()).unwrap_or(i64::MAX);
        let mut live_keys = HashSet::new();
        for (key, raw) in self.area.scan(EVENT_PREFIX).await {
            let expired = match serde_json::from_str::<SyncMessage>(&raw) {
                Ok(msg) => now - msg.timestamp > event_ttl,
                Err(_) => true,
            };
            if expired {
                self.area.remove(&key, self.me()).await;
            } else {
                live_keys.insert(key);
            }
        }
        self.state
            .lock()
            .await
            .seen_events
            .retain(|key| live_keys.contains(key));
    }
}

/// Storage-event transport
pub struct StorageTransport {
    tab: Arc<Tab>,
    tasks: TaskSet,
}

impl StorageTransport {
    pub fn new(area: Arc<StorageArea>, client_id: &str, config: SyncConfig) -> Self {
        Self {
            tab: Arc::new(Tab {
                area,
                endpoint: Endpoint::new(client_id),
                config,
                state: Mutex::new(TabState::default()),
            }),
            tasks: TaskSet::new(),
        }
    }

    /// Current role as decided by the election
    pub fn is_host(&self) -> bool {
        self.tab.endpoint.is_host()
    }

    fn spawn_background(&self) {
        let tab = self.tab.clone();
        let mut changes = tab.area.subscribe();
        self.tasks.spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => tab.handle_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Missed {} storage changes, poll will catch up", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let config = &self.tab.config;

        let tab = self.tab.clone();
        self.tasks.spawn_after(config.initial_election_delay, async move {
            tab.run_election().await;
        });

        let tab = self.tab.clone();
        self.tasks.spawn_every(config.poll_interval, move || {
            let tab = tab.clone();
            async move { tab.poll().await }
        });

        let tab = self.tab.clone();
        self.tasks.spawn_every(config.heartbeat_interval, move || {
            let tab = tab.clone();
            async move { tab.touch().await }
        });

        let tab = self.tab.clone();
        self.tasks.spawn_every(config.cleanup_interval, move || {
            let tab = tab.clone();
            async move { tab.cleanup().await }
        });
    }
}

#[async_trait]
impl Transport for StorageTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Storage
    }

    fn client_id(&self) -> &str {
        self.tab.endpoint.client_id()
    }

    async fn connect(
        &self,
        session_id: &str,
        display_name: &str,
        is_host: bool,
    ) -> Result<(), TransportError> {
        self.tasks.shutdown().await;
        self.tab.endpoint.set_status(ConnectionStatus::Connecting);
        self.tab.endpoint.join(session_id, is_host).await;
        {
            let mut state = self.tab.state.lock().await;
            *state = TabState {
                session_id: session_id.to_string(),
                display_name: display_name.to_string(),
                ..TabState::default()
            };
            // Anything already in storage predates us; the poll will pick it up
        }
        self.tab.register(is_host).await;
        self.spawn_background();

        self.tab.endpoint.set_status(ConnectionStatus::Connected);
        tracing::info!(
            client_id = %self.client_id(),
            session_id = %session_id,
            "Tab registered with shared storage"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        self.tasks.shutdown().await;
        if self.tab.endpoint.session_id().await.is_some() {
            self.tab.unregister().await;
            self.tab.endpoint.leave().await;
        }
    }

    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        let msg = self.tab.endpoint.stamp(payload).await?;
        match msg.payload {
            Payload::FullState { .. } | Payload::UpdateIssues { .. } => self.tab.write_state(msg).await,
            _ => {
                let key = self.tab.post_event(msg).await?;
                let tab = self.tab.clone();
                self.tasks.spawn_after(self.tab.config.event_ttl, async move {
                    tab.area.remove(&key, tab.me()).await;
                });
                Ok(())
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.tab.endpoint.subscribe()
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.tab.endpoint.status()
    }

    fn set_host(&self, is_host: bool) {
        self.tab.endpoint.assume_role(is_host);
    }
}
