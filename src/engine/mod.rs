//! Reconciliation engine.
//!
//! The host answers state requests and periodically re-pushes its ticket list;
//! participants bootstrap by asking repeatedly and accept incoming lists under
//! the merge rule in [`merge`]. Nothing here assumes ordered or exactly-once
//! delivery.

pub mod merge;
pub mod schedule;

use crate::clock::now_ms;
use crate::config::{SyncConfig, TransportKind};
use crate::protocol::{Payload, SyncMessage};
use crate::store::LocalStore;
use crate::transport::{Transport, TransportEvent};
use crate::types::*;
use merge::{Incoming, MergeDecision};
use schedule::TaskSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

/// What the engine tells the rest of the client
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A ticket list was accepted (re-emitted a couple of times)
    IssuesUpdated(Vec<Ticket>),
    TicketSelected(Ticket),
    VoteReceived {
        participant_id: ClientId,
        card_value: f64,
        display_name: String,
    },
    /// Votes carried by a host snapshot
    VotesRestored(HashMap<ClientId, f64>),
    RevealRequested,
    VotingReset,
    GameInfo {
        game_name: String,
        game_type: String,
    },
    UserJoined {
        client_id: ClientId,
        display_name: String,
        is_host: bool,
    },
    UserLeft {
        client_id: ClientId,
        display_name: String,
        was_host: bool,
    },
    HostChanged {
        client_id: ClientId,
        display_name: String,
    },
    RoleChanged(Role),
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    store: LocalStore,
    config: SyncConfig,
    is_host: AtomicBool,
    display_name: RwLock<String>,
    /// Highest ticket-list timestamp applied so far
    last_applied: Mutex<Option<i64>>,
    /// When a host was last heard from
    last_host_seen: Mutex<Option<i64>>,
    /// Votes of the running round, shipped in snapshots
    votes: RwLock<HashMap<ClientId, f64>>,
    events: broadcast::Sender<SyncEvent>,
    /// Pending state requests; cancelled by the first accepted update
    bootstrap: TaskSet,
    /// Receive loop and periodic timers
    timers: TaskSet,
    /// Staggered responses and re-emits
    responses: TaskSet,
}

/// Handle to one client's reconciliation engine
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(transport: Arc<dyn Transport>, store: LocalStore, config: SyncConfig) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            inner: Arc::new(EngineInner {
                transport,
                store,
                config,
                is_host: AtomicBool::new(false),
                display_name: RwLock::new(String::new()),
                last_applied: Mutex::new(None),
                last_host_seen: Mutex::new(None),
                votes: RwLock::new(HashMap::new()),
                events,
                bootstrap: TaskSet::new(),
                timers: TaskSet::new(),
                responses: TaskSet::new(),
            }),
        }
    }

    /// Connect the transport and start the protocol for our role
    pub async fn start(&self, session_id: &str, display_name: &str, role: Role) {
        let inner = &self.inner;
        inner.stop_tasks().await;
        inner.is_host.store(role.is_host(), Ordering::SeqCst);
        *inner.display_name.write().await = display_name.to_string();
        *inner.last_applied.lock().await = None;

        let mut rx = inner.transport.subscribe();
        if let Err(e) = inner
            .transport
            .connect(session_id, display_name, role.is_host())
            .await
        {
            tracing::error!("Transport failed to connect: {}", e);
        }

        let engine = inner.clone();
        inner.timers.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TransportEvent::Message(msg)) => engine.handle(msg).await,
                    Ok(TransportEvent::RoleChanged { is_host }) => {
                        engine.change_role(Role::from_host_flag(is_host)).await
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Engine lagged behind transport, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let engine = inner.clone();
        inner
            .timers
            .spawn_every(inner.config.heartbeat_interval, move || {
                let engine = engine.clone();
                async move { engine.heartbeat().await }
            });

        let engine = inner.clone();
        inner
            .timers
            .spawn_every(inner.config.connection_check_interval, move || {
                let engine = engine.clone();
                async move { engine.connection_check().await }
            });

        inner
            .send(Payload::UserJoined {
                client_id: Some(inner.client_id().to_string()),
                display_name: display_name.to_string(),
                is_host: role.is_host(),
            })
            .await;

        if role.is_host() {
            inner.respond_with_state();
        } else {
            inner.schedule_bootstrap();
        }

        tracing::info!(
            client_id = %inner.client_id(),
            session_id = %session_id,
            ?role,
            "Sync engine started"
        );
    }

    /// Cancel every timer and close the transport
    pub async fn teardown(&self) {
        self.inner.stop_tasks().await;
        self.inner.transport.disconnect().await;
        tracing::info!(client_id = %self.inner.client_id(), "Sync engine stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_host(&self) -> bool {
        self.inner.is_host()
    }

    pub fn client_id(&self) -> &str {
        self.inner.client_id()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Number of state requests still scheduled
    pub fn pending_requests(&self) -> usize {
        self.inner.bootstrap.len()
    }

    /// Store a ticket list and broadcast it.
    ///
    /// `forced` overrides every receiver's merge rule; use it for explicit imports.
    pub async fn publish_issues(&self, issues: Vec<Ticket>, forced: bool) {
        let timestamp = now_ms();
        self.inner.store.set_tickets(&issues);
        {
            let mut last = self.inner.last_applied.lock().await;
            *last = merge::advance(*last, Some(timestamp));
        }
        self.inner
            .send(Payload::UpdateIssues {
                issues,
                timestamp: Some(timestamp),
                force_update: forced,
            })
            .await;
    }

    /// Persist a selection and broadcast it
    pub async fn select_ticket(&self, ticket: Ticket) {
        self.inner.store.set_selected_ticket(&ticket);
        self.inner.send(Payload::SelectTicket { ticket }).await;
    }

    pub async fn send_vote(&self, card_value: f64) {
        let display_name = self.inner.display_name.read().await.clone();
        self.inner
            .send(Payload::Vote {
                participant_id: self.inner.client_id().to_string(),
                card_value,
                display_name,
            })
            .await;
    }

    pub async fn send_reveal(&self) {
        self.inner.send(Payload::Reveal {}).await;
    }

    pub async fn send_reset(&self) {
        self.inner.send(Payload::ResetVoting {}).await;
    }

    /// Ask every peer to resynchronise: the host re-pushes, participants re-request
    pub async fn force_sync(&self) {
        self.inner.send(Payload::ForceSync {}).await;
        if self.inner.is_host() {
            self.inner.send_current_state(true).await;
        } else {
            self.inner.request_state().await;
        }
    }

    /// Replace the vote map shipped in snapshots
    pub async fn set_votes(&self, votes: HashMap<ClientId, f64>) {
        *self.inner.votes.write().await = votes;
    }

    /// Current authoritative snapshot as this client sees it
    pub async fn snapshot(&self) -> GameState {
        self.inner.snapshot().await
    }
}

impl EngineInner {
    fn client_id(&self) -> &str {
        self.transport.client_id()
    }

    fn is_host(&self) -> bool {
        self.is_host.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn stop_tasks(&self) {
        self.bootstrap.shutdown().await;
        self.responses.shutdown().await;
        self.timers.shutdown().await;
    }

    async fn send(&self, payload: Payload) {
        let kind = payload.kind();
        if let Err(e) = self.transport.send(payload).await {
            tracing::debug!("Could not send {}: {}", kind, e);
        }
    }

    async fn snapshot(&self) -> GameState {
        GameState {
            game_name: self.store.game_name().unwrap_or_default(),
            game_type: self.store.game_type().unwrap_or_default(),
            issues: self.store.tickets(),
            selected_ticket: self.store.selected_ticket(),
            votes: self.votes.read().await.clone(),
        }
    }

    async fn send_current_state(&self, forced: bool) {
        let state = self.snapshot().await;
        let timestamp = Some(now_ms());
        let issues = state.issues.clone();
        self.send(Payload::full_state(state, timestamp, forced)).await;
        if !issues.is_empty() {
            self.send(Payload::UpdateIssues {
                issues,
                timestamp,
                force_update: forced,
            })
            .await;
        }
    }

    /// Push state at each host response delay
    fn respond_with_state(self: &Arc<Self>) {
        for delay in self.config.host_response_delays.clone() {
            let engine = self.clone();
            self.responses.spawn_after(delay, async move {
                if engine.is_host() {
                    engine.send_current_state(false).await;
                }
            });
        }
    }

    async fn request_state(&self) {
        self.send(Payload::RequestState {
            needs_full_state: true,
            requesting_client_id: Some(self.client_id().to_string()),
            current_issues_count: self.store.tickets().len(),
        })
        .await;
    }

    /// (Re)arm the participant's state requests
    fn schedule_bootstrap(self: &Arc<Self>) {
        self.bootstrap.abort_all();
        for delay in self.config.bootstrap_schedule() {
            let engine = self.clone();
            self.bootstrap.spawn_after(delay, async move {
                engine.request_state().await;
            });
        }
    }

    async fn heartbeat(&self) {
        let issues_count = self.store.tickets().len();
        let is_host = self.is_host();
        let needs_sync = !is_host && issues_count == 0;
        self.send(Payload::Heartbeat {
            is_host,
            has_issues: issues_count > 0,
            issues_count,
            needs_sync,
        })
        .await;
        if needs_sync {
            self.request_state().await;
        }
    }

    async fn connection_check(&self) {
        if self.is_host() {
            self.send_current_state(false).await;
            return;
        }

        let quiet_for = self
            .last_host_seen
            .lock()
            .await
            .map(|seen| now_ms() - seen)
            .unwrap_or(i64::MAX);
        let horizon = i64::try_from(self.config.connection_check_interval.as_millis() * 2)
            .unwrap_or(i64::MAX);
        if self.store.tickets().is_empty() || quiet_for > horizon {
            self.request_state().await;
        }
    }

    async fn change_role(self: &Arc<Self>, role: Role) {
        if self.is_host.swap(role.is_host(), Ordering::SeqCst) == role.is_host() {
            return;
        }
        self.transport.set_host(role.is_host());
        tracing::info!(client_id = %self.client_id(), ?role, "Engine role changed");
        self.emit(SyncEvent::RoleChanged(role));

        if role.is_host() {
            self.bootstrap.abort_all();
            self.respond_with_state();
        } else {
            self.schedule_bootstrap();
        }
    }

    /// Two hosts asserting at once: the smaller client id keeps the role
    async fn resolve_duplicate_host(self: &Arc<Self>, sender: &str) {
        let anchored_by_medium = self.transport.kind() == TransportKind::Storage;
        if !anchored_by_medium && self.is_host() && sender < self.client_id() {
            tracing::warn!(
                client_id = %self.client_id(),
                other = %sender,
                "Another host with a smaller id is active, stepping down"
            );
            self.change_role(Role::Participant).await;
        }
    }

    async fn handle(self: &Arc<Self>, msg: SyncMessage) {
        if msg.is_from(self.client_id()) {
            return;
        }

        if msg.sender.is_host {
            *self.last_host_seen.lock().await = Some(now_ms());
            self.resolve_duplicate_host(&msg.sender.id).await;
        }

        let is_host = self.is_host();
        match msg.payload {
            Payload::JoinRoom {
                display_name,
                is_host: joiner_is_host,
            } => {
                self.emit(SyncEvent::UserJoined {
                    client_id: msg.sender.id,
                    display_name,
                    is_host: joiner_is_host,
                });
                if is_host {
                    self.respond_with_state();
                }
            }
            Payload::UserJoined {
                client_id,
                display_name,
                is_host: joiner_is_host,
            } => {
                self.emit(SyncEvent::UserJoined {
                    client_id: client_id.unwrap_or(msg.sender.id),
                    display_name,
                    is_host: joiner_is_host,
                });
                if is_host {
                    self.respond_with_state();
                }
            }
            Payload::RequestState { .. } => {
                if is_host {
                    self.respond_with_state();
                }
            }
            Payload::ForceSync {} => {
                if is_host {
                    self.send_current_state(true).await;
                } else {
                    self.request_state().await;
                }
            }
            Payload::Heartbeat {
                is_host: from_host,
                has_issues,
                needs_sync,
                ..
            } => {
                if from_host && !is_host {
                    if has_issues && self.store.tickets().is_empty() {
                        self.request_state().await;
                    }
                } else if !from_host && is_host && needs_sync {
                    self.respond_with_state();
                }
            }
            Payload::FullState {
                game_name,
                game_type,
                issues,
                selected_ticket,
                votes,
                timestamp,
                force_update,
            } => {
                if is_host {
                    return;
                }
                if !game_name.is_empty() || !game_type.is_empty() {
                    if !game_name.is_empty() {
                        self.store.set_game_name(&game_name);
                    }
                    if !game_type.is_empty() {
                        self.store.set_game_type(&game_type);
                    }
                    self.emit(SyncEvent::GameInfo {
                        game_name,
                        game_type,
                    });
                }
                self.apply_issues(issues, timestamp, force_update).await;
                if let Some(ticket) = selected_ticket {
                    self.adopt_selection(ticket);
                }
                if !votes.is_empty() {
                    self.emit(SyncEvent::VotesRestored(votes));
                }
            }
            Payload::UpdateIssues {
                issues,
                timestamp,
                force_update,
            } => {
                if !is_host {
                    self.apply_issues(issues, timestamp, force_update).await;
                }
            }
            Payload::SelectTicket { ticket } => {
                self.store.set_selected_ticket(&ticket);
                self.emit(SyncEvent::TicketSelected(ticket));
            }
            Payload::Vote {
                participant_id,
                card_value,
                display_name,
            } => self.emit(SyncEvent::VoteReceived {
                participant_id,
                card_value,
                display_name,
            }),
            Payload::Reveal {} => self.emit(SyncEvent::RevealRequested),
            Payload::ResetVoting {} => self.emit(SyncEvent::VotingReset),
            Payload::UserLeft {
                client_id,
                was_host,
                display_name,
            } => self.emit(SyncEvent::UserLeft {
                client_id,
                display_name,
                was_host,
            }),
            Payload::NewHost {
                client_id,
                display_name,
            } => self.emit(SyncEvent::HostChanged {
                client_id,
                display_name,
            }),
            Payload::Ping {} | Payload::Pong {} => {}
        }
    }

    /// Run the merge rule on an incoming list; returns whether it was applied
    async fn apply_issues(
        self: &Arc<Self>,
        issues: Vec<Ticket>,
        timestamp: Option<i64>,
        forced: bool,
    ) -> bool {
        let local_len = self.store.tickets().len();
        let mut last = self.last_applied.lock().await;
        let decision = merge::decide(
            Incoming {
                len: issues.len(),
                forced,
                timestamp,
            },
            local_len,
            *last,
        );

        let MergeDecision::Apply(reason) = decision else {
            tracing::debug!(
                ?decision,
                incoming = issues.len(),
                local = local_len,
                "Ticket list not applied"
            );
            return false;
        };

        *last = merge::advance(*last, timestamp);
        drop(last);

        self.store.set_tickets(&issues);
        self.bootstrap.shutdown().await;
        tracing::debug!(?reason, count = issues.len(), "Applied ticket list");

        self.emit(SyncEvent::IssuesUpdated(issues.clone()));
        for delay in self.config.reemit_delays.clone() {
            let engine = self.clone();
            let issues = issues.clone();
            self.responses.spawn_after(delay, async move {
                engine.emit(SyncEvent::IssuesUpdated(issues));
            });
        }
        true
    }

    fn adopt_selection(&self, ticket: Ticket) {
        if self.store.selected_ticket().as_ref() == Some(&ticket) {
            return;
        }
        self.store.set_selected_ticket(&ticket);
        self.emit(SyncEvent::TicketSelected(ticket));
    }
}
