//! One client's view of an estimation session.
//!
//! `Session` wires identity, the durable store, the sync engine and the voting
//! round together. It is built explicitly and torn down explicitly.

use crate::config::SyncConfig;
use crate::engine::schedule::TaskSet;
use crate::engine::{SyncEngine, SyncEvent};
use crate::error::RoundError;
use crate::identity::{Invitation, SessionIdentity};
use crate::round::{RoundPhase, RoundResult, VotingRound};
use crate::store::LocalStore;
use crate::transport::SharedMedia;
use crate::types::*;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

/// What a session reports to its UI
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Sync(SyncEvent),
    Countdown { remaining: u32 },
    Revealed { average: Option<f64> },
    RoundFinished(RoundResult),
}

struct SessionInner {
    config: SyncConfig,
    store: LocalStore,
    media: SharedMedia,
    identity: RwLock<SessionIdentity>,
    engine: RwLock<SyncEngine>,
    round: Mutex<VotingRound>,
    events: broadcast::Sender<SessionEvent>,
    /// Engine event pump
    pump: TaskSet,
    countdown: TaskSet,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(config: SyncConfig, store: LocalStore, media: SharedMedia) -> Self {
        let identity = SessionIdentity::load(store.clone());
        let engine = build_engine(&config, &store, &media, identity.client_id());
        let round = VotingRound::new(
            identity.client_id(),
            VotingScale::from_game_type(&store.game_type().unwrap_or_default()),
        );
        let (events, _rx) = broadcast::channel(256);

        Self {
            inner: Arc::new(SessionInner {
                config,
                store,
                media,
                identity: RwLock::new(identity),
                engine: RwLock::new(engine),
                round: Mutex::new(round),
                events,
                pump: TaskSet::new(),
                countdown: TaskSet::new(),
            }),
        }
    }

    /// Host a brand new session
    pub async fn create(&self, game_name: &str, game_type: &str) -> SessionId {
        let session_id = self.inner.identity.write().await.create_session();
        self.inner.store.set_game_name(game_name);
        self.inner.store.set_game_type(game_type);
        self.inner.store.clear_tickets();
        self.inner.start().await;
        session_id
    }

    /// Open the game page, joining the invited session when the invitation asks for it
    pub async fn open(&self, invitation: Option<&Invitation>) {
        self.inner.identity.write().await.enter(invitation);
        self.inner.start().await;
    }

    /// Join a session as participant
    pub async fn join(&self, invitation: &Invitation) {
        self.inner.identity.write().await.join_session(
            &invitation.session,
            invitation.game.as_deref(),
            invitation.game_type.as_deref(),
        );
        self.inner.start().await;
    }

    /// Invitation for the current session
    pub async fn invitation(&self) -> Invitation {
        Invitation::for_identity(
            &*self.inner.identity.read().await,
            self.inner.store.game_name(),
            self.inner.store.game_type(),
        )
    }

    /// Replace the ticket list with an imported one and push it to everyone
    pub async fn import_tickets(&self, tickets: Vec<Ticket>) {
        self.inner.engine().await.publish_issues(tickets, true).await;
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.inner.store.tickets()
    }

    /// Start a round on a ticket from the current list
    pub async fn select_ticket(&self, key: &str) -> Result<(), RoundError> {
        let ticket = self
            .tickets()
            .into_iter()
            .find(|t| t.key == key)
            .ok_or_else(|| RoundError::UnknownTicket(key.to_string()))?;

        self.inner.countdown.abort_all();
        self.inner.round.lock().await.select(ticket.clone());
        let engine = self.inner.engine().await;
        engine.select_ticket(ticket).await;
        engine.set_votes(Default::default()).await;
        Ok(())
    }

    pub async fn vote(&self, card_value: f64) -> Result<(), RoundError> {
        let votes = {
            let mut round = self.inner.round.lock().await;
            round.cast_vote(card_value)?;
            round.votes().clone()
        };
        let engine = self.inner.engine().await;
        engine.set_votes(votes).await;
        engine.send_vote(card_value).await;
        Ok(())
    }

    /// Close voting and reveal after the countdown, for everyone
    pub async fn start_countdown(&self) -> Result<(), RoundError> {
        self.inner.begin_countdown().await?;
        self.inner.engine().await.send_reveal().await;
        Ok(())
    }

    /// Clear votes for everyone, keeping the selected ticket
    pub async fn reset_voting(&self) {
        self.inner.countdown.abort_all();
        self.inner.round.lock().await.reset();
        let engine = self.inner.engine().await;
        engine.set_votes(Default::default()).await;
        engine.send_reset().await;
    }

    /// Ask every peer to resynchronise
    pub async fn force_sync(&self) {
        self.inner.engine().await.force_sync().await;
    }

    pub async fn phase(&self) -> RoundPhase {
        self.inner.round.lock().await.phase()
    }

    pub async fn round(&self) -> VotingRound {
        self.inner.round.lock().await.clone()
    }

    pub async fn is_host(&self) -> bool {
        self.inner.identity.read().await.is_host()
    }

    pub async fn session_id(&self) -> SessionId {
        self.inner.identity.read().await.session_id().to_string()
    }

    pub async fn client_id(&self) -> ClientId {
        self.inner.identity.read().await.client_id().to_string()
    }

    pub async fn display_name(&self) -> String {
        self.inner.identity.read().await.display_name()
    }

    pub fn set_display_name(&self, name: &str) {
        self.inner.store.set_display_name(name);
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub async fn engine(&self) -> SyncEngine {
        self.inner.engine().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Leave the session and start over with fresh ids as host of a new one
    pub async fn logout(&self) -> SessionId {
        self.teardown().await;
        let mut identity = self.inner.identity.write().await;
        let session_id = identity.reset_session();
        *self.inner.engine.write().await = build_engine(
            &self.inner.config,
            &self.inner.store,
            &self.inner.media,
            identity.client_id(),
        );
        *self.inner.round.lock().await = VotingRound::new(identity.client_id(), VotingScale::Unrestricted);
        tracing::info!(session_id = %session_id, "Logged out");
        session_id
    }

    /// Cancel every pending task and close the transport
    pub async fn teardown(&self) {
        self.inner.countdown.shutdown().await;
        self.inner.pump.shutdown().await;
        self.inner.engine().await.teardown().await;
    }
}

fn build_engine(
    config: &SyncConfig,
    store: &LocalStore,
    media: &SharedMedia,
    client_id: &str,
) -> SyncEngine {
    let transport = media.transport(config, client_id);
    SyncEngine::new(transport, store.clone(), config.clone())
}

impl SessionInner {
    async fn engine(&self) -> SyncEngine {
        self.engine.read().await.clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// (Re)start the engine for the current identity and pump its events
    async fn start(self: &Arc<Self>) {
        self.countdown.shutdown().await;
        self.pump.shutdown().await;

        let (session_id, role, display_name, client_id) = {
            let identity = self.identity.read().await;
            (
                identity.session_id().to_string(),
                identity.role(),
                identity.display_name(),
                identity.client_id().to_string(),
            )
        };

        {
            let mut round = VotingRound::new(
                &client_id,
                VotingScale::from_game_type(&self.store.game_type().unwrap_or_default()),
            );
            if let Some(ticket) = self.store.selected_ticket() {
                round.select(ticket);
            }
            *self.round.lock().await = round;
        }

        let engine = self.engine().await;
        let mut rx = engine.subscribe();
        let session = self.clone();
        self.pump.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => session.on_sync_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Session lagged behind engine, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        engine.start(&session_id, &display_name, role).await;
    }

    async fn on_sync_event(self: &Arc<Self>, event: SyncEvent) {
        match &event {
            SyncEvent::TicketSelected(ticket) => {
                self.countdown.abort_all();
                self.round.lock().await.select(ticket.clone());
            }
            SyncEvent::VoteReceived {
                participant_id,
                card_value,
                ..
            } => {
                let votes = {
                    let mut round = self.round.lock().await;
                    round.record_remote_vote(participant_id, *card_value);
                    round.votes().clone()
                };
                self.engine().await.set_votes(votes).await;
            }
            SyncEvent::VotesRestored(votes) => {
                self.round.lock().await.restore_votes(votes);
            }
            SyncEvent::RevealRequested => {
                if let Err(e) = self.begin_countdown().await {
                    tracing::debug!("Ignoring remote reveal: {}", e);
                }
            }
            SyncEvent::VotingReset => {
                self.countdown.abort_all();
                self.round.lock().await.reset();
                self.engine().await.set_votes(Default::default()).await;
            }
            SyncEvent::GameInfo { game_type, .. } => {
                self.round
                    .lock()
                    .await
                    .set_scale(VotingScale::from_game_type(game_type));
            }
            SyncEvent::RoleChanged(role) => {
                self.identity.write().await.set_role(*role);
            }
            _ => {}
        }
        self.emit(SessionEvent::Sync(event));
    }

    /// Validate and start the local countdown; ticks run as a background task
    async fn begin_countdown(self: &Arc<Self>) -> Result<(), RoundError> {
        self.round
            .lock()
            .await
            .start_countdown(self.config.countdown_ticks)?;

        let session = self.clone();
        let tick = self.config.countdown_tick;
        self.countdown.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
            loop {
                let revealed = {
                    let round = session.round.lock().await;
                    round.phase() == RoundPhase::Revealed
                };
                if revealed {
                    session.finish_countdown().await;
                    return;
                }
                interval.tick().await;
                let remaining = session.round.lock().await.tick();
                match remaining {
                    Some(remaining) => session.emit(SessionEvent::Countdown { remaining }),
                    None => return,
                }
            }
        });
        Ok(())
    }

    /// Write the average to the ticket, persist and re-broadcast the list, back to idle
    async fn finish_countdown(&self) {
        let (average, result) = {
            let mut round = self.round.lock().await;
            (round.average(), round.finish())
        };
        self.emit(SessionEvent::Revealed { average });
        let Some(result) = result else {
            return;
        };

        if let Some(points) = result.average {
            if !self.store.update_ticket_story_point(&result.ticket.key, points) {
                tracing::warn!(key = %result.ticket.key, "Estimated ticket is no longer in the list");
            }
        }
        self.store.clear_selected_ticket();

        let engine = self.engine().await;
        engine.set_votes(Default::default()).await;
        engine.publish_issues(self.store.tickets(), false).await;

        tracing::info!(
            key = %result.ticket.key,
            average = ?result.average,
            "Round finished"
        );
        self.emit(SessionEvent::RoundFinished(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session() -> Session {
        Session::new(SyncConfig::default(), LocalStore::in_memory(), SharedMedia::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_needs_ticket() {
        let session = session();
        session.create("Sprint", "Fibonacci").await;

        assert_eq!(
            session.start_countdown().await,
            Err(RoundError::NoTicketSelected)
        );
        assert_eq!(session.phase().await, RoundPhase::Idle);
        session.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_unknown_ticket() {
        let session = session();
        session.create("Sprint", "Fibonacci").await;

        assert_eq!(
            session.select_ticket("NOPE-1").await,
            Err(RoundError::UnknownTicket("NOPE-1".to_string()))
        );
        session.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_solo_round_writes_story_point() {
        let session = session();
        session.create("Sprint", "Fibonacci").await;
        session
            .import_tickets(vec![Ticket::new("PP-1", "Login"), Ticket::new("PP-2", "Logout")])
            .await;

        session.select_ticket("PP-1").await.unwrap();
        session.vote(8.0).await.unwrap();
        session.start_countdown().await.unwrap();
        assert_eq!(session.vote(3.0).await, Err(RoundError::CountdownInProgress));

        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(session.phase().await, RoundPhase::Idle);
        assert_eq!(session.tickets()[0].story_point, Some(8.0));
        assert!(session.round().await.votes().is_empty());
        assert_eq!(session.store().selected_ticket(), None);
        session.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_mints_new_identity() {
        let session = session();
        let first = session.create("Sprint", "Fibonacci").await;
        let client = session.client_id().await;

        let second = session.logout().await;
        assert_ne!(first, second);
        assert_ne!(client, session.client_id().await);
        assert!(session.is_host().await);
    }
}
