use super::KeyValueStore;
use crate::types::*;
use std::sync::Arc;

/// Logical keys in the durable store
pub mod keys {
    pub const DISPLAY_NAME: &str = "displayName";
    pub const TICKETS: &str = "jiraTickets";
    pub const SELECTED_TICKET: &str = "selectedTicket";
    pub const SESSION_ID: &str = "sessionId";
    pub const CLIENT_ID: &str = "clientId";
    pub const SYNC_VERSION: &str = "syncVersion";
    pub const GAME_NAME: &str = "gameName";
    pub const GAME_TYPE: &str = "gameType";
}

/// Typed view over a `KeyValueStore`.
///
/// Nothing here fails past this boundary: read errors and corrupt entries are
/// logged, the entry is cleared and an empty value is returned.
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn KeyValueStore>,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Store backed by process memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(super::MemoryStore::new()))
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to read {} from store: {}", key, e);
                self.discard(key);
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str) {
        if let Err(e) = self.backend.set(key, value) {
            tracing::warn!("Failed to write {} to store: {}", key, e);
        }
    }

    fn discard(&self, key: &str) {
        if let Err(e) = self.backend.remove(key) {
            tracing::warn!("Failed to clear {} from store: {}", key, e);
        }
    }

    fn read_json(&self, key: &str) -> Option<serde_json::Value> {
        let raw = self.read(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Clearing corrupt {} entry: {}", key, e);
                self.discard(key);
                None
            }
        }
    }

    fn write_json<T: serde::Serialize + ?Sized>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => self.write(key, &json),
            Err(e) => tracing::error!("Failed to serialize {}: {}", key, e),
        }
    }

    fn read_text(&self, key: &str) -> Option<String> {
        self.read(key).filter(|s| !s.trim().is_empty())
    }

    // ========== Tickets ==========

    pub fn tickets(&self) -> Vec<Ticket> {
        match self.read_json(keys::TICKETS) {
            Some(value @ serde_json::Value::Array(_)) => Ticket::coerce_list(&value),
            Some(_) => {
                tracing::warn!("Stored ticket list is not an array, clearing it");
                self.discard(keys::TICKETS);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Replace the ticket list and bump the sync version. Returns the new version.
    pub fn set_tickets(&self, tickets: &[Ticket]) -> u64 {
        let normalized: Vec<Ticket> = tickets.iter().cloned().map(normalize).collect();
        self.write_json(keys::TICKETS, &normalized);
        self.increment_sync_version()
    }

    /// Set the story point of one ticket in the stored list.
    ///
    /// Returns false when the key is not in the list.
    pub fn update_ticket_story_point(&self, key: &str, points: f64) -> bool {
        let mut tickets = self.tickets();
        let Some(ticket) = tickets.iter_mut().find(|t| t.key == key) else {
            return false;
        };
        ticket.story_point = Some(points);
        self.set_tickets(&tickets);
        true
    }

    pub fn selected_ticket(&self) -> Option<Ticket> {
        let value = self.read_json(keys::SELECTED_TICKET)?;
        if value.is_null() {
            return None;
        }
        let ticket = Ticket::coerce(&value);
        if ticket.is_none() {
            tracing::warn!("Stored selected ticket is not an object, clearing it");
            self.discard(keys::SELECTED_TICKET);
        }
        ticket
    }

    pub fn set_selected_ticket(&self, ticket: &Ticket) {
        self.write_json(keys::SELECTED_TICKET, &normalize(ticket.clone()));
    }

    pub fn clear_selected_ticket(&self) {
        self.discard(keys::SELECTED_TICKET);
    }

    // ========== Sync version ==========

    pub fn sync_version(&self) -> u64 {
        self.read(keys::SYNC_VERSION)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn increment_sync_version(&self) -> u64 {
        let next = self.sync_version() + 1;
        self.write(keys::SYNC_VERSION, &next.to_string());
        next
    }

    // ========== Profile and game metadata ==========

    pub fn display_name(&self) -> Option<String> {
        self.read_text(keys::DISPLAY_NAME)
    }

    pub fn set_display_name(&self, name: &str) {
        self.write(keys::DISPLAY_NAME, name.trim());
    }

    pub fn game_name(&self) -> Option<String> {
        self.read_text(keys::GAME_NAME)
    }

    pub fn set_game_name(&self, name: &str) {
        self.write(keys::GAME_NAME, name);
    }

    pub fn game_type(&self) -> Option<String> {
        self.read_text(keys::GAME_TYPE)
    }

    pub fn set_game_type(&self, game_type: &str) {
        self.write(keys::GAME_TYPE, game_type);
    }

    // ========== Identity slots ==========

    pub fn session_id(&self) -> Option<SessionId> {
        self.read_text(keys::SESSION_ID)
    }

    pub fn set_session_id(&self, id: &str) {
        self.write(keys::SESSION_ID, id);
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.read_text(keys::CLIENT_ID)
    }

    pub fn set_client_id(&self, id: &str) {
        self.write(keys::CLIENT_ID, id);
    }

    /// Whether the backend currently accepts reads
    pub fn is_available(&self) -> bool {
        self.backend.get(keys::SESSION_ID).is_ok()
    }

    /// Drop ticket state ahead of joining another session
    pub fn clear_tickets(&self) {
        self.discard(keys::TICKETS);
        self.discard(keys::SELECTED_TICKET);
    }

    /// Drop everything scoped to the current session, keeping the display name
    pub fn clear_session_data(&self) {
        for key in [
            keys::TICKETS,
            keys::SELECTED_TICKET,
            keys::SESSION_ID,
            keys::CLIENT_ID,
            keys::SYNC_VERSION,
            keys::GAME_NAME,
            keys::GAME_TYPE,
        ] {
            self.discard(key);
        }
    }

    /// Remove every key
    pub fn clear(&self) {
        if let Err(e) = self.backend.clear() {
            tracing::warn!("Failed to clear store: {}", e);
        }
    }
}

fn normalize(mut ticket: Ticket) -> Ticket {
    if ticket.status.trim().is_empty() {
        ticket.status = DEFAULT_TICKET_STATUS.to_string();
    }
    ticket
}
