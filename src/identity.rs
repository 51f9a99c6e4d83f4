//! Session identity: who we are, which session we belong to, and whether we host it.

use crate::error::InviteError;
use crate::store::LocalStore;
use crate::types::*;

/// Route invitations point at
pub const GAME_PATH: &str = "/main-game";

/// Mint a new opaque id (time-ordered prefix, random suffix)
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Session identity backed by the local store.
///
/// Role is not persisted: a client is host of whatever session it holds until
/// it enters one through an invitation.
#[derive(Clone)]
pub struct SessionIdentity {
    store: LocalStore,
    session_id: SessionId,
    client_id: ClientId,
    role: Role,
}

impl SessionIdentity {
    /// Load the stored identity, minting ids where none are stored.
    ///
    /// An unavailable store yields a synthesized host identity rather than an error.
    pub fn load(store: LocalStore) -> Self {
        if !store.is_available() {
            tracing::warn!("Identity store unavailable, continuing as host with a fresh id");
            return Self {
                store,
                session_id: new_id(),
                client_id: new_id(),
                role: Role::Host,
            };
        }

        let client_id = store.client_id().unwrap_or_else(|| {
            let id = new_id();
            store.set_client_id(&id);
            id
        });
        let session_id = store.session_id().unwrap_or_else(|| {
            let id = new_id();
            store.set_session_id(&id);
            id
        });

        Self {
            store,
            session_id,
            client_id,
            role: Role::Host,
        }
    }

    /// Start a new session hosted by this client
    pub fn create_session(&mut self) -> SessionId {
        self.session_id = new_id();
        self.store.set_session_id(&self.session_id);
        self.role = Role::Host;
        tracing::info!(session_id = %self.session_id, "Created session");
        self.session_id.clone()
    }

    /// Adopt a foreign session id as a participant.
    ///
    /// Local tickets belong to the previous session and are dropped.
    pub fn join_session(
        &mut self,
        session_id: &str,
        game_name: Option<&str>,
        game_type: Option<&str>,
    ) {
        self.session_id = session_id.to_string();
        self.role = Role::Participant;
        self.store.set_session_id(session_id);
        self.store.clear_tickets();
        if let Some(name) = game_name {
            self.store.set_game_name(name);
        }
        if let Some(game_type) = game_type {
            self.store.set_game_type(game_type);
        }
        tracing::info!(session_id = %self.session_id, "Joined session as participant");
    }

    /// Discard identity and session data, then start over as host of a fresh session
    pub fn reset_session(&mut self) -> SessionId {
        self.store.clear_session_data();
        self.client_id = new_id();
        self.store.set_client_id(&self.client_id);
        self.create_session()
    }

    /// Follow a role change decided by the transport (election or relay promotion)
    pub fn set_role(&mut self, role: Role) {
        if self.role != role {
            tracing::info!(?role, "Role changed");
            self.role = role;
        }
    }

    pub fn is_host(&self) -> bool {
        self.role.is_host()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Stored display name, or a generated one which is then stored
    pub fn display_name(&self) -> String {
        if let Some(name) = self.store.display_name() {
            return name;
        }
        let name = petname::petname(2, " ").unwrap_or_else(|| "Guest".to_string());
        self.store.set_display_name(&name);
        name
    }

    /// Act on an invitation, if any. Returns true when it made us join a session.
    pub fn enter(&mut self, invitation: Option<&Invitation>) -> bool {
        match entry_for(self, invitation) {
            Entry::Join => {
                if let Some(invite) = invitation {
                    self.join_session(
                        &invite.session,
                        invite.game.as_deref(),
                        invite.game_type.as_deref(),
                    );
                }
                true
            }
            Entry::Keep => false,
        }
    }
}

/// Invitation carried in a link's query string
#[derive(Debug, Clone, PartialEq)]
pub struct Invitation {
    pub session: SessionId,
    pub game: Option<String>,
    pub game_type: Option<String>,
}

impl Invitation {
    pub fn for_identity(identity: &SessionIdentity, game: Option<String>, game_type: Option<String>) -> Self {
        Self {
            session: identity.session_id().to_string(),
            game,
            game_type,
        }
    }

    /// Link to the game page carrying this invitation
    pub fn to_url(&self, base: &str) -> String {
        let mut url = format!(
            "{}{}?session={}",
            base.trim_end_matches('/'),
            GAME_PATH,
            urlencoding::encode(&self.session)
        );
        if let Some(game) = &self.game {
            url.push_str(&format!("&game={}", urlencoding::encode(game)));
        }
        if let Some(game_type) = &self.game_type {
            url.push_str(&format!("&type={}", urlencoding::encode(game_type)));
        }
        url
    }

    /// Read an invitation from a full link or a bare query string
    pub fn parse(url: &str) -> Result<Self, InviteError> {
        let query = match url.split_once('?') {
            Some((_, query)) => query,
            None => url,
        };
        let query = query.split('#').next().unwrap_or_default();

        let mut session = None;
        let mut game = None;
        let mut game_type = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, raw) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(&raw.replace('+', " "))
                .map_err(|_| InviteError::BadEncoding(name.to_string()))?
                .into_owned();
            match name {
                "session" => session = Some(value),
                "game" => game = Some(value),
                "type" => game_type = Some(value),
                _ => {}
            }
        }

        let session = session
            .filter(|s| !s.trim().is_empty())
            .ok_or(InviteError::MissingSession)?;
        Ok(Self {
            session,
            game: game.filter(|g| !g.is_empty()),
            game_type: game_type.filter(|t| !t.is_empty()),
        })
    }
}

/// What opening the game page should do with the current identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Keep the current identity and role
    Keep,
    /// Join the invited session as participant
    Join,
}

/// A differing session joins it; the same session joins too unless we already host it.
pub fn entry_for(identity: &SessionIdentity, invitation: Option<&Invitation>) -> Entry {
    match invitation {
        Some(invite) if invite.session != identity.session_id() || !identity.is_host() => {
            Entry::Join
        }
        _ => Entry::Keep,
    }
}
