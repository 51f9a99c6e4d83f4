use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Every message kind the session protocol knows about.
///
/// Payloads are always objects on the wire (`data: {}` for kinds that carry
/// nothing) so peers running older builds can add fields without breaking us.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Payload {
    JoinRoom {
        #[serde(default)]
        display_name: String,
        #[serde(default)]
        is_host: bool,
    },
    UserJoined {
        #[serde(default)]
        client_id: Option<ClientId>,
        #[serde(default)]
        display_name: String,
        #[serde(default)]
        is_host: bool,
    },
    /// Sent by participants (and by the relay on their behalf) to ask the host for a snapshot
    #[serde(alias = "request_full_state")]
    RequestState {
        #[serde(default)]
        needs_full_state: bool,
        #[serde(default)]
        requesting_client_id: Option<ClientId>,
        #[serde(default)]
        current_issues_count: usize,
    },
    FullState {
        #[serde(default)]
        game_name: String,
        #[serde(default)]
        game_type: String,
        #[serde(default, deserialize_with = "deserialize_tickets")]
        issues: Vec<Ticket>,
        #[serde(default)]
        selected_ticket: Option<Ticket>,
        #[serde(default)]
        votes: HashMap<ClientId, f64>,
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        force_update: bool,
    },
    UpdateIssues {
        #[serde(default, deserialize_with = "deserialize_tickets")]
        issues: Vec<Ticket>,
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        force_update: bool,
    },
    SelectTicket {
        ticket: Ticket,
    },
    Vote {
        participant_id: ClientId,
        card_value: f64,
        #[serde(default)]
        display_name: String,
    },
    Reveal {},
    ResetVoting {},
    ForceSync {},
    Heartbeat {
        #[serde(default)]
        is_host: bool,
        #[serde(default)]
        has_issues: bool,
        #[serde(default)]
        issues_count: usize,
        #[serde(default)]
        needs_sync: bool,
    },
    Ping {},
    Pong {},
    /// Relay-only: a member left the room
    UserLeft {
        client_id: ClientId,
        #[serde(default)]
        was_host: bool,
        #[serde(default)]
        display_name: String,
    },
    /// Relay-only: the room promoted a new host after the previous one left
    NewHost {
        client_id: ClientId,
        #[serde(default)]
        display_name: String,
    },
}

impl Payload {
    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::JoinRoom { .. } => "join_room",
            Payload::UserJoined { .. } => "user_joined",
            Payload::RequestState { .. } => "request_state",
            Payload::FullState { .. } => "full_state",
            Payload::UpdateIssues { .. } => "update_issues",
            Payload::SelectTicket { .. } => "select_ticket",
            Payload::Vote { .. } => "vote",
            Payload::Reveal {} => "reveal",
            Payload::ResetVoting {} => "reset_voting",
            Payload::ForceSync {} => "force_sync",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::Ping {} => "ping",
            Payload::Pong {} => "pong",
            Payload::UserLeft { .. } => "user_left",
            Payload::NewHost { .. } => "new_host",
        }
    }

    /// Kinds that carry ticket state and are worth sending redundantly
    pub fn is_high_value(&self) -> bool {
        matches!(
            self,
            Payload::UpdateIssues { .. } | Payload::FullState { .. } | Payload::RequestState { .. }
        )
    }

    /// Build a `full_state` payload from a snapshot
    pub fn full_state(state: GameState, timestamp: Option<i64>, force_update: bool) -> Self {
        Payload::FullState {
            game_name: state.game_name,
            game_type: state.game_type,
            issues: state.issues,
            selected_ticket: state.selected_ticket,
            votes: state.votes,
            timestamp,
            force_update,
        }
    }

    /// Rebuild a payload from a wire `type` and its `data` object
    pub fn from_parts(kind: &str, data: Value) -> Result<Self, serde_json::Error> {
        let data = if data.is_null() {
            Value::Object(Default::default())
        } else {
            data
        };
        serde_json::from_value(serde_json::json!({ "type": kind, "data": data }))
    }

    /// Split a payload into its wire `type` and `data` object
    pub fn into_parts(self) -> (String, Value) {
        let kind = self.kind().to_string();
        let data = match serde_json::to_value(&self) {
            Ok(Value::Object(mut map)) => map.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        (kind, data)
    }
}

/// Who sent a message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub id: ClientId,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

/// Broadcast envelope: `{ type, data, timestamp, sender }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct SyncMessage {
    pub payload: Payload,
    pub timestamp: i64,
    pub sender: Sender,
}

impl SyncMessage {
    pub fn new(payload: Payload, sender: Sender) -> Self {
        Self {
            payload,
            timestamp: crate::clock::now_ms(),
            sender,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Whether this message came from the given client (and must not be applied by it)
    pub fn is_from(&self, client_id: &str) -> bool {
        self.sender.id == client_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: i64,
    sender: Sender,
}

impl TryFrom<WireMessage> for SyncMessage {
    type Error = serde_json::Error;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            payload: Payload::from_parts(&wire.kind, wire.data)?,
            timestamp: wire.timestamp,
            sender: wire.sender,
        })
    }
}

impl From<SyncMessage> for WireMessage {
    fn from(msg: SyncMessage) -> Self {
        let (kind, data) = msg.payload.into_parts();
        Self {
            kind,
            data,
            timestamp: msg.timestamp,
            sender: msg.sender,
        }
    }
}

// ========== Relay wire format ==========

/// Sender id the relay stamps on messages it originates
pub const SERVER_SENDER_ID: &str = "server";

/// Message kinds only the relay server emits
pub mod relay_kind {
    pub const WELCOME: &str = "welcome";
    pub const ROOM_JOINED: &str = "room_joined";
    pub const USER_JOINED: &str = "user_joined";
    pub const USER_LEFT: &str = "user_left";
    pub const NEW_HOST: &str = "new_host";
    pub const PROMOTED_TO_HOST: &str = "promoted_to_host";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const JOIN_ROOM: &str = "join_room";
    pub const REQUEST_STATE: &str = "request_state";
    pub const FULL_STATE: &str = "full_state";
    pub const UPDATE_ISSUES: &str = "update_issues";
    pub const SELECT_TICKET: &str = "select_ticket";
}

/// Relay envelope: `{ type, roomId, data, senderId, senderName, isHost, timestamp }`.
///
/// `data` stays untyped here because the relay forwards kinds it does not know verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub timestamp: i64,
}

impl RelayEnvelope {
    /// Envelope originated by the relay itself
    pub fn from_server(kind: &str, room_id: Option<&str>, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            room_id: room_id.map(str::to_string),
            data,
            sender_id: SERVER_SENDER_ID.to_string(),
            sender_name: String::new(),
            is_host: false,
            timestamp: crate::clock::now_ms(),
        }
    }

    /// Wrap an application message for the relay
    pub fn from_sync(msg: SyncMessage, room_id: &str, sender_name: &str) -> Self {
        let (kind, data) = msg.payload.into_parts();
        Self {
            kind,
            room_id: Some(room_id.to_string()),
            data,
            sender_id: msg.sender.id,
            sender_name: sender_name.to_string(),
            is_host: msg.sender.is_host,
            timestamp: msg.timestamp,
        }
    }

    /// Unwrap into an application message; `None` for kinds outside the taxonomy
    pub fn into_sync(self) -> Option<SyncMessage> {
        let payload = match Payload::from_parts(&self.kind, self.data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("Dropping relay message of type {}: {}", self.kind, e);
                return None;
            }
        };
        Some(SyncMessage {
            payload,
            timestamp: self.timestamp,
            sender: Sender {
                id: self.sender_id,
                is_host: self.is_host,
                session_id: self.room_id,
            },
        })
    }

    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!("Failed to serialize relay message: {}", e);
                None
            }
        }
    }
}

/// Member entry listed in `room_joined`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomClient {
    pub client_id: ClientId,
    pub display_name: String,
    pub is_host: bool,
}
