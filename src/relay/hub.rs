//! Room membership, the per-room state copy, and message routing for the relay.

use crate::protocol::{relay_kind, RelayEnvelope, RoomClient};
use crate::types::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

/// Server-assigned connection id
pub type ConnId = String;

/// What the socket task should do next
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Envelope(RelayEnvelope),
    /// Close the socket without waiting for the peer
    Terminate,
}

struct Connection {
    outbox: mpsc::UnboundedSender<Outbound>,
    room: Option<RoomId>,
    alive: bool,
}

#[derive(Debug, Clone)]
struct Member {
    conn_id: ConnId,
    display_name: String,
    is_host: bool,
    /// Join order; the smallest remaining one is promoted when the host leaves
    seq: u64,
}

/// Last known state fields, replayed to joiners and requesters
#[derive(Debug, Clone, Default)]
struct RoomCopy {
    issues: Option<Value>,
    selected_ticket: Option<Value>,
    game_name: Option<Value>,
    game_type: Option<Value>,
    timestamp: Option<i64>,
}

impl RoomCopy {
    fn to_full_state(&self) -> Value {
        let mut data = serde_json::Map::new();
        let fields = [
            ("issues", &self.issues),
            ("selectedTicket", &self.selected_ticket),
            ("gameName", &self.game_name),
            ("gameType", &self.game_type),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                data.insert(name.to_string(), value.clone());
            }
        }
        if let Some(ts) = self.timestamp {
            data.insert("timestamp".to_string(), json!(ts));
        }
        Value::Object(data)
    }

    /// Absorb whatever state fields a relayed message carries
    fn absorb(&mut self, kind: &str, data: &Value) {
        let field = |name: &str| data.get(name).filter(|v| !v.is_null()).cloned();
        match kind {
            relay_kind::UPDATE_ISSUES => {
                if let Some(issues) = field("issues") {
                    self.issues = Some(issues);
                    self.timestamp = data.get("timestamp").and_then(Value::as_i64);
                }
            }
            relay_kind::SELECT_TICKET => {
                if let Some(ticket) = field("ticket") {
                    self.selected_ticket = Some(ticket);
                }
            }
            relay_kind::FULL_STATE => {
                if let Some(issues) = field("issues") {
                    self.issues = Some(issues);
                    self.timestamp = data.get("timestamp").and_then(Value::as_i64);
                }
                if let Some(ticket) = field("selectedTicket") {
                    self.selected_ticket = Some(ticket);
                }
                if let Some(name) = field("gameName") {
                    self.game_name = Some(name);
                }
                if let Some(game_type) = field("gameType") {
                    self.game_type = Some(game_type);
                }
            }
            _ => {}
        }
    }
}

struct Room {
    members: Vec<Member>,
    copy: RoomCopy,
    last_activity: Instant,
}

impl Room {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            copy: RoomCopy::default(),
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn hosts(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.is_host)
    }

    fn clients_except(&self, conn_id: &str) -> Vec<RoomClient> {
        self.members
            .iter()
            .filter(|m| m.conn_id != conn_id)
            .map(|m| RoomClient {
                client_id: m.conn_id.clone(),
                display_name: m.display_name.clone(),
                is_host: m.is_host,
            })
            .collect()
    }
}

/// Shared relay state: live connections and the rooms they joined
#[derive(Default)]
pub struct RelayHub {
    connections: RwLock<HashMap<ConnId, Connection>>,
    rooms: RwLock<HashMap<RoomId, Room>>,
    join_seq: AtomicU64,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh socket and greet it with its connection id
    pub async fn register(&self) -> (ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let conn_id = crate::identity::new_id();
        let (outbox, rx) = mpsc::unbounded_channel();
        let welcome = RelayEnvelope::from_server(
            relay_kind::WELCOME,
            None,
            json!({ "clientId": conn_id, "timestamp": crate::clock::now_ms() }),
        );
        let _ = outbox.send(Outbound::Envelope(welcome));

        self.connections.write().await.insert(
            conn_id.clone(),
            Connection {
                outbox,
                room: None,
                alive: true,
            },
        );
        tracing::info!(conn_id = %conn_id, "Relay client connected");
        (conn_id, rx)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Connection ids in a room, in join order
    pub async fn members(&self, room_id: &str) -> Vec<RoomClient> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|room| room.clients_except(""))
            .unwrap_or_default()
    }

    pub async fn mark_alive(&self, conn_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(conn_id) {
            conn.alive = true;
        }
    }

    async fn send_to(&self, conn_id: &str, envelope: RelayEnvelope) {
        if let Some(conn) = self.connections.read().await.get(conn_id) {
            let _ = conn.outbox.send(Outbound::Envelope(envelope));
        }
    }

    async fn send_many(&self, conn_ids: &[ConnId], envelope: &RelayEnvelope) {
        let connections = self.connections.read().await;
        for id in conn_ids {
            if let Some(conn) = connections.get(id) {
                let _ = conn.outbox.send(Outbound::Envelope(envelope.clone()));
            }
        }
    }

    /// Route one text frame from a connection
    pub async fn handle_text(&self, conn_id: &str, text: &str) {
        self.mark_alive(conn_id).await;

        let envelope: RelayEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "Dropping unparseable relay frame: {}", e);
                return;
            }
        };

        match envelope.kind.as_str() {
            relay_kind::PING => {
                let pong = RelayEnvelope::from_server(relay_kind::PONG, envelope.room_id.as_deref(), json!({}));
                self.send_to(conn_id, pong).await;
                return;
            }
            // Answer to our liveness ping; already counted above
            relay_kind::PONG => return,
            _ => {}
        }

        let Some(room_id) = envelope.room_id.clone() else {
            tracing::debug!(conn_id = %conn_id, kind = %envelope.kind, "Dropping message without room");
            return;
        };

        match envelope.kind.as_str() {
            relay_kind::JOIN_ROOM => self.join(conn_id, &room_id, &envelope).await,
            relay_kind::REQUEST_STATE => self.request_state(conn_id, &room_id, &envelope).await,
            _ => self.relay(conn_id, &room_id, envelope).await,
        }
    }

    async fn join(&self, conn_id: &str, room_id: &str, envelope: &RelayEnvelope) {
        let previous = self
            .connections
            .read()
            .await
            .get(conn_id)
            .and_then(|c| c.room.clone());
        if let Some(previous) = previous {
            if previous != room_id {
                self.leave_room(conn_id, &previous).await;
            } else {
                return;
            }
        }

        let display_name = envelope
            .data
            .get("displayName")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .unwrap_or(&envelope.sender_name)
            .to_string();
        let asserts_host = envelope
            .data
            .get("isHost")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || envelope.is_host;

        let (is_host, others, copy) = {
            let mut rooms = self.rooms.write().await;
            let room = rooms.entry(room_id.to_string()).or_insert_with(Room::new);
            let is_host = asserts_host || room.members.is_empty();
            room.members.push(Member {
                conn_id: conn_id.to_string(),
                display_name: display_name.clone(),
                is_host,
                seq: self.join_seq.fetch_add(1, Ordering::SeqCst),
            });
            room.touch();
            (is_host, room.clients_except(conn_id), room.copy.to_full_state())
        };

        if let Some(conn) = self.connections.write().await.get_mut(conn_id) {
            conn.room = Some(room_id.to_string());
        }

        tracing::info!(
            conn_id = %conn_id,
            room_id = %room_id,
            is_host,
            members = others.len() + 1,
            "Joined room"
        );

        let others_ids: Vec<ConnId> = others.iter().map(|c| c.client_id.clone()).collect();
        let joined = RelayEnvelope::from_server(
            relay_kind::USER_JOINED,
            Some(room_id),
            json!({ "clientId": conn_id, "displayName": display_name, "isHost": is_host }),
        );
        self.send_many(&others_ids, &joined).await;

        let room_joined = RelayEnvelope::from_server(
            relay_kind::ROOM_JOINED,
            Some(room_id),
            json!({ "roomId": room_id, "clients": others, "isHost": is_host }),
        );
        self.send_to(conn_id, room_joined).await;
        self.send_to(
            conn_id,
            RelayEnvelope::from_server(relay_kind::FULL_STATE, Some(room_id), copy),
        )
        .await;

        if !is_host {
            self.notify_host(room_id, conn_id).await;
        }
    }

    /// Ask the room's host for a fresh snapshot on behalf of `requester`
    async fn notify_host(&self, room_id: &str, requester: &str) {
        let hosts: Vec<ConnId> = match self.rooms.read().await.get(room_id) {
            Some(room) => room.hosts().map(|m| m.conn_id.clone()).collect(),
            None => return,
        };
        let request = RelayEnvelope::from_server(
            relay_kind::REQUEST_STATE,
            Some(room_id),
            json!({ "requestingClientId": requester, "needsFullState": true }),
        );
        self.send_many(&hosts, &request).await;
    }

    async fn request_state(&self, conn_id: &str, room_id: &str, envelope: &RelayEnvelope) {
        let copy = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(room_id) else {
                tracing::debug!(room_id = %room_id, "State requested for unknown room");
                return;
            };
            room.touch();
            room.copy.to_full_state()
        };
        self.send_to(
            conn_id,
            RelayEnvelope::from_server(relay_kind::FULL_STATE, Some(room_id), copy),
        )
        .await;

        let requester = if envelope.sender_id.is_empty() {
            conn_id
        } else {
            envelope.sender_id.as_str()
        };
        self.notify_host(room_id, requester).await;
    }

    /// Update the room copy if the message carries state, then fan out to everyone else
    async fn relay(&self, conn_id: &str, room_id: &str, envelope: RelayEnvelope) {
        let required = match envelope.kind.as_str() {
            relay_kind::UPDATE_ISSUES => Some("issues"),
            relay_kind::SELECT_TICKET => Some("ticket"),
            _ => None,
        };
        if let Some(field) = required {
            if envelope.data.get(field).map_or(true, Value::is_null) {
                tracing::debug!(conn_id = %conn_id, kind = %envelope.kind, "Dropping {} without {}", envelope.kind, field);
                return;
            }
        }

        let targets: Vec<ConnId> = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(room_id) else {
                tracing::debug!(room_id = %room_id, kind = %envelope.kind, "Dropping message for unknown room");
                return;
            };
            room.touch();
            room.copy.absorb(&envelope.kind, &envelope.data);
            room.members
                .iter()
                .filter(|m| m.conn_id != conn_id)
                .map(|m| m.conn_id.clone())
                .collect()
        };
        tracing::debug!(room_id = %room_id, kind = %envelope.kind, targets = targets.len(), "Relaying");
        self.send_many(&targets, &envelope).await;
    }

    /// Forget a connection; safe to call more than once
    pub async fn leave(&self, conn_id: &str) {
        let Some(conn) = self.connections.write().await.remove(conn_id) else {
            return;
        };
        if let Some(room_id) = conn.room {
            self.leave_room(conn_id, &room_id).await;
        }
        tracing::info!(conn_id = %conn_id, "Relay client disconnected");
    }

    async fn leave_room(&self, conn_id: &str, room_id: &str) {
        let (left, remaining, promoted) = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(room_id) else {
                return;
            };
            let Some(index) = room.members.iter().position(|m| m.conn_id == conn_id) else {
                return;
            };
            let left = room.members.remove(index);
            room.touch();

            if room.members.is_empty() {
                rooms.remove(room_id);
                tracing::info!(room_id = %room_id, "Room emptied and removed");
                (left, Vec::new(), None)
            } else {
                let promoted = if left.is_host && room.hosts().next().is_none() {
                    room.members
                        .iter_mut()
                        .min_by_key(|m| m.seq)
                        .map(|m| {
                            m.is_host = true;
                            m.clone()
                        })
                } else {
                    None
                };
                let remaining = room.members.iter().map(|m| m.conn_id.clone()).collect();
                (left, remaining, promoted)
            }
        };

        if let Some(conn) = self.connections.write().await.get_mut(conn_id) {
            conn.room = None;
        }

        let user_left = RelayEnvelope::from_server(
            relay_kind::USER_LEFT,
            Some(room_id),
            json!({
                "clientId": left.conn_id,
                "wasHost": left.is_host,
                "displayName": left.display_name,
            }),
        );
        self.send_many(&remaining, &user_left).await;

        if let Some(host) = promoted {
            tracing::info!(room_id = %room_id, conn_id = %host.conn_id, "Promoted new host");
            let new_host = RelayEnvelope::from_server(
                relay_kind::NEW_HOST,
                Some(room_id),
                json!({ "clientId": host.conn_id, "displayName": host.display_name }),
            );
            self.send_many(&remaining, &new_host).await;
            self.send_to(
                &host.conn_id,
                RelayEnvelope::from_server(
                    relay_kind::PROMOTED_TO_HOST,
                    Some(room_id),
                    json!({ "isHost": true }),
                ),
            )
            .await;
        }
    }

    /// One liveness cycle: terminate sockets that stayed silent since the last
    /// cycle, send an app-level `ping` to the rest. Returns the terminated
    /// connection ids.
    pub async fn sweep_connections(&self) -> Vec<ConnId> {
        let ping = RelayEnvelope::from_server(relay_kind::PING, None, json!({}));
        let dead: Vec<ConnId> = {
            let mut connections = self.connections.write().await;
            let mut dead = Vec::new();
            for (id, conn) in connections.iter_mut() {
                if conn.alive {
                    conn.alive = false;
                    let _ = conn.outbox.send(Outbound::Envelope(ping.clone()));
                } else {
                    let _ = conn.outbox.send(Outbound::Terminate);
                    dead.push(id.clone());
                }
            }
            dead
        };
        for id in &dead {
            tracing::warn!(conn_id = %id, "Terminating unresponsive relay client");
            self.leave(id).await;
        }
        dead
    }

    /// Drop rooms without activity for longer than `horizon`
    pub async fn sweep_rooms(&self, horizon: Duration) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|room_id, room| {
            let keep = room.last_activity.elapsed() <= horizon;
            if !keep {
                tracing::info!(room_id = %room_id, "Removing idle room");
            }
            keep
        });
        before - rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SERVER_SENDER_ID;

    async fn connect(hub: &RelayHub) -> (ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let (id, mut rx) = hub.register().await;
        match rx.try_recv() {
            Ok(Outbound::Envelope(env)) => assert_eq!(env.kind, relay_kind::WELCOME),
            other => panic!("expected welcome, got {:?}", other),
        }
        (id, rx)
    }

    fn frame(kind: &str, room: Option<&str>, data: Value, is_host: bool) -> String {
        let mut value = json!({
            "type": kind,
            "data": data,
            "senderId": "app-client",
            "senderName": "Someone",
            "isHost": is_host,
            "timestamp": 1,
        });
        if let Some(room) = room {
            value["roomId"] = json!(room);
        }
        value.to_string()
    }

    async fn join(hub: &RelayHub, id: &str, name: &str, is_host: bool) {
        let data = json!({ "displayName": name, "isHost": is_host });
        hub.handle_text(id, &frame(relay_kind::JOIN_ROOM, Some("r1"), data, is_host))
            .await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<RelayEnvelope> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Envelope(env) = item {
                out.push(env);
            }
        }
        out
    }

    fn kinds(envelopes: &[RelayEnvelope]) -> Vec<&str> {
        envelopes.iter().map(|e| e.kind.as_str()).collect()
    }

    #[tokio::test]
    async fn test_first_joiner_becomes_host() {
        let hub = RelayHub::new();
        let (h, mut h_rx) = connect(&hub).await;
        join(&hub, &h, "Host", false).await;

        let got = drain(&mut h_rx);
        assert_eq!(kinds(&got), vec![relay_kind::ROOM_JOINED, relay_kind::FULL_STATE]);
        assert_eq!(got[0].data["isHost"], true);
        assert_eq!(hub.members("r1").await[0].is_host, true);
    }

    #[tokio::test]
    async fn test_participant_join_notifies_host() {
        let hub = RelayHub::new();
        let (h, mut h_rx) = connect(&hub).await;
        join(&hub, &h, "Host", true).await;
        drain(&mut h_rx);

        let (p, mut p_rx) = connect(&hub).await;
        join(&hub, &p, "P1", false).await;

        let host_got = drain(&mut h_rx);
        assert_eq!(kinds(&host_got), vec![relay_kind::USER_JOINED, relay_kind::REQUEST_STATE]);
        assert_eq!(host_got[1].data["requestingClientId"], p.as_str());

        let p_got = drain(&mut p_rx);
        assert_eq!(p_got[0].data["clients"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_host_failover_promotes_oldest() {
        let hub = RelayHub::new();
        let (h, _h_rx) = connect(&hub).await;
        join(&hub, &h, "Host", true).await;
        let (p1, mut p1_rx) = connect(&hub).await;
        join(&hub, &p1, "P1", false).await;
        let (p2, mut p2_rx) = connect(&hub).await;
        join(&hub, &p2, "P2", false).await;
        drain(&mut p1_rx);
        drain(&mut p2_rx);

        hub.leave(&h).await;

        let p1_got = drain(&mut p1_rx);
        assert_eq!(
            kinds(&p1_got),
            vec![relay_kind::USER_LEFT, relay_kind::NEW_HOST, relay_kind::PROMOTED_TO_HOST]
        );
        assert_eq!(p1_got[0].data["wasHost"], true);
        assert_eq!(p1_got[1].data["clientId"], p1.as_str());

        let p2_got = drain(&mut p2_rx);
        assert_eq!(kinds(&p2_got), vec![relay_kind::USER_LEFT, relay_kind::NEW_HOST]);
        assert_eq!(p2_got[1].data["clientId"], p1.as_str());

        let members = hub.members("r1").await;
        assert!(members.iter().any(|m| m.client_id == p1 && m.is_host));
    }

    #[tokio::test]
    async fn test_room_copy_served_to_late_joiner() {
        let hub = RelayHub::new();
        let (h, _h_rx) = connect(&hub).await;
        join(&hub, &h, "Host", true).await;

        let issues = json!({ "issues": [{"Key": "PP-1"}], "timestamp": 42 });
        hub.handle_text(&h, &frame(relay_kind::UPDATE_ISSUES, Some("r1"), issues, true))
            .await;
        let select = json!({ "ticket": {"Key": "PP-1"} });
        hub.handle_text(&h, &frame(relay_kind::SELECT_TICKET, Some("r1"), select, true))
            .await;

        let (p, mut p_rx) = connect(&hub).await;
        join(&hub, &p, "P1", false).await;
        let got = drain(&mut p_rx);
        let state = &got[1];
        assert_eq!(state.kind, relay_kind::FULL_STATE);
        assert_eq!(state.data["issues"][0]["Key"], "PP-1");
        assert_eq!(state.data["selectedTicket"]["Key"], "PP-1");
        assert_eq!(state.data["timestamp"], 42);
    }

    #[tokio::test]
    async fn test_relay_excludes_sender_and_drops_roomless() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = connect(&hub).await;
        join(&hub, &a, "A", true).await;
        let (b, mut b_rx) = connect(&hub).await;
        join(&hub, &b, "B", false).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        hub.handle_text(&a, &frame("vote", Some("r1"), json!({"participantId": "a", "cardValue": 5}), true))
            .await;
        hub.handle_text(&a, &frame("reveal", None, json!({}), true)).await;

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(kinds(&drain(&mut b_rx)), vec!["vote"]);

        hub.handle_text(&b, &frame(relay_kind::PING, None, json!({}), false)).await;
        assert_eq!(kinds(&drain(&mut b_rx)), vec![relay_kind::PONG]);
    }

    #[tokio::test]
    async fn test_last_leaver_removes_room() {
        let hub = RelayHub::new();
        let (a, _rx) = connect(&hub).await;
        join(&hub, &a, "A", false).await;
        assert_eq!(hub.room_count().await, 1);

        hub.leave(&a).await;
        hub.leave(&a).await;
        assert_eq!(hub.room_count().await, 0);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_silent_connection_is_terminated() {
        let hub = RelayHub::new();
        let (quiet, mut quiet_rx) = connect(&hub).await;
        let (chatty, mut chatty_rx) = connect(&hub).await;
        join(&hub, &chatty, "Chatty", true).await;
        let (peer, mut peer_rx) = connect(&hub).await;
        join(&hub, &peer, "Peer", false).await;
        drain(&mut chatty_rx);
        drain(&mut peer_rx);

        assert!(hub.sweep_connections().await.is_empty());
        let pinged = drain(&mut chatty_rx);
        assert_eq!(kinds(&pinged), vec![relay_kind::PING]);
        assert_eq!(pinged[0].sender_id, SERVER_SENDER_ID);
        assert_eq!(kinds(&drain(&mut quiet_rx)), vec![relay_kind::PING]);

        // Clients answer with a room-tagged pong; it counts as liveness only
        hub.handle_text(&chatty, &frame(relay_kind::PONG, Some("r1"), json!({}), true))
            .await;
        hub.handle_text(&peer, &frame(relay_kind::PONG, Some("r1"), json!({}), false))
            .await;
        assert!(drain(&mut peer_rx).is_empty());
        assert!(drain(&mut chatty_rx).is_empty());

        assert_eq!(hub.sweep_connections().await, vec![quiet.clone()]);
        match quiet_rx.try_recv() {
            Ok(Outbound::Terminate) => {}
            other => panic!("expected terminate, got {:?}", other),
        }
        assert_eq!(kinds(&drain(&mut chatty_rx)), vec![relay_kind::PING]);
        assert_eq!(hub.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_state_kinds_without_state_are_not_relayed() {
        let hub = RelayHub::new();
        let (a, _a_rx) = connect(&hub).await;
        join(&hub, &a, "A", true).await;
        let (b, mut b_rx) = connect(&hub).await;
        join(&hub, &b, "B", false).await;
        drain(&mut b_rx);

        hub.handle_text(&a, &frame(relay_kind::UPDATE_ISSUES, Some("r1"), json!({"timestamp": 3}), true))
            .await;
        hub.handle_text(&a, &frame(relay_kind::SELECT_TICKET, Some("r1"), json!({"ticket": null}), true))
            .await;
        assert!(drain(&mut b_rx).is_empty());

        hub.handle_text(&a, &frame(relay_kind::SELECT_TICKET, Some("r1"), json!({"ticket": {"Key": "PP-1"}}), true))
            .await;
        assert_eq!(kinds(&drain(&mut b_rx)), vec![relay_kind::SELECT_TICKET]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_rooms_are_swept() {
        let hub = RelayHub::new();
        let (a, _rx) = connect(&hub).await;
        join(&hub, &a, "A", true).await;

        let horizon = Duration::from_secs(24 * 60 * 60);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(hub.sweep_rooms(horizon).await, 0);

        tokio::time::advance(horizon).await;
        assert_eq!(hub.sweep_rooms(horizon).await, 1);
        assert_eq!(hub.room_count().await, 0);
    }
}
