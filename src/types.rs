use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

/// Opaque ID types for type safety
pub type SessionId = String;
pub type ClientId = String;
pub type TicketKey = String;
pub type RoomId = String;

/// Status given to imported tickets that arrive without one
pub const DEFAULT_TICKET_STATUS: &str = "To Do";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Participant,
}

impl Role {
    pub fn is_host(self) -> bool {
        self == Role::Host
    }

    pub fn from_host_flag(is_host: bool) -> Self {
        if is_host {
            Role::Host
        } else {
            Role::Participant
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// A ticket under estimation.
///
/// Field names on the wire follow the spreadsheet columns the importer reads,
/// so lists exported by older clients keep deserializing. Deserialization goes
/// through [`Ticket::coerce`], so nulls and numbers in text columns are accepted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Ticket {
    #[serde(rename = "Key")]
    pub key: TicketKey,
    #[serde(rename = "Summary")]
    pub summary: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Assignee")]
    pub assignee: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Story point", serialize_with = "serialize_story_point")]
    pub story_point: Option<f64>,
}

impl<'de> Deserialize<'de> for Ticket {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(d)?;
        Ticket::coerce(&value).ok_or_else(|| serde::de::Error::custom("ticket must be an object"))
    }
}

/// Ticket lists off the wire: `null` is empty and non-object entries are dropped
pub fn deserialize_tickets<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Ticket>, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    Ok(Ticket::coerce_list(&value))
}

fn default_status() -> String {
    DEFAULT_TICKET_STATUS.to_string()
}

impl Ticket {
    pub fn new(key: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            summary: summary.into(),
            status: default_status(),
            assignee: String::new(),
            description: String::new(),
            story_point: None,
        }
    }

    /// Coerce an arbitrary JSON value into a ticket.
    ///
    /// Returns `None` for anything that is not an object. String fields accept
    /// numbers and booleans; missing or blank status becomes "To Do".
    pub fn coerce(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let text = |name: &str| -> String {
            match obj.get(name) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                Some(serde_json::Value::Bool(b)) => b.to_string(),
                _ => String::new(),
            }
        };

        let status = text("Status");
        Some(Self {
            key: text("Key"),
            summary: text("Summary"),
            status: if status.trim().is_empty() {
                default_status()
            } else {
                status
            },
            assignee: text("Assignee"),
            description: text("Description"),
            story_point: obj.get("Story point").and_then(story_point_from_value),
        })
    }

    /// Coerce a JSON array into tickets, dropping entries that are not objects
    pub fn coerce_list(value: &serde_json::Value) -> Vec<Self> {
        value
            .as_array()
            .map(|items| items.iter().filter_map(Self::coerce).collect())
            .unwrap_or_default()
    }
}

fn story_point_from_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn serialize_story_point<S: Serializer>(value: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(points) => s.serialize_f64(*points),
        None => s.serialize_str(""),
    }
}


/// Host-authoritative snapshot shipped in `full_state`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub game_type: String,
    #[serde(default)]
    pub issues: Vec<Ticket>,
    #[serde(default)]
    pub selected_ticket: Option<Ticket>,
    #[serde(default)]
    pub votes: HashMap<ClientId, f64>,
}

/// Card deck derived from the game type chosen at session creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VotingScale {
    Fibonacci,
    NumbersOneToFifteen,
    PowersOfTwo,
    Unrestricted,
}

impl VotingScale {
    pub fn from_game_type(game_type: &str) -> Self {
        if game_type.contains("Fibonacci") {
            VotingScale::Fibonacci
        } else if game_type.contains("Numbers 1-15") {
            VotingScale::NumbersOneToFifteen
        } else if game_type.contains("Powers of 2") {
            VotingScale::PowersOfTwo
        } else {
            VotingScale::Unrestricted
        }
    }

    pub fn cards(self) -> Vec<u32> {
        match self {
            VotingScale::Fibonacci => vec![0, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89],
            VotingScale::NumbersOneToFifteen => (1..=15).collect(),
            VotingScale::PowersOfTwo => vec![0, 1, 2, 4, 8, 16, 32, 64],
            VotingScale::Unrestricted => Vec::new(),
        }
    }

    /// Whether a card value belongs to this deck. Unrestricted accepts anything non-negative.
    pub fn accepts(self, value: f64) -> bool {
        match self {
            VotingScale::Unrestricted => value >= 0.0,
            _ => self.cards().iter().any(|c| f64::from(*c) == value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_fills_defaults() {
        let ticket = Ticket::coerce(&json!({"Key": "PP-1"})).unwrap();
        assert_eq!(ticket.key, "PP-1");
        assert_eq!(ticket.status, "To Do");
        assert_eq!(ticket.summary, "");
        assert_eq!(ticket.story_point, None);
    }

    #[test]
    fn test_coerce_accepts_numeric_strings() {
        let ticket = Ticket::coerce(&json!({
            "Key": 42,
            "Status": "In Progress",
            "Story point": "5"
        }))
        .unwrap();
        assert_eq!(ticket.key, "42");
        assert_eq!(ticket.status, "In Progress");
        assert_eq!(ticket.story_point, Some(5.0));
    }

    #[test]
    fn test_coerce_list_drops_non_objects() {
        let list = Ticket::coerce_list(&json!([{"Key": "A"}, "junk", 3, {"Key": "B"}]));
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].key, "B");
    }

    #[test]
    fn test_ticket_wire_names() {
        let mut ticket = Ticket::new("PP-7", "Login page");
        ticket.story_point = Some(3.0);
        let value = serde_json::to_value(&ticket).unwrap();
        assert_eq!(value["Key"], "PP-7");
        assert_eq!(value["Story point"], 3.0);

        let unset = serde_json::to_value(Ticket::new("PP-8", "")).unwrap();
        assert_eq!(unset["Story point"], "");
        let back: Ticket = serde_json::from_value(unset).unwrap();
        assert_eq!(back.story_point, None);
    }

    #[test]
    fn test_voting_scale_from_game_type() {
        let scale = VotingScale::from_game_type("Fibonacci (0, 1, 2, 3, 5...)");
        assert_eq!(scale, VotingScale::Fibonacci);
        assert!(scale.accepts(13.0));
        assert!(!scale.accepts(4.0));
        assert_eq!(VotingScale::from_game_type("Numbers 1-15").cards().len(), 15);
        assert_eq!(VotingScale::from_game_type("???"), VotingScale::Unrestricted);
    }
}
