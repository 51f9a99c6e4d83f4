use std::time::Duration;

/// Protocol-logic errors raised by the voting round. Messages are user-facing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoundError {
    #[error("Please select a ticket before starting the countdown")]
    NoTicketSelected,

    #[error("Voting is closed while the countdown is running")]
    CountdownInProgress,

    #[error("Card {0} is not part of this deck")]
    InvalidCard(f64),

    #[error("Ticket {0} is not in the current ticket list")]
    UnknownTicket(String),
}

/// Failures inside the durable store. Never crosses the `LocalStore` boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored value is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Storage is unavailable: {0}")]
    Unavailable(String),
}

/// Transport plumbing failures. Logged and recovered inside the adapters.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected to a session")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Gave up reconnecting after {attempts} attempts (last delay {last_delay:?})")]
    ReconnectExhausted { attempts: u32, last_delay: Duration },

    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Invitation links that cannot be read
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InviteError {
    #[error("Invitation link has no session parameter")]
    MissingSession,

    #[error("Invitation parameter {0} is not valid UTF-8")]
    BadEncoding(String),
}
