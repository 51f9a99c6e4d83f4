// Public API for the relay binary, integration tests and embedding clients

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod relay;
pub mod round;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;
