//! Runtime configuration for clients and the relay server.
//!
//! Everything has a default matching the timings the protocol was tuned with;
//! environment variables override individual values.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Which broadcast medium a client uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process pub/sub between frames of one origin
    Broadcast,
    /// Shared storage area with change events (one tab elected host)
    Storage,
    /// WebSocket relay server
    Relay,
}

impl TransportKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "broadcast" | "in-tab" => Some(TransportKind::Broadcast),
            "storage" | "cross-tab" => Some(TransportKind::Storage),
            "relay" | "websocket" | "ws" => Some(TransportKind::Relay),
            _ => None,
        }
    }
}

/// Client-side protocol timings and transport selection
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub transport: TransportKind,
    /// WebSocket URL of the relay server
    pub relay_url: String,
    /// Delays after join at which a participant asks the host for state
    pub bootstrap_delays: Vec<Duration>,
    /// Upper bound on bootstrap requests
    pub max_bootstrap_attempts: usize,
    /// Delays at which the host answers a state request
    pub host_response_delays: Vec<Duration>,
    /// Extra re-emits of an applied update to local subscribers
    pub reemit_delays: Vec<Duration>,
    /// Host liveness announcement
    pub heartbeat_interval: Duration,
    /// Host re-push / participant empty-list check
    pub connection_check_interval: Duration,
    /// Delays for redundant in-tab sends of high-value messages
    pub broadcast_redundancy: Vec<Duration>,
    /// Additional redundant sends for `update_issues` from the host
    pub host_issue_redundancy: Vec<Duration>,
    /// Clients unseen for longer than this are not eligible as storage host
    pub liveness_window: Duration,
    /// Storage client records older than this are pruned
    pub client_ttl: Duration,
    /// Storage sweep of stale clients and expired events
    pub cleanup_interval: Duration,
    /// Lifetime of a storage event key
    pub event_ttl: Duration,
    /// Storage poll for missed change events
    pub poll_interval: Duration,
    /// Delay before the first storage election
    pub initial_election_delay: Duration,
    /// Relay reconnect backoff base
    pub reconnect_base: Duration,
    /// Relay reconnect backoff ceiling
    pub reconnect_cap: Duration,
    pub max_reconnect_attempts: u32,
    /// Client app-level ping to the relay
    pub ping_interval: Duration,
    /// Countdown ticks before votes are revealed
    pub countdown_ticks: u32,
    pub countdown_tick: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Broadcast,
            relay_url: "ws://127.0.0.1:3000/ws".to_string(),
            bootstrap_delays: [
                100, 500, 1_000, 2_000, 3_000, 5_000, 8_000, 12_000, 15_000, 20_000, 25_000,
                30_000, 40_000, 50_000, 60_000,
            ]
            .into_iter()
            .map(Duration::from_millis)
            .collect(),
            max_bootstrap_attempts: 15,
            host_response_delays: vec![Duration::ZERO, Duration::from_millis(500)],
            reemit_delays: vec![Duration::from_millis(100), Duration::from_millis(500)],
            heartbeat_interval: Duration::from_secs(3),
            connection_check_interval: Duration::from_secs(5),
            broadcast_redundancy: vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(500),
            ],
            host_issue_redundancy: vec![Duration::from_secs(1), Duration::from_secs(3)],
            liveness_window: Duration::from_secs(5),
            client_ttl: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(10),
            event_ttl: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            initial_election_delay: Duration::from_secs(1),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            ping_interval: Duration::from_secs(30),
            countdown_ticks: 3,
            countdown_tick: Duration::from_secs(1),
        }
    }
}

impl SyncConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let transport = match std::env::var("POKERSYNC_TRANSPORT") {
            Ok(value) => TransportKind::parse(&value).unwrap_or_else(|| {
                tracing::warn!("Unknown POKERSYNC_TRANSPORT {:?}, using broadcast", value);
                TransportKind::Broadcast
            }),
            Err(_) => defaults.transport,
        };

        let relay_url = std::env::var("POKERSYNC_RELAY_URL")
            .ok()
            .and_then(|url| {
                let trimmed = url.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .unwrap_or(defaults.relay_url);

        let config = Self {
            transport,
            relay_url,
            heartbeat_interval: env_millis("POKERSYNC_HEARTBEAT_MS")
                .unwrap_or(defaults.heartbeat_interval),
            liveness_window: env_millis("POKERSYNC_LIVENESS_WINDOW_MS")
                .unwrap_or(defaults.liveness_window),
            max_reconnect_attempts: std::env::var("POKERSYNC_MAX_RECONNECTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_reconnect_attempts),
            countdown_ticks: std::env::var("POKERSYNC_COUNTDOWN_TICKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.countdown_ticks),
            ..defaults
        };

        tracing::info!(
            transport = ?config.transport,
            relay_url = %config.relay_url,
            "Sync config loaded"
        );
        config
    }

    /// Bootstrap schedule after applying the attempt cap
    pub fn bootstrap_schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        self.bootstrap_delays
            .iter()
            .copied()
            .take(self.max_bootstrap_attempts)
    }
}

/// Relay server settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    /// Interval of the server-side `ping` / dead-socket sweep
    pub ping_interval: Duration,
    /// Rooms without traffic for this long are dropped
    pub room_idle_horizon: Duration,
    pub room_sweep_interval: Duration,
    /// Optional directory of static assets served at `/`
    pub static_dir: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3000),
            ping_interval: Duration::from_secs(30),
            room_idle_horizon: Duration::from_secs(24 * 60 * 60),
            room_sweep_interval: Duration::from_secs(60 * 60),
            static_dir: None,
        }
    }
}

impl RelayConfig {
    /// Load config from environment variables (`PORT` keeps hosting platforms happy)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(defaults.addr.port());

        let static_dir = std::env::var("POKERSYNC_STATIC_DIR").ok().and_then(|dir| {
            let trimmed = dir.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });

        let config = Self {
            addr: SocketAddr::new(defaults.addr.ip(), port),
            ping_interval: env_millis("POKERSYNC_RELAY_PING_MS").unwrap_or(defaults.ping_interval),
            static_dir,
            ..defaults
        };

        tracing::info!(
            addr = %config.addr,
            ping_interval = ?config.ping_interval,
            "Relay config loaded"
        );
        config
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}
