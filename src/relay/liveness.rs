use super::hub::RelayHub;
use std::sync::Arc;
use std::time::Duration;

/// Spawn a background task that probes every socket each `interval` and
/// terminates the ones that did not answer the previous probe
pub fn spawn_ping_sweeper(hub: Arc<RelayHub>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let dead = hub.sweep_connections().await;
            if !dead.is_empty() {
                tracing::info!("Liveness sweep terminated {} connection(s)", dead.len());
            }
        }
    });
}

/// Spawn a background task that removes rooms idle for longer than `horizon`
pub fn spawn_room_sweeper(hub: Arc<RelayHub>, interval: Duration, horizon: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let removed = hub.sweep_rooms(horizon).await;
            tracing::debug!(removed, "Room sweep done");
        }
    });
}
