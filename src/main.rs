use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pokersync::{
    config::RelayConfig,
    relay::{self, liveness, RelayHub},
};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pokersync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting pokersync relay...");

    let config = RelayConfig::from_env();
    let hub = Arc::new(RelayHub::new());

    // Terminate sockets that stop answering pings
    liveness::spawn_ping_sweeper(hub.clone(), config.ping_interval);

    // Forget rooms nobody has touched for a day
    liveness::spawn_room_sweeper(hub.clone(), config.room_sweep_interval, config.room_idle_horizon);

    let app = relay::router(hub, &config);

    tracing::info!("Listening on http://{}", config.addr);
    let listener = match tokio::net::TcpListener::bind(config.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", config.addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Relay server stopped: {}", e);
        std::process::exit(1);
    }
}
