//! # Orbit Server
//!
//! Presence fan-out server: authenticates socket connections, tracks circle
//! rooms and presence state, and converges with its peers over a message bus.
//!
//! ## Usage
//!
//! ```bash
//! # Run with settings from orbit.toml (or /etc/orbit/orbit.toml)
//! ORBIT__AUTH__JWT_SECRET=... orbit
//!
//! # Run with a custom config
//! ORBIT_CONFIG=/path/to/orbit.toml orbit
//!
//! # Run several instances sharing Redis
//! ORBIT_PORT=8081 ORBIT__BUS__BACKEND=redis ORBIT__BUS__URL=redis://127.0.0.1:6379 orbit
//! ```

mod config;
mod gate;
mod gateway;
mod handlers;
mod jwt;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orbit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Orbit server on {}:{} (bus: {:?})",
        config.host,
        config.port,
        config.bus.backend
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
