//! # Air Server
//!
//! Realtime message relay server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (air.toml if present, MySQL store)
//! air
//!
//! # Run with environment variables
//! AIR_PORT=8181 DB_HOST=db.internal air
//!
//! # Override nested settings
//! AIR__STORE__BACKEND=memory AIR__METRICS__ENABLED=false air
//! ```

use air_server::{config::Config, handlers, metrics};
use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "air=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!("Starting Air server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
