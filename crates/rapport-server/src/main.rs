//! # Rapport Server
//!
//! Matching and realtime conversation server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! rapport
//!
//! # Run with a specific config file
//! rapport --config /path/to/rapport.toml
//!
//! # Configure through rapport.toml or environment variables
//! RAPPORT_PORT=8080 RAPPORT_HOST=0.0.0.0 RAPPORT_STORAGE__PATH=/var/lib/rapport.db rapport
//! ```

mod config;
mod handlers;
mod metrics;
mod session;
mod state;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rapport=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().skip_while(|arg| arg != "--config").nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Rapport server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
