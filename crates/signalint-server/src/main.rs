//! # signalint-server
//!
//! HTTP server for the signalint telemetry engine.
//!
//! This binary provides:
//! - REST API for scanning, the device rosters, aliases and CSV export
//! - A single BLE message session
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, with simulated radios
//! cargo run --package signalint-server
//!
//! # On a Linux host with BlueZ
//! cargo run --package signalint-server --features bluetooth
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use signalint_core::Config;
use signalint_server::{create_router, logging, AppState};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::is_production())?;

    info!("Starting signalint-server");

    let config = Config::load_or_default(Config::config_path())?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config).await?;

    let app = create_router(state);
    let listener = TcpListener::bind(&addr).await?;

    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
