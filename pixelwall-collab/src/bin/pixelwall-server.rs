//! Pixelwall server: the shared canvas over WebSocket.
//!
//! Configured from the environment (`PIXELWALL_BIND`, `PORT`,
//! `PIXELWALL_DATA_DIR`, `PIXELWALL_COOLDOWN_MS`). Log level follows
//! `RUST_LOG`, defaulting to `info`. Ctrl-C stops accepting connections and
//! flushes the store.

use std::process::ExitCode;

use log::{error, info};
use pixelwall_collab::{CanvasServer, ServerConfig, ServerError};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting pixelwall server...");

    match run().await {
        Ok(()) => {
            info!("Pixelwall server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Pixelwall server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), ServerError> {
    let config = ServerConfig::from_env()?;
    match &config.storage_path {
        Some(path) => info!("Persisting canvas to {}", path.display()),
        None => info!("No data directory set, canvas is in-memory only"),
    }

    let server = CanvasServer::new(config)?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}
