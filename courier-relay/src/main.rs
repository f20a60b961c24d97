//! Courier relay server: real-time chat and notification delivery.
//!
//! An axum WebSocket server that carries two-party chat rooms between
//! clients and vendors, persists every message, and queues notifications
//! for users who are not looking.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000 with in-memory storage
//! cargo run --bin courier-relay
//!
//! # Persist to SQLite on a custom address
//! cargo run --bin courier-relay -- --bind 127.0.0.1:8080 --storage sqlite://courier.db
//!
//! # Or via environment variables
//! COURIER_ADDR=127.0.0.1:8080 COURIER_STORAGE=memory cargo run --bin courier-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use courier_relay::config::{RelayCliArgs, RelayConfig, StorageBackend};
use courier_relay::dispatcher::Dispatcher;
use courier_relay::relay::{self, RelayState};
use courier_relay::store::Storage;
use courier_relay::store::memory::MemoryStore;
use courier_relay::store::sqlite::SqliteStore;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Held until exit so buffered log lines are flushed.
    let _log_guard = init_tracing(&config);

    tracing::info!(addr = %config.bind_addr, storage = ?config.storage, "starting courier relay");

    let result = match &config.storage {
        StorageBackend::Memory => serve(&config, MemoryStore::new()).await,
        StorageBackend::Sqlite(url) => match SqliteStore::connect(url).await {
            Ok(store) => serve(&config, store).await,
            Err(e) => Err(e.into()),
        },
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "relay server failed");
        std::process::exit(1);
    }
}

/// Initializes tracing with the resolved log level, writing to stderr or,
/// when configured, to a log file.
fn init_tracing(config: &RelayConfig) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let Some(path) = &config.log_file else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = path
        .file_name()
        .map_or_else(|| "courier-relay.log".into(), |n| n.to_os_string());
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

/// Runs the relay on `store` until Ctrl-C.
async fn serve<S: Storage>(
    config: &RelayConfig,
    store: S,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dispatcher = Dispatcher::with_limits(Arc::new(store), config.limits);
    let state = Arc::new(RelayState::with_settings(dispatcher, config.connection));

    let (bound_addr, handle) =
        relay::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await?;
    tracing::info!(addr = %bound_addr, "relay server listening");

    tokio::select! {
        result = handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down, closing connections");
            state.close_all_connections();
            // Give writer tasks a moment to flush close frames.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }
    Ok(())
}
