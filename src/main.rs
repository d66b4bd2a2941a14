//! relwire - remote wire-protocol server
//!
//! Serves the in-memory relational engine over the relwire protocol.

use relwire_engine::MemoryEngine;
use relwire_server::{Config, Server};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RELWIRE_CONFIG is set, then env overrides)
    let config_path = std::env::var("RELWIRE_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting relwire server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Lazy mode: {}",
        if config.network.lazy { "allowed" } else { "disabled" }
    );
    tracing::info!("  Wire crypt: {:?}", config.crypt.wire_crypt);
    tracing::info!("  Auth plugins: {}", config.auth.plugins.join(", "));
    if config.auth.users.is_empty() {
        tracing::warn!("No users configured; every login will be rejected");
    } else {
        tracing::info!("  Users: {}", config.auth.users.len());
    }

    let mut engine = MemoryEngine::new();
    for db in &config.engine.databases {
        engine = match &db.key {
            Some(key) => engine.with_keyed_database(&db.name, key.clone().into_bytes()),
            None => engine.with_database(&db.name),
        };
        tracing::info!(
            "  Database: {}{}",
            db.name,
            if db.key.is_some() { " (keyed)" } else { "" }
        );
    }

    let server = Arc::new(Server::new(config, Arc::new(engine)));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
