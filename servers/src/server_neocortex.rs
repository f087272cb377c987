//! # NEOCORTEX HTTP Server
//!
//! Runs the nervous system behind its HTTP API.
//!
//! ## Key Features:
//! - **Backends**: PostgreSQL store when `DATABASE_URL` is set (schema applied
//!   at start-up), in-memory store otherwise; Redis relay when `REDIS_URL` is
//!   set, in-process relay otherwise.
//! - **Scheduler**: the circadian clock routes signals, runs tasks, writes
//!   metrics and cleans up while the server is up.
//! - **Configuration**: defaults, then a JSON file, then environment and CLI
//!   (`clap`), with `.env` files loaded by `dotenvy`.
//! - **Graceful Shutdown**: `tokio-graceful` stops accepting requests, drains
//!   in-flight ones and stops the clock, within 10 seconds.

use anyhow::{Context, Result};
use neocortex::Neocortex;
use neocortex::connections::{PgStore, RedisRelay};
use neocortex::core::relay::{LocalRelay, Relay};
use neocortex::loggers::setup_logging;
use neocortex::store::{MemoryStore, Store};
use servers::neocortex_logic::config::{self, Config};
use servers::neocortex_logic::routes;
use servers::neocortex_logic::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{error, info, warn};

async fn build_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.database_url() {
        Some(url) => {
            let store = PgStore::connect(url, config.pool_size())?;
            store.ping().await.context("PostgreSQL is unreachable")?;
            store.migrate().await?;
            info!("Store: PostgreSQL");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set: using the in-memory store, nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn build_relay(config: &Config, channel: &str, capacity: usize) -> Result<Arc<dyn Relay>> {
    match config.redis_url() {
        Some(url) => {
            let relay = RedisRelay::connect(url, channel).await?;
            info!("Relay: Redis channel {}", relay.channel());
            Ok(Arc::new(relay))
        }
        None => {
            info!("Relay: in-process");
            Ok(Arc::new(LocalRelay::new(capacity)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    let log_prefix = config.log_prefix.clone().unwrap_or_else(|| "server_neocortex".to_string());
    let _log_guard = match setup_logging(&log_prefix) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    let settings = config.neocortex_settings();
    let store = build_store(&config).await?;
    let relay = build_relay(&config, &settings.channel, settings.relay_capacity).await?;

    let neocortex = Neocortex::new(store, relay, settings);
    neocortex.seed_defaults().await?;
    neocortex.start().await?;

    let address = format!("0.0.0.0:{}", config.port());
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    info!("server_neocortex listening on {}", listener.local_addr()?);

    let shutdown: Shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| tokio_main(guard, listener, neocortex));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");

    Ok(())
}

/// Serves the API until the shutdown signal, then stops the clock.
async fn tokio_main(shutdown_guard: ShutdownGuard, listener: TcpListener, neocortex: Neocortex) {
    let app = routes::router(AppState::new(neocortex.clone()));
    let signal = shutdown_guard.clone_weak();

    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            signal.cancelled().await;
            info!("Signal received: initiate graceful shutdown");
        })
        .await;
    if let Err(e) = served {
        error!("HTTP server error: {}", e);
    }

    if let Err(e) = neocortex.stop().await {
        error!("NEOCORTEX did not stop cleanly: {}", e);
    }
    drop(shutdown_guard);
}
