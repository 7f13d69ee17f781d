// src/server.rs
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum_server::Handle;
use thiserror::Error;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, ConfigError};
use crate::db;
use crate::feed::ChangeFeed;
use crate::listener::NotifyListener;
use crate::routes::create_routes;
use crate::state::AppState;
use crate::store::{DynStore, MemoryStore, PgStore};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid bind address {address}: {source}")]
    Address {
        address: String,
        source: std::net::AddrParseError,
    },

    #[error("server: {0}")]
    Io(#[from] std::io::Error),
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Ignore the error when a subscriber is already set (tests).
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Wires the store and change feed for `config`. With a database the change
/// listener is started as well; its handle is returned so the caller owns it.
pub async fn build_state(
    config: Config,
) -> Result<(AppState, Option<JoinHandle<()>>), StartupError> {
    let feed = ChangeFeed::with_max_channels(config.feed_max_channels);

    let (store, listener): (DynStore, _) = match config.database_url.clone() {
        Some(database_url) => {
            let pool = db::create_pool(&config, &database_url).await?;
            db::migrate(&pool).await?;

            // Down until the listener has connected.
            feed.set_available(false);
            let listener = Arc::new(NotifyListener::new(
                pool.clone(),
                feed.clone(),
                config.feed_reconnect_delay,
            ));
            (Arc::new(PgStore::new(pool)), Some(listener.start()))
        }
        None => (Arc::new(MemoryStore::with_feed(feed.clone())), None),
    };

    info!(store = store.backend_name(), "Store ready");
    Ok((AppState::new(store, feed, config), listener))
}

pub async fn run() -> Result<(), StartupError> {
    init_tracing();

    let config = Config::from_env()?;
    let address = config.bind_address();
    let addr: SocketAddr = address.parse().map_err(|source| StartupError::Address {
        address: address.clone(),
        source,
    })?;

    let (state, listener) = build_state(config).await?;
    let app = create_routes(state);

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    info!("Server running on {addr}");
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    if let Some(listener) = listener {
        listener.abort();
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
