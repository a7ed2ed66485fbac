//! Time-bounded polls with one vote per identity, kept entirely in a
//! key-value store.
//!
//! - [`poll::PollRepository`] creates, reads, lists, searches, closes and
//!   deletes polls.
//! - [`vote::VoteLedger`] casts votes and reads tallies.
//! - [`lifecycle`] derives whether a poll is open, closed or expired.
//! - [`store`] is the storage contract with its redis and in-memory backends.
//!
//! Nothing here holds shared mutable state in process; the store is the only
//! synchronization point between concurrent requests.
use tokio::{net::TcpListener, signal};
use tracing::info;

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod poll;
pub mod routes;
pub mod state;
pub mod store;
pub mod vote;

use config::Config;
use state::AppState;

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    info!("Connecting to store...");
    let store = db::create_store(&config).await?;
    let state = AppState::new(config, store);

    let address = format!("0.0.0.0:{}", state.config.port);
    let app = routes::create_routes(state);

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
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
}
