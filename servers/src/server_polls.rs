//! # Live Poll Server
//!
//! HTTP and WebSocket front for the voting core. Votes arrive as
//! `POST /polls/{id}/vote` with the voter token in the `X-Voter-Id` header;
//! viewers attach to `GET /polls/{id}/ws` and receive a fresh snapshot after
//! every committed vote.

use anyhow::{Context, Result};
use tokio::signal;

mod poll_logic;
use poll_logic::{config, downstream, state, store};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let _log_guard = poll_core::loggers::init_logging(&config.log_dir(), config.log_level(), "server_polls")?;

    let store = store::AnyStore::from_config(&config.store_config())
        .await
        .context("Failed to open the poll store")?;
    tracing::info!(store = store.backend(), "Poll store ready");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let app_state = state::AppState::new(store, &config, shutdown_tx.clone());

    let mut downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            tracing::info!("SIGTERM received, initiating shutdown.");
        }
        // The server stopped on its own, most likely it could not bind.
        finished = &mut downstream_handle => {
            return finished.context("Downstream task panicked")?;
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    match downstream_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Downstream server failed"),
        Err(e) => tracing::error!(error = %e, "Downstream task panicked"),
    }

    tracing::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
