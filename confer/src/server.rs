//! Server lifecycle management
//!
//! Wires the media engine, the session protocol and the HTTP router together
//! and runs them until a shutdown signal arrives.

use anyhow::Context;
use confer_sfu::{LocalMediaEngine, SessionProtocol};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::http::{create_router, AppState};

pub struct ConferServer {
    config: Config,
    engine: Arc<LocalMediaEngine>,
    protocol: Arc<SessionProtocol>,
}

impl ConferServer {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let engine = Arc::new(LocalMediaEngine::new(config.engine.clone()));
        let protocol = Arc::new(SessionProtocol::new(config.sfu.clone(), engine.clone()));
        Self {
            config,
            engine,
            protocol,
        }
    }

    /// Serve until SIGTERM or Ctrl+C
    pub async fn run(self) -> anyhow::Result<()> {
        let address = self.config.http_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind HTTP address {address}"))?;
        info!(address = %listener.local_addr()?, "Signaling server listening");

        let watcher = self.protocol.spawn_engine_watcher();
        let router = create_router(AppState::new(
            Arc::clone(&self.protocol),
            self.config.server.max_message_size,
        ));

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        info!(peers = self.protocol.stats().peers, "Shutting down media engine");
        self.engine.shutdown("server shutdown");
        watcher.abort();

        served.context("HTTP server error")?;
        info!("Server shut down gracefully");
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
