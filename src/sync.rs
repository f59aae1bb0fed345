//! Real-time sync engine: wires the chat stream into the index.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{
    Config, READY_POLL_ATTEMPTS, READY_POLL_DELAY, RECONNECT_BASE_DELAY, RECONNECT_MAX_ATTEMPTS,
    SHUTDOWN_GRACE,
};
use crate::ddp::{supervise, BackoffPolicy, WsConnector};
use crate::index::{self, DocumentSink};
use crate::writer::IndexWriter;

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub ready_attempts: u32,
    pub ready_delay: Duration,
    pub backoff: BackoffPolicy,
    pub shutdown_grace: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            ready_attempts: READY_POLL_ATTEMPTS,
            ready_delay: READY_POLL_DELAY,
            backoff: BackoffPolicy {
                base_delay: RECONNECT_BASE_DELAY,
                max_attempts: RECONNECT_MAX_ATTEMPTS,
            },
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Run until SIGINT/SIGTERM, or until the reconnection budget is spent.
pub async fn run(config: &Config) -> Result<()> {
    run_with(config, SyncSettings::default(), shutdown_signal()).await
}

pub async fn run_with<F>(config: &Config, settings: SyncSettings, shutdown_signal: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let credentials = config.credentials()?;

    let gateway = index::connect(&config.search)?;
    info!("Waiting for search engine at {}", config.search.url);
    gateway
        .wait_until_ready(settings.ready_attempts, settings.ready_delay)
        .await?;
    gateway
        .ensure_schema()
        .await
        .with_context(|| format!("Failed to prepare index {}", gateway.index_name()))?;

    let sink: Arc<dyn DocumentSink> = Arc::new(gateway);
    let (writer, _lanes) = IndexWriter::spawn(sink, config.index_lanes);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connector = WsConnector {
        ws_url: config.rocketchat.ws_url.clone(),
        credentials,
        root_url: config.root_url.clone(),
        writer,
    };
    let backoff = settings.backoff;
    let mut supervisor =
        tokio::spawn(async move { supervise(&mut connector, backoff, shutdown_rx).await });

    info!("Sync engine started");

    tokio::select! {
        _ = shutdown_signal => {
            info!("Shutting down sync engine...");
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(settings.shutdown_grace, &mut supervisor).await {
                Ok(_) => info!("Connection closed"),
                Err(_) => {
                    warn!(
                        "Connection did not close within {:?}, exiting anyway",
                        settings.shutdown_grace
                    );
                    supervisor.abort();
                }
            }
            Ok(())
        }
        joined = &mut supervisor => {
            match joined.context("Session supervisor panicked")? {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!("Sync engine stopping: {}", e);
                    Err(e.into())
                }
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}
