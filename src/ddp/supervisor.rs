use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::connection::{self, ConnectionEnd, ConnectionOutcome};
use super::session::Session;
use crate::config::Credentials;
use crate::writer::IndexWriter;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("gave up after {attempts} consecutive connection attempts")]
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    /// Consecutive attempts allowed, counting the first connection.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Wait before attempt `attempt` (1-indexed); the first attempt is
    /// immediate, attempt `n + 1` waits `base_delay × n`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.saturating_sub(1)
    }
}

/// One fresh connection attempt. Implementations must build a new session
/// per call.
#[async_trait]
pub trait Connector: Send {
    async fn connect_once(
        &mut self,
        attempt: u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ConnectionOutcome;
}

/// Connector for the real chat server.
pub struct WsConnector {
    pub ws_url: String,
    pub credentials: Credentials,
    pub root_url: String,
    pub writer: IndexWriter,
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect_once(
        &mut self,
        attempt: u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ConnectionOutcome {
        info!(attempt, "Starting session");
        let mut session = Session::new(self.credentials.clone(), self.root_url.clone());
        connection::run(&self.ws_url, &mut session, &self.writer, shutdown).await
    }
}

/// Keep a session alive until shutdown, reconnecting with linear backoff.
///
/// Returns `Ok(())` on shutdown and [`SupervisorError::Exhausted`] once
/// `max_attempts` consecutive attempts have failed to stay up. Reaching the
/// streaming state resets the count.
pub async fn supervise<C: Connector>(
    connector: &mut C,
    policy: BackoffPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SupervisorError> {
    let mut attempt: u32 = 1;

    loop {
        let outcome = connector.connect_once(attempt, &mut shutdown).await;

        let reason = match outcome.end {
            ConnectionEnd::Shutdown => {
                info!("Session supervisor stopped");
                return Ok(());
            }
            ConnectionEnd::Closed(reason) => reason,
        };

        if outcome.reached_streaming {
            // The connection that just dropped was healthy; count its
            // replacement as the first retry.
            attempt = 1;
        }

        if attempt >= policy.max_attempts {
            error!(
                attempts = attempt,
                reason = %reason,
                "Reconnection budget exhausted"
            );
            return Err(SupervisorError::Exhausted { attempts: attempt });
        }
        attempt += 1;

        let delay = policy.delay_before(attempt);
        warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Connection lost, reconnecting"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutdown during reconnect backoff");
                    return Ok(());
                }
            }
        }

        if *shutdown.borrow() {
            return Ok(());
        }
    }
}
