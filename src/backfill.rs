//! One-shot bulk load of recent channel history into the index.

use std::fmt;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{Config, Credentials, READY_POLL_ATTEMPTS, READY_POLL_DELAY};
use crate::document::IndexDocument;
use crate::index::{self, DocumentSink};
use crate::rest::{Channel, HistorySource, RestAuth, RocketChatClient};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub channels: usize,
    pub channels_failed: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl fmt::Display for BackfillReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} messages indexed from {} channels ({} skipped, {} failed, {} channels failed)",
            self.indexed, self.channels, self.skipped, self.failed, self.channels_failed
        )
    }
}

/// Prepare the index, then load history from the configured chat server.
pub async fn run(config: &Config, page_size: u32) -> Result<BackfillReport> {
    let credentials = config.credentials()?;

    let gateway = index::connect(&config.search)?;
    gateway
        .wait_until_ready(READY_POLL_ATTEMPTS, READY_POLL_DELAY)
        .await?;
    gateway
        .ensure_schema()
        .await
        .with_context(|| format!("Failed to prepare index {}", gateway.index_name()))?;

    let history = RocketChatClient::new(&config.rocketchat.url)?;
    Backfill {
        history: &history,
        sink: &gateway,
        root_url: &config.root_url,
        page_size,
    }
    .run(&credentials)
    .await
}

pub struct Backfill<'a, H: ?Sized, S: ?Sized> {
    pub history: &'a H,
    pub sink: &'a S,
    pub root_url: &'a str,
    pub page_size: u32,
}

impl<'a, H, S> Backfill<'a, H, S>
where
    H: HistorySource + ?Sized,
    S: DocumentSink + ?Sized,
{
    /// Index the latest `page_size` messages of every channel. Schema
    /// preparation is the caller's job.
    pub async fn run(&self, credentials: &Credentials) -> Result<BackfillReport> {
        info!("Logging in to chat server as {}", credentials.username);
        let session = self
            .history
            .login(credentials)
            .await
            .context("Chat server login failed")?;
        info!("Logged in as {}", session.username);

        let channels = self
            .history
            .list_channels(&session.auth)
            .await
            .context("Failed to list channels")?;
        info!("Found {} channels", channels.len());

        let mut report = BackfillReport {
            channels: channels.len(),
            ..Default::default()
        };

        for channel in &channels {
            if let Err(e) = self.backfill_channel(&session.auth, channel, &mut report).await {
                warn!(channel = %channel.display_name(), error = %e, "Skipping channel");
                report.channels_failed += 1;
            }
        }

        self.sink
            .refresh()
            .await
            .context("Failed to refresh index after backfill")?;

        info!("Backfill complete: {}", report);
        Ok(report)
    }

    async fn backfill_channel(
        &self,
        auth: &RestAuth,
        channel: &Channel,
        report: &mut BackfillReport,
    ) -> Result<()> {
        let name = channel.display_name();
        let messages = self
            .history
            .channel_messages(auth, &channel.id, self.page_size)
            .await?;
        info!(channel = %name, "{} messages", messages.len());

        for message in &messages {
            let Some(document) = IndexDocument::from_indexable(message, Some(name), self.root_url)
            else {
                report.skipped += 1;
                continue;
            };

            match self.sink.upsert(&document).await {
                Ok(()) => report.indexed += 1,
                Err(e) => {
                    warn!(
                        message_id = %document.message_id,
                        channel = %name,
                        error = %e,
                        "Failed to index message"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(())
    }
}
