use anyhow::Result;
use clap::{ArgAction, Args, ValueEnum};
use std::fmt;
use std::time::Duration;

/// Delay unit for reconnection backoff. Attempt `n` waits `n` times this.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
/// Consecutive connection attempts allowed before the sync engine gives up.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 10;
/// Search engine readiness polling budget.
pub const READY_POLL_ATTEMPTS: u32 = 30;
pub const READY_POLL_DELAY: Duration = Duration::from_secs(2);
/// How often the query layer re-checks search engine health.
pub const HEALTH_RECHECK_INTERVAL: Duration = Duration::from_secs(60);
/// How long shutdown waits for the transport to close before exiting anyway.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Settings shared by every subcommand. Each one can come from a flag or
/// from its environment variable (a `.env` file is loaded first).
#[derive(Debug, Clone, Args)]
pub struct Config {
    #[command(flatten)]
    pub rocketchat: RocketChatConfig,

    #[command(flatten)]
    pub search: SearchConfig,

    /// Public root URL used to build message deep links.
    #[arg(long, global = true, env = "ROOT_URL", default_value = "http://localhost:3000")]
    pub root_url: String,

    /// Concurrent index writers used by the sync engine.
    #[arg(
        long,
        global = true,
        env = "SYNC_INDEX_LANES",
        default_value_t = 4,
        value_parser = parse_lanes
    )]
    pub index_lanes: usize,
}

#[derive(Clone, Args)]
pub struct RocketChatConfig {
    /// DDP WebSocket endpoint.
    #[arg(
        long = "rocketchat-ws-url",
        global = true,
        env = "ROCKETCHAT_WS_URL",
        default_value = "ws://rocketchat:3000/websocket"
    )]
    pub ws_url: String,

    /// REST base URL.
    #[arg(
        id = "rocketchat-url", long = "rocketchat-url",
        global = true,
        env = "ROCKETCHAT_URL",
        default_value = "http://rocketchat:3000"
    )]
    pub url: String,

    #[arg(id = "rocketchat-user", long = "rocketchat-user", global = true, env = "ROCKETCHAT_USER")]
    pub user: Option<String>,

    #[arg(
        id = "rocketchat-password", long = "rocketchat-password",
        global = true,
        env = "ROCKETCHAT_PASSWORD",
        hide_env_values = true
    )]
    pub password: Option<String>,
}

impl fmt::Debug for RocketChatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocketChatConfig")
            .field("ws_url", &self.ws_url)
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Args)]
pub struct SearchConfig {
    #[arg(
        id = "opensearch-url", long = "opensearch-url",
        global = true,
        env = "OPENSEARCH_URL",
        default_value = "http://opensearch:9200"
    )]
    pub url: String,

    #[arg(
        long = "opensearch-index",
        global = true,
        env = "OPENSEARCH_INDEX",
        default_value = "rocketchat_messages"
    )]
    pub index: String,

    /// Basic auth user, only sent to https engines.
    #[arg(id = "opensearch-user", long = "opensearch-user", global = true, env = "OPENSEARCH_USER")]
    pub user: Option<String>,

    #[arg(
        id = "opensearch-password", long = "opensearch-password",
        global = true,
        env = "OPENSEARCH_PASSWORD",
        hide_env_values = true
    )]
    pub password: Option<String>,

    /// Verify the engine's TLS certificate.
    #[arg(
        long = "opensearch-tls-verify",
        global = true,
        env = "OPENSEARCH_TLS_VERIFY",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub tls_verify: bool,

    /// Text analysis applied to the searchable fields when the index is created.
    #[arg(
        long = "search-analyzer",
        global = true,
        env = "SEARCH_ANALYZER",
        value_enum,
        ignore_case = true,
        default_value = "standard"
    )]
    pub analyzer: AnalyzerProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AnalyzerProfile {
    Standard,
    /// Nori-based analysis for Korean text.
    #[value(alias = "nori")]
    Korean,
}

impl Config {
    /// Chat credentials, required by the sync engine and the backfill job.
    pub fn credentials(&self) -> Result<Credentials> {
        match (&self.rocketchat.user, &self.rocketchat.password) {
            (Some(username), Some(password)) => Ok(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => anyhow::bail!(
                "ROCKETCHAT_USER and ROCKETCHAT_PASSWORD are required \
                 (set them in .env after creating the sync account)"
            ),
        }
    }
}

fn parse_lanes(raw: &str) -> Result<usize, String> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err("must be > 0".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}
