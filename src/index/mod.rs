//! OpenSearch-backed message index.
//!
//! Writes are keyed by message id, so redelivered or replayed messages
//! overwrite their earlier version instead of piling up duplicates. Schema
//! creation tolerates losing a creation race against another process.

#[cfg(test)]
pub(crate) mod memory;
pub mod query;
pub mod schema;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AnalyzerProfile, SearchConfig};
use crate::document::IndexDocument;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search engine request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("search engine returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid search engine URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IndexError {
    /// True when index creation lost a race with another writer.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            IndexError::Status { status: 400, body }
                if body.contains("resource_already_exists_exception")
        )
    }

    /// True when the engine itself failed to answer, as opposed to a reply
    /// we could not decode.
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, IndexError::Transport(_) | IndexError::Status { .. })
    }
}

/// Destination for mapped documents.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Write-or-overwrite the document under its message id.
    async fn upsert(&self, document: &IndexDocument) -> Result<(), IndexError>;

    /// Make previously written documents searchable.
    async fn refresh(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    Existing,
    Created,
    /// Another process created the index between our check and our create.
    CreatedConcurrently,
}

#[derive(Debug, Deserialize)]
pub struct ClusterHealth {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    pub hits: SearchHits,
    #[serde(default)]
    pub aggregations: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct SearchHits {
    #[serde(default)]
    pub total: Option<HitTotal>,
    #[serde(default)]
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
pub struct HitTotal {
    pub value: u64,
}

#[derive(Debug, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_score", default)]
    pub score: Option<f64>,
    #[serde(rename = "_source")]
    pub source: IndexDocument,
    #[serde(default)]
    pub highlight: HashMap<String, Vec<String>>,
}

impl SearchResponse {
    pub fn total(&self) -> u64 {
        self.hits
            .total
            .as_ref()
            .map(|t| t.value)
            .unwrap_or(self.hits.hits.len() as u64)
    }
}

impl SearchHit {
    /// First highlighted fragment of the message text.
    pub fn text_highlight(&self) -> Option<&str> {
        self.highlight
            .get("text")
            .and_then(|fragments| fragments.first())
            .map(String::as_str)
    }
}

/// Thin client over the search engine's HTTP API, bound to one index.
#[derive(Clone)]
pub struct IndexGateway {
    http: reqwest::Client,
    base: Url,
    index: String,
    basic_auth: Option<(String, Option<String>)>,
    analyzer: AnalyzerProfile,
}

impl IndexGateway {
    pub fn new(config: &SearchConfig) -> Result<Self, IndexError> {
        let base = Url::parse(&config.url)
            .map_err(|e| IndexError::InvalidUrl(format!("{}: {}", config.url, e)))?;
        let https = base.scheme() == "https";

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10));
        if https {
            builder = builder.danger_accept_invalid_certs(!config.tls_verify);
        }

        // Credentials are only sent over TLS.
        let basic_auth = match (&config.user, https) {
            (Some(user), true) => Some((user.clone(), config.password.clone())),
            _ => None,
        };

        Ok(Self {
            http: builder.build()?,
            base,
            index: config.index.clone(),
            basic_auth,
            analyzer: config.analyzer,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn url(&self, segments: &[&str]) -> Result<Url, IndexError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| IndexError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.basic_auth {
            Some((user, password)) => builder.basic_auth(user, password.as_deref()),
            None => builder,
        }
    }

    pub async fn health(&self) -> Result<ClusterHealth, IndexError> {
        let url = self.url(&["_cluster", "health"])?;
        let response = check(self.request(Method::GET, url).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Poll cluster health until it answers, giving up after `attempts` tries.
    pub async fn wait_until_ready(&self, attempts: u32, delay: Duration) -> anyhow::Result<()> {
        for attempt in 1..=attempts {
            match self.health().await {
                Ok(health) => {
                    info!(status = %health.status, "Search engine is ready");
                    return Ok(());
                }
                Err(e) => {
                    info!(attempt, attempts, error = %e, "Waiting for search engine...");
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        anyhow::bail!(
            "Search engine at {} not available after {} attempts",
            self.base,
            attempts
        )
    }

    pub async fn index_exists(&self) -> Result<bool, IndexError> {
        let url = self.url(&[self.index.as_str()])?;
        let response = self.request(Method::HEAD, url).send().await?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(IndexError::Status {
                status,
                body: String::new(),
            }),
        }
    }

    /// Create the index with its field mapping unless it already exists.
    pub async fn ensure_schema(&self) -> Result<SchemaStatus, IndexError> {
        if self.index_exists().await? {
            info!(index = %self.index, "Index exists");
            return Ok(SchemaStatus::Existing);
        }

        info!(index = %self.index, analyzer = ?self.analyzer, "Creating index");
        let url = self.url(&[self.index.as_str()])?;
        let body = schema::index_definition(self.analyzer);
        let result = match self.request(Method::PUT, url).json(&body).send().await {
            Ok(response) => check(response).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(_) => {
                info!(index = %self.index, "Index created");
                Ok(SchemaStatus::Created)
            }
            Err(e) if e.is_already_exists() => {
                info!(index = %self.index, "Index was created concurrently");
                Ok(SchemaStatus::CreatedConcurrently)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn search(&self, body: &Value) -> Result<SearchResponse, IndexError> {
        let url = self.url(&[self.index.as_str(), "_search"])?;
        let response = check(self.request(Method::POST, url).json(body).send().await?).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl DocumentSink for IndexGateway {
    async fn upsert(&self, document: &IndexDocument) -> Result<(), IndexError> {
        let url = self.url(&[self.index.as_str(), "_doc", document.message_id.as_str()])?;
        check(self.request(Method::PUT, url).json(document).send().await?).await?;
        Ok(())
    }

    async fn refresh(&self) -> Result<(), IndexError> {
        let url = self.url(&[self.index.as_str(), "_refresh"])?;
        check(self.request(Method::POST, url).send().await?).await?;
        Ok(())
    }
}

async fn check(response: Response) -> Result<Response, IndexError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        warn!(status = status.as_u16(), "Search engine server error");
    }
    Err(IndexError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Build a gateway or fail with context suitable for start-up errors.
pub fn connect(config: &SearchConfig) -> anyhow::Result<IndexGateway> {
    IndexGateway::new(config)
        .with_context(|| format!("Failed to configure search client for {}", config.url))
}
