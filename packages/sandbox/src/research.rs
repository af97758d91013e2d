// ABOUTME: Research tool client returning reference documents for a query
// ABOUTME: HTTP implementation talks to a retrieval service; a disabled variant reports misconfiguration

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("Research tool is not configured (set KNAPSACK_RESEARCH_URL)")]
    NotConfigured,

    #[error("Research request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Research service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid research query: {0}")]
    InvalidQuery(String),
}

impl ResearchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured => "research_not_configured",
            Self::Request(_) | Self::Status { .. } => "research_failed",
            Self::InvalidQuery(_) => "invalid_query",
        }
    }
}

/// Looks up documentation relevant to a query
#[async_trait]
pub trait ResearchClient: Send + Sync {
    /// Return up to `n_documents` text documents, most relevant first
    async fn research(&self, query: &str, n_documents: usize)
        -> Result<Vec<String>, ResearchError>;
}

#[derive(Debug, Serialize)]
struct ResearchRequest<'a> {
    query: &'a str,
    top_k: usize,
    namespace: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResearchResponse {
    documents: Vec<String>,
}

pub struct HttpResearchClient {
    client: Client,
    url: String,
    namespace: String,
}

impl HttpResearchClient {
    pub fn new(
        url: impl Into<String>,
        namespace: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ResearchError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            namespace: namespace.into(),
        })
    }
}

#[async_trait]
impl ResearchClient for HttpResearchClient {
    async fn research(
        &self,
        query: &str,
        n_documents: usize,
    ) -> Result<Vec<String>, ResearchError> {
        if query.trim().is_empty() {
            return Err(ResearchError::InvalidQuery("query is empty".to_string()));
        }
        if n_documents == 0 {
            return Err(ResearchError::InvalidQuery(
                "n_documents must be greater than zero".to_string(),
            ));
        }

        debug!("Research query (top_k={}): {}", n_documents, query);

        let response = self
            .client
            .post(&self.url)
            .json(&ResearchRequest {
                query,
                top_k: n_documents,
                namespace: &self.namespace,
            })
            .send()
            .await
            .map_err(|e| {
                error!("Research request failed: {}", e);
                ResearchError::Request(e)
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Research service error: {} - {}", status, body);
            return Err(ResearchError::Status { status, body });
        }

        let mut parsed: ResearchResponse = response.json().await?;
        parsed.documents.truncate(n_documents);
        Ok(parsed.documents)
    }
}

/// Stand-in used when no research service is configured
pub struct DisabledResearch;

#[async_trait]
impl ResearchClient for DisabledResearch {
    async fn research(
        &self,
        _query: &str,
        _n_documents: usize,
    ) -> Result<Vec<String>, ResearchError> {
        Err(ResearchError::NotConfigured)
    }
}
