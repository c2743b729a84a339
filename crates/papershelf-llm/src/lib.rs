use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod mock;
pub mod normalize;

// Re-export for convenience
pub use client::{LlmClient, ManagedConfig};
pub use normalize::{extract_json_object, parse_comparison, parse_summary};

/// The content of a paper handed to the analysis backend: either raw
/// bytes from a fresh upload, or a server-relative reference to an
/// already-persisted file that must be fetched before encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperContent {
    Bytes(Vec<u8>),
    Reference(String),
}

impl PaperContent {
    pub fn is_reference(&self) -> bool {
        matches!(self, PaperContent::Reference(_))
    }

    pub fn size(&self) -> usize {
        match self {
            PaperContent::Bytes(b) => b.len(),
            PaperContent::Reference(_) => 0,
        }
    }
}

/// Structured summary extracted from a paper. Only `title` is mandatory;
/// normalization fills whatever canonical fields the model produced and
/// routes unmatched keys into `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub title: String,
    #[serde(default)]
    pub authors: Option<String>,
    #[serde(default)]
    pub publication: Option<String>,
    #[serde(default)]
    pub problem: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub contributions: Option<String>,
    #[serde(default)]
    pub results: Option<String>,
    #[serde(default)]
    pub limitations: Option<String>,
    #[serde(default)]
    pub keywords: Option<String>,
    /// Normalized keys with no canonical slot, keyed by their raw name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl AnalysisSummary {
    /// Minimal summary with just a title. Used by tests and mocks.
    pub fn with_title(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// One row of a multi-paper comparison, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub title: String,
    pub strengths: String,
    pub weaknesses: String,
}

/// Result of comparing N already-analyzed papers: a prose summary plus
/// one row per input paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub summary: String,
    pub rows: Vec<ComparisonRow>,
}

/// Request mode for an analysis call.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisSettings {
    /// First-party endpoint using the server-supplied credential held by
    /// the client. Timeout is the client's configured managed bound.
    Managed,
    /// User-supplied OpenAI-compatible endpoint.
    External(ExternalSettings),
}

/// Connection settings for external mode, all user-supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalSettings {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

/// Classified analysis failure, surfaced verbatim as the record's error
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("API credential is missing")]
    CredentialMissing,
    #[error("could not fetch stored file: {0}")]
    FetchFailed(String),
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("request timed out")]
    Timeout,
    #[error("unusable model response: {0}")]
    MalformedResponse(String),
    #[error("rate limited by the model provider")]
    RateLimited,
    #[error("model service unavailable (HTTP {0})")]
    UpstreamUnavailable(u16),
    #[error("request rejected by content safety filter")]
    ContentRejected,
    #[error("analysis failed: {0}")]
    Unclassified(String),
}

/// An analysis backend that can summarize one paper and compare several.
///
/// Object-safe so the queue and session hold it as `Arc<dyn AnalysisBackend>`;
/// [`mock::MockAnalysisBackend`] scripts it for tests.
#[async_trait::async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Summarize one paper. A `Reference` content is fetched before
    /// encoding; failures come back classified, never panicking.
    async fn analyze(
        &self,
        content: &PaperContent,
        settings: &AnalysisSettings,
    ) -> Result<AnalysisSummary, AnalysisError>;

    /// Compare N already-analyzed papers by their structured summaries.
    /// No file bytes are re-uploaded.
    async fn compare(
        &self,
        summaries: &[AnalysisSummary],
        settings: &AnalysisSettings,
    ) -> Result<ComparisonResult, AnalysisError>;
}
