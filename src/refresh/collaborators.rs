//! Collaborator contracts consumed by the refresh pipeline.
//!
//! Query generation, discovery/fetch and extraction live outside this crate;
//! only their data contracts are defined here. [`TemplateQueryGenerator`] is a
//! deterministic generator usable without any model behind it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExtractionError, FetchError, GenerationError};
use crate::graph::{Subject, WindowRef};
use crate::registry::{EventType, SignalType, SourceCategory};

/// Alternatives beyond this are dropped.
pub const MAX_ALTERNATIVE_QUERIES: usize = 3;
/// Keywords beyond this are dropped.
pub const MAX_KEYWORDS: usize = 10;

/// A search plan for one category of one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Main search string.
    pub primary_query: String,
    /// Fallback phrasings, at most [`MAX_ALTERNATIVE_QUERIES`].
    #[serde(default)]
    pub alternative_queries: Vec<String>,
    /// Terms that should appear in results, at most [`MAX_KEYWORDS`].
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Generator's explanation, kept for logs.
    #[serde(default)]
    pub reasoning: String,
    /// Upper bound on discovered origins; `None` defers to configuration.
    #[serde(default)]
    pub max_results: Option<usize>,
}

impl QuerySpec {
    /// A plan with only a primary query.
    #[must_use]
    pub fn new(primary_query: impl Into<String>) -> Self {
        Self {
            primary_query: primary_query.into(),
            alternative_queries: Vec::new(),
            keywords: Vec::new(),
            reasoning: String::new(),
            max_results: None,
        }
    }

    /// Trims fields, drops blanks, and caps alternatives and keywords.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::InvalidSpec` when the primary query is blank.
    pub fn normalized(mut self) -> Result<Self, GenerationError> {
        self.primary_query = self.primary_query.trim().to_string();
        if self.primary_query.is_empty() {
            return Err(GenerationError::InvalidSpec {
                reason: "primary query is empty".to_string(),
            });
        }
        let clean = |items: Vec<String>, cap: usize| -> Vec<String> {
            items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .take(cap)
                .collect()
        };
        self.alternative_queries = clean(self.alternative_queries, MAX_ALTERNATIVE_QUERIES);
        self.keywords = clean(self.keywords, MAX_KEYWORDS);
        self.reasoning = self.reasoning.trim().to_string();
        Ok(self)
    }
}

/// A candidate origin returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRef {
    /// URL or other fetchable locator.
    pub locator: String,
    /// 1-based position in the discovery results.
    pub rank: usize,
    /// Title shown by discovery, if any.
    #[serde(default)]
    pub title: Option<String>,
    /// Discovery snippet, if any.
    #[serde(default)]
    pub snippet: Option<String>,
}

impl OriginRef {
    /// An origin with no title or snippet.
    #[must_use]
    pub fn new(locator: impl Into<String>, rank: usize) -> Self {
        Self {
            locator: locator.into(),
            rank,
            title: None,
            snippet: None,
        }
    }
}

/// Fetched content, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    /// Where the body came from.
    pub origin: OriginRef,
    /// Unprocessed body.
    pub body: String,
    /// Document title reported by the fetcher.
    pub title: Option<String>,
    /// When the fetch completed.
    pub fetched_at: DateTime<Utc>,
    /// Fetcher-specific headers or tags.
    pub metadata: BTreeMap<String, String>,
}

impl RawDocument {
    /// A document with no title or metadata.
    #[must_use]
    pub fn new(origin: OriginRef, body: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            origin,
            body: body.into(),
            title: None,
            fetched_at,
            metadata: BTreeMap::new(),
        }
    }
}

/// Content ready for extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDocument {
    /// Where the text came from.
    pub origin: OriginRef,
    /// Title carried over from the raw document.
    pub title: Option<String>,
    /// Single-line prose within the configured bounds.
    pub text: String,
    /// When the fetch completed.
    pub fetched_at: DateTime<Utc>,
    /// Set when the body exceeded the configured maximum.
    pub truncated: bool,
}

/// A claim proposed by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactDraft {
    /// Claim text as written by the extractor.
    pub text: String,
    /// Extractor confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// Optional claim classification, such as `financial`.
    #[serde(default)]
    pub claim_type: Option<String>,
}

impl FactDraft {
    /// A draft with no claim type.
    #[must_use]
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence,
            claim_type: None,
        }
    }

    /// Sets the claim type.
    #[must_use]
    pub fn with_claim_type(mut self, claim_type: impl Into<String>) -> Self {
        self.claim_type = Some(claim_type.into());
        self
    }
}

/// A signal value proposed by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDraft {
    /// Signal being measured.
    pub metric_type: SignalType,
    /// Measured value, checked against the signal's range.
    pub value: f64,
    /// Number of observations behind the value.
    pub volume: u64,
    /// Defaults to the merge time when absent.
    #[serde(default)]
    pub computed_at: Option<DateTime<Utc>>,
}

/// One extractor output item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractedItem {
    /// A proposed claim.
    Fact(FactDraft),
    /// A proposed signal value.
    Metric(MetricDraft),
}

/// Produces a search plan for one category of a window.
#[async_trait]
pub trait QueryGenerator: Send + Sync {
    /// The plan for `category` of `window`.
    async fn generate_query(
        &self,
        subject: &Subject,
        window: &WindowRef,
        category: &SourceCategory,
    ) -> Result<QuerySpec, GenerationError>;
}

/// Discovers and fetches origins.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Candidate origins for `query`, best first.
    async fn discover(
        &self,
        query: &QuerySpec,
        category: &SourceCategory,
    ) -> Result<Vec<OriginRef>, FetchError>;

    /// Retrieves the body at `origin`.
    async fn fetch(&self, origin: &OriginRef) -> Result<RawDocument, FetchError>;
}

/// Extracts structured items from a normalized document.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    /// An empty result is valid and not an error.
    async fn extract(
        &self,
        document: &NormalizedDocument,
        window: &WindowRef,
    ) -> Result<Vec<ExtractedItem>, ExtractionError>;
}

/// Builds queries from fixed per-event-type templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateQueryGenerator;

impl TemplateQueryGenerator {
    /// The query text for `subject` in `window`.
    #[must_use]
    pub fn build(subject: &Subject, window: &WindowRef, category: &SourceCategory) -> QuerySpec {
        let name = subject.display_name.as_str();
        let period = window.period;
        let primary = match window.event_type {
            EventType::Earnings => format!("{name} {period} earnings results revenue EPS guidance"),
            EventType::ProductLaunch => format!("{name} {period} product launch announcement"),
            EventType::Acquisition => format!("{name} {period} acquisition merger deal"),
            EventType::Regulatory => format!("{name} {period} SEC filing regulatory disclosure"),
            EventType::Conference => format!("{name} {period} earnings call investor conference"),
            other => format!("{name} {period} {}", other.metadata().display_name.to_lowercase()),
        };
        let primary = match category {
            SourceCategory::News => primary,
            SourceCategory::Filing => format!("{primary} 10-Q 8-K"),
            other => format!("{primary} {other}"),
        };

        QuerySpec {
            primary_query: primary,
            alternative_queries: Vec::new(),
            keywords: vec![
                name.to_string(),
                period.to_string(),
                window.event_type.to_string(),
            ],
            reasoning: format!("template query for {} sources", category),
            max_results: None,
        }
    }
}

#[async_trait]
impl QueryGenerator for TemplateQueryGenerator {
    async fn generate_query(
        &self,
        subject: &Subject,
        window: &WindowRef,
        category: &SourceCategory,
    ) -> Result<QuerySpec, GenerationError> {
        Ok(Self::build(subject, window, category))
    }
}
