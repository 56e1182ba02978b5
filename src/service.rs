//! The surface exposed to the serving layer.
//!
//! [`PulseGraph`] wires the freshness policy, refresh orchestrator and
//! comparison reader over one merge engine, and adds the composed
//! [`snapshot`](PulseGraph::snapshot) flow used to answer a question about a
//! subject: resolve periods, check freshness, refresh if allowed, compare.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::comparison::{ComparisonReader, ComparisonResult};
use crate::config::PulseConfig;
use crate::error::{PulseError, PulseResult};
use crate::freshness::{FreshnessPolicy, FreshnessReport};
use crate::graph::{GraphMergeEngine, SubjectRef, WindowRef};
use crate::period::Period;
use crate::refresh::{FactExtractor, QueryGenerator, RefreshOrchestrator, RefreshResult, SourceFetcher};
use crate::registry::{EventType, SignalType, SourceCategory};
use crate::storage::GraphStore;

/// The external collaborators a refresh needs.
#[derive(Clone)]
pub struct Collaborators {
    /// Builds the search plan per category.
    pub queries: Arc<dyn QueryGenerator>,
    /// Discovers and fetches documents.
    pub fetcher: Arc<dyn SourceFetcher>,
    /// Turns documents into drafts.
    pub extractor: Arc<dyn FactExtractor>,
}

/// Input to [`PulseGraph::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Subject natural key, such as a ticker.
    pub subject: String,
    /// Latest period; defaults to the current quarter.
    #[serde(default)]
    pub period_a: Option<Period>,
    /// Comparison period; defaults to the quarter before `period_a`.
    #[serde(default)]
    pub period_b: Option<Period>,
    /// Event the windows are scoped to.
    #[serde(default)]
    pub event_type: EventType,
    /// Metric compared across the two periods.
    pub metric_type: SignalType,
    /// Categories whose freshness is checked; empty means news only.
    #[serde(default)]
    pub categories: Vec<SourceCategory>,
    /// Refresh stale categories of `period_a` before comparing.
    #[serde(default)]
    pub auto_refresh: bool,
}

impl SnapshotRequest {
    /// Request for the default periods, news only, without refresh.
    #[must_use]
    pub fn new(subject: impl Into<String>, metric_type: SignalType) -> Self {
        Self {
            subject: subject.into(),
            period_a: None,
            period_b: None,
            event_type: EventType::default(),
            metric_type,
            categories: Vec::new(),
            auto_refresh: false,
        }
    }

    /// Compares explicit periods.
    #[must_use]
    pub const fn with_periods(mut self, period_a: Period, period_b: Period) -> Self {
        self.period_a = Some(period_a);
        self.period_b = Some(period_b);
        self
    }

    /// Categories whose freshness is checked.
    #[must_use]
    pub fn with_categories(mut self, categories: impl IntoIterator<Item = SourceCategory>) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    /// Refresh stale categories of `period_a` first.
    #[must_use]
    pub const fn auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }
}

/// Best-available answer for a subject across two periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Facts and metrics for both periods.
    pub comparison: ComparisonResult,
    /// Freshness of `period_a` before any refresh.
    pub freshness_a: FreshnessReport,
    /// Freshness of `period_b`.
    pub freshness_b: FreshnessReport,
    /// Result of the refresh, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<RefreshResult>,
    /// Why an attempted refresh produced no result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_error: Option<String>,
}

/// Freshness-aware knowledge graph core.
pub struct PulseGraph {
    engine: GraphMergeEngine,
    policy: FreshnessPolicy,
    orchestrator: RefreshOrchestrator,
    reader: ComparisonReader,
}

impl PulseGraph {
    /// Builds the core over `store`.
    ///
    /// # Errors
    ///
    /// `PulseError::Config` if `config` does not validate.
    pub fn new(
        store: Arc<dyn GraphStore>,
        collaborators: Collaborators,
        config: PulseConfig,
    ) -> PulseResult<Self> {
        config.validate()?;
        let engine = GraphMergeEngine::new(store, config.merge);
        let orchestrator = RefreshOrchestrator::new(
            engine.clone(),
            collaborators.queries,
            collaborators.fetcher,
            collaborators.extractor,
            config.refresh.clone(),
        );
        Ok(Self {
            policy: FreshnessPolicy::from_config(&config.freshness),
            reader: ComparisonReader::new(engine.clone(), config.comparison.fact_limit),
            orchestrator,
            engine,
        })
    }

    /// The merge engine.
    #[must_use]
    pub const fn engine(&self) -> &GraphMergeEngine {
        &self.engine
    }

    /// The freshness policy.
    #[must_use]
    pub const fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    /// The refresh orchestrator.
    #[must_use]
    pub const fn orchestrator(&self) -> &RefreshOrchestrator {
        &self.orchestrator
    }

    /// Creates a subject or updates its display name.
    ///
    /// # Errors
    ///
    /// `ValidationError` for a blank identifier; store errors.
    pub async fn register_subject(&self, identifier: &str, display_name: &str) -> PulseResult<SubjectRef> {
        self.engine.upsert_subject(identifier, display_name).await
    }

    async fn ensure_window(
        &self,
        subject: &str,
        period: Period,
        event_type: EventType,
    ) -> PulseResult<WindowRef> {
        let subject_ref = match self.engine.find_subject(subject).await? {
            Some(existing) => existing,
            None => self.engine.upsert_subject(subject, subject).await?,
        };
        self.engine.upsert_window(&subject_ref, period, event_type).await
    }

    /// Freshness of `categories` for one window. Never writes.
    ///
    /// Unknown subjects and windows report every category as `Unknown`.
    ///
    /// # Errors
    ///
    /// `ValidationError` for a blank subject; store errors.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn check_freshness(
        &self,
        subject: &str,
        period: Period,
        event_type: EventType,
        categories: &[SourceCategory],
    ) -> PulseResult<FreshnessReport> {
        let window = match self.engine.find_subject(subject).await? {
            Some(subject_ref) => self.engine.find_window(&subject_ref, period, event_type).await?,
            None => None,
        };
        let latest = match window {
            Some(window) => self.engine.latest_fetches(&window, categories).await?,
            None => categories.iter().map(|c| (c.clone(), None)).collect(),
        };
        Ok(self.policy.evaluate(&latest, Utc::now()))
    }

    /// Refreshes `categories` of one window, creating subject and window as needed.
    ///
    /// # Errors
    ///
    /// See [`RefreshOrchestrator::refresh`].
    #[tracing::instrument(level = "debug", skip(self, cancel))]
    pub async fn refresh(
        &self,
        subject: &str,
        period: Period,
        event_type: EventType,
        categories: &[SourceCategory],
        cancel: &CancellationToken,
    ) -> PulseResult<RefreshResult> {
        let window = self.ensure_window(subject, period, event_type).await?;
        self.orchestrator.refresh(&window, categories, cancel).await
    }

    /// Compares `subject` between two periods. Never refreshes.
    ///
    /// # Errors
    ///
    /// See [`ComparisonReader::compare`].
    pub async fn compare(
        &self,
        subject: &str,
        period_a: Period,
        period_b: Period,
        metric_type: SignalType,
    ) -> PulseResult<ComparisonResult> {
        self.reader.compare(subject, period_a, period_b, metric_type).await
    }

    /// The composed read path.
    ///
    /// Refresh failures do not fail the snapshot; the caller gets whatever
    /// data exists together with the reason the refresh did not complete.
    ///
    /// # Errors
    ///
    /// Validation and store errors.
    #[tracing::instrument(level = "debug", skip(self, request, cancel), fields(subject = %request.subject))]
    pub async fn snapshot(
        &self,
        request: &SnapshotRequest,
        cancel: &CancellationToken,
    ) -> PulseResult<Snapshot> {
        let (default_a, _) = Period::default_pair(Utc::now());
        let period_a = request.period_a.unwrap_or(default_a);
        let period_b = request.period_b.unwrap_or_else(|| period_a.predecessor());
        let categories = if request.categories.is_empty() {
            vec![SourceCategory::News]
        } else {
            request.categories.clone()
        };

        let freshness_a = self
            .check_freshness(&request.subject, period_a, request.event_type, &categories)
            .await?;
        let freshness_b = self
            .check_freshness(&request.subject, period_b, request.event_type, &categories)
            .await?;

        let mut refresh = None;
        let mut refresh_error = None;
        if request.auto_refresh && freshness_a.needs_refresh() {
            let stale = freshness_a.stale_categories();
            match self
                .refresh(&request.subject, period_a, request.event_type, &stale, cancel)
                .await
            {
                Ok(result) => refresh = Some(result),
                Err(PulseError::Refresh(err)) => {
                    tracing::warn!(error = %err, "refresh did not complete, serving existing data");
                    refresh_error = Some(err.to_string());
                }
                Err(other) => return Err(other),
            }
        }

        let comparison = self
            .compare(&request.subject, period_a, period_b, request.metric_type)
            .await?;
        Ok(Snapshot {
            comparison,
            freshness_a,
            freshness_b,
            refresh,
            refresh_error,
        })
    }
}

impl std::fmt::Debug for PulseGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseGraph")
            .field("engine", &self.engine)
            .field("policy", &self.policy)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}
