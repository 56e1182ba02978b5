//! The refresh pipeline.
//!
//! One invocation refreshes a set of stale categories for one window. Each
//! category runs its own state machine under the in-flight guard; categories
//! run concurrently and never abort one another. Failures are caught at the
//! smallest unit (origin, document, category) and recorded in the result.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::RefreshConfig;
use crate::error::{
    ExtractionError, FetchError, GenerationError, PulseError, PulseResult, RefreshError,
};
use crate::graph::{GraphMergeEngine, Subject, WindowRef};
use crate::refresh::collaborators::{
    ExtractedItem, FactExtractor, NormalizedDocument, OriginRef, QueryGenerator, QuerySpec,
    RawDocument, SourceFetcher,
};
use crate::refresh::guard::{Admission, RefreshGuard, RefreshKey};
use crate::refresh::normalize::{normalize, NormalizeLimits};
use crate::refresh::outcome::{
    CategoryOutcome, RefreshIssue, RefreshResult, RefreshStage, RefreshState,
};
use crate::registry::SourceCategory;

#[derive(Debug, Default)]
struct DocumentMerge {
    facts: usize,
    metrics: usize,
    issues: Vec<RefreshIssue>,
}

/// Brings stale categories of a window up to date.
pub struct RefreshOrchestrator {
    engine: GraphMergeEngine,
    queries: Arc<dyn QueryGenerator>,
    fetcher: Arc<dyn SourceFetcher>,
    extractor: Arc<dyn FactExtractor>,
    guard: RefreshGuard,
    config: RefreshConfig,
}

impl RefreshOrchestrator {
    /// Wires the collaborators to `engine`. The guard is built from `config.guard`.
    #[must_use]
    pub fn new(
        engine: GraphMergeEngine,
        queries: Arc<dyn QueryGenerator>,
        fetcher: Arc<dyn SourceFetcher>,
        extractor: Arc<dyn FactExtractor>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            engine,
            queries,
            fetcher,
            extractor,
            guard: RefreshGuard::new(&config.guard),
            config,
        }
    }

    /// The in-flight lease table.
    #[must_use]
    pub const fn guard(&self) -> &RefreshGuard {
        &self.guard
    }

    /// Pipeline settings in effect.
    #[must_use]
    pub const fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Refreshes `categories` for `window`.
    ///
    /// An empty category set is a successful no-op.
    ///
    /// # Errors
    ///
    /// - `RefreshError::Blocked` if no category got past query generation
    /// - `RefreshError::InProgress` if every category is held elsewhere (reject mode)
    /// - `RefreshError::Cancelled` if `cancel` fired before any document was merged
    /// - store errors while reading the subject
    #[tracing::instrument(level = "debug", skip(self, window, cancel), fields(window = %window.key))]
    pub async fn refresh(
        &self,
        window: &WindowRef,
        categories: &[SourceCategory],
        cancel: &CancellationToken,
    ) -> PulseResult<RefreshResult> {
        let started_at = Utc::now();
        let requested: BTreeSet<SourceCategory> = categories.iter().cloned().collect();
        if requested.is_empty() {
            tracing::debug!("no stale categories, nothing to refresh");
            return Ok(Self::finish(window, started_at, BTreeMap::new(), Vec::new()));
        }
        if cancel.is_cancelled() {
            return Err(RefreshError::Cancelled.into());
        }

        let subject = self
            .engine
            .read_subject(&window.subject)
            .await?
            .map_or_else(
                || Subject {
                    identifier: window.subject.key.clone(),
                    display_name: window.subject.key.clone(),
                },
                |stored| stored.data,
            );

        let runs = join_all(
            requested
                .iter()
                .map(|category| self.run_category(&subject, window, category, cancel)),
        )
        .await;

        let mut outcomes = BTreeMap::new();
        let mut rejected = Vec::new();
        let mut rejection = None;
        for (category, run) in requested.into_iter().zip(runs) {
            match run {
                Ok(outcome) => {
                    outcomes.insert(category, outcome);
                }
                Err(RefreshError::InProgress { key }) => {
                    rejection.get_or_insert(key);
                    rejected.push(category);
                }
                Err(other) => return Err(other.into()),
            }
        }

        if outcomes.is_empty() {
            if let Some(key) = rejection {
                return Err(RefreshError::InProgress { key }.into());
            }
        }
        if outcomes
            .values()
            .all(|outcome| outcome.cancelled && outcome.ingested_sources == 0)
        {
            tracing::info!(subject = %window.subject.key, "refresh cancelled by caller");
            return Err(RefreshError::Cancelled.into());
        }
        if outcomes.values().all(CategoryOutcome::is_blocked) {
            let issues: Vec<RefreshIssue> = outcomes
                .values()
                .flat_map(|outcome| outcome.errors.iter().cloned())
                .collect();
            tracing::warn!(subject = %window.subject.key, issues = issues.len(), "refresh blocked");
            return Err(RefreshError::Blocked { issues }.into());
        }

        let result = Self::finish(window, started_at, outcomes, rejected);
        tracing::info!(
            subject = %result.subject,
            period = %result.period,
            status = ?result.status,
            sources = result.ingested_sources(),
            facts = result.ingested_facts(),
            metrics = result.ingested_metrics(),
            errors = result.error_count(),
            "refresh finished"
        );
        Ok(result)
    }

    fn finish(
        window: &WindowRef,
        started_at: DateTime<Utc>,
        categories: BTreeMap<SourceCategory, CategoryOutcome>,
        in_progress: Vec<SourceCategory>,
    ) -> RefreshResult {
        RefreshResult {
            subject: window.subject.key.clone(),
            window: window.key.clone(),
            period: window.period,
            event_type: window.event_type,
            status: RefreshResult::status_for(categories.values(), in_progress.len()),
            categories,
            in_progress,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_category(
        &self,
        subject: &Subject,
        window: &WindowRef,
        category: &SourceCategory,
        cancel: &CancellationToken,
    ) -> Result<CategoryOutcome, RefreshError> {
        let key = RefreshKey::new(window, category);
        loop {
            match self.guard.acquire(key.clone(), cancel).await {
                Ok(Admission::Lead(lease)) => {
                    let outcome = self.execute(subject, window, category, cancel).await;
                    lease.complete(&outcome);
                    return Ok(outcome);
                }
                // The holder's caller cancelled; this caller did not, so it runs the refresh itself.
                Ok(Admission::Joined(outcome)) if outcome.cancelled && !cancel.is_cancelled() => {
                    tracing::debug!(%category, "in-flight refresh was cancelled, taking over");
                    // The holder may not have released its slot yet.
                    tokio::task::yield_now().await;
                }
                Ok(Admission::Joined(mut outcome)) => {
                    tracing::debug!(%category, "joined in-flight refresh");
                    outcome.joined_in_flight = true;
                    return Ok(outcome);
                }
                Err(RefreshError::Cancelled) => {
                    let mut outcome = CategoryOutcome::new(category.clone());
                    outcome.cancel(RefreshStage::Querying);
                    return Ok(outcome);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn execute(
        &self,
        subject: &Subject,
        window: &WindowRef,
        category: &SourceCategory,
        cancel: &CancellationToken,
    ) -> CategoryOutcome {
        let mut outcome = CategoryOutcome::new(category.clone());

        outcome.advance(RefreshState::Querying);
        if cancel.is_cancelled() {
            outcome.cancel(RefreshStage::Querying);
            return outcome;
        }
        let query = match self.generate(subject, window, category).await {
            Ok(query) => query,
            Err(err) => {
                tracing::warn!(%category, error = %err, "query generation failed");
                outcome.fail(RefreshIssue::new(RefreshStage::Querying, err.to_string()));
                return outcome;
            }
        };
        outcome.query = Some(query.primary_query.clone());

        outcome.advance(RefreshState::Fetching);
        if cancel.is_cancelled() {
            outcome.cancel(RefreshStage::Fetching);
            return outcome;
        }
        let origins = match self.discover(&query, category).await {
            Ok(origins) => origins,
            Err(err) => {
                tracing::warn!(%category, error = %err, "discovery failed");
                outcome.fail(RefreshIssue::new(RefreshStage::Fetching, err.to_string()));
                return outcome;
            }
        };
        outcome.discovered = origins.len();
        let documents = self.fetch_all(origins, cancel, &mut outcome).await;
        if cancel.is_cancelled() {
            outcome.cancel(RefreshStage::Fetching);
            return outcome;
        }

        outcome.advance(RefreshState::Extracting);
        let extracted = self.extract_all(documents, window, cancel, &mut outcome).await;
        let cancelled_during_extraction = cancel.is_cancelled();

        // Extracted work is merged even after cancellation; only collaborator calls stop.
        outcome.advance(RefreshState::Merging);
        self.merge_all(window, category, extracted, &mut outcome).await;

        if outcome.is_failed() {
            return outcome;
        }
        if cancelled_during_extraction {
            outcome.cancel(RefreshStage::Extracting);
        } else {
            outcome.advance(RefreshState::Done);
        }
        outcome
    }

    async fn generate(
        &self,
        subject: &Subject,
        window: &WindowRef,
        category: &SourceCategory,
    ) -> Result<QuerySpec, GenerationError> {
        tokio::time::timeout(
            self.config.collaborator_timeout(),
            self.queries.generate_query(subject, window, category),
        )
        .await
        .unwrap_or_else(|_| {
            Err(GenerationError::Timeout {
                duration_ms: self.config.collaborator_timeout_ms,
            })
        })
        .and_then(QuerySpec::normalized)
    }

    async fn discover(
        &self,
        query: &QuerySpec,
        category: &SourceCategory,
    ) -> Result<Vec<OriginRef>, FetchError> {
        let discovered = tokio::time::timeout(
            self.config.collaborator_timeout(),
            self.fetcher.discover(query, category),
        )
        .await
        .unwrap_or_else(|_| {
            Err(FetchError::Timeout {
                duration_ms: self.config.collaborator_timeout_ms,
            })
        })?;

        let cap = query
            .max_results
            .map_or(self.config.max_origins, |max| max.min(self.config.max_origins));
        let mut seen = HashSet::new();
        Ok(discovered
            .into_iter()
            .filter(|origin| {
                let locator = origin.locator.trim();
                !locator.is_empty() && seen.insert(locator.to_string())
            })
            .take(cap)
            .collect())
    }

    async fn fetch_all(
        &self,
        origins: Vec<OriginRef>,
        cancel: &CancellationToken,
        outcome: &mut CategoryOutcome,
    ) -> Vec<RawDocument> {
        let limit = self.config.collaborator_timeout();
        let timeout_ms = self.config.collaborator_timeout_ms;
        let mut results: Vec<(OriginRef, Option<Result<RawDocument, FetchError>>)> =
            stream::iter(origins)
                .map(|origin| async move {
                    if cancel.is_cancelled() {
                        return (origin, None);
                    }
                    let fetched = tokio::time::timeout(limit, self.fetcher.fetch(&origin))
                        .await
                        .unwrap_or_else(|_| Err(FetchError::Timeout { duration_ms: timeout_ms }));
                    (origin, Some(fetched))
                })
                .buffer_unordered(self.config.fetch_concurrency.max(1))
                .collect()
                .await;
        results.sort_by_key(|(origin, _)| origin.rank);

        let mut documents = Vec::with_capacity(results.len());
        for (origin, fetched) in results {
            match fetched {
                Some(Ok(document)) => {
                    tracing::debug!(origin = %origin.locator, chars = document.body.len(), "fetched");
                    documents.push(document);
                }
                Some(Err(err)) => {
                    tracing::warn!(origin = %origin.locator, error = %err, "fetch failed, skipping");
                    outcome.record(RefreshIssue::at_origin(
                        RefreshStage::Fetching,
                        origin.locator,
                        err.to_string(),
                    ));
                }
                None => {}
            }
        }
        documents
    }

    async fn extract_all(
        &self,
        documents: Vec<RawDocument>,
        window: &WindowRef,
        cancel: &CancellationToken,
        outcome: &mut CategoryOutcome,
    ) -> Vec<(NormalizedDocument, Vec<ExtractedItem>)> {
        let limits = NormalizeLimits {
            min_chars: self.config.min_document_chars,
            max_chars: self.config.max_document_chars,
        };
        let mut normalized = Vec::with_capacity(documents.len());
        for raw in &documents {
            match normalize(raw, limits) {
                Ok(document) => normalized.push(document),
                Err(err) => {
                    tracing::warn!(origin = %raw.origin.locator, error = %err, "normalization failed, skipping");
                    outcome.record(RefreshIssue::at_origin(
                        RefreshStage::Extracting,
                        raw.origin.locator.clone(),
                        err.to_string(),
                    ));
                }
            }
        }

        let limit = self.config.collaborator_timeout();
        let timeout_ms = self.config.collaborator_timeout_ms;
        let mut results: Vec<(NormalizedDocument, Option<Result<Vec<ExtractedItem>, ExtractionError>>)> =
            stream::iter(normalized)
                .map(|document| async move {
                    if cancel.is_cancelled() {
                        return (document, None);
                    }
                    let extracted = tokio::time::timeout(limit, self.extractor.extract(&document, window))
                        .await
                        .unwrap_or_else(|_| Err(ExtractionError::Timeout { duration_ms: timeout_ms }));
                    (document, Some(extracted))
                })
                .buffer_unordered(self.config.extract_concurrency.max(1))
                .collect()
                .await;
        results.sort_by_key(|(document, _)| document.origin.rank);

        let mut extracted = Vec::with_capacity(results.len());
        for (document, items) in results {
            match items {
                Some(Ok(items)) => {
                    tracing::debug!(origin = %document.origin.locator, items = items.len(), "extracted");
                    extracted.push((document, items));
                }
                Some(Err(err)) => {
                    tracing::warn!(origin = %document.origin.locator, error = %err, "extraction failed, skipping");
                    outcome.record(RefreshIssue::at_origin(
                        RefreshStage::Extracting,
                        document.origin.locator,
                        err.to_string(),
                    ));
                }
                None => {}
            }
        }
        extracted
    }

    async fn merge_all(
        &self,
        window: &WindowRef,
        category: &SourceCategory,
        extracted: Vec<(NormalizedDocument, Vec<ExtractedItem>)>,
        outcome: &mut CategoryOutcome,
    ) {
        for (document, items) in extracted {
            match self.merge_with_retry(window, category, &document, &items).await {
                Ok(merged) => {
                    outcome.ingested_sources += 1;
                    outcome.ingested_facts += merged.facts;
                    outcome.ingested_metrics += merged.metrics;
                    for issue in merged.issues {
                        outcome.record(issue);
                    }
                }
                Err(err) => {
                    tracing::warn!(origin = %document.origin.locator, error = %err, "merge failed, abandoning category");
                    outcome.fail(RefreshIssue::at_origin(
                        RefreshStage::Merging,
                        document.origin.locator.clone(),
                        err.to_string(),
                    ));
                    return;
                }
            }
        }
    }

    async fn merge_with_retry(
        &self,
        window: &WindowRef,
        category: &SourceCategory,
        document: &NormalizedDocument,
        items: &[ExtractedItem],
    ) -> PulseResult<DocumentMerge> {
        let policy = self.config.merge_retry;
        let mut attempt = 1;
        loop {
            match self.merge_document(window, category, document, items).await {
                Ok(merged) => return Ok(merged),
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        origin = %document.origin.locator,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient store error while merging, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes one document and everything extracted from it.
    ///
    /// Upserts are idempotent, so a retry after a transient failure rewrites
    /// the same nodes. Invalid drafts are recorded and skipped.
    async fn merge_document(
        &self,
        window: &WindowRef,
        category: &SourceCategory,
        document: &NormalizedDocument,
        items: &[ExtractedItem],
    ) -> PulseResult<DocumentMerge> {
        let source = self
            .engine
            .upsert_source_record(
                &document.origin.locator,
                document.fetched_at,
                category,
                document.title.as_deref(),
                &document.text,
            )
            .await?;
        self.engine.link_source(&source, window).await?;

        let support = [source];
        let mut merged = DocumentMerge::default();
        for item in items {
            let written: Result<(), PulseError> = match item {
                ExtractedItem::Fact(draft) => self
                    .engine
                    .upsert_fact(
                        window,
                        &draft.text,
                        draft.confidence,
                        draft.claim_type.as_deref(),
                        &support,
                    )
                    .await
                    .map(|_| merged.facts += 1),
                ExtractedItem::Metric(draft) => self
                    .engine
                    .upsert_metric(
                        &window.subject,
                        window,
                        draft.metric_type,
                        draft.value,
                        draft.volume,
                        draft.computed_at.unwrap_or_else(Utc::now),
                    )
                    .await
                    .map(|_| merged.metrics += 1),
            };
            match written {
                Ok(()) => {}
                Err(err) if err.is_validation() => {
                    tracing::warn!(origin = %document.origin.locator, error = %err, "dropping invalid extracted item");
                    merged.issues.push(RefreshIssue::at_origin(
                        RefreshStage::Merging,
                        document.origin.locator.clone(),
                        err.to_string(),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(merged)
    }
}

impl std::fmt::Debug for RefreshOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshOrchestrator")
            .field("guard", &self.guard)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardMode, MergeConfig};
    use crate::period::Period;
    use crate::refresh::collaborators::{FactDraft, MetricDraft, TemplateQueryGenerator};
    use crate::registry::{EventType, SignalType};
    use crate::storage::{InMemoryGraphStore, NodeLabel};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const BODY: &str = "NVIDIA reported record data center revenue for the quarter, beating estimates.";

    /// Serves `origins` from discovery; locators containing "fail" error out.
    /// With `cancel_on_fetch` set, the first fetch cancels that token.
    struct FakeFetcher {
        origins: Vec<String>,
        fetches: AtomicUsize,
        cancel_on_fetch: Option<CancellationToken>,
    }

    impl FakeFetcher {
        fn new(origins: &[&str]) -> Self {
            Self {
                origins: origins.iter().map(|s| (*s).to_string()).collect(),
                fetches: AtomicUsize::new(0),
                cancel_on_fetch: None,
            }
        }

        fn cancelling(origins: &[&str], token: CancellationToken) -> Self {
            Self {
                cancel_on_fetch: Some(token),
                ..Self::new(origins)
            }
        }
    }

    #[async_trait]
    impl SourceFetcher for FakeFetcher {
        async fn discover(
            &self,
            _query: &QuerySpec,
            _category: &SourceCategory,
        ) -> Result<Vec<OriginRef>, FetchError> {
            Ok(self
                .origins
                .iter()
                .enumerate()
                .map(|(i, o)| OriginRef::new(o.clone(), i + 1))
                .collect())
        }

        async fn fetch(&self, origin: &OriginRef) -> Result<RawDocument, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_on_fetch {
                token.cancel();
            }
            if origin.locator.contains("fail") {
                return Err(FetchError::Unreachable {
                    message: "connection refused".to_string(),
                });
            }
            if origin.locator.contains("short") {
                return Ok(RawDocument::new(origin.clone(), "tiny", Utc::now()));
            }
            Ok(RawDocument::new(
                origin.clone(),
                format!("{BODY} Source {}.", origin.locator),
                Utc::now(),
            ))
        }
    }

    /// One fact per document (text shared across documents) plus one metric.
    /// With `cancel_on_extract` set, the first call cancels that token.
    #[derive(Default)]
    struct FakeExtractor {
        extra: Mutex<Vec<ExtractedItem>>,
        calls: AtomicUsize,
        cancel_on_extract: Option<CancellationToken>,
    }

    #[async_trait]
    impl FactExtractor for FakeExtractor {
        async fn extract(
            &self,
            _document: &NormalizedDocument,
            _window: &WindowRef,
        ) -> Result<Vec<ExtractedItem>, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_on_extract {
                token.cancel();
            }
            let mut items = vec![
                ExtractedItem::Fact(FactDraft::new("Data center revenue hit a record", 0.8)),
                ExtractedItem::Metric(MetricDraft {
                    metric_type: SignalType::Sentiment,
                    value: 0.6,
                    volume: 1,
                    computed_at: None,
                }),
            ];
            items.extend(self.extra.lock().unwrap().iter().cloned());
            Ok(items)
        }
    }

    struct FailingQueries;

    #[async_trait]
    impl QueryGenerator for FailingQueries {
        async fn generate_query(
            &self,
            _subject: &Subject,
            _window: &WindowRef,
            _category: &SourceCategory,
        ) -> Result<QuerySpec, GenerationError> {
            Err(GenerationError::Unavailable {
                message: "model offline".to_string(),
            })
        }
    }

    async fn setup(
        queries: Arc<dyn QueryGenerator>,
        fetcher: Arc<FakeFetcher>,
        extra: Vec<ExtractedItem>,
    ) -> (RefreshOrchestrator, GraphMergeEngine, WindowRef) {
        let extractor = Arc::new(FakeExtractor {
            extra: Mutex::new(extra),
            ..FakeExtractor::default()
        });
        setup_with(queries, fetcher, extractor, RefreshConfig::default()).await
    }

    async fn setup_with(
        queries: Arc<dyn QueryGenerator>,
        fetcher: Arc<FakeFetcher>,
        extractor: Arc<FakeExtractor>,
        config: RefreshConfig,
    ) -> (RefreshOrchestrator, GraphMergeEngine, WindowRef) {
        let store = Arc::new(InMemoryGraphStore::new());
        let engine = GraphMergeEngine::new(store, MergeConfig::default());
        let subject = engine.upsert_subject("NVDA", "NVIDIA").await.unwrap();
        let window = engine
            .upsert_window(&subject, Period::parse("Q3-2025").unwrap(), EventType::Earnings)
            .await
            .unwrap();
        let orchestrator = RefreshOrchestrator::new(engine.clone(), queries, fetcher, extractor, config);
        (orchestrator, engine, window)
    }

    #[tokio::test]
    async fn test_empty_categories_is_noop_success() {
        let fetcher = Arc::new(FakeFetcher::new(&["https://a.com/1"]));
        let (orchestrator, _, window) =
            setup(Arc::new(TemplateQueryGenerator), fetcher.clone(), Vec::new()).await;
        let result = orchestrator
            .refresh(&window, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, crate::refresh::RefreshStatus::Success);
        assert!(result.categories.is_empty());
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_full_success() {
        let fetcher = Arc::new(FakeFetcher::new(&["https://a.com/1", "https://a.com/2"]));
        let (orchestrator, engine, window) =
            setup(Arc::new(TemplateQueryGenerator), fetcher, Vec::new()).await;
        let result = orchestrator
            .refresh(&window, &[SourceCategory::News], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, crate::refresh::RefreshStatus::Success);
        let news = result.category(&SourceCategory::News).unwrap();
        assert_eq!(news.state, RefreshState::Done);
        assert_eq!(news.discovered, 2);
        assert_eq!(news.ingested_sources, 2);
        assert_eq!(news.ingested_facts, 2);
        assert_eq!(news.ingested_metrics, 2);
        assert!(news.query.as_deref().unwrap().contains("NVIDIA"));

        // Same fact text from two documents merges into one node with two supports.
        assert_eq!(engine.count(NodeLabel::Fact).await.unwrap(), 1);
        let facts = engine.read_facts(&window.subject, window.period).await.unwrap();
        assert_eq!(facts[0].supported_by.len(), 2);
        assert_eq!(orchestrator.guard().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_fetch_and_normalize_failures_are_skipped() {
        let fetcher = Arc::new(FakeFetcher::new(&[
            "https://a.com/1",
            "https://fail.com/2",
            "https://a.com/short",
        ]));
        let (orchestrator, _, window) =
            setup(Arc::new(TemplateQueryGenerator), fetcher, Vec::new()).await;
        let result = orchestrator
            .refresh(&window, &[SourceCategory::News], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, crate::refresh::RefreshStatus::Partial);
        let news = result.category(&SourceCategory::News).unwrap();
        assert_eq!(news.state, RefreshState::Done);
        assert_eq!(news.ingested_sources, 1);
        let stages: Vec<RefreshStage> = news.errors.iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![RefreshStage::Fetching, RefreshStage::Extracting]);
    }

    #[tokio::test]
    async fn test_invalid_draft_recorded_not_fatal() {
        let fetcher = Arc::new(FakeFetcher::new(&["https://a.com/1"]));
        let extra = vec![ExtractedItem::Fact(FactDraft::new("Overconfident", 1.7))];
        let (orchestrator, _, window) = setup(Arc::new(TemplateQueryGenerator), fetcher, extra).await;
        let result = orchestrator
            .refresh(&window, &[SourceCategory::News], &CancellationToken::new())
            .await
            .unwrap();
        let news = result.category(&SourceCategory::News).unwrap();
        assert_eq!(news.ingested_facts, 1);
        assert_eq!(news.errors.len(), 1);
        assert_eq!(news.errors[0].stage, RefreshStage::Merging);
    }

    #[tokio::test]
    async fn test_all_queries_failing_is_blocked() {
        let fetcher = Arc::new(FakeFetcher::new(&["https://a.com/1"]));
        let (orchestrator, engine, window) =
            setup(Arc::new(FailingQueries), fetcher.clone(), Vec::new()).await;
        let err = orchestrator
            .refresh(
                &window,
                &[SourceCategory::News, SourceCategory::Filing],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            PulseError::Refresh(RefreshError::Blocked { issues }) => assert_eq!(issues.len(), 2),
            other => panic!("expected blocked, got {other:?}"),
        }
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(engine.count(NodeLabel::Source).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fetcher = Arc::new(FakeFetcher::new(&["https://a.com/1"]));
        let (orchestrator, _, window) =
            setup(Arc::new(TemplateQueryGenerator), fetcher.clone(), Vec::new()).await;
        let token = CancellationToken::new();
        token.cancel();
        let err = orchestrator
            .refresh(&window, &[SourceCategory::News], &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PulseError::Refresh(RefreshError::Cancelled)));
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reject_mode_when_held() {
        let fetcher = Arc::new(FakeFetcher::new(&["https://a.com/1"]));
        let (mut orchestrator, _, window) =
            setup(Arc::new(TemplateQueryGenerator), fetcher, Vec::new()).await;
        let mut config = RefreshConfig::default();
        config.guard.mode = GuardMode::Reject;
        orchestrator.guard = RefreshGuard::new(&config.guard);

        let token = CancellationToken::new();
        let _held = orchestrator
            .guard()
            .acquire(RefreshKey::new(&window, &SourceCategory::News), &token)
            .await
            .unwrap();

        let err = orchestrator
            .refresh(&window, &[SourceCategory::News], &token)
            .await
            .unwrap_err();
        assert!(err.is_in_progress());

        // A free sibling category still runs; the held one is reported.
        let result = orchestrator
            .refresh(&window, &[SourceCategory::News, SourceCategory::Blog], &token)
            .await
            .unwrap();
        assert_eq!(result.in_progress, vec![SourceCategory::News]);
        assert_eq!(result.status, crate::refresh::RefreshStatus::Partial);
        assert!(result.category(&SourceCategory::Blog).is_some());
    }

    fn sequential_config() -> RefreshConfig {
        RefreshConfig {
            fetch_concurrency: 1,
            extract_concurrency: 1,
            ..RefreshConfig::default()
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_fetch_stops_further_fetches() {
        let token = CancellationToken::new();
        let fetcher = Arc::new(FakeFetcher::cancelling(
            &["https://a.com/1", "https://a.com/2", "https://a.com/3"],
            token.clone(),
        ));
        let extractor = Arc::new(FakeExtractor::default());
        let (orchestrator, engine, window) = setup_with(
            Arc::new(TemplateQueryGenerator),
            fetcher.clone(),
            extractor.clone(),
            sequential_config(),
        )
        .await;

        let err = orchestrator
            .refresh(&window, &[SourceCategory::News], &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PulseError::Refresh(RefreshError::Cancelled)));
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.count(NodeLabel::Source).await.unwrap(), 0);
        assert_eq!(orchestrator.guard().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_extraction_merges_extracted_work() {
        let token = CancellationToken::new();
        let fetcher = Arc::new(FakeFetcher::new(&[
            "https://a.com/1",
            "https://a.com/2",
            "https://a.com/3",
        ]));
        let extractor = Arc::new(FakeExtractor {
            cancel_on_extract: Some(token.clone()),
            ..FakeExtractor::default()
        });
        let (orchestrator, engine, window) = setup_with(
            Arc::new(TemplateQueryGenerator),
            fetcher.clone(),
            extractor.clone(),
            sequential_config(),
        )
        .await;

        let result = orchestrator
            .refresh(&window, &[SourceCategory::News], &token)
            .await
            .unwrap();
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

        let news = result.category(&SourceCategory::News).unwrap();
        assert_eq!(news.state, RefreshState::Failed(RefreshStage::Extracting));
        assert!(news.cancelled);
        assert_eq!(news.ingested_sources, 1);
        assert_eq!(news.ingested_facts, 1);
        assert_eq!(result.status, crate::refresh::RefreshStatus::Partial);
        assert_eq!(engine.count(NodeLabel::Source).await.unwrap(), 1);
        assert_eq!(engine.count(NodeLabel::Fact).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_reports_cancelled_not_blocked() {
        let fetcher = Arc::new(FakeFetcher::new(&["https://a.com/1"]));
        let (orchestrator, _, window) =
            setup(Arc::new(TemplateQueryGenerator), fetcher.clone(), Vec::new()).await;
        let _held = orchestrator
            .guard()
            .acquire(RefreshKey::new(&window, &SourceCategory::News), &CancellationToken::new())
            .await
            .unwrap();

        let token = CancellationToken::new();
        let waiter = orchestrator.refresh(&window, &[SourceCategory::News], &token);
        let cancel = async {
            tokio::task::yield_now().await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(waiter, cancel);

        assert!(matches!(result, Err(PulseError::Refresh(RefreshError::Cancelled))));
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_waiter_takes_over_after_holder_cancelled() {
        let fetcher = Arc::new(FakeFetcher::new(&["https://a.com/1"]));
        let (orchestrator, _, window) =
            setup(Arc::new(TemplateQueryGenerator), fetcher.clone(), Vec::new()).await;
        let lease = match orchestrator
            .guard()
            .acquire(RefreshKey::new(&window, &SourceCategory::News), &CancellationToken::new())
            .await
            .unwrap()
        {
            Admission::Lead(lease) => lease,
            Admission::Joined(_) => panic!("expected to lead"),
        };

        let token = CancellationToken::new();
        let waiter = orchestrator.refresh(&window, &[SourceCategory::News], &token);
        let holder = async move {
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            let mut cancelled = CategoryOutcome::new(SourceCategory::News);
            cancelled.cancel(RefreshStage::Fetching);
            lease.complete(&cancelled);
        };
        let (result, ()) = tokio::join!(waiter, holder);

        let result = result.unwrap();
        let news = result.category(&SourceCategory::News).unwrap();
        assert_eq!(news.state, RefreshState::Done);
        assert!(!news.joined_in_flight);
        assert!(!news.cancelled);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.guard().in_flight(), 0);
    }
}
