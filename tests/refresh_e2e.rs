use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use pulsegraph::storage::{
    CasOutcome, Edge, EdgeKind, InsertOutcome, Node, NodeId, NodeLabel,
};
use pulsegraph::{
    Collaborators, EventType, ExtractedItem, ExtractionError, FactDraft, FactExtractor, FetchError,
    GenerationError, GraphStore, GuardMode, InMemoryGraphStore, MetricDraft, NormalizedDocument,
    OriginRef, Period, PulseConfig, PulseError, PulseGraph, QueryGenerator, QuerySpec,
    RawDocument, RefreshError, RefreshStage, RefreshState, RefreshStatus, SignalType,
    SourceCategory, SourceFetcher, StorageError, Subject, TemplateQueryGenerator, WindowRef,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fetched_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 20, 9, 15, 0).unwrap()
}

fn q3() -> Period {
    Period::parse("Q3-2025").unwrap()
}

/// Counts query generations; the concurrency guard must keep this at one per key.
#[derive(Default)]
struct CountingQueries {
    calls: AtomicUsize,
}

#[async_trait]
impl QueryGenerator for CountingQueries {
    async fn generate_query(
        &self,
        subject: &Subject,
        window: &WindowRef,
        category: &SourceCategory,
    ) -> Result<QuerySpec, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TemplateQueryGenerator::build(subject, window, category))
    }
}

/// Serves a fixed origin list. Locators containing "down" fail; fetches wait on
/// `gate` when one is installed.
struct ScriptedFetcher {
    origins: Vec<String>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedFetcher {
    fn new(origins: &[&str]) -> Self {
        Self {
            origins: origins.iter().map(|o| (*o).to_string()).collect(),
            gate: None,
        }
    }

    fn gated(origins: &[&str], gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(origins)
        }
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
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
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        if origin.locator.contains("down") {
            return Err(FetchError::Timeout { duration_ms: 30_000 });
        }
        Ok(RawDocument::new(
            origin.clone(),
            format!(
                "Coverage from {} on the quarter: revenue, margins and guidance all discussed.",
                origin.locator
            ),
            fetched_at(),
        ))
    }
}

/// One fact unique to each document plus a sentiment reading.
struct PerDocumentExtractor;

#[async_trait]
impl FactExtractor for PerDocumentExtractor {
    async fn extract(
        &self,
        document: &NormalizedDocument,
        _window: &WindowRef,
    ) -> Result<Vec<ExtractedItem>, ExtractionError> {
        Ok(vec![
            ExtractedItem::Fact(FactDraft::new(
                format!("Claim reported by {}", document.origin.locator),
                0.75,
            )),
            ExtractedItem::Metric(MetricDraft {
                metric_type: SignalType::Sentiment,
                value: 0.64,
                volume: 3,
                computed_at: Some(fetched_at()),
            }),
        ])
    }
}

fn build(
    store: Arc<dyn GraphStore>,
    queries: Arc<dyn QueryGenerator>,
    fetcher: ScriptedFetcher,
    config: PulseConfig,
) -> PulseGraph {
    PulseGraph::new(
        store,
        Collaborators {
            queries,
            fetcher: Arc::new(fetcher),
            extractor: Arc::new(PerDocumentExtractor),
        },
        config,
    )
    .unwrap()
}

#[tokio::test]
async fn partial_failure_keeps_successful_documents() {
    init_tracing();
    let store = Arc::new(InMemoryGraphStore::new());
    let pulse = build(
        store.clone(),
        Arc::new(TemplateQueryGenerator),
        ScriptedFetcher::new(&[
            "https://a.example.com/1",
            "https://down.example.com/2",
            "https://b.example.com/3",
            "https://down.example.com/4",
            "https://c.example.com/5",
        ]),
        PulseConfig::default(),
    );
    pulse.register_subject("NVDA", "NVIDIA").await.unwrap();

    let result = pulse
        .refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::News], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RefreshStatus::Partial);
    assert_eq!(result.error_count(), 2);
    assert!(result.errors().all(|e| e.stage == RefreshStage::Fetching));

    let news = result.category(&SourceCategory::News).unwrap();
    assert_eq!(news.state, RefreshState::Done);
    assert_eq!(news.discovered, 5);
    assert_eq!(news.ingested_sources, 3);
    assert_eq!(news.ingested_facts, 3);
    assert_eq!(store.count(NodeLabel::Fact).await.unwrap(), 3);
    assert_eq!(store.count(NodeLabel::Source).await.unwrap(), 3);
}

#[tokio::test]
async fn repeated_refresh_is_idempotent() {
    let store = Arc::new(InMemoryGraphStore::new());
    let pulse = build(
        store.clone(),
        Arc::new(TemplateQueryGenerator),
        ScriptedFetcher::new(&["https://a.example.com/1", "https://b.example.com/2"]),
        PulseConfig::default(),
    );

    let mut counts = Vec::new();
    for _ in 0..2 {
        pulse
            .refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::News], &CancellationToken::new())
            .await
            .unwrap();
        let mut snapshot = HashMap::new();
        for label in [
            NodeLabel::Subject,
            NodeLabel::Window,
            NodeLabel::Source,
            NodeLabel::Fact,
            NodeLabel::Metric,
        ] {
            snapshot.insert(label, store.count(label).await.unwrap());
        }
        counts.push((snapshot, store.edge_count().unwrap()));
    }
    assert_eq!(counts[0], counts[1]);
    assert_eq!(counts[0].0[&NodeLabel::Window], 1);
    assert_eq!(counts[0].0[&NodeLabel::Metric], 1);

    // Every fact keeps at least one supporting source.
    for node in store.scan(NodeLabel::Fact).await.unwrap() {
        let support = store.edges_from(node.id, EdgeKind::SupportedBy).await.unwrap();
        assert!(!support.is_empty());
    }
}

#[tokio::test]
async fn concurrent_refreshes_run_once_and_share_outcome() {
    let store = Arc::new(InMemoryGraphStore::new());
    let queries = Arc::new(CountingQueries::default());
    let gate = Arc::new(Semaphore::new(0));
    let pulse = build(
        store.clone(),
        queries.clone(),
        ScriptedFetcher::gated(&["https://a.example.com/1", "https://b.example.com/2"], gate.clone()),
        PulseConfig::default(),
    );
    pulse.register_subject("NVDA", "NVIDIA").await.unwrap();

    let token = CancellationToken::new();
    let first = pulse.refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::News], &token);
    let second = pulse.refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::News], &token);
    let release = async {
        while queries.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        // Let the other caller reach the guard before the holder can finish.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(64);
    };
    let (first, second, ()) = tokio::join!(first, second, release);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(queries.calls.load(Ordering::SeqCst), 1);
    let a = first.category(&SourceCategory::News).unwrap();
    let b = second.category(&SourceCategory::News).unwrap();
    assert!(a.joined_in_flight ^ b.joined_in_flight);
    assert_eq!(a.ingested_facts, b.ingested_facts);
    assert_eq!(store.count(NodeLabel::Fact).await.unwrap(), 2);
    assert_eq!(pulse.orchestrator().guard().in_flight(), 0);
}

#[tokio::test]
async fn concurrent_refresh_rejected_in_reject_mode() {
    let store = Arc::new(InMemoryGraphStore::new());
    let queries = Arc::new(CountingQueries::default());
    let gate = Arc::new(Semaphore::new(0));
    let mut config = PulseConfig::default();
    config.refresh.guard.mode = GuardMode::Reject;
    let pulse = build(
        store.clone(),
        queries.clone(),
        ScriptedFetcher::gated(&["https://a.example.com/1"], gate.clone()),
        config,
    );
    pulse.register_subject("NVDA", "NVIDIA").await.unwrap();

    let token = CancellationToken::new();
    let first = pulse.refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::News], &token);
    let second = async {
        while queries.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let outcome = pulse
            .refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::News], &token)
            .await;
        gate.add_permits(64);
        outcome
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().status, RefreshStatus::Success);
    assert!(matches!(
        second,
        Err(PulseError::Refresh(RefreshError::InProgress { .. }))
    ));
    assert_eq!(queries.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn different_categories_do_not_block_each_other() {
    let queries = Arc::new(CountingQueries::default());
    let pulse = build(
        Arc::new(InMemoryGraphStore::new()),
        queries.clone(),
        ScriptedFetcher::new(&["https://a.example.com/1"]),
        PulseConfig::default(),
    );
    let token = CancellationToken::new();
    let (news, filing) = tokio::join!(
        pulse.refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::News], &token),
        pulse.refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::Filing], &token),
    );
    assert_eq!(news.unwrap().status, RefreshStatus::Success);
    assert_eq!(filing.unwrap().status, RefreshStatus::Success);
    assert_eq!(queries.calls.load(Ordering::SeqCst), 2);
    assert_eq!(pulse.engine().count(NodeLabel::Window).await.unwrap(), 1);
}

#[tokio::test]
async fn shared_origin_advances_every_category() {
    let store = Arc::new(InMemoryGraphStore::new());
    let pulse = build(
        store.clone(),
        Arc::new(TemplateQueryGenerator),
        ScriptedFetcher::new(&["https://wire.example.com/nvda-q3"]),
        PulseConfig::default(),
    );
    let subject = pulse.register_subject("NVDA", "NVIDIA").await.unwrap();

    pulse
        .refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::News], &CancellationToken::new())
        .await
        .unwrap();
    pulse
        .refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::Blog], &CancellationToken::new())
        .await
        .unwrap();

    // One record for the shared origin, tagged with both categories.
    assert_eq!(store.count(NodeLabel::Source).await.unwrap(), 1);
    let window = pulse
        .engine()
        .find_window(&subject, q3(), EventType::Earnings)
        .await
        .unwrap()
        .unwrap();
    let latest = pulse
        .engine()
        .latest_fetches(&window, &[SourceCategory::News, SourceCategory::Blog, SourceCategory::Forum])
        .await
        .unwrap();
    assert_eq!(latest[&SourceCategory::News], Some(fetched_at()));
    assert_eq!(latest[&SourceCategory::Blog], Some(fetched_at()));
    assert_eq!(latest[&SourceCategory::Forum], None);
}

/// Wraps the in-memory store and fails the first `failures` inserts.
struct FlakyStore {
    inner: InMemoryGraphStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryGraphStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl GraphStore for FlakyStore {
    async fn get(&self, label: NodeLabel, key: &str) -> Result<Option<Node>, StorageError> {
        self.inner.get(label, key).await
    }

    async fn get_by_id(&self, id: NodeId) -> Result<Option<Node>, StorageError> {
        self.inner.get_by_id(id).await
    }

    async fn insert_if_absent(&self, node: Node) -> Result<InsertOutcome, StorageError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if node.label == NodeLabel::Source && remaining > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::ConnectionError("connection reset".to_string()));
        }
        self.inner.insert_if_absent(node).await
    }

    async fn compare_and_swap(
        &self,
        node: Node,
        expected_version: u64,
    ) -> Result<CasOutcome, StorageError> {
        self.inner.compare_and_swap(node, expected_version).await
    }

    async fn insert_edge_if_absent(&self, edge: Edge) -> Result<bool, StorageError> {
        self.inner.insert_edge_if_absent(edge).await
    }

    async fn edges_from(&self, from: NodeId, kind: EdgeKind) -> Result<Vec<Edge>, StorageError> {
        self.inner.edges_from(from, kind).await
    }

    async fn edges_to(&self, to: NodeId, kind: EdgeKind) -> Result<Vec<Edge>, StorageError> {
        self.inner.edges_to(to, kind).await
    }

    async fn count(&self, label: NodeLabel) -> Result<usize, StorageError> {
        self.inner.count(label).await
    }

    async fn scan(&self, label: NodeLabel) -> Result<Vec<Node>, StorageError> {
        self.inner.scan(label).await
    }
}

fn fast_retry_config() -> PulseConfig {
    let mut config = PulseConfig::default();
    config.refresh.merge_retry.base_backoff_ms = 1;
    config.refresh.merge_retry.max_backoff_ms = 2;
    config
}

#[tokio::test]
async fn transient_store_errors_are_retried() {
    let store = Arc::new(FlakyStore::new(2));
    let pulse = build(
        store.clone(),
        Arc::new(TemplateQueryGenerator),
        ScriptedFetcher::new(&["https://a.example.com/1"]),
        fast_retry_config(),
    );
    let result = pulse
        .refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::News], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, RefreshStatus::Success);
    assert_eq!(result.ingested_sources(), 1);
    assert_eq!(store.count(NodeLabel::Source).await.unwrap(), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_the_category() {
    init_tracing();
    let store = Arc::new(FlakyStore::new(usize::MAX));
    let pulse = build(
        store.clone(),
        Arc::new(TemplateQueryGenerator),
        ScriptedFetcher::new(&["https://a.example.com/1"]),
        fast_retry_config(),
    );
    let result = pulse
        .refresh("NVDA", q3(), EventType::Earnings, &[SourceCategory::News], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, RefreshStatus::Partial);
    let news = result.category(&SourceCategory::News).unwrap();
    assert_eq!(news.state, RefreshState::Failed(RefreshStage::Merging));
    assert_eq!(news.ingested_sources, 0);
    assert_eq!(store.count(NodeLabel::Fact).await.unwrap(), 0);
}
