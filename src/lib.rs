//! # PulseGraph - Freshness-aware knowledge graph core
//!
//! PulseGraph keeps a knowledge graph of claims and metrics derived from
//! external sources that go stale. It decides when cached data is too old,
//! re-derives it through pluggable collaborators, and merges the results into
//! a shared store without duplication, even under concurrent refreshes.
//!
//! ## Core Concepts
//!
//! - **Period**: a fiscal quarter such as `Q3-2025`, with total arithmetic
//! - **Natural key**: a deterministic identity computed from an entity's own attributes
//! - **Freshness verdict**: `FRESH`, `STALE` or `UNKNOWN` per source category
//! - **Refresh**: query, fetch, extract and merge, with per-unit failure isolation
//! - **Comparison**: facts and a metric delta between two periods
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pulsegraph::{Collaborators, PulseConfig, PulseGraph, SnapshotRequest, SignalType};
//! use pulsegraph::storage::InMemoryGraphStore;
//! use tokio_util::sync::CancellationToken;
//!
//! let pulse = PulseGraph::new(Arc::new(InMemoryGraphStore::new()), collaborators, PulseConfig::default())?;
//! pulse.register_subject("NVDA", "NVIDIA").await?;
//!
//! let request = SnapshotRequest::new("NVDA", SignalType::Sentiment).auto_refresh(true);
//! let snapshot = pulse.snapshot(&request, &CancellationToken::new()).await?;
//! println!("{:?} delta={:?}", snapshot.freshness_a.aggregate, snapshot.comparison.delta);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Leaf types
pub mod config;
pub mod error;
pub mod period;
pub mod registry;

// Persistence and merge
pub mod graph;
pub mod storage;

// Policy, refresh and read paths
pub mod comparison;
pub mod freshness;
pub mod refresh;
pub mod service;

// Re-export primary types at crate root for convenience
pub use comparison::{ComparisonReader, ComparisonResult, FactView, MetricView, SourceView};
pub use config::{
    ComparisonConfig, FreshnessConfig, GuardConfig, GuardMode, MergeConfig, PulseConfig,
    RefreshConfig, RetryPolicy,
};
pub use error::{
    ExtractionError, FetchError, FormatError, GenerationError, NormalizeError, PulseError,
    PulseResult, RefreshError, ValidationError,
};
pub use freshness::{CategoryFreshness, FreshnessPolicy, FreshnessReport, Verdict};
pub use graph::{
    Fact, FactRef, GraphMergeEngine, Metric, MetricRef, SourceRecord, SourceRef, Stored, Subject,
    SubjectRef, Window, WindowRef, WriteKind,
};
pub use period::Period;
pub use refresh::{
    CategoryOutcome, ExtractedItem, FactDraft, FactExtractor, MetricDraft, NormalizedDocument,
    OriginRef, QueryGenerator, QuerySpec, RawDocument, RefreshIssue, RefreshOrchestrator,
    RefreshResult, RefreshStage, RefreshState, RefreshStatus, SourceFetcher,
    TemplateQueryGenerator,
};
pub use registry::{EventType, SignalType, SourceCategory};
pub use service::{Collaborators, PulseGraph, Snapshot, SnapshotRequest};
pub use storage::{GraphStore, InMemoryGraphStore, StorageError};
