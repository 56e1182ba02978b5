//! Refresh orchestration.
//!
//! - `collaborators`: query generation, discovery/fetch and extraction contracts
//! - `normalize`: fetched content to extractable text
//! - `guard`: at most one in-flight refresh per `(subject, window, category)`
//! - `orchestrator`: the per-category state machine and result aggregation

pub mod collaborators;
pub mod guard;
pub mod normalize;
mod orchestrator;
mod outcome;

pub use collaborators::{
    ExtractedItem, FactDraft, FactExtractor, MetricDraft, NormalizedDocument, OriginRef,
    QueryGenerator, QuerySpec, RawDocument, SourceFetcher, TemplateQueryGenerator,
};
pub use guard::{Admission, Lease, RefreshGuard, RefreshKey};
pub use orchestrator::RefreshOrchestrator;
pub use outcome::{
    CategoryOutcome, RefreshIssue, RefreshResult, RefreshStage, RefreshState, RefreshStatus,
};
