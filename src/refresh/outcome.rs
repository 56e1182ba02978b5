//! Refresh states and the aggregated result.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::period::Period;
use crate::registry::{EventType, SourceCategory};

/// Issue message for a run stopped by its caller.
pub(crate) const CANCELLED: &str = "refresh cancelled";

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshStage {
    /// Query generation.
    Querying,
    /// Discovery and fetching.
    Fetching,
    /// Normalization and extraction.
    Extracting,
    /// Writing to the graph.
    Merging,
}

impl fmt::Display for RefreshStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Querying => "QUERYING",
            Self::Fetching => "FETCHING",
            Self::Extracting => "EXTRACTING",
            Self::Merging => "MERGING",
        })
    }
}

/// Per-category state machine.
///
/// `Planned -> Querying -> Fetching -> Extracting -> Merging -> Done`, with
/// `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshState {
    /// Admitted, nothing started.
    Planned,
    /// Generating the query.
    Querying,
    /// Discovering and fetching origins.
    Fetching,
    /// Normalizing and extracting documents.
    Extracting,
    /// Merging extracted items.
    Merging,
    /// Finished; per-origin issues may still be recorded.
    Done,
    /// Stopped at the given stage.
    Failed(RefreshStage),
}

impl RefreshState {
    /// `Done` or `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// The stage a `Failed` transition from this state is attributed to.
    #[must_use]
    pub const fn stage(self) -> Option<RefreshStage> {
        match self {
            Self::Planned | Self::Querying => Some(RefreshStage::Querying),
            Self::Fetching => Some(RefreshStage::Fetching),
            Self::Extracting => Some(RefreshStage::Extracting),
            Self::Merging => Some(RefreshStage::Merging),
            Self::Done => None,
            Self::Failed(stage) => Some(stage),
        }
    }
}

/// One recorded failure. Per-origin failures carry the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshIssue {
    /// Stage the failure happened in.
    pub stage: RefreshStage,
    /// Origin locator for per-origin failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Human-readable cause.
    pub message: String,
}

impl RefreshIssue {
    /// A category-level issue.
    #[must_use]
    pub fn new(stage: RefreshStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            origin: None,
            message: message.into(),
        }
    }

    /// An issue tied to one origin.
    #[must_use]
    pub fn at_origin(stage: RefreshStage, origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            origin: Some(origin.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for RefreshIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "[{}] {origin}: {}", self.stage, self.message),
            None => write!(f, "[{}] {}", self.stage, self.message),
        }
    }
}

/// Outcome of refreshing one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryOutcome {
    /// Category refreshed.
    pub category: SourceCategory,
    /// Final (or current) state.
    pub state: RefreshState,
    /// Primary query text used for discovery.
    pub query: Option<String>,
    /// Origins kept after discovery, dedup and capping.
    pub discovered: usize,
    /// Documents merged.
    pub ingested_sources: usize,
    /// Fact writes, including merges into existing facts.
    pub ingested_facts: usize,
    /// Metric writes.
    pub ingested_metrics: usize,
    /// Issues recorded along the way, in order.
    pub errors: Vec<RefreshIssue>,
    /// Set when this outcome was produced by another caller's in-flight refresh.
    pub joined_in_flight: bool,
    /// The run stopped because its caller cancelled, not because a collaborator failed.
    #[serde(default)]
    pub cancelled: bool,
}

impl CategoryOutcome {
    /// A `Planned` outcome with no counts.
    #[must_use]
    pub fn new(category: SourceCategory) -> Self {
        Self {
            category,
            state: RefreshState::Planned,
            query: None,
            discovered: 0,
            ingested_sources: 0,
            ingested_facts: 0,
            ingested_metrics: 0,
            errors: Vec::new(),
            joined_in_flight: false,
            cancelled: false,
        }
    }

    pub(crate) fn advance(&mut self, state: RefreshState) {
        tracing::debug!(category = %self.category, from = ?self.state, to = ?state, "refresh state");
        self.state = state;
    }

    pub(crate) fn record(&mut self, issue: RefreshIssue) {
        self.errors.push(issue);
    }

    /// Records `issue` and moves to `Failed` at the current stage.
    pub(crate) fn fail(&mut self, issue: RefreshIssue) {
        let stage = self.state.stage().unwrap_or(issue.stage);
        self.record(issue);
        self.advance(RefreshState::Failed(stage));
    }

    /// Records a cancellation at `stage` and moves to `Failed(stage)`.
    pub(crate) fn cancel(&mut self, stage: RefreshStage) {
        self.record(RefreshIssue::new(stage, CANCELLED));
        self.cancelled = true;
        self.advance(RefreshState::Failed(stage));
    }

    /// Ended in `Failed`.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self.state, RefreshState::Failed(_))
    }

    /// Never got past query generation for a reason other than cancellation.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        !self.cancelled && matches!(self.state, RefreshState::Failed(RefreshStage::Querying))
    }
}

/// Overall refresh status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    /// Every category completed with no recorded errors.
    Success,
    /// Some work was skipped or some categories failed.
    Partial,
}

/// Aggregated result of one refresh call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResult {
    /// Subject natural key.
    pub subject: String,
    /// Window natural key.
    pub window: String,
    /// Window period.
    pub period: Period,
    /// Window event type.
    pub event_type: EventType,
    /// Overall status.
    pub status: RefreshStatus,
    /// Outcome per admitted category.
    pub categories: BTreeMap<SourceCategory, CategoryOutcome>,
    /// Categories rejected because another refresh held them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub in_progress: Vec<SourceCategory>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// When the call returned.
    pub finished_at: DateTime<Utc>,
}

impl RefreshResult {
    /// All recorded issues, by category.
    pub fn errors(&self) -> impl Iterator<Item = &RefreshIssue> {
        self.categories.values().flat_map(|c| c.errors.iter())
    }

    /// Number of recorded issues.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.categories.values().map(|c| c.errors.len()).sum()
    }

    /// Documents merged across categories.
    #[must_use]
    pub fn ingested_sources(&self) -> usize {
        self.categories.values().map(|c| c.ingested_sources).sum()
    }

    /// Fact writes across categories.
    #[must_use]
    pub fn ingested_facts(&self) -> usize {
        self.categories.values().map(|c| c.ingested_facts).sum()
    }

    /// Metric writes across categories.
    #[must_use]
    pub fn ingested_metrics(&self) -> usize {
        self.categories.values().map(|c| c.ingested_metrics).sum()
    }

    /// Outcome for `category`, if it was admitted.
    #[must_use]
    pub fn category(&self, category: &SourceCategory) -> Option<&CategoryOutcome> {
        self.categories.get(category)
    }

    pub(crate) fn status_for<'a>(
        outcomes: impl IntoIterator<Item = &'a CategoryOutcome>,
        rejected: usize,
    ) -> RefreshStatus {
        let clean = outcomes
            .into_iter()
            .all(|c| c.state == RefreshState::Done && c.errors.is_empty());
        if clean && rejected == 0 {
            RefreshStatus::Success
        } else {
            RefreshStatus::Partial
        }
    }
}
