//! The idempotent graph-merge engine.
//!
//! Every write is a read-merge-write cycle closed by a conditional store
//! primitive: `insert_if_absent` when the natural key is free, otherwise
//! `compare_and_swap` against the version that was read. A lost race re-reads
//! and re-merges, so concurrent writers converge on one node per key. The
//! first committer's node id is canonical; later writers only change mutable
//! properties according to the per-entity rules below.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::MergeConfig;
use crate::error::{PulseResult, ValidationError};
use crate::graph::entities::{
    Fact, FactRef, Metric, MetricRef, SourceRecord, SourceRef, Stored, Subject, SubjectRef,
    Window, WindowRef,
};
use crate::graph::keys;
use crate::period::Period;
use crate::registry::{EventType, SignalType, SourceCategory};
use crate::storage::{
    CasOutcome, Edge, EdgeKind, GraphStore, InsertOutcome, Node, NodeId, NodeLabel, StorageError,
};

/// What a single upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// A new node was inserted.
    Created,
    /// An existing node was rewritten.
    Updated,
    /// The merge produced the stored state; nothing was written.
    Unchanged,
}

enum Merge<T> {
    Keep,
    Replace(T),
}

/// Sole reader/writer of persisted entities.
#[derive(Clone)]
pub struct GraphMergeEngine {
    store: Arc<dyn GraphStore>,
    config: MergeConfig,
}

impl GraphMergeEngine {
    /// Create an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn GraphStore>, config: MergeConfig) -> Self {
        Self { store, config }
    }

    /// Merge settings in effect.
    #[must_use]
    pub const fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Number of nodes with `label`.
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn count(&self, label: NodeLabel) -> PulseResult<usize> {
        Ok(self.store.count(label).await?)
    }

    async fn merge_node<T, F>(
        &self,
        label: NodeLabel,
        key: &str,
        proposed: &T,
        merge: F,
    ) -> Result<(Node, WriteKind), StorageError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: Fn(&T, &T) -> Merge<T> + Send + Sync,
    {
        let attempts = self.config.max_cas_attempts.max(1);
        let mut current = self.store.get(label, key).await?;

        for attempt in 1..=attempts {
            let node = match current.take() {
                Some(node) => node,
                None => {
                    let fresh = Node::new(label, key, serde_json::to_value(proposed)?);
                    match self.store.insert_if_absent(fresh).await? {
                        InsertOutcome::Inserted(node) => return Ok((node, WriteKind::Created)),
                        InsertOutcome::Existing(node) => node,
                    }
                }
            };

            let existing: T = serde_json::from_value(node.properties.clone())?;
            let next = match merge(&existing, proposed) {
                Merge::Keep => return Ok((node, WriteKind::Unchanged)),
                Merge::Replace(next) => next,
            };

            let expected = node.version;
            let mut candidate = node;
            candidate.properties = serde_json::to_value(&next)?;
            match self.store.compare_and_swap(candidate, expected).await? {
                CasOutcome::Swapped(node) => return Ok((node, WriteKind::Updated)),
                CasOutcome::Conflict(latest) => {
                    tracing::debug!(%label, key, attempt, "lost compare-and-swap race, re-merging");
                    current = Some(latest);
                }
            }
        }

        Err(StorageError::Contention {
            label,
            key: key.to_string(),
            attempts,
        })
    }

    async fn link(&self, from: NodeId, kind: EdgeKind, to: NodeId) -> Result<(), StorageError> {
        self.store.insert_edge_if_absent(Edge::new(from, kind, to)).await?;
        Ok(())
    }

    async fn load<T: DeserializeOwned>(&self, id: NodeId) -> PulseResult<Option<Stored<T>>> {
        match self.store.get_by_id(id).await? {
            Some(node) => Ok(Some(Stored::from_node(&node)?)),
            None => Ok(None),
        }
    }

    /// Creates or updates a subject. The display name is last-writer-wins.
    ///
    /// # Errors
    /// `ValidationError::EmptyField` for a blank identifier; store errors.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn upsert_subject(&self, identifier: &str, display_name: &str) -> PulseResult<SubjectRef> {
        let key = keys::subject_key(identifier)?;
        let display_name = match display_name.trim() {
            "" => identifier.trim().to_string(),
            name => name.to_string(),
        };
        let proposed = Subject {
            identifier: key.clone(),
            display_name,
        };

        let (node, write) = self
            .merge_node(NodeLabel::Subject, &key, &proposed, |existing: &Subject, new| {
                if existing.display_name == new.display_name {
                    Merge::Keep
                } else {
                    Merge::Replace(new.clone())
                }
            })
            .await?;
        tracing::debug!(subject = %key, ?write, "subject upserted");
        Ok(SubjectRef { id: node.id, key })
    }

    /// Looks up a subject without creating it.
    ///
    /// # Errors
    /// `ValidationError::EmptyField` for a blank identifier; store errors.
    pub async fn find_subject(&self, identifier: &str) -> PulseResult<Option<SubjectRef>> {
        let key = keys::subject_key(identifier)?;
        Ok(self
            .store
            .get(NodeLabel::Subject, &key)
            .await?
            .map(|node| SubjectRef { id: node.id, key }))
    }

    /// Reads a subject's properties.
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn read_subject(&self, subject: &SubjectRef) -> PulseResult<Option<Stored<Subject>>> {
        self.load(subject.id).await
    }

    /// Creates a window on first reference; identical keys converge to one node.
    ///
    /// # Errors
    /// Propagates store errors.
    #[tracing::instrument(level = "debug", skip(self), fields(subject = %subject.key))]
    pub async fn upsert_window(
        &self,
        subject: &SubjectRef,
        period: Period,
        event_type: EventType,
    ) -> PulseResult<WindowRef> {
        let key = keys::window_key(&subject.key, period, event_type);
        let proposed = Window {
            subject_key: subject.key.clone(),
            period,
            event_type,
        };
        let (node, _) = self
            .merge_node(NodeLabel::Window, &key, &proposed, |_: &Window, _| Merge::Keep)
            .await?;
        self.link(subject.id, EdgeKind::HasWindow, node.id).await?;

        Ok(WindowRef {
            id: node.id,
            key,
            subject: subject.clone(),
            period,
            event_type,
        })
    }

    /// Looks up a window without creating it.
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn find_window(
        &self,
        subject: &SubjectRef,
        period: Period,
        event_type: EventType,
    ) -> PulseResult<Option<WindowRef>> {
        let key = keys::window_key(&subject.key, period, event_type);
        Ok(self
            .store
            .get(NodeLabel::Window, &key)
            .await?
            .map(|node| WindowRef {
                id: node.id,
                key,
                subject: subject.clone(),
                period,
                event_type,
            }))
    }

    /// All windows of `subject` in `period`, across event types.
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn windows_for(&self, subject: &SubjectRef, period: Period) -> PulseResult<Vec<WindowRef>> {
        let mut out = Vec::new();
        for edge in self.store.edges_from(subject.id, EdgeKind::HasWindow).await? {
            let Some(window) = self.load::<Window>(edge.to).await? else {
                continue;
            };
            if window.period == period {
                out.push(WindowRef {
                    id: window.id,
                    key: window.key.clone(),
                    subject: subject.clone(),
                    period,
                    event_type: window.event_type,
                });
            }
        }
        out.sort_by_key(|w| w.event_type);
        Ok(out)
    }

    /// Records one fetch of `origin` for `category`.
    ///
    /// Re-fetches inside the same dedup bucket address the same node. The
    /// category joins the node's category set and `fetched_at` moves forward
    /// to the latest fetch; content and title follow the latest fetch.
    ///
    /// # Errors
    /// `ValidationError::EmptyField` for a blank origin; store errors.
    #[tracing::instrument(level = "debug", skip(self, content))]
    pub async fn upsert_source_record(
        &self,
        origin: &str,
        fetched_at: DateTime<Utc>,
        category: &SourceCategory,
        title: Option<&str>,
        content: &str,
    ) -> PulseResult<SourceRef> {
        let origin = keys::normalize_origin(origin)?;
        let key = keys::source_key(&origin, fetched_at, self.config.source_bucket_secs);
        let proposed = SourceRecord {
            origin,
            fetched_at,
            categories: BTreeSet::from([category.clone()]),
            title: title.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string),
            content_hash: keys::content_hash(content),
            content_len: content.chars().count(),
        };

        let (node, write) = self
            .merge_node(NodeLabel::Source, &key, &proposed, |existing: &SourceRecord, new| {
                let mut next = existing.clone();
                next.categories.extend(new.categories.iter().cloned());
                if new.fetched_at >= existing.fetched_at {
                    next.fetched_at = new.fetched_at;
                    next.content_hash.clone_from(&new.content_hash);
                    next.content_len = new.content_len;
                    next.title = new.title.clone().or_else(|| existing.title.clone());
                }
                if &next == existing {
                    Merge::Keep
                } else {
                    Merge::Replace(next)
                }
            })
            .await?;
        tracing::debug!(source = %key, ?write, "source record upserted");

        let stored: Stored<SourceRecord> = Stored::from_node(&node)?;
        Ok(SourceRef {
            id: node.id,
            key,
            categories: stored.data.categories,
            fetched_at: stored.data.fetched_at,
        })
    }

    /// Links a source record to the window it was fetched for (and its subject).
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn link_source(&self, source: &SourceRef, window: &WindowRef) -> PulseResult<()> {
        self.link(source.id, EdgeKind::Covers, window.id).await?;
        self.link(source.id, EdgeKind::Mentions, window.subject.id).await?;
        Ok(())
    }

    /// Creates or merges a fact keyed by `(window, normalized text, schema version)`.
    ///
    /// On collision the higher confidence wins and supporting sources are
    /// unioned; prior evidence is never dropped.
    ///
    /// # Errors
    /// - `ValidationError::EmptySupport` if `supporting` is empty
    /// - `ValidationError::DanglingReference` if a supporting source is missing
    /// - other `ValidationError`s for blank text or out-of-range confidence
    #[tracing::instrument(level = "debug", skip(self, text, supporting), fields(window = %window.key))]
    pub async fn upsert_fact(
        &self,
        window: &WindowRef,
        text: &str,
        confidence: f64,
        claim_type: Option<&str>,
        supporting: &[SourceRef],
    ) -> PulseResult<FactRef> {
        if supporting.is_empty() {
            return Err(ValidationError::EmptySupport.into());
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyField { field: "text" }.into());
        }
        if !confidence.is_finite() {
            return Err(ValidationError::NonFiniteValue { field: "confidence" }.into());
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ValidationError::ConfidenceOutOfRange { value: confidence }.into());
        }
        for source in supporting {
            let exists = self
                .store
                .get_by_id(source.id)
                .await?
                .is_some_and(|n| n.label == NodeLabel::Source);
            if !exists {
                return Err(ValidationError::DanglingReference {
                    label: "source",
                    id: source.id.to_string(),
                }
                .into());
            }
        }

        let key = keys::fact_key(&window.key, text, self.config.schema_version);
        let proposed = Fact {
            text: text.to_string(),
            claim_type: claim_type.map(str::trim).filter(|c| !c.is_empty()).map(str::to_string),
            confidence,
            extracted_at: Utc::now(),
            subject_key: window.subject.key.clone(),
            window_key: window.key.clone(),
            schema_version: self.config.schema_version,
            supported_by: supporting.iter().map(|s| s.id).collect(),
        };

        let (node, write) = self
            .merge_node(NodeLabel::Fact, &key, &proposed, |existing: &Fact, new| {
                let support: BTreeSet<NodeId> =
                    existing.supported_by.union(&new.supported_by).copied().collect();
                let confidence = existing.confidence.max(new.confidence);
                let claim_type = existing.claim_type.clone().or_else(|| new.claim_type.clone());
                if support == existing.supported_by
                    && confidence.total_cmp(&existing.confidence).is_eq()
                    && claim_type == existing.claim_type
                {
                    return Merge::Keep;
                }
                Merge::Replace(Fact {
                    confidence,
                    claim_type,
                    supported_by: support,
                    extracted_at: existing.extracted_at.max(new.extracted_at),
                    ..existing.clone()
                })
            })
            .await?;

        self.link(node.id, EdgeKind::About, window.subject.id).await?;
        self.link(node.id, EdgeKind::Within, window.id).await?;
        for source in supporting {
            self.link(node.id, EdgeKind::SupportedBy, source.id).await?;
        }
        tracing::debug!(fact = %key, ?write, "fact upserted");
        Ok(FactRef { id: node.id, key })
    }

    /// Writes a metric keyed by `(subject, window, metric type)`.
    ///
    /// Last write wins, except that a write whose `computed_at` is older than
    /// the stored value is dropped with a warning and is not an error.
    ///
    /// # Errors
    /// `ValidationError` for out-of-range values or a window that belongs to
    /// another subject; store errors.
    #[tracing::instrument(level = "debug", skip(self), fields(subject = %subject.key, window = %window.key))]
    pub async fn upsert_metric(
        &self,
        subject: &SubjectRef,
        window: &WindowRef,
        metric_type: SignalType,
        value: f64,
        volume: u64,
        computed_at: DateTime<Utc>,
    ) -> PulseResult<MetricRef> {
        if window.subject.id != subject.id {
            return Err(ValidationError::SubjectMismatch {
                subject: subject.key.clone(),
                window: window.key.clone(),
            }
            .into());
        }
        metric_type.check_value(value)?;

        let key = keys::metric_key(&window.key, metric_type);
        let proposed = Metric {
            subject_key: subject.key.clone(),
            window_key: window.key.clone(),
            metric_type,
            value,
            volume,
            computed_at,
        };

        let (node, write) = self
            .merge_node(NodeLabel::Metric, &key, &proposed, |existing: &Metric, new| {
                if new.computed_at < existing.computed_at {
                    tracing::warn!(
                        metric = %existing.window_key,
                        stored_at = %existing.computed_at,
                        incoming_at = %new.computed_at,
                        "dropping stale metric write"
                    );
                    Merge::Keep
                } else if existing == new {
                    Merge::Keep
                } else {
                    Merge::Replace(new.clone())
                }
            })
            .await?;
        self.link(node.id, EdgeKind::Measures, window.id).await?;
        tracing::debug!(metric = %key, ?write, "metric upserted");
        Ok(MetricRef { id: node.id, key })
    }

    async fn latest_fetch_via(
        &self,
        target: NodeId,
        kind: EdgeKind,
        category: &SourceCategory,
    ) -> PulseResult<Option<DateTime<Utc>>> {
        let mut latest: Option<DateTime<Utc>> = None;
        for edge in self.store.edges_to(target, kind).await? {
            let Some(source) = self.load::<SourceRecord>(edge.from).await? else {
                continue;
            };
            if source.categories.contains(category) {
                latest = latest.max(Some(source.fetched_at));
            }
        }
        Ok(latest)
    }

    /// Most recent fetch of `category` sources mentioning `subject`, any window.
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn read_latest_fetch(
        &self,
        subject: &SubjectRef,
        category: &SourceCategory,
    ) -> PulseResult<Option<DateTime<Utc>>> {
        self.latest_fetch_via(subject.id, EdgeKind::Mentions, category).await
    }

    /// Most recent fetch of `category` sources covering `window`.
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn read_latest_fetch_in_window(
        &self,
        window: &WindowRef,
        category: &SourceCategory,
    ) -> PulseResult<Option<DateTime<Utc>>> {
        self.latest_fetch_via(window.id, EdgeKind::Covers, category).await
    }

    /// Latest fetch per category for a window; the freshness cursor.
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn latest_fetches(
        &self,
        window: &WindowRef,
        categories: &[SourceCategory],
    ) -> PulseResult<BTreeMap<SourceCategory, Option<DateTime<Utc>>>> {
        let mut out = BTreeMap::new();
        for category in categories {
            let latest = self.read_latest_fetch_in_window(window, category).await?;
            out.insert(category.clone(), latest);
        }
        Ok(out)
    }

    /// Facts about `subject` in `period`, highest confidence first.
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn read_facts(&self, subject: &SubjectRef, period: Period) -> PulseResult<Vec<Stored<Fact>>> {
        let mut facts: Vec<Stored<Fact>> = Vec::new();
        for window in self.windows_for(subject, period).await? {
            for edge in self.store.edges_to(window.id, EdgeKind::Within).await? {
                if let Some(fact) = self.load::<Fact>(edge.from).await? {
                    facts.push(fact);
                }
            }
        }
        facts.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.extracted_at.cmp(&a.extracted_at))
                .then_with(|| a.key.cmp(&b.key))
        });
        facts.dedup_by_key(|f| f.id);
        Ok(facts)
    }

    /// The source records supporting a fact.
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn read_fact_sources(&self, fact: &Stored<Fact>) -> PulseResult<Vec<Stored<SourceRecord>>> {
        let mut sources = Vec::with_capacity(fact.supported_by.len());
        for id in &fact.supported_by {
            if let Some(source) = self.load::<SourceRecord>(*id).await? {
                sources.push(source);
            }
        }
        sources.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at));
        Ok(sources)
    }

    /// The most recently computed `metric_type` for `subject` in `period`.
    ///
    /// # Errors
    /// Propagates store errors.
    pub async fn read_metric(
        &self,
        subject: &SubjectRef,
        period: Period,
        metric_type: SignalType,
    ) -> PulseResult<Option<Stored<Metric>>> {
        let mut best: Option<Stored<Metric>> = None;
        for window in self.windows_for(subject, period).await? {
            for edge in self.store.edges_to(window.id, EdgeKind::Measures).await? {
                let Some(metric) = self.load::<Metric>(edge.from).await? else {
                    continue;
                };
                if metric.metric_type != metric_type {
                    continue;
                }
                if best.as_ref().map_or(true, |b| metric.computed_at > b.computed_at) {
                    best = Some(metric);
                }
            }
        }
        Ok(best)
    }
}

impl std::fmt::Debug for GraphMergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphMergeEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
