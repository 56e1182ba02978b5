//! Read-only period comparison.
//!
//! Reads already-materialized facts and metrics for two periods and derives a
//! delta. Never triggers a refresh.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PulseResult;
use crate::graph::{Fact, GraphMergeEngine, Metric, SourceRecord, Stored, SubjectRef};
use crate::period::Period;
use crate::registry::{SignalType, SourceCategory};

/// A supporting source as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceView {
    /// Normalized origin locator.
    pub origin: String,
    /// Title reported by the fetcher.
    pub title: Option<String>,
    /// Categories the origin was fetched for.
    pub categories: BTreeSet<SourceCategory>,
    /// Latest fetch in the record's bucket.
    pub fetched_at: DateTime<Utc>,
}

impl From<&Stored<SourceRecord>> for SourceView {
    fn from(source: &Stored<SourceRecord>) -> Self {
        Self {
            origin: source.origin.clone(),
            title: source.title.clone(),
            categories: source.categories.clone(),
            fetched_at: source.fetched_at,
        }
    }
}

/// A fact with its evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactView {
    /// Claim text.
    pub text: String,
    /// Optional claim label.
    pub claim_type: Option<String>,
    /// Merged confidence in `[0, 1]`.
    pub confidence: f64,
    /// When the claim was last extracted.
    pub extracted_at: DateTime<Utc>,
    /// Supporting sources, newest first.
    pub sources: Vec<SourceView>,
}

/// A metric reading as shown to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricView {
    /// Signal measured.
    pub metric_type: SignalType,
    /// Measured value.
    pub value: f64,
    /// Observations behind the value.
    pub volume: u64,
    /// When the value was computed.
    pub computed_at: DateTime<Utc>,
}

impl From<&Stored<Metric>> for MetricView {
    fn from(metric: &Stored<Metric>) -> Self {
        Self {
            metric_type: metric.metric_type,
            value: metric.value,
            volume: metric.volume,
            computed_at: metric.computed_at,
        }
    }
}

/// Facts and metrics for two periods, with the derived delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// Canonical subject identifier.
    pub subject: String,
    /// Signal compared.
    pub metric_type: SignalType,
    /// Latest period.
    pub period_a: Period,
    /// Comparison period.
    pub period_b: Period,
    /// Facts for `period_a`, highest confidence first.
    pub facts_a: Vec<FactView>,
    /// Facts for `period_b`, highest confidence first.
    pub facts_b: Vec<FactView>,
    /// Latest `metric_type` reading for `period_a`.
    pub metric_a: Option<MetricView>,
    /// Latest `metric_type` reading for `period_b`.
    pub metric_b: Option<MetricView>,
    /// `metric_a - metric_b`; absent unless both metrics exist.
    pub delta: Option<f64>,
    /// Explains an absent delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Derives the delta between two optional metrics.
///
/// Missing data never becomes zero: if either side is absent the delta is
/// absent and the note says which.
#[must_use]
pub fn metric_delta(
    metric_type: SignalType,
    (period_a, a): (Period, Option<&MetricView>),
    (period_b, b): (Period, Option<&MetricView>),
) -> (Option<f64>, Option<String>) {
    match (a, b) {
        (Some(a), Some(b)) => (Some(a.value - b.value), None),
        (None, None) => (
            None,
            Some(format!("no {metric_type} recorded for {period_a} or {period_b}")),
        ),
        (None, Some(_)) => (
            None,
            Some(format!("no {metric_type} recorded for {period_a}; delta not computed")),
        ),
        (Some(_), None) => (
            None,
            Some(format!("no {metric_type} recorded for {period_b}; delta not computed")),
        ),
    }
}

/// Read-only comparison surface.
#[derive(Debug, Clone)]
pub struct ComparisonReader {
    engine: GraphMergeEngine,
    fact_limit: usize,
}

impl ComparisonReader {
    /// Reader returning at most `fact_limit` facts per period.
    #[must_use]
    pub fn new(engine: GraphMergeEngine, fact_limit: usize) -> Self {
        Self { engine, fact_limit }
    }

    /// Compares `subject` between two periods.
    ///
    /// An unknown subject yields empty facts and an absent delta.
    ///
    /// # Errors
    ///
    /// `ValidationError` for a blank subject; store errors.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn compare(
        &self,
        subject: &str,
        period_a: Period,
        period_b: Period,
        metric_type: SignalType,
    ) -> PulseResult<ComparisonResult> {
        let Some(subject_ref) = self.engine.find_subject(subject).await? else {
            let (delta, note) = metric_delta(metric_type, (period_a, None), (period_b, None));
            return Ok(ComparisonResult {
                subject: subject.trim().to_string(),
                metric_type,
                period_a,
                period_b,
                facts_a: Vec::new(),
                facts_b: Vec::new(),
                metric_a: None,
                metric_b: None,
                delta,
                note: note.map(|n| format!("unknown subject; {n}")),
            });
        };

        let facts_a = self.facts(&subject_ref, period_a).await?;
        let facts_b = self.facts(&subject_ref, period_b).await?;
        let metric_a = self
            .engine
            .read_metric(&subject_ref, period_a, metric_type)
            .await?
            .as_ref()
            .map(MetricView::from);
        let metric_b = self
            .engine
            .read_metric(&subject_ref, period_b, metric_type)
            .await?
            .as_ref()
            .map(MetricView::from);
        let (delta, note) = metric_delta(
            metric_type,
            (period_a, metric_a.as_ref()),
            (period_b, metric_b.as_ref()),
        );

        Ok(ComparisonResult {
            subject: subject_ref.key,
            metric_type,
            period_a,
            period_b,
            facts_a,
            facts_b,
            metric_a,
            metric_b,
            delta,
            note,
        })
    }

    async fn facts(&self, subject: &SubjectRef, period: Period) -> PulseResult<Vec<FactView>> {
        let facts: Vec<Stored<Fact>> = self.engine.read_facts(subject, period).await?;
        let mut views = Vec::with_capacity(facts.len().min(self.fact_limit));
        for fact in facts.iter().take(self.fact_limit) {
            let sources = self.engine.read_fact_sources(fact).await?;
            views.push(FactView {
                text: fact.text.clone(),
                claim_type: fact.claim_type.clone(),
                confidence: fact.confidence,
                extracted_at: fact.extracted_at,
                sources: sources.iter().map(SourceView::from).collect(),
            });
        }
        Ok(views)
    }
}
