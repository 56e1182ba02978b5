//! Persisted entity types and the references handed out by the merge engine.
//!
//! The structs here are the node properties. Identity (node id, natural key,
//! version) travels alongside in [`Stored`].

use std::collections::BTreeSet;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::period::Period;
use crate::registry::{EventType, SignalType, SourceCategory};
use crate::storage::{Node, NodeId, StorageError};

/// A company (or other tracked subject).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    /// Canonical identifier, equal to the natural key.
    pub identifier: String,
    /// Overwritten on every re-upsert.
    pub display_name: String,
}

/// A `(subject, period, event type)` scope for facts and metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    /// Natural key of the owning subject.
    pub subject_key: String,
    /// Fiscal quarter.
    pub period: Period,
    /// Event category of the window.
    pub event_type: EventType,
}

/// Fetches of one origin, deduplicated per time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Normalized origin locator.
    pub origin: String,
    /// Latest fetch inside the bucket.
    pub fetched_at: DateTime<Utc>,
    /// Every category this origin was fetched for; grows by union on merge.
    pub categories: BTreeSet<SourceCategory>,
    /// Title reported by the fetcher, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// blake3 of the normalized content.
    pub content_hash: String,
    /// Content length in characters.
    pub content_len: usize,
}

/// An extracted claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Claim text as first written.
    pub text: String,
    /// Optional label such as `guidance`; the first writer's label is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_type: Option<String>,
    /// In `[0, 1]`; the highest seen so far.
    pub confidence: f64,
    /// When the claim was last extracted.
    pub extracted_at: DateTime<Utc>,
    /// Natural key of the subject the claim is about.
    pub subject_key: String,
    /// Natural key of the owning window.
    pub window_key: String,
    /// Extraction schema version, part of the natural key.
    pub schema_version: u32,
    /// Never empty; grows by union on merge.
    pub supported_by: BTreeSet<NodeId>,
}

/// A scalar signal computed for a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Natural key of the measured subject.
    pub subject_key: String,
    /// Natural key of the owning window.
    pub window_key: String,
    /// Signal being measured.
    pub metric_type: SignalType,
    /// Within the signal's declared range.
    pub value: f64,
    /// Number of observations behind `value`.
    pub volume: u64,
    /// Newer values replace older ones; older writes are dropped.
    pub computed_at: DateTime<Utc>,
}

/// An entity read back from the store together with its node identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stored<T> {
    /// Canonical node id.
    pub id: NodeId,
    /// Natural key.
    pub key: String,
    /// Store write counter.
    pub version: u64,
    /// Time of the last applied write.
    pub updated_at: DateTime<Utc>,
    /// The entity properties.
    #[serde(flatten)]
    pub data: T,
}

impl<T> Stored<T>
where
    T: for<'de> Deserialize<'de>,
{
    pub(crate) fn from_node(node: &Node) -> Result<Self, StorageError> {
        Ok(Self {
            id: node.id,
            key: node.key.clone(),
            version: node.version,
            updated_at: node.updated_at,
            data: serde_json::from_value(node.properties.clone())?,
        })
    }
}

impl<T> Deref for Stored<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

/// Stable handle to a subject node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectRef {
    /// Canonical node id.
    pub id: NodeId,
    /// Natural key.
    pub key: String,
}

/// Stable handle to a window node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowRef {
    /// Canonical node id.
    pub id: NodeId,
    /// Natural key.
    pub key: String,
    /// Owning subject.
    pub subject: SubjectRef,
    /// Fiscal quarter.
    pub period: Period,
    /// Event category.
    pub event_type: EventType,
}

/// Stable handle to a source record node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    /// Canonical node id.
    pub id: NodeId,
    /// Natural key (origin plus fetch bucket).
    pub key: String,
    /// Categories recorded on the node after the write.
    pub categories: BTreeSet<SourceCategory>,
    /// Latest fetch inside the bucket.
    pub fetched_at: DateTime<Utc>,
}

/// Stable handle to a fact node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactRef {
    /// Canonical node id.
    pub id: NodeId,
    /// Natural key.
    pub key: String,
}

/// Stable handle to a metric node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricRef {
    /// Canonical node id.
    pub id: NodeId,
    /// Natural key.
    pub key: String,
}
