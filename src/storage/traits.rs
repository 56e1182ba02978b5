//! Abstract graph storage traits.
//!
//! The store holds labeled nodes addressed by `(label, natural key)` and typed
//! edges between node ids. It offers two conditional write primitives,
//! [`GraphStore::insert_if_absent`] and [`GraphStore::compare_and_swap`], and
//! nothing else: natural-key derivation and merge rules live in
//! [`GraphMergeEngine`](crate::graph::GraphMergeEngine).

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Conditional write kept losing to concurrent writers.
    #[error("Write contention on {label}:{key} after {attempts} attempts")]
    Contention {
        /// Label of the contended node.
        label: NodeLabel,
        /// Natural key of the contended node.
        key: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl StorageError {
    /// Transient errors may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendError(_) | Self::ConnectionError(_) | Self::Contention { .. }
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Store-assigned node identifier. The first committer's id is canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Creates a new random node ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLabel {
    /// A tracked company or entity.
    Subject,
    /// A (subject, period, event) window.
    Window,
    /// A fetched source record.
    Source,
    /// An extracted claim.
    Fact,
    /// A metric value.
    Metric,
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Subject => "subject",
            Self::Window => "window",
            Self::Source => "source",
            Self::Fact => "fact",
            Self::Metric => "metric",
        })
    }
}

/// Edge types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    /// Subject -> Window
    HasWindow,
    /// Source -> Window
    Covers,
    /// Source -> Subject
    Mentions,
    /// Fact -> Subject
    About,
    /// Fact -> Window
    Within,
    /// Fact -> Source
    SupportedBy,
    /// Metric -> Window
    Measures,
}

/// A stored node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Store-assigned id.
    pub id: NodeId,
    /// Node label.
    pub label: NodeLabel,
    /// Natural key, unique per label.
    pub key: String,
    /// Monotonic per-node write counter; starts at 1.
    pub version: u64,
    /// Label-specific JSON payload.
    pub properties: serde_json::Value,
    /// First insert time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Builds an unsaved node. The store assigns version 1 on insert.
    #[must_use]
    pub fn new(label: NodeLabel, key: impl Into<String>, properties: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::new(),
            label,
            key: key.into(),
            version: 0,
            properties,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A directed, typed edge. Edges carry no properties and are set-valued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    /// Source node.
    pub from: NodeId,
    /// Edge type.
    pub kind: EdgeKind,
    /// Target node.
    pub to: NodeId,
}

impl Edge {
    /// An edge from `from` to `to`.
    #[must_use]
    pub const fn new(from: NodeId, kind: EdgeKind, to: NodeId) -> Self {
        Self { from, kind, to }
    }
}

/// Result of [`GraphStore::insert_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The node was written; contains the stored node.
    Inserted(Node),
    /// A node with the same `(label, key)` already existed; contains it unchanged.
    Existing(Node),
}

/// Result of [`GraphStore::compare_and_swap`].
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write was applied; contains the stored node.
    Swapped(Node),
    /// The stored version did not match; contains the current node.
    Conflict(Node),
}

/// Storage trait for the property graph.
///
/// # Safety Considerations
/// - Each method is individually atomic
/// - Implementations must be safe under concurrent access
/// - Reads are at least read-committed
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Get a node by natural key.
    async fn get(&self, label: NodeLabel, key: &str) -> Result<Option<Node>, StorageError>;

    /// Get a node by id.
    async fn get_by_id(&self, id: NodeId) -> Result<Option<Node>, StorageError>;

    /// Insert `node` unless `(label, key)` is taken.
    async fn insert_if_absent(&self, node: Node) -> Result<InsertOutcome, StorageError>;

    /// Replace the node with `node.id` if its stored version equals `expected_version`.
    ///
    /// `id`, `label`, `key` and `created_at` are preserved from the stored node;
    /// the version is incremented by the store.
    ///
    /// # Errors
    /// - `NodeNotFound`: if no node with `node.id` exists
    async fn compare_and_swap(
        &self,
        node: Node,
        expected_version: u64,
    ) -> Result<CasOutcome, StorageError>;

    /// Add an edge unless it already exists. Returns true if it was added.
    ///
    /// # Errors
    /// - `NodeNotFound`: if either endpoint is missing
    async fn insert_edge_if_absent(&self, edge: Edge) -> Result<bool, StorageError>;

    /// Outgoing edges of `from` with the given kind.
    async fn edges_from(&self, from: NodeId, kind: EdgeKind) -> Result<Vec<Edge>, StorageError>;

    /// Incoming edges of `to` with the given kind.
    async fn edges_to(&self, to: NodeId, kind: EdgeKind) -> Result<Vec<Edge>, StorageError>;

    /// Count nodes with a label.
    async fn count(&self, label: NodeLabel) -> Result<usize, StorageError>;

    /// All nodes with a label.
    async fn scan(&self, label: NodeLabel) -> Result<Vec<Node>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure the trait is object-safe
    fn _assert_graph_store_object_safe(_: &dyn GraphStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::NodeNotFound(NodeId::new());
        assert!(err.to_string().contains("Node not found"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_storage_error_transient() {
        assert!(StorageError::BackendError("x".to_string()).is_transient());
        assert!(StorageError::ConnectionError("x".to_string()).is_transient());
        assert!(StorageError::Contention {
            label: NodeLabel::Window,
            key: "k".to_string(),
            attempts: 3,
        }
        .is_transient());
        assert!(!StorageError::SerializationError("x".to_string()).is_transient());
        assert!(!StorageError::NodeNotFound(NodeId::new()).is_transient());
    }

    #[test]
    fn test_edge_kind_serialization() {
        let json = serde_json::to_string(&EdgeKind::SupportedBy).unwrap();
        assert_eq!(json, "\"SUPPORTED_BY\"");
    }
}
