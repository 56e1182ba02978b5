//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of
//! [`GraphStore`]. It is intended for embedded usage, tests, and as a
//! reference implementation of the conditional-write contract.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::storage::traits::{
    CasOutcome, Edge, EdgeKind, GraphStore, InsertOutcome, Node, NodeId, NodeLabel, StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct GraphState {
    by_id: HashMap<NodeId, Node>,
    by_key: HashMap<(NodeLabel, String), NodeId>,
    out_edges: HashMap<(NodeId, EdgeKind), BTreeSet<NodeId>>,
    in_edges: HashMap<(NodeId, EdgeKind), BTreeSet<NodeId>>,
}

/// Thread-safe in-memory graph store.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    state: RwLock<GraphState>,
}

impl InMemoryGraphStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of edges, across all kinds.
    ///
    /// # Errors
    /// Returns `BackendError` if the lock is poisoned.
    pub fn edge_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("graph.edge_count"))?;
        Ok(state.out_edges.values().map(BTreeSet::len).sum())
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get(&self, label: NodeLabel, key: &str) -> Result<Option<Node>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("graph.get"))?;
        Ok(state
            .by_key
            .get(&(label, key.to_string()))
            .and_then(|id| state.by_id.get(id))
            .cloned())
    }

    async fn get_by_id(&self, id: NodeId) -> Result<Option<Node>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("graph.get_by_id"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    async fn insert_if_absent(&self, mut node: Node) -> Result<InsertOutcome, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("graph.insert_if_absent"))?;

        let index_key = (node.label, node.key.clone());
        if let Some(existing) = state.by_key.get(&index_key).and_then(|id| state.by_id.get(id)) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        if state.by_id.contains_key(&node.id) {
            return Err(StorageError::BackendError(format!(
                "node id collision on insert: {}",
                node.id
            )));
        }

        node.version = 1;
        state.by_key.insert(index_key, node.id);
        state.by_id.insert(node.id, node.clone());
        Ok(InsertOutcome::Inserted(node))
    }

    async fn compare_and_swap(
        &self,
        mut node: Node,
        expected_version: u64,
    ) -> Result<CasOutcome, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("graph.compare_and_swap"))?;

        let current = state
            .by_id
            .get_mut(&node.id)
            .ok_or(StorageError::NodeNotFound(node.id))?;

        if current.version != expected_version {
            return Ok(CasOutcome::Conflict(current.clone()));
        }

        node.label = current.label;
        node.key.clone_from(&current.key);
        node.created_at = current.created_at;
        node.version = current.version + 1;
        node.updated_at = Utc::now();
        *current = node.clone();
        Ok(CasOutcome::Swapped(node))
    }

    async fn insert_edge_if_absent(&self, edge: Edge) -> Result<bool, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("graph.insert_edge_if_absent"))?;

        for endpoint in [edge.from, edge.to] {
            if !state.by_id.contains_key(&endpoint) {
                return Err(StorageError::NodeNotFound(endpoint));
            }
        }

        let added = state
            .out_edges
            .entry((edge.from, edge.kind))
            .or_default()
            .insert(edge.to);
        if added {
            state
                .in_edges
                .entry((edge.to, edge.kind))
                .or_default()
                .insert(edge.from);
        }
        Ok(added)
    }

    async fn edges_from(&self, from: NodeId, kind: EdgeKind) -> Result<Vec<Edge>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("graph.edges_from"))?;
        Ok(state
            .out_edges
            .get(&(from, kind))
            .map(|targets| targets.iter().map(|&to| Edge::new(from, kind, to)).collect())
            .unwrap_or_default())
    }

    async fn edges_to(&self, to: NodeId, kind: EdgeKind) -> Result<Vec<Edge>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("graph.edges_to"))?;
        Ok(state
            .in_edges
            .get(&(to, kind))
            .map(|sources| sources.iter().map(|&from| Edge::new(from, kind, to)).collect())
            .unwrap_or_default())
    }

    async fn count(&self, label: NodeLabel) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("graph.count"))?;
        Ok(state.by_key.keys().filter(|(l, _)| *l == label).count())
    }

    async fn scan(&self, label: NodeLabel) -> Result<Vec<Node>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("graph.scan"))?;
        let mut nodes: Vec<Node> = state
            .by_id
            .values()
            .filter(|n| n.label == label)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(nodes)
    }
}
