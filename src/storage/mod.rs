//! Graph storage for PulseGraph.
//!
//! [`GraphStore`] is the abstract interface; [`InMemoryGraphStore`] is the
//! embedded backend. Only [`GraphMergeEngine`](crate::graph::GraphMergeEngine)
//! writes through it.

mod memory;
mod traits;

pub use memory::InMemoryGraphStore;
pub use traits::{
    CasOutcome, Edge, EdgeKind, GraphStore, InsertOutcome, Node, NodeId, NodeLabel, StorageError,
};
