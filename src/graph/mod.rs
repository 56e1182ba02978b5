//! Knowledge-graph entities, natural keys, and the merge engine.

pub mod entities;
pub mod keys;
mod merge;

pub use entities::{
    Fact, FactRef, Metric, MetricRef, SourceRecord, SourceRef, Stored, Subject, SubjectRef,
    Window, WindowRef,
};
pub use merge::{GraphMergeEngine, WriteKind};
