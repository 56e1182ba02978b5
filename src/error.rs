//! Error types for PulseGraph.
//!
//! All errors are strongly typed using thiserror. Collaborator and store
//! failures are caught at the smallest scope (per document, per category) and
//! folded into a [`RefreshResult`](crate::refresh::RefreshResult); only the
//! variants reachable through [`PulseError`] ever surface to a caller.

use thiserror::Error;

use crate::refresh::RefreshIssue;
use crate::storage::StorageError;

/// Malformed period identifier (user input, recoverable by re-prompting).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// No input.
    #[error("Period string is empty")]
    Empty,

    /// Input is not `Qn-YYYY`.
    #[error("Invalid period format '{input}'. Expected 'Q[1-4]-YYYY'")]
    Malformed {
        /// The rejected input.
        input: String,
    },

    /// Quarter digit outside 1..=4.
    #[error("Quarter must be 1-4, got {quarter} in '{input}'")]
    QuarterOutOfRange {
        /// The rejected input.
        input: String,
        /// The parsed quarter digit.
        quarter: u32,
    },
}

/// Structurally invalid entity, rejected at the boundary and never partially written.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A fact arrived with no supporting source.
    #[error("Fact must be supported by at least one source record")]
    EmptySupport,

    /// A required text field is blank.
    #[error("Field '{field}' cannot be empty")]
    EmptyField {
        /// Name of the blank field.
        field: &'static str,
    },

    /// Confidence outside `[0.0, 1.0]`.
    #[error("Confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        /// The rejected value.
        value: f64,
    },

    /// NaN or infinite numeric field.
    #[error("Field '{field}' must be a finite number")]
    NonFiniteValue {
        /// Name of the offending field.
        field: &'static str,
    },

    /// Metric value outside its declared range.
    #[error("Metric '{metric}' value {value} is outside [{min}, {max}]")]
    MetricOutOfRange {
        /// Metric type name.
        metric: String,
        /// The rejected value.
        value: f64,
        /// Lower bound of the declared range.
        min: f64,
        /// Upper bound of the declared range.
        max: f64,
    },

    /// A ref points at a node the store does not hold.
    #[error("Referenced {label} node does not exist: {id}")]
    DanglingReference {
        /// Label of the missing node.
        label: &'static str,
        /// Id of the missing node.
        id: String,
    },

    /// Subject and window refs disagree.
    #[error("Window {window} does not belong to subject {subject}")]
    SubjectMismatch {
        /// Subject natural key.
        subject: String,
        /// Window natural key.
        window: String,
    },

    /// Event type name not in the registry.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Signal type name not in the registry.
    #[error("Unknown signal type: {0}")]
    UnknownSignalType(String),

    /// Category name that does not parse.
    #[error("Unknown source category: {0}")]
    UnknownSourceCategory(String),
}

/// Query-generation collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// The generator could not be reached.
    #[error("Query generation unavailable: {message}")]
    Unavailable {
        /// Collaborator-provided detail.
        message: String,
    },

    /// The generator exceeded the collaborator timeout.
    #[error("Query generation timed out after {duration_ms}ms")]
    Timeout {
        /// Elapsed time before giving up.
        duration_ms: u64,
    },

    /// The generator returned an unusable query.
    #[error("Generated query spec is invalid: {reason}")]
    InvalidSpec {
        /// Why the query was rejected.
        reason: String,
    },
}

/// Discovery/fetch collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The fetch exceeded the collaborator timeout.
    #[error("Fetch timed out after {duration_ms}ms")]
    Timeout {
        /// Elapsed time before giving up.
        duration_ms: u64,
    },

    /// The origin could not be reached.
    #[error("Origin unreachable: {message}")]
    Unreachable {
        /// Transport detail.
        message: String,
    },

    /// The origin refused the request.
    #[error("Origin blocked the request: {reason}")]
    Blocked {
        /// Refusal detail, such as a status or robots rule.
        reason: String,
    },
}

/// Extraction collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    /// The extractor could not be reached.
    #[error("Extraction unavailable: {message}")]
    Unavailable {
        /// Collaborator-provided detail.
        message: String,
    },

    /// The extractor exceeded the collaborator timeout.
    #[error("Extraction timed out after {duration_ms}ms")]
    Timeout {
        /// Elapsed time before giving up.
        duration_ms: u64,
    },

    /// The extractor returned output that does not parse.
    #[error("Extraction output malformed: {reason}")]
    Malformed {
        /// Parse failure detail.
        reason: String,
    },
}

/// A fetched document that could not be normalized into extractable text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    /// Nothing left after stripping markup.
    #[error("Document body is empty")]
    Empty,

    /// Below the configured minimum length.
    #[error("Document has {actual} characters after normalization, minimum is {min}")]
    TooShort {
        /// Characters after normalization.
        actual: usize,
        /// Configured minimum.
        min: usize,
    },

    /// Body looks like binary content.
    #[error("Document body is not text")]
    Binary,
}

/// Refresh-level failures surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RefreshError {
    /// Every requested category is already being refreshed.
    #[error("Refresh already in progress for {key}")]
    InProgress {
        /// Display form of the held key.
        key: String,
    },

    /// No category got past query generation.
    #[error("Refresh blocked: no category could begin ({} issues)", issues.len())]
    Blocked {
        /// One issue per failed category.
        issues: Vec<RefreshIssue>,
    },

    /// Cancelled before any document was merged.
    #[error("Refresh cancelled")]
    Cancelled,
}

/// Top-level error type for PulseGraph.
#[derive(Debug, Error)]
pub enum PulseError {
    /// Malformed period.
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Rejected entity.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Store failure after retries.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Refresh-level failure.
    #[error("Refresh error: {0}")]
    Refresh(#[from] RefreshError),

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// What failed validation.
        message: String,
    },

    /// Broken internal invariant.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl PulseError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a concurrency-guard rejection.
    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        matches!(self, Self::Refresh(RefreshError::InProgress { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::Refresh(RefreshError::InProgress { .. }) => true,
            Self::Format(_)
            | Self::Validation(_)
            | Self::Refresh(_)
            | Self::Config { .. }
            | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for PulseGraph operations.
pub type PulseResult<T> = Result<T, PulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_message() {
        let err = FormatError::Malformed {
            input: "2025-Q3".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("2025-Q3"));
        assert!(msg.contains("Q[1-4]-YYYY"));
    }

    #[test]
    fn test_validation_error_confidence() {
        let err = ValidationError::ConfidenceOutOfRange { value: 1.5 };
        let msg = format!("{err}");
        assert!(msg.contains("1.5"));
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn test_fetch_error_timeout() {
        let err = FetchError::Timeout { duration_ms: 5000 };
        assert!(format!("{err}").contains("5000ms"));
    }

    #[test]
    fn test_pulse_error_from_validation() {
        let err: PulseError = ValidationError::EmptySupport.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pulse_error_retryable() {
        let err: PulseError = StorageError::BackendError("connection reset".to_string()).into();
        assert!(err.is_retryable());

        let err: PulseError = StorageError::SerializationError("bad json".to_string()).into();
        assert!(!err.is_retryable());

        let err: PulseError = RefreshError::InProgress {
            key: "nvda/Q3-2025/earnings/news".to_string(),
        }
        .into();
        assert!(err.is_in_progress());
        assert!(err.is_retryable());

        let err: PulseError = FormatError::Empty.into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pulse_error_internal() {
        let err = PulseError::internal("unexpected state");
        assert!(format!("{err}").contains("unexpected state"));
        assert!(!err.is_retryable());
    }
}
