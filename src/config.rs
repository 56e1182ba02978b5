//! Configuration.
//!
//! Every section has a `Default` and deserializes with `#[serde(default)]`, so
//! a partial JSON document only overrides what it names.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PulseError, PulseResult};
use crate::registry::SourceCategory;

const HOUR_SECS: u64 = 60 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Staleness thresholds.
    pub freshness: FreshnessConfig,
    /// Refresh pipeline settings.
    pub refresh: RefreshConfig,
    /// Merge engine settings.
    pub merge: MergeConfig,
    /// Comparison read settings.
    pub comparison: ComparisonConfig,
}

impl PulseConfig {
    /// Parses a JSON document and validates it.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::Config` on malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> PulseResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PulseError::config(format!("invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make the pipeline spin or never finish.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::Config` naming the first offending field.
    pub fn validate(&self) -> PulseResult<()> {
        let checks: [(&str, bool); 8] = [
            ("refresh.collaborator_timeout_ms", self.refresh.collaborator_timeout_ms > 0),
            ("refresh.fetch_concurrency", self.refresh.fetch_concurrency > 0),
            ("refresh.extract_concurrency", self.refresh.extract_concurrency > 0),
            ("refresh.merge_retry.max_attempts", self.refresh.merge_retry.max_attempts > 0),
            ("refresh.guard.lease_ttl_secs", self.refresh.guard.lease_ttl_secs > 0),
            ("merge.source_bucket_secs", self.merge.source_bucket_secs > 0),
            ("merge.max_cas_attempts", self.merge.max_cas_attempts > 0),
            (
                "refresh.max_document_chars",
                self.refresh.max_document_chars >= self.refresh.min_document_chars,
            ),
        ];
        for (field, ok) in checks {
            if !ok {
                return Err(PulseError::config(format!("{field} is out of range")));
            }
        }
        Ok(())
    }
}

/// Max-age thresholds per source category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Max age in seconds keyed by category.
    pub thresholds_secs: BTreeMap<SourceCategory, u64>,
    /// Applies to categories without an explicit threshold.
    pub default_max_age_secs: u64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        let thresholds_secs = BTreeMap::from([
            (SourceCategory::News, 6 * HOUR_SECS),
            (SourceCategory::Social, HOUR_SECS),
            (SourceCategory::Forum, 6 * HOUR_SECS),
            (SourceCategory::Blog, 24 * HOUR_SECS),
            (SourceCategory::Filing, 24 * HOUR_SECS),
        ]);
        Self {
            thresholds_secs,
            default_max_age_secs: 24 * HOUR_SECS,
        }
    }
}

/// What a refresh does when the same key is already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    /// Wait for the in-flight refresh and share its outcome.
    #[default]
    Wait,
    /// Fail fast with `RefreshInProgress`.
    Reject,
}

/// In-flight refresh guard settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Behavior when the key is already held.
    pub mode: GuardMode,
    /// A lease older than this is considered abandoned and may be taken over.
    pub lease_ttl_secs: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            mode: GuardMode::Wait,
            lease_ttl_secs: 600,
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per retry.
    pub base_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let pow = retry.saturating_sub(1).min(16);
        let factor = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

/// Refresh pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Per collaborator call.
    pub collaborator_timeout_ms: u64,
    /// Origins fetched per category, after discovery.
    pub max_origins: usize,
    /// Fetches in flight per category.
    pub fetch_concurrency: usize,
    /// Extractor calls in flight per category.
    pub extract_concurrency: usize,
    /// Shorter documents are skipped.
    pub min_document_chars: usize,
    /// Longer documents are truncated before extraction.
    pub max_document_chars: usize,
    /// Retry policy for transient store errors while merging.
    pub merge_retry: RetryPolicy,
    /// In-flight guard.
    pub guard: GuardConfig,
}

impl RefreshConfig {
    /// `collaborator_timeout_ms` as a `Duration`.
    #[must_use]
    pub const fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            collaborator_timeout_ms: 30_000,
            max_origins: 5,
            fetch_concurrency: 4,
            extract_concurrency: 4,
            min_document_chars: 40,
            max_document_chars: 50_000,
            merge_retry: RetryPolicy::default(),
            guard: GuardConfig::default(),
        }
    }
}

/// Merge engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Re-fetches of one origin within a bucket collapse into one source record.
    ///
    /// The record keeps the latest `fetched_at` of the bucket, so the bucket
    /// size never delays the freshness cursor.
    pub source_bucket_secs: u64,
    /// Conditional-write attempts before reporting contention.
    pub max_cas_attempts: u32,
    /// Extraction schema version, part of the fact natural key.
    pub schema_version: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            source_bucket_secs: HOUR_SECS,
            max_cas_attempts: 16,
            schema_version: 1,
        }
    }
}

/// Comparison read settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Facts returned per period.
    pub fact_limit: usize,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self { fact_limit: 15 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(PulseConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides() {
        let cfg = PulseConfig::from_json_str(
            r#"{
                "freshness": { "thresholds_secs": { "news": 3600, "filings": 86400 } },
                "refresh": { "guard": { "mode": "reject" } }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.freshness.thresholds_secs.len(), 2);
        assert_eq!(cfg.freshness.thresholds_secs[&SourceCategory::Filing], 86_400);
        assert_eq!(cfg.refresh.guard.mode, GuardMode::Reject);
        assert_eq!(cfg.refresh.max_origins, 5);
        assert_eq!(cfg.merge.source_bucket_secs, 3_600);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = PulseConfig::from_json_str(r#"{ "merge": { "max_cas_attempts": 0 } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("merge.max_cas_attempts"));

        assert!(PulseConfig::from_json_str("{ not json").is_err());
    }

    #[test]
    fn test_extract_concurrency_is_separate() {
        let cfg = PulseConfig::from_json_str(r#"{ "refresh": { "extract_concurrency": 1 } }"#)
            .unwrap();
        assert_eq!(cfg.refresh.extract_concurrency, 1);
        assert_eq!(cfg.refresh.fetch_concurrency, 4);

        let err = PulseConfig::from_json_str(r#"{ "refresh": { "extract_concurrency": 0 } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("refresh.extract_concurrency"));
    }

    #[test]
    fn test_retry_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
    }
}
