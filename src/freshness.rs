//! Freshness policy.
//!
//! Pure decision logic: given the most recent fetch time per source category
//! and the configured max-age thresholds, decide which categories need a
//! refresh. The policy never reads the store; callers hand it the cursor
//! values read through [`GraphMergeEngine`](crate::graph::GraphMergeEngine).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FreshnessConfig;
use crate::registry::SourceCategory;

/// Freshness verdict for one category.
///
/// Ordered by severity so the aggregate is simply the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Fetched within the category's max age.
    Fresh,
    /// Fetched, but longer ago than the max age.
    Stale,
    /// No record was ever fetched.
    Unknown,
}

impl Verdict {
    /// Whether this verdict authorizes a refresh.
    #[must_use]
    pub const fn needs_refresh(self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fresh => "FRESH",
            Self::Stale => "STALE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Per-category verdict with the inputs that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFreshness {
    /// Verdict for this category.
    pub verdict: Verdict,
    /// Newest fetch of the category linked to the window.
    pub latest_fetch: Option<DateTime<Utc>>,
    /// Threshold the verdict was evaluated against.
    pub max_age_secs: u64,
}

/// Result of evaluating a set of categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessReport {
    /// Verdict per requested category.
    pub categories: BTreeMap<SourceCategory, CategoryFreshness>,
    /// Most severe verdict across `categories`; `Fresh` when none were requested.
    pub aggregate: Verdict,
    /// Instant the verdicts were computed for.
    pub checked_at: DateTime<Utc>,
}

impl FreshnessReport {
    /// Verdict for `category`, if it was requested.
    #[must_use]
    pub fn verdict(&self, category: &SourceCategory) -> Option<Verdict> {
        self.categories.get(category).map(|c| c.verdict)
    }

    /// Categories whose verdict authorizes a refresh, in stable order.
    #[must_use]
    pub fn stale_categories(&self) -> Vec<SourceCategory> {
        self.categories
            .iter()
            .filter(|(_, c)| c.verdict.needs_refresh())
            .map(|(category, _)| category.clone())
            .collect()
    }

    /// Whether any requested category needs a refresh.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.aggregate.needs_refresh()
    }
}

/// Max-age thresholds per source category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshnessPolicy {
    thresholds: BTreeMap<SourceCategory, Duration>,
    default_max_age: Duration,
}

// Thresholds beyond a century are treated as a century.
const MAX_THRESHOLD_SECS: u64 = 100 * 366 * 24 * 60 * 60;

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value.min(MAX_THRESHOLD_SECS)).unwrap_or(0))
}

impl FreshnessPolicy {
    /// Policy with explicit thresholds and a fallback for unlisted categories.
    #[must_use]
    pub fn new(thresholds: BTreeMap<SourceCategory, Duration>, default_max_age: Duration) -> Self {
        Self {
            thresholds,
            default_max_age,
        }
    }

    /// Policy built from configured second counts.
    #[must_use]
    pub fn from_config(config: &FreshnessConfig) -> Self {
        let thresholds = config
            .thresholds_secs
            .iter()
            .map(|(category, max_age)| (category.clone(), secs(*max_age)))
            .collect();
        Self::new(thresholds, secs(config.default_max_age_secs))
    }

    /// Threshold for `category`, falling back to the default.
    #[must_use]
    pub fn max_age(&self, category: &SourceCategory) -> Duration {
        self.thresholds
            .get(category)
            .copied()
            .unwrap_or(self.default_max_age)
    }

    /// Verdict for a single category.
    ///
    /// A fetch exactly `max_age` old is still fresh; timestamps in the future
    /// (clock skew) count as fresh.
    #[must_use]
    pub fn verdict(
        &self,
        category: &SourceCategory,
        latest_fetch: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Verdict {
        match latest_fetch {
            None => Verdict::Unknown,
            Some(at) if now.signed_duration_since(at) > self.max_age(category) => Verdict::Stale,
            Some(_) => Verdict::Fresh,
        }
    }

    /// Evaluates every requested category in `latest`.
    #[must_use]
    pub fn evaluate(
        &self,
        latest: &BTreeMap<SourceCategory, Option<DateTime<Utc>>>,
        now: DateTime<Utc>,
    ) -> FreshnessReport {
        let categories: BTreeMap<SourceCategory, CategoryFreshness> = latest
            .iter()
            .map(|(category, latest_fetch)| {
                let entry = CategoryFreshness {
                    verdict: self.verdict(category, *latest_fetch, now),
                    latest_fetch: *latest_fetch,
                    max_age_secs: u64::try_from(self.max_age(category).num_seconds()).unwrap_or(0),
                };
                (category.clone(), entry)
            })
            .collect();
        let aggregate = categories
            .values()
            .map(|c| c.verdict)
            .max()
            .unwrap_or(Verdict::Fresh);

        FreshnessReport {
            categories,
            aggregate,
            checked_at: now,
        }
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::from_config(&FreshnessConfig::default())
    }
}
