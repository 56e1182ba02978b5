//! Registries of event types, signal types and source categories.
//!
//! Event types scope a [`Window`](crate::graph::Window) (the category half of
//! its natural key), signal types name [`Metric`](crate::graph::Metric)s, and
//! source categories partition [`SourceRecord`](crate::graph::SourceRecord)s
//! for freshness decisions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A significant company occurrence that facts and metrics are scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Quarterly or annual results.
    Earnings,
    /// New product or service announcement.
    ProductLaunch,
    /// Merger or acquisition.
    Acquisition,
    /// Regulatory action or approval.
    Regulatory,
    /// Investor or industry conference.
    Conference,
    /// Dividend declaration.
    Dividend,
    /// Stock split.
    StockSplit,
    /// Leadership change.
    ExecutiveChange,
    /// Litigation.
    Lawsuit,
    /// Strategic partnership.
    Partnership,
}

/// Descriptive metadata for an [`EventType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypeMetadata {
    /// Human-readable name.
    pub display_name: &'static str,
    /// One-line description.
    pub description: &'static str,
    /// e.g. "quarterly", "ad-hoc".
    pub typical_frequency: &'static str,
    /// Signal window label used when a caller does not name one.
    pub default_window: &'static str,
}

impl EventType {
    /// All registered event types.
    pub const ALL: [Self; 10] = [
        Self::Earnings,
        Self::ProductLaunch,
        Self::Acquisition,
        Self::Regulatory,
        Self::Conference,
        Self::Dividend,
        Self::StockSplit,
        Self::ExecutiveChange,
        Self::Lawsuit,
        Self::Partnership,
    ];

    /// Stable identifier used in natural keys and serialization.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Earnings => "earnings",
            Self::ProductLaunch => "product_launch",
            Self::Acquisition => "acquisition",
            Self::Regulatory => "regulatory",
            Self::Conference => "conference",
            Self::Dividend => "dividend",
            Self::StockSplit => "stock_split",
            Self::ExecutiveChange => "executive_change",
            Self::Lawsuit => "lawsuit",
            Self::Partnership => "partnership",
        }
    }

    /// Display metadata.
    #[must_use]
    pub const fn metadata(&self) -> EventTypeMetadata {
        match self {
            Self::Earnings => EventTypeMetadata {
                display_name: "Earnings Report",
                description: "Quarterly or annual earnings report and earnings call",
                typical_frequency: "quarterly",
                default_window: "post_earnings_7d",
            },
            Self::ProductLaunch => EventTypeMetadata {
                display_name: "Product Launch",
                description: "New product or service announcement and launch",
                typical_frequency: "ad-hoc",
                default_window: "post_event_14d",
            },
            Self::Acquisition => EventTypeMetadata {
                display_name: "Acquisition/Merger",
                description: "M&A activity including announcements and closings",
                typical_frequency: "ad-hoc",
                default_window: "post_event_30d",
            },
            Self::Regulatory => EventTypeMetadata {
                display_name: "Regulatory Event",
                description: "Regulatory filings, approvals, or compliance events",
                typical_frequency: "quarterly",
                default_window: "post_event_7d",
            },
            Self::Conference => EventTypeMetadata {
                display_name: "Conference/Presentation",
                description: "Investor conferences, keynotes, and presentations",
                typical_frequency: "ad-hoc",
                default_window: "post_event_3d",
            },
            Self::Dividend => EventTypeMetadata {
                display_name: "Dividend Announcement",
                description: "Dividend declarations or changes",
                typical_frequency: "quarterly",
                default_window: "post_event_7d",
            },
            Self::StockSplit => EventTypeMetadata {
                display_name: "Stock Split",
                description: "Stock split announcements and executions",
                typical_frequency: "ad-hoc",
                default_window: "post_event_14d",
            },
            Self::ExecutiveChange => EventTypeMetadata {
                display_name: "Executive Change",
                description: "CEO, CFO, or other C-suite appointments/departures",
                typical_frequency: "ad-hoc",
                default_window: "post_event_14d",
            },
            Self::Lawsuit => EventTypeMetadata {
                display_name: "Legal Action",
                description: "Lawsuits, legal settlements, or regulatory actions",
                typical_frequency: "ad-hoc",
                default_window: "post_event_30d",
            },
            Self::Partnership => EventTypeMetadata {
                display_name: "Partnership/Alliance",
                description: "Strategic partnerships or business alliances",
                typical_frequency: "ad-hoc",
                default_window: "post_event_14d",
            },
        }
    }
}

impl Default for EventType {
    fn default() -> Self {
        Self::Earnings
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == needle)
            .ok_or_else(|| ValidationError::UnknownEventType(s.to_string()))
    }
}

/// A measurable metric computed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    /// Aggregate tone, 0 to 1.
    Sentiment,
    /// Annualized price volatility.
    Volatility,
    /// Trading volume.
    Volume,
    /// Social media engagement.
    SocialEngagement,
    /// Consensus analyst rating.
    AnalystRating,
    /// Volume of news coverage.
    NewsCoverage,
    /// Price momentum.
    PriceMomentum,
    /// Institutional buying and selling.
    InstitutionalFlow,
}

/// Descriptive metadata and value bounds for a [`SignalType`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalTypeMetadata {
    /// Human-readable name.
    pub display_name: &'static str,
    /// Unit label.
    pub unit: &'static str,
    /// Inclusive lower bound, if any.
    pub min_value: Option<f64>,
    /// Inclusive upper bound, if any.
    pub max_value: Option<f64>,
    /// `None` when the direction is context-dependent.
    pub higher_is_better: Option<bool>,
}

impl SignalType {
    /// All registered signal types.
    pub const ALL: [Self; 8] = [
        Self::Sentiment,
        Self::Volatility,
        Self::Volume,
        Self::SocialEngagement,
        Self::AnalystRating,
        Self::NewsCoverage,
        Self::PriceMomentum,
        Self::InstitutionalFlow,
    ];

    /// Stable identifier used in natural keys and serialization.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sentiment => "sentiment",
            Self::Volatility => "volatility",
            Self::Volume => "volume",
            Self::SocialEngagement => "social_engagement",
            Self::AnalystRating => "analyst_rating",
            Self::NewsCoverage => "news_coverage",
            Self::PriceMomentum => "price_momentum",
            Self::InstitutionalFlow => "institutional_flow",
        }
    }

    /// Display metadata and value bounds.
    #[must_use]
    pub const fn metadata(&self) -> SignalTypeMetadata {
        match self {
            Self::Sentiment => SignalTypeMetadata {
                display_name: "Sentiment Score",
                unit: "score",
                min_value: Some(0.0),
                max_value: Some(1.0),
                higher_is_better: Some(true),
            },
            Self::Volatility => SignalTypeMetadata {
                display_name: "Volatility Index",
                unit: "percentage",
                min_value: Some(0.0),
                max_value: None,
                higher_is_better: Some(false),
            },
            Self::Volume => SignalTypeMetadata {
                display_name: "Trading Volume",
                unit: "count",
                min_value: Some(0.0),
                max_value: None,
                higher_is_better: None,
            },
            Self::SocialEngagement => SignalTypeMetadata {
                display_name: "Social Engagement",
                unit: "score",
                min_value: Some(0.0),
                max_value: Some(1.0),
                higher_is_better: Some(true),
            },
            Self::AnalystRating => SignalTypeMetadata {
                display_name: "Analyst Rating",
                unit: "rating",
                min_value: Some(1.0),
                max_value: Some(5.0),
                higher_is_better: Some(true),
            },
            Self::NewsCoverage => SignalTypeMetadata {
                display_name: "News Coverage",
                unit: "score",
                min_value: Some(0.0),
                max_value: Some(1.0),
                higher_is_better: None,
            },
            Self::PriceMomentum => SignalTypeMetadata {
                display_name: "Price Momentum",
                unit: "score",
                min_value: Some(-1.0),
                max_value: Some(1.0),
                higher_is_better: Some(true),
            },
            Self::InstitutionalFlow => SignalTypeMetadata {
                display_name: "Institutional Flow",
                unit: "score",
                min_value: Some(-1.0),
                max_value: Some(1.0),
                higher_is_better: Some(true),
            },
        }
    }

    /// Checks a metric value against this signal's declared bounds.
    ///
    /// # Errors
    ///
    /// Returns `NonFiniteValue` for NaN/infinite values and `MetricOutOfRange`
    /// for values outside the declared bounds.
    pub fn check_value(&self, value: f64) -> Result<(), ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::NonFiniteValue { field: "value" });
        }
        let meta = self.metadata();
        let min = meta.min_value.unwrap_or(f64::NEG_INFINITY);
        let max = meta.max_value.unwrap_or(f64::INFINITY);
        if value < min || value > max {
            return Err(ValidationError::MetricOutOfRange {
                metric: self.as_str().to_string(),
                value,
                min,
                max,
            });
        }
        Ok(())
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == needle)
            .ok_or_else(|| ValidationError::UnknownSignalType(s.to_string()))
    }
}

/// Where a source record came from, for freshness purposes.
///
/// Serialized as a plain string so it can key JSON maps; unrecognized
/// lowercase identifiers become [`SourceCategory::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceCategory {
    /// News outlets and wires.
    News,
    /// Blogs and newsletters.
    Blog,
    /// Discussion forums.
    Forum,
    /// Social networks.
    Social,
    /// Regulatory filings.
    Filing,
    /// Caller-defined lowercase identifier.
    Custom(String),
}

impl SourceCategory {
    /// The built-in categories.
    #[must_use]
    pub fn builtin() -> [Self; 5] {
        [Self::News, Self::Blog, Self::Forum, Self::Social, Self::Filing]
    }

    /// Stable identifier used in natural keys and serialization.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::News => "news",
            Self::Blog => "blog",
            Self::Forum => "forum",
            Self::Social => "social",
            Self::Filing => "filing",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceCategory {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "news" => Ok(Self::News),
            "blog" => Ok(Self::Blog),
            "forum" => Ok(Self::Forum),
            "social" => Ok(Self::Social),
            "filing" | "filings" => Ok(Self::Filing),
            "" => Err(ValidationError::UnknownSourceCategory(s.to_string())),
            other
                if other
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') =>
            {
                Ok(Self::Custom(other.to_string()))
            }
            _ => Err(ValidationError::UnknownSourceCategory(s.to_string())),
        }
    }
}

impl TryFrom<String> for SourceCategory {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceCategory> for String {
    fn from(category: SourceCategory) -> Self {
        category.as_str().to_string()
    }
}
