//! Reporting periods (fiscal quarters).
//!
//! A [`Period`] is an opaque, totally ordered identifier for a calendar
//! quarter. All arithmetic is pure; [`Period::parse`] is the only fallible
//! operation.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FormatError;

static PERIOD_RE: OnceLock<Regex> = OnceLock::new();

fn period_regex() -> &'static Regex {
    PERIOD_RE.get_or_init(|| {
        Regex::new(r"^Q(\d+)-(\d{4})$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

const QUARTERS_PER_YEAR: i64 = 4;
const MIN_ORDINAL: i64 = i32::MIN as i64 * QUARTERS_PER_YEAR;
const MAX_ORDINAL: i64 = i32::MAX as i64 * QUARTERS_PER_YEAR + (QUARTERS_PER_YEAR - 1);

/// A calendar quarter, e.g. `Q3-2025`.
///
/// Ordering is chronological. Serialized as its display string.
///
/// # Examples
///
/// ```
/// use pulsegraph::Period;
///
/// let q3 = Period::parse("Q3-2025").unwrap();
/// assert_eq!(q3.offset(2).to_string(), "Q1-2026");
/// assert_eq!(q3.offset(-2).to_string(), "Q1-2025");
/// assert!(Period::parse("2025-Q3").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    // Field order matters for the derived ordering.
    year: i32,
    quarter: u8,
}

impl Period {
    /// Creates a period from a quarter (1-4) and year.
    ///
    /// # Errors
    ///
    /// Returns `FormatError::QuarterOutOfRange` if `quarter` is not 1-4.
    pub fn new(quarter: u32, year: i32) -> Result<Self, FormatError> {
        match u8::try_from(quarter) {
            Ok(q @ 1..=4) => Ok(Self { year, quarter: q }),
            _ => Err(FormatError::QuarterOutOfRange {
                input: format!("Q{quarter}-{year}"),
                quarter,
            }),
        }
    }

    /// Parses a `Q[1-4]-YYYY` period string.
    ///
    /// # Errors
    ///
    /// Returns a [`FormatError`] for empty or malformed strings and for
    /// quarters outside 1-4.
    pub fn parse(input: &str) -> Result<Self, FormatError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(FormatError::Empty);
        }

        let caps = period_regex()
            .captures(trimmed)
            .ok_or_else(|| FormatError::Malformed {
                input: input.to_string(),
            })?;

        let malformed = || FormatError::Malformed {
            input: input.to_string(),
        };
        let quarter: u32 = caps[1].parse().map_err(|_| malformed())?;
        let year: i32 = caps[2].parse().map_err(|_| malformed())?;

        if !(1..=4).contains(&quarter) {
            return Err(FormatError::QuarterOutOfRange {
                input: input.to_string(),
                quarter,
            });
        }
        Self::new(quarter, year)
    }

    /// Returns true if `input` parses as a period.
    #[must_use]
    pub fn validate(input: &str) -> bool {
        Self::parse(input).is_ok()
    }

    /// Quarter number, 1-4.
    #[must_use]
    pub const fn quarter(&self) -> u8 {
        self.quarter
    }

    /// Calendar year.
    #[must_use]
    pub const fn year(&self) -> i32 {
        self.year
    }

    const fn ordinal(self) -> i64 {
        self.year as i64 * QUARTERS_PER_YEAR + (self.quarter as i64 - 1)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from_ordinal(ordinal: i64) -> Self {
        let ordinal = ordinal.clamp(MIN_ORDINAL, MAX_ORDINAL);
        Self {
            year: ordinal.div_euclid(QUARTERS_PER_YEAR) as i32,
            quarter: (ordinal.rem_euclid(QUARTERS_PER_YEAR) + 1) as u8,
        }
    }

    /// The next quarter (Q4 rolls over into Q1 of the next year).
    #[must_use]
    pub fn successor(self) -> Self {
        self.offset(1)
    }

    /// The previous quarter (Q1 rolls back into Q4 of the previous year).
    #[must_use]
    pub fn predecessor(self) -> Self {
        self.offset(-1)
    }

    /// Moves `n` quarters forward (positive) or backward (negative).
    ///
    /// Saturates at the representable year range.
    #[must_use]
    pub fn offset(self, n: i64) -> Self {
        Self::from_ordinal(self.ordinal().saturating_add(n))
    }

    /// The quarter containing `now`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn current(now: DateTime<Utc>) -> Self {
        let quarter = ((now.month() - 1) / 3 + 1) as u8;
        Self {
            year: now.year(),
            quarter,
        }
    }

    /// The quarter `periods_back` quarters before the one containing `now`.
    #[must_use]
    pub fn comparison(now: DateTime<Utc>, periods_back: u32) -> Self {
        Self::current(now).offset(-i64::from(periods_back))
    }

    /// Default `(latest, previous)` pair for comparisons.
    #[must_use]
    pub fn default_pair(now: DateTime<Utc>) -> (Self, Self) {
        let latest = Self::current(now);
        (latest, latest.predecessor())
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}-{}", self.quarter, self.year)
    }
}

impl FromStr for Period {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Period {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}
