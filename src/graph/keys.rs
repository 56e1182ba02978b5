//! Natural-key derivation.
//!
//! Keys are deterministic functions of an entity's own attributes. Two writes
//! that derive the same key address the same node.

use chrono::{DateTime, Utc};

use crate::error::ValidationError;
use crate::period::Period;
use crate::registry::{EventType, SignalType};

const SEP: char = '|';

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical subject identifier: trimmed, whitespace-collapsed, lowercase.
///
/// # Errors
///
/// Returns `EmptyField` if nothing remains after normalization.
pub fn subject_key(identifier: &str) -> Result<String, ValidationError> {
    let key = collapse_whitespace(identifier).to_lowercase();
    if key.is_empty() {
        return Err(ValidationError::EmptyField { field: "identifier" });
    }
    Ok(key)
}

/// `subject|period|event_type`.
#[must_use]
pub fn window_key(subject_key: &str, period: Period, event_type: EventType) -> String {
    format!("{subject_key}{SEP}{period}{SEP}{event_type}")
}

/// Normalizes an origin locator so cosmetic URL differences collapse.
///
/// Lowercases scheme and host, drops the fragment, default ports and a
/// trailing slash on the path. Non-URL locators are only trimmed.
///
/// # Errors
///
/// Returns `EmptyField` for blank origins.
pub fn normalize_origin(origin: &str) -> Result<String, ValidationError> {
    let trimmed = origin.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField { field: "origin" });
    }
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);

    let Some((scheme, rest)) = without_fragment.split_once("://") else {
        return Ok(without_fragment.to_string());
    };
    let scheme = scheme.to_ascii_lowercase();

    let split_at = rest.find(&['/', '?'][..]).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(split_at);
    let mut host = authority.to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "http" => Some(":80"),
        "https" => Some(":443"),
        _ => None,
    };
    if let Some(port) = default_port {
        if let Some(stripped) = host.strip_suffix(port) {
            host = stripped.to_string();
        }
    }

    let (path, query) = match tail.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (tail, None),
    };
    let path = path.trim_end_matches('/');

    let mut out = format!("{scheme}://{host}{path}");
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(q);
    }
    Ok(out)
}

/// Index of the dedup bucket `fetched_at` falls into.
#[must_use]
pub fn fetch_bucket(fetched_at: DateTime<Utc>, bucket_secs: u64) -> i64 {
    let width = i64::try_from(bucket_secs.max(1)).unwrap_or(i64::MAX);
    fetched_at.timestamp().div_euclid(width)
}

/// `normalized_origin|bucket`.
#[must_use]
pub fn source_key(normalized_origin: &str, fetched_at: DateTime<Utc>, bucket_secs: u64) -> String {
    format!("{normalized_origin}{SEP}{}", fetch_bucket(fetched_at, bucket_secs))
}

/// Text normalization applied before hashing a fact.
#[must_use]
pub fn normalize_fact_text(text: &str) -> String {
    let collapsed = collapse_whitespace(text).to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c == '.' || c == '!' || c == ';')
        .trim_end()
        .to_string()
}

/// blake3 over `(window, normalized text, schema version)`.
#[must_use]
pub fn fact_key(window_key: &str, text: &str, schema_version: u32) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(window_key.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(normalize_fact_text(text).as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(&schema_version.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

/// `window|metric_type`. The window key already embeds the subject.
#[must_use]
pub fn metric_key(window_key: &str, metric_type: SignalType) -> String {
    format!("{window_key}{SEP}{metric_type}")
}

/// Content fingerprint for change detection on re-fetch.
#[must_use]
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}
