//! Document normalization ahead of extraction.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::NormalizeError;
use crate::refresh::collaborators::{NormalizedDocument, RawDocument};

static IMAGE_RE: OnceLock<Regex> = OnceLock::new();
static LINK_RE: OnceLock<Regex> = OnceLock::new();

fn image_regex() -> &'static Regex {
    IMAGE_RE.get_or_init(|| {
        Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn link_regex() -> &'static Regex {
    LINK_RE.get_or_init(|| {
        Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

/// Bounds applied by [`normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeLimits {
    /// Shorter text is rejected.
    pub min_chars: usize,
    /// Longer text is truncated.
    pub max_chars: usize,
}

/// Reduces fetched markdown/plain text to a single line of prose.
///
/// Images are dropped, links keep their anchor text, whitespace collapses to
/// single spaces. Bodies longer than `max_chars` are truncated.
///
/// # Errors
///
/// `Binary` for bodies containing NUL bytes, `Empty` or `TooShort` when too
/// little text remains.
pub fn normalize(raw: &RawDocument, limits: NormalizeLimits) -> Result<NormalizedDocument, NormalizeError> {
    if raw.body.contains('\0') {
        return Err(NormalizeError::Binary);
    }

    let without_images = image_regex().replace_all(&raw.body, " ");
    let without_links = link_regex().replace_all(&without_images, "$1");
    let collapsed = without_links.split_whitespace().collect::<Vec<_>>().join(" ");

    let actual = collapsed.chars().count();
    if actual == 0 {
        return Err(NormalizeError::Empty);
    }
    if actual < limits.min_chars {
        return Err(NormalizeError::TooShort {
            actual,
            min: limits.min_chars,
        });
    }

    let truncated = actual > limits.max_chars;
    let text = if truncated {
        collapsed.chars().take(limits.max_chars).collect()
    } else {
        collapsed
    };

    let title = raw
        .title
        .as_deref()
        .or(raw.origin.title.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    Ok(NormalizedDocument {
        origin: raw.origin.clone(),
        title,
        text,
        fetched_at: raw.fetched_at,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::collaborators::OriginRef;
    use chrono::Utc;

    const LIMITS: NormalizeLimits = NormalizeLimits {
        min_chars: 10,
        max_chars: 40,
    };

    fn raw(body: &str) -> RawDocument {
        RawDocument::new(OriginRef::new("https://ex.com/a", 1), body, Utc::now())
    }

    #[test]
    fn test_markdown_is_flattened() {
        let doc = normalize(
            &raw("# Title\n\n![chart](x.png) Revenue  [grew](https://x) 12%\n"),
            LIMITS,
        )
        .unwrap();
        assert_eq!(doc.text, "# Title Revenue grew 12%");
        assert!(!doc.truncated);
    }

    #[test]
    fn test_rejects_binary_and_short() {
        assert_eq!(normalize(&raw("abc\0def ghijkl"), LIMITS), Err(NormalizeError::Binary));
        assert_eq!(normalize(&raw("  \n "), LIMITS), Err(NormalizeError::Empty));
        assert_eq!(
            normalize(&raw("tiny"), LIMITS),
            Err(NormalizeError::TooShort { actual: 4, min: 10 })
        );
    }

    #[test]
    fn test_truncates_long_bodies() {
        let doc = normalize(&raw(&"word ".repeat(50)), LIMITS).unwrap();
        assert!(doc.truncated);
        assert_eq!(doc.text.chars().count(), 40);
    }

    #[test]
    fn test_title_falls_back_to_origin() {
        let mut r = raw("some reasonably long body text");
        r.origin.title = Some(" Serp title ".to_string());
        assert_eq!(normalize(&r, LIMITS).unwrap().title.as_deref(), Some("Serp title"));
        r.title = Some("Page title".to_string());
        assert_eq!(normalize(&r, LIMITS).unwrap().title.as_deref(), Some("Page title"));
    }
}
