//! Text helpers shared by the invoker and the ingestion engine.
//!
//! This module provides:
//! - Log-friendly truncation for scraper output previews
//! - Whitespace normalization and length capping for stored fields
//! - URL canonicalization for the listing natural key
//! - Role classification from a job title

use url::Url;

/// Truncate a string for logging purposes.
///
/// Long strings are cut to at most `max` bytes (backing off to a char
/// boundary) with an ellipsis and byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Collapse runs of whitespace (including newlines) into single spaces and trim.
pub fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keep at most `max` characters.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Canonical form of a listing URL, used as the natural key.
///
/// Absolute http(s) URLs are normalized by the `url` crate (lowercased host,
/// default port dropped, percent-encoding fixed) and lose their fragment.
/// Anything else is only trimmed. Returns `None` for blank input.
pub fn canonical_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match Url::parse(trimmed) {
        Ok(mut parsed) if matches!(parsed.scheme(), "http" | "https") => {
            parsed.set_fragment(None);
            Some(parsed.to_string())
        }
        _ => Some(trimmed.to_string()),
    }
}

/// Derive a role category from a job title.
///
/// Checked in priority order; the first match wins. Titles that match
/// nothing are `"other"`.
pub fn classify_role(title: &str) -> &'static str {
    let t = title.to_lowercase();
    if t.contains("embedded") && t.contains("system") {
        "embedded-systems"
    } else if t.contains("firmware") || t.contains("fpga") {
        "firmware"
    } else if t.contains("hardware") || t.contains("hw ") || t.contains("pcb") {
        "hardware"
    } else if t.contains("software") || t.contains("sw ") {
        "software"
    } else if t.contains("embedded") {
        "embedded-general"
    } else if t.contains("engineer") {
        "engineering"
    } else {
        "other"
    }
}
