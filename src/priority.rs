//! Keyword-based urgency classification.
//!
//! Used when a message, broadcast or alert arrives without an explicit
//! priority. Keywords are matched case-insensitively as substrings; the first
//! tier with a hit wins.

use crate::model::Priority;

const CRITICAL_KEYWORDS: [&str; 5] = [
    "life-threatening",
    "under fire",
    "bleeding",
    "trapped",
    "explosion",
];

const HIGH_KEYWORDS: [&str; 4] = ["injured", "medical", "no water", "no food"];

const LOW_KEYWORDS: [&str; 2] = ["status", "update"];

/// Classify `text` by keyword, falling back to `hint` and then `Normal`.
///
/// Empty text is always `Normal`.
pub fn classify_priority(text: &str, hint: Option<Priority>) -> Priority {
    if text.is_empty() {
        return Priority::Normal;
    }

    let lower = text.to_lowercase();
    let mentions = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    if mentions(&CRITICAL_KEYWORDS) {
        Priority::Critical
    } else if mentions(&HIGH_KEYWORDS) {
        Priority::High
    } else if mentions(&LOW_KEYWORDS) {
        Priority::Low
    } else {
        hint.unwrap_or(Priority::Normal)
    }
}

/// An explicit priority wins; otherwise classify the text.
pub fn resolve_priority(text: &str, explicit: Option<Priority>) -> Priority {
    explicit.unwrap_or_else(|| classify_priority(text, None))
}
