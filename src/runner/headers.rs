//! Environment default-header merging.

use crate::model::HeaderEntry;

/// Merge an environment's default headers into a case's explicit header list.
/// Case-level headers take precedence: a default is appended (enabled) only
/// when its name is not already present, matched case-sensitively. Entries
/// with empty names are dropped.
pub fn merge_env_headers(
    case_headers: Vec<HeaderEntry>,
    env_headers: &[HeaderEntry],
) -> Vec<HeaderEntry> {
    let mut merged = case_headers;
    for default in env_headers {
        if !merged.iter().any(|h| h.name == default.name) {
            merged.push(HeaderEntry {
                name: default.name.clone(),
                value: default.value.clone(),
                abled: true,
            });
        }
    }
    merged.retain(|h| !h.name.is_empty());
    merged
}
