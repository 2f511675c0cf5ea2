//! FTS5 Query Sanitization
//!
//! Raw user text is never passed to MATCH: FTS5 treats `-`, `*`, `:`, and
//! quotes as syntax, and a stray operator turns a recall query into a parse
//! error. Each whitespace token is stripped to alphanumerics, double-quoted,
//! and the tokens are OR-joined so partial matches still rank.

/// Sanitize free text into an FTS5 MATCH expression
///
/// Returns None when nothing searchable remains.
pub fn sanitize_fts5_query(raw: &str) -> Option<String> {
    let tokens: Vec<String> = raw
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}
