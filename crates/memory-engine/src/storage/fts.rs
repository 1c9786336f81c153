//! FTS5 query sanitization.
//!
//! Strip quotes and FTS operator tokens (`AND`, `OR`, `NOT`, parens, `*`)
//! and collapse the remaining terms with explicit `OR`-joining, so
//! accidental operator syntax in user text can't corrupt the query.

/// Sanitize free text into a safe FTS5 MATCH query.
///
/// Returns `None` if nothing survives sanitization (e.g. the input was
/// entirely operator tokens/punctuation), letting callers skip the FTS
/// leg of hybrid search rather than issue an unconstrained MATCH.
pub fn sanitize_fts5_query(raw: &str) -> Option<String> {
    let stripped: String = raw
        .chars()
        .map(|c| match c {
            '"' | '\'' | '(' | ')' | '*' | ':' | '^' | '-' => ' ',
            other => other,
        })
        .collect();

    let terms: Vec<String> = stripped
        .split_whitespace()
        .filter(|term| {
            let upper = term.to_uppercase();
            !matches!(upper.as_str(), "AND" | "OR" | "NOT")
        })
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .filter(|t| t.len() > 2)
        .collect();

    if terms.is_empty() {
        return None;
    }

    Some(terms.join(" OR "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_operator_tokens() {
        let sanitized = sanitize_fts5_query(r#""NOT" OR ("#).unwrap_or_default();
        // must not contain a bare unescaped operator that could corrupt the query
        assert!(!sanitized.to_uppercase().split(' ').any(|t| t == "NOT"));
    }

    #[test]
    fn or_joins_plain_terms() {
        let sanitized = sanitize_fts5_query("dark mode theme").unwrap();
        assert_eq!(sanitized, "\"dark\" OR \"mode\" OR \"theme\"");
    }

    #[test]
    fn pure_operator_input_yields_none() {
        assert!(sanitize_fts5_query("AND OR NOT ( )").is_none());
    }
}
