//! Structured `(entity, key, value)` extraction: shallow rules over a
//! handful of common shapes. No LLM call; this is the regex fast-path
//! that feeds `StoreInput` before an optional classifier pass.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    pub entity: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
}

struct Shape {
    pattern: &'static str,
    key: &'static str,
}

fn shapes() -> &'static [(Regex, &'static str)] {
    static SHAPES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    SHAPES.get_or_init(|| {
        let specs: &[Shape] = &[
            Shape { pattern: r"(?i)^\s*my\s+email\s+is\s+(.+)$", key: "email" },
            Shape { pattern: r"(?i)^\s*my\s+name\s+is\s+(.+)$", key: "name" },
            Shape { pattern: r"(?i)^\s*i\s+prefer\s+(.+)$", key: "preference" },
            Shape { pattern: r"(?i)^\s*i\s+like\s+(.+)$", key: "preference" },
        ];
        specs
            .iter()
            .filter_map(|s| Regex::new(s.pattern).ok().map(|re| (re, s.key)))
            .collect()
    })
}

fn possessive_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(\w[\w\s]*?)'s\s+(\w[\w-]*)\s+is\s+(.+?)\.?\s*$").unwrap())
}

/// Extracts `(entity, key, value)` from common sentence shapes. Returns
/// an all-`None` result if nothing recognizable is found — the capture
/// pipeline still stores raw `text` regardless.
pub fn extract_fields(text: &str) -> ExtractedFields {
    let trimmed = text.trim();

    if let Some(captures) = possessive_pattern().captures(trimmed) {
        return ExtractedFields {
            entity: Some(captures[1].trim().to_string()),
            key: Some(captures[2].trim().to_lowercase()),
            value: Some(captures[3].trim().to_string()),
        };
    }

    for (pattern, key) in shapes() {
        if let Some(captures) = pattern.captures(trimmed) {
            let value = captures.get(1).map(|m| m.as_str().trim().trim_end_matches('.').to_string());
            return ExtractedFields {
                entity: None,
                key: Some(key.to_string()),
                value,
            };
        }
    }

    ExtractedFields::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_possessive_shape() {
        let fields = extract_fields("Alice's favorite-color is blue");
        assert_eq!(fields.entity.as_deref(), Some("Alice"));
        assert_eq!(fields.key.as_deref(), Some("favorite-color"));
        assert_eq!(fields.value.as_deref(), Some("blue"));
    }

    #[test]
    fn extracts_my_email_is_shape() {
        let fields = extract_fields("my email is jane@example.com");
        assert_eq!(fields.key.as_deref(), Some("email"));
        assert_eq!(fields.value.as_deref(), Some("jane@example.com"));
    }

    #[test]
    fn unrecognized_shape_yields_all_none() {
        let fields = extract_fields("the weather today is unpredictable and strange");
        assert_eq!(fields, ExtractedFields::default());
    }
}
