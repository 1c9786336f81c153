//! Tag inference: regex patterns over `text + " " + entity`,
//! lowercased and deduplicated.

use std::sync::OnceLock;

use regex::Regex;

fn tag_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let specs: &[(&str, &str)] = &[
            ("credential", r"(?i)\b(password|token|api[_-]?key|ssh|credential)\b"),
            ("blocker", r"(?i)\b(blocked|blocker|stuck|waiting on)\b"),
            ("done", r"(?i)\b(done|completed|finished|closed)\b"),
            ("task", r"(?i)\b(todo|task|need to|have to)\b"),
            ("bug", r"(?i)\b(bug|error|broken|crash(es|ed)?)\b"),
            ("config", r"(?i)\b(config|setting|environment variable|env var)\b"),
            ("infra", r"(?i)\b(server|deploy|kubernetes|docker|aws|gcp|azure)\b"),
        ];
        specs
            .iter()
            .filter_map(|(tag, pattern)| Regex::new(pattern).ok().map(|re| (*tag, re)))
            .collect()
    })
}

/// Applied unless the caller already supplied explicit tags.
pub fn infer_tags(text: &str, entity: Option<&str>) -> Vec<String> {
    let haystack = match entity {
        Some(entity) => format!("{text} {entity}"),
        None => text.to_string(),
    };

    let mut tags: Vec<String> = tag_patterns()
        .iter()
        .filter(|(_, re)| re.is_match(&haystack))
        .map(|(tag, _)| tag.to_string())
        .collect();

    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_task_and_blocker_tags() {
        let tags = infer_tags("I'm stuck on the deploy, need to fix the docker config", None);
        assert!(tags.contains(&"blocker".to_string()));
        assert!(tags.contains(&"task".to_string()));
        assert!(tags.contains(&"infra".to_string()));
    }

    #[test]
    fn no_match_yields_empty_tags() {
        assert!(infer_tags("a pleasant walk in the park", None).is_empty());
    }

    #[test]
    fn tags_are_deduplicated_and_sorted() {
        let tags = infer_tags("todo todo task task", None);
        assert_eq!(tags, vec!["task".to_string()]);
    }
}
