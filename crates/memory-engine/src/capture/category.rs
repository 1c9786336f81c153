//! Regex-only category detection. No LLM call: unresolved text lands
//! in `Category::Other`, eligible for later auto-classify
//! reclassification on a periodic scheduler.

use std::sync::OnceLock;

use regex::Regex;

use crate::model::Category;

struct Rule {
    category: Category,
    pattern: &'static str,
}

fn rules() -> &'static [(Category, Regex)] {
    static RULES: OnceLock<Vec<(Category, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        let specs: &[Rule] = &[
            Rule { category: Category::Preference, pattern: r"(?i)\b(i prefer|i like|i don't like|i hate|i'd rather|my favorite)\b" },
            Rule { category: Category::Decision, pattern: r"(?i)\b(we decided|let's use|going with|decision:|we'll use)\b" },
            Rule { category: Category::Rule, pattern: r"(?i)\b(always|never|must|should always|must not)\b" },
            Rule { category: Category::Procedure, pattern: r"(?i)\b(to do this|the steps are|first,? .* then|workflow:)\b" },
            Rule { category: Category::Entity, pattern: r"(?i)\b\w+'s\s+\w+\s+is\b" },
            Rule { category: Category::Pattern, pattern: r"(?i)\b(pattern|convention|idiom|style guide)\b" },
        ];
        specs
            .iter()
            .filter_map(|r| Regex::new(r.pattern).ok().map(|re| (r.category.clone(), re)))
            .collect()
    })
}

/// First matching rule wins; falls back to `fact` if the text looks
/// declarative (contains "is"/"are"), else `other`.
pub fn detect_category(text: &str) -> Category {
    for (category, pattern) in rules() {
        if pattern.is_match(text) {
            return category.clone();
        }
    }
    if Regex::new(r"(?i)\b(is|are|was|were)\b").unwrap().is_match(text) {
        return Category::Fact;
    }
    Category::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_preference() {
        assert_eq!(detect_category("I prefer tabs over spaces"), Category::Preference);
    }

    #[test]
    fn detects_decision() {
        assert_eq!(detect_category("We decided to use Postgres"), Category::Decision);
    }

    #[test]
    fn falls_back_to_fact_for_declarative_text() {
        assert_eq!(detect_category("The server is in us-east-1"), Category::Fact);
    }

    #[test]
    fn falls_back_to_other_when_nothing_matches() {
        assert_eq!(detect_category("lorem ipsum dolor"), Category::Other);
    }
}
