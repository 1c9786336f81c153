//! Multi-language trigger and extraction keyword sets.
//!
//! The on-disk format is a small JSON object per language; ships with an
//! English built-in and loads additional languages from
//! `<data_dir>/language-keywords/<lang>.json` when present, merging
//! rather than replacing the built-ins.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One language's capture vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LanguageKeywords {
    pub preference: Vec<String>,
    pub decision: Vec<String>,
    pub directive: Vec<String>,
    pub reinforcement: Vec<String>,
}

fn english() -> LanguageKeywords {
    LanguageKeywords {
        preference: vec!["i prefer", "i like", "i don't like", "i hate", "i'd rather"]
            .into_iter()
            .map(String::from)
            .collect(),
        decision: vec!["we decided", "let's use", "going with", "decision:"]
            .into_iter()
            .map(String::from)
            .collect(),
        directive: vec!["always", "never", "remember to", "make sure to"]
            .into_iter()
            .map(String::from)
            .collect(),
        reinforcement: vec!["as i said", "like i mentioned", "still true", "confirmed"]
            .into_iter()
            .map(String::from)
            .collect(),
    }
}

/// Loads the built-in English keyword set plus any `*.json` files under
/// `dir` (missing directory is not an error — just English remains).
pub fn load_keywords(dir: Option<&Path>) -> HashMap<String, LanguageKeywords> {
    let mut out = HashMap::new();
    out.insert("en".to_string(), english());

    let Some(dir) = dir else { return out };
    let Ok(entries) = std::fs::read_dir(dir) else { return out };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        let Ok(contents) = std::fs::read_to_string(&path) else { continue };
        match serde_json::from_str::<LanguageKeywords>(&contents) {
            Ok(keywords) => {
                out.insert(stem.to_string(), keywords);
            }
            Err(e) => {
                tracing::warn!(lang = stem, error = %e, "skipping malformed language-keywords file");
            }
        }
    }
    out
}

/// Compiled trigger patterns across every known signal class and
/// language, used by `filters::trigger_filter`. Entity/fact signals are
/// structural (handled in `extract.rs`'s shape detection), so only the
/// phrase-based classes are represented here.
pub fn all_trigger_patterns() -> Vec<String> {
    let keywords = load_keywords(None);
    let mut patterns = Vec::new();
    for set in keywords.values() {
        for phrase in set
            .preference
            .iter()
            .chain(&set.decision)
            .chain(&set.directive)
            .chain(&set.reinforcement)
        {
            patterns.push(format!("(?i){}", regex::escape(phrase)));
        }
    }
    // Structural entity/fact signals: possessive "X's Y is Z" and "my
    // {word} is" patterns fire independent of language keyword files.
    patterns.push(r"(?i)\bmy\s+\w+\s+is\b".to_string());
    patterns.push(r"(?i)\b\w+'s\s+\w+\s+is\b".to_string());
    patterns
}
