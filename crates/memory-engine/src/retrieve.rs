//! Retriever: fuses FTS and ANN candidates with reciprocal rank
//! fusion (`k=60`, rank-based rather than score-based), applies
//! recency/importance/salience adjustments, shapes the result into
//! the fixed-order injection envelope, and watches tool output for
//! auth-failure signals.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::{AutoRecallConfig, InjectionFormat};
use crate::model::{DecayClass, Fact, RankedFact, Tier};
use crate::traits::{chat_default, ChatModel};

pub const RRF_K: f32 = 60.0;

fn tie_break_date(fact: &Fact) -> DateTime<Utc> {
    fact.source_date.unwrap_or(fact.created_at)
}

/// Fuses two independently-ranked candidate lists by rank, not raw
/// score, so FTS's bm25 scale and ANN's cosine scale never need to be
/// reconciled.
pub fn reciprocal_rank_fusion(fts: &[RankedFact], ann: &[RankedFact]) -> Vec<RankedFact> {
    let mut fused: HashMap<String, (f32, &'static str, Fact)> = HashMap::new();

    for (rank, candidate) in fts.iter().enumerate() {
        let entry = fused
            .entry(candidate.fact.id.clone())
            .or_insert_with(|| (0.0, "fts", candidate.fact.clone()));
        entry.0 += 1.0 / (RRF_K + rank as f32 + 1.0);
    }
    for (rank, candidate) in ann.iter().enumerate() {
        let delta = 1.0 / (RRF_K + rank as f32 + 1.0);
        match fused.get_mut(&candidate.fact.id) {
            Some(entry) => {
                entry.0 += delta;
                entry.1 = "both";
            }
            None => {
                fused.insert(candidate.fact.id.clone(), (delta, "ann", candidate.fact.clone()));
            }
        }
    }

    let mut out: Vec<RankedFact> = fused
        .into_values()
        .map(|(score, source, fact)| RankedFact { fact, score, source })
        .collect();
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| tie_break_date(&b.fact).cmp(&tie_break_date(&a.fact)))
    });
    out
}

fn recency_factor(fact: &Fact, now: DateTime<Utc>) -> f32 {
    let age_secs = (now - fact.created_at).num_seconds().max(0) as f32;
    let ninety_days = (90 * 86_400) as f32;
    0.8 + 0.2 * (1.0 - (age_secs / ninety_days)).max(0.0)
}

/// In-place score adjustment: `preferLongTerm` boosts durable decay
/// classes, `useImportanceRecency` blends importance and age, and
/// access-salience (log of recall count) always applies.
pub fn apply_post_fusion_adjustments(candidates: &mut [RankedFact], cfg: &AutoRecallConfig, now: DateTime<Utc>) {
    for candidate in candidates.iter_mut() {
        if cfg.prefer_long_term {
            candidate.score *= match candidate.fact.decay_class {
                DecayClass::Permanent => 1.2,
                DecayClass::Stable => 1.1,
                _ => 1.0,
            };
        }
        if cfg.use_importance_recency {
            let importance_weight = 0.7 + 0.3 * candidate.fact.importance as f32;
            candidate.score *= importance_weight * recency_factor(&candidate.fact, now);
        }
        let salience = 1.0 + 0.1 * ((1 + candidate.fact.recall_count).max(1) as f32).ln();
        candidate.score *= salience;
    }
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| tie_break_date(&b.fact).cmp(&tie_break_date(&a.fact)))
    });
}

/// Merges entity-lookup facts into the fused candidate set, skipping
/// ids already present.
pub fn merge_entity_facts(candidates: &mut Vec<RankedFact>, entity_facts: Vec<Fact>, boost_score: f32) {
    let existing: std::collections::HashSet<String> = candidates.iter().map(|c| c.fact.id.clone()).collect();
    for fact in entity_facts {
        if existing.contains(&fact.id) {
            continue;
        }
        candidates.push(RankedFact { fact, score: boost_score, source: "entity" });
    }
}

/// Drops candidates the options say should never be injected: `cold`
/// tier when tiering is enabled, and anything outside `asOf` validity
/// (or superseded, unless explicitly included).
pub fn filter_candidates(
    candidates: Vec<RankedFact>,
    tiering_enabled: bool,
    as_of: Option<DateTime<Utc>>,
    include_superseded: bool,
) -> Vec<RankedFact> {
    candidates
        .into_iter()
        .filter(|c| {
            if tiering_enabled && c.fact.tier == Tier::Cold {
                return false;
            }
            if !include_superseded && c.fact.is_superseded() {
                return false;
            }
            if let Some(as_of) = as_of {
                return c.fact.valid_at(as_of);
            }
            true
        })
        .collect()
}

pub fn estimate_tokens(s: &str) -> usize {
    (s.len() / 4).max(1)
}

fn item_text(fact: &Fact, use_summary: bool, max_chars: usize) -> String {
    let text = if use_summary {
        fact.summary.as_deref().unwrap_or(&fact.text)
    } else {
        &fact.text
    };
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}

fn format_line(candidate: &RankedFact, format: InjectionFormat, use_summary: bool, max_chars: usize) -> String {
    let text = item_text(&candidate.fact, use_summary, max_chars);
    match format {
        InjectionFormat::Full => format!("- [{}/{}] {}", candidate.source, candidate.fact.category, text),
        InjectionFormat::Short => format!("- {}: {}", candidate.fact.category, text),
        InjectionFormat::Minimal => format!("- {text}"),
        InjectionFormat::Progressive | InjectionFormat::ProgressiveHybrid => format!("- {text}"),
    }
}

fn format_index_line(position: usize, candidate: &RankedFact, title_chars: usize) -> String {
    let title = item_text(&candidate.fact, true, title_chars);
    let tokens = estimate_tokens(&candidate.fact.text);
    format!("{position}. [{}] {title}  (~{tokens}t)", candidate.fact.category)
}

/// Result of shaping candidates into the body of `<relevant-memories>`:
/// the rendered text plus the ids actually injected, for Hebbian
/// co-recall reinforcement and `maxRecallsPerTarget` bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ShapedInjection {
    pub body: String,
    pub injected_ids: Vec<String>,
}

fn shape_flat(candidates: &[RankedFact], cfg: &AutoRecallConfig) -> ShapedInjection {
    let mut lines = Vec::new();
    let mut injected_ids = Vec::new();
    let mut tokens_used = 0usize;

    for candidate in candidates {
        let line = format_line(candidate, cfg.injection_format, cfg.use_summary_in_injection, cfg.max_per_memory_chars);
        let cost = estimate_tokens(&line);
        if tokens_used + cost > cfg.max_tokens && !lines.is_empty() {
            break;
        }
        tokens_used += cost;
        lines.push(line);
        injected_ids.push(candidate.fact.id.clone());
    }

    ShapedInjection { body: lines.join("\n"), injected_ids }
}

fn shape_progressive(candidates: &[RankedFact], cfg: &AutoRecallConfig) -> ShapedInjection {
    let hybrid = cfg.injection_format == InjectionFormat::ProgressiveHybrid;
    let limit = cfg.progressive_max_candidates.min(candidates.len());
    let pool = &candidates[..limit];

    let (pinned, rest): (Vec<&RankedFact>, Vec<&RankedFact>) = if hybrid {
        pool.iter().partition(|c| {
            c.fact.decay_class == DecayClass::Permanent
                || c.fact.recall_count >= cfg.progressive_pinned_recall_count
        })
    } else {
        (Vec::new(), pool.iter().collect())
    };

    let mut sections = Vec::new();
    let mut injected_ids = Vec::new();

    if !pinned.is_empty() {
        let mut pinned_lines = Vec::new();
        for candidate in &pinned {
            pinned_lines.push(format_line(candidate, InjectionFormat::Short, cfg.use_summary_in_injection, cfg.max_per_memory_chars));
            injected_ids.push(candidate.fact.id.clone());
        }
        sections.push(pinned_lines.join("\n"));
    }

    let mut index_lines = Vec::new();
    let mut tokens_used = 0usize;
    for (i, candidate) in rest.iter().enumerate() {
        let line = format_index_line(i + 1, candidate, 80);
        let cost = estimate_tokens(&line);
        if tokens_used + cost > cfg.progressive_index_max_tokens && !index_lines.is_empty() {
            break;
        }
        tokens_used += cost;
        index_lines.push(line);
        injected_ids.push(candidate.fact.id.clone());
    }
    if !index_lines.is_empty() {
        sections.push(index_lines.join("\n"));
    }

    ShapedInjection { body: sections.join("\n\n"), injected_ids }
}

pub fn shape_candidates(candidates: &[RankedFact], cfg: &AutoRecallConfig) -> ShapedInjection {
    match cfg.injection_format {
        InjectionFormat::Progressive | InjectionFormat::ProgressiveHybrid => shape_progressive(candidates, cfg),
        _ => shape_flat(candidates, cfg),
    }
}

/// As `shape_candidates`, but when `summarizeWhenOverBudget` is on and
/// the flat shaping path dropped candidates for budget reasons, asks
/// the chat tier for a single prose summary of the overflow instead of
/// silently truncating. Falls back to the truncated list on any chat
/// failure.
pub async fn shape_with_optional_summary(
    candidates: &[RankedFact],
    cfg: &AutoRecallConfig,
    chat: Option<&dyn ChatModel>,
) -> ShapedInjection {
    let shaped = shape_candidates(candidates, cfg);
    if !cfg.summarize_when_over_budget || shaped.injected_ids.len() >= candidates.len() {
        return shaped;
    }
    let Some(chat) = chat else { return shaped };

    let dropped: Vec<&RankedFact> = candidates
        .iter()
        .filter(|c| !shaped.injected_ids.contains(&c.fact.id))
        .collect();
    if dropped.is_empty() {
        return shaped;
    }

    let mut prompt = String::from("Summarize these memories in two or three sentences:\n");
    for candidate in &dropped {
        prompt.push_str("- ");
        prompt.push_str(&candidate.fact.text);
        prompt.push('\n');
    }

    match chat_default(chat, prompt, 200).await {
        Ok(summary) => {
            let mut body = shaped.body;
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(&format!("- (summarized) {summary}"));
            ShapedInjection { body, injected_ids: shaped.injected_ids }
        }
        Err(e) => {
            tracing::warn!(error = %e, "over-budget summary failed, falling back to truncated list");
            shaped
        }
    }
}

fn wrap_tag(tag: &str, attrs: &str, body: &str) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if attrs.is_empty() {
        Some(format!("<{tag}>\n{body}\n</{tag}>"))
    } else {
        Some(format!("<{tag} {attrs}>\n{body}\n</{tag}>"))
    }
}

pub fn wrap_hot_memories(hot: &[Fact]) -> Option<String> {
    if hot.is_empty() {
        return None;
    }
    let body = hot
        .iter()
        .map(|f| format!("- [{}] {}", f.category, f.summary.as_deref().unwrap_or(&f.text)))
        .collect::<Vec<_>>()
        .join("\n");
    wrap_tag("hot-memories", "", &body)
}

pub fn wrap_procedures(procs: &[crate::model::Procedure]) -> Option<String> {
    if procs.is_empty() {
        return None;
    }
    let body = procs
        .iter()
        .map(|p| format!("- {} (confidence {:.2})", p.task_pattern, p.confidence))
        .collect::<Vec<_>>()
        .join("\n");
    wrap_tag("relevant-procedures", "", &body)
}

pub fn wrap_relevant_memories(shaped: &ShapedInjection, format: InjectionFormat) -> Option<String> {
    let format_attr = match format {
        InjectionFormat::Full => "full",
        InjectionFormat::Short => "short",
        InjectionFormat::Minimal => "minimal",
        InjectionFormat::Progressive => "progressive",
        InjectionFormat::ProgressiveHybrid => "progressive_hybrid",
    };
    wrap_tag("relevant-memories", &format!("format=\"{format_attr}\""), &shaped.body)
}

/// A credential-hint block naming only the entity/category/key a
/// memory stores under, never its value.
pub fn format_credential_hint(fact: &Fact) -> String {
    let entity = fact.entity.as_deref().unwrap_or("unknown");
    let key = fact.key.as_deref().unwrap_or("unknown");
    format!(
        "<credential-hint>\nA stored {} memory exists for entity \"{entity}\" key \"{key}\". \
         Retrieve it through the configured secrets path rather than guessing.\n</credential-hint>",
        fact.category,
    )
}

/// Joins the envelope sections in fixed order: hot memories,
/// procedures, relevant memories, then any credential hints. `None`
/// if every section is empty.
pub fn assemble_prepend(
    hot: Option<String>,
    procedures: Option<String>,
    relevant: Option<String>,
    credential_hints: &[String],
) -> Option<String> {
    let mut sections = Vec::new();
    if let Some(s) = hot {
        sections.push(s);
    }
    if let Some(s) = procedures {
        sections.push(s);
    }
    if let Some(s) = relevant {
        sections.push(s);
    }
    sections.extend(credential_hints.iter().cloned());

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// Scans tool-result text for signs of an authentication failure and
/// extracts a best-effort target (host or IP) to key reactive recall
/// on.
pub struct AuthFailureDetector {
    patterns: Vec<Regex>,
    ip_pattern: Regex,
    host_pattern: Regex,
}

impl AuthFailureDetector {
    pub fn new(extra_patterns: &[String]) -> Self {
        let mut patterns = vec![
            Regex::new(r"(?i)permission denied \(publickey").expect("valid builtin regex"),
            Regex::new(r"\b401\b|\b403\b").expect("valid builtin regex"),
            Regex::new(r"(?i)invalid api key|token expired|unauthorized").expect("valid builtin regex"),
        ];
        for raw in extra_patterns {
            match Regex::new(raw) {
                Ok(re) => patterns.push(re),
                Err(e) => tracing::warn!(pattern = %raw, error = %e, "invalid auth-failure pattern, skipping"),
            }
        }
        Self {
            patterns,
            ip_pattern: Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("valid builtin regex"),
            host_pattern: Regex::new(r"(?:https?://)?([a-zA-Z0-9.-]+\.[a-zA-Z]{2,})").expect("valid builtin regex"),
        }
    }

    pub fn detect(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }

    pub fn extract_target(&self, text: &str) -> Option<String> {
        if let Some(m) = self.ip_pattern.find(text) {
            return Some(m.as_str().to_string());
        }
        self.host_pattern
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Scope};

    fn fact(id: &str, score_order: i64) -> Fact {
        Fact {
            id: id.to_string(),
            text: format!("fact {id}"),
            summary: None,
            entity: None,
            key: None,
            value: None,
            category: Category::Fact,
            importance: 0.5,
            recall_count: 0,
            last_accessed_at: None,
            decay_class: DecayClass::Stable,
            ttl_seconds: Some(90 * 86_400),
            created_at: Utc::now() - chrono::Duration::seconds(score_order),
            last_confirmed_at: Utc::now(),
            tier: Tier::Warm,
            scope: Scope::Global,
            scope_target: None,
            valid_from: Utc::now() - chrono::Duration::days(1),
            valid_until: None,
            superseded_at: None,
            superseded_by: None,
            supersedes_id: None,
            source_date: None,
            normalized_hash: None,
            source: None,
            tags: Vec::new(),
            reinforced_count: 0,
            last_reinforced_at: None,
            reinforced_quotes: Vec::new(),
        }
    }

    #[test]
    fn rrf_merges_and_ranks_overlap_highest() {
        let fts = vec![
            RankedFact { fact: fact("a", 0), score: 1.0, source: "fts" },
            RankedFact { fact: fact("b", 1), score: 0.9, source: "fts" },
        ];
        let ann = vec![
            RankedFact { fact: fact("b", 1), score: 0.8, source: "ann" },
            RankedFact { fact: fact("c", 2), score: 0.7, source: "ann" },
        ];
        let fused = reciprocal_rank_fusion(&fts, &ann);
        assert_eq!(fused[0].fact.id, "b");
        assert_eq!(fused[0].source, "both");
    }

    #[test]
    fn post_fusion_boosts_permanent_facts() {
        let mut permanent = fact("p", 0);
        permanent.decay_class = DecayClass::Permanent;
        let mut stable = fact("s", 0);
        stable.decay_class = DecayClass::Stable;
        let mut candidates = vec![
            RankedFact { fact: stable, score: 1.0, source: "fts" },
            RankedFact { fact: permanent, score: 1.0, source: "fts" },
        ];
        let cfg = AutoRecallConfig { use_importance_recency: false, ..Default::default() };
        apply_post_fusion_adjustments(&mut candidates, &cfg, Utc::now());
        assert_eq!(candidates[0].fact.id, "p");
    }

    #[test]
    fn filter_candidates_drops_cold_tier_when_tiering_enabled() {
        let mut cold = fact("c", 0);
        cold.tier = Tier::Cold;
        let candidates = vec![RankedFact { fact: cold, score: 1.0, source: "fts" }];
        let filtered = filter_candidates(candidates, true, None, false);
        assert!(filtered.is_empty());
    }

    #[test]
    fn shape_flat_respects_token_budget() {
        let candidates: Vec<RankedFact> = (0..50)
            .map(|i| RankedFact { fact: fact(&i.to_string(), i), score: 1.0, source: "fts" })
            .collect();
        let cfg = AutoRecallConfig { max_tokens: 20, ..Default::default() };
        let shaped = shape_flat(&candidates, &cfg);
        assert!(shaped.injected_ids.len() < candidates.len());
    }

    #[test]
    fn auth_failure_detector_matches_builtin_patterns() {
        let detector = AuthFailureDetector::new(&[]);
        assert!(detector.detect("Permission denied (publickey)."));
        assert!(detector.detect("request failed with 401"));
        assert!(!detector.detect("build succeeded"));
    }

    #[test]
    fn auth_failure_detector_extracts_ip_over_host() {
        let detector = AuthFailureDetector::new(&[]);
        let target = detector.extract_target("connection to 10.0.0.5 failed: unauthorized");
        assert_eq!(target.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn assemble_prepend_is_none_when_all_sections_empty() {
        assert!(assemble_prepend(None, None, None, &[]).is_none());
    }

    #[test]
    fn assemble_prepend_joins_sections_in_fixed_order() {
        let result = assemble_prepend(
            Some("<hot-memories>\nx\n</hot-memories>".to_string()),
            None,
            Some("<relevant-memories format=\"short\">\ny\n</relevant-memories>".to_string()),
            &["<credential-hint>z</credential-hint>".to_string()],
        )
        .unwrap();
        assert!(result.find("hot-memories").unwrap() < result.find("relevant-memories").unwrap());
        assert!(result.find("relevant-memories").unwrap() < result.find("credential-hint").unwrap());
    }
}
