//! Classifier: decides whether a capture candidate should be added as
//! a new fact, merged into an existing one, treated as a retraction,
//! or dropped. Prompts with a short numbered list of candidates and
//! asks for a single structured verdict from the
//! ADD/UPDATE/DELETE/NOOP vocabulary.

use crate::model::{ClassifierDecision, Fact};
use crate::storage::SqliteFactStore;
use crate::traits::{chat_default, parse_classifier_response, with_retries, ChatModel, ClassifierVerdict};
use crate::vector::VectorStore;

const MAX_SIMILAR_IN_PROMPT: usize = 3;
const CLASSIFY_MAX_TOKENS: u32 = 200;
const CLASSIFY_MAX_ATTEMPTS: u32 = 2;

/// Builds the prompt sent to the chat tier. Lists up to
/// `MAX_SIMILAR_IN_PROMPT` candidates the new text might relate to and
/// asks for a single JSON verdict.
pub fn build_prompt(candidate_text: &str, similar: &[Fact]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are deciding how a new memory relates to existing memories.\n\
         Respond with a single JSON object: {\"decision\": \"ADD\"|\"UPDATE\"|\"DELETE\"|\"NOOP\", \
         \"targetId\": string or null, \"rationale\": string or null}.\n\
         ADD if it is genuinely new. UPDATE if it supersedes one of the existing memories below \
         (set targetId to its id). DELETE if it retracts one of them. NOOP if it is a \
         near-duplicate that adds nothing.\n\n",
    );
    prompt.push_str("New memory:\n");
    prompt.push_str(candidate_text);
    prompt.push_str("\n\nExisting memories:\n");
    if similar.is_empty() {
        prompt.push_str("(none found)\n");
    }
    for fact in similar.iter().take(MAX_SIMILAR_IN_PROMPT) {
        prompt.push_str(&format!("- id={} text={}\n", fact.id, fact.text));
    }
    prompt
}

fn fallback_add() -> ClassifierVerdict {
    ClassifierVerdict {
        decision: ClassifierDecision::Add,
        target_id: None,
        rationale: None,
    }
}

/// Runs the classifier. On any chat or parse failure, falls back to
/// `ADD` rather than blocking the write.
pub async fn classify(chat: &dyn ChatModel, candidate_text: &str, similar: &[Fact]) -> ClassifierVerdict {
    let prompt = build_prompt(candidate_text, similar);
    let raw = with_retries(
        || async { chat_default(chat, prompt.clone(), CLASSIFY_MAX_TOKENS).await },
        CLASSIFY_MAX_ATTEMPTS,
    )
    .await;

    let raw = match raw {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "classifier chat call failed, falling back to ADD");
            return fallback_add();
        }
    };

    match parse_classifier_response(&raw) {
        Ok(verdict) => verdict,
        Err(e) => {
            tracing::warn!(error = %e, response = %raw, "classifier response unparseable, falling back to ADD");
            fallback_add()
        }
    }
}

/// Gathers candidate facts the classifier should weigh against: vector
/// top-k first (resolved back to full rows), falling back to the fact
/// store's own structured/FTS similarity search when the vector store
/// finds nothing.
pub async fn gather_similar_facts(
    vector_store: &dyn VectorStore,
    fact_store: &SqliteFactStore,
    embedding: Option<&[f32]>,
    text: &str,
    entity: Option<&str>,
    key: Option<&str>,
    limit: usize,
) -> Vec<Fact> {
    if let Some(embedding) = embedding {
        let hits = vector_store.search(embedding, limit, 0.0).await;
        if !hits.is_empty() {
            let opts = crate::model::QueryOptions::default();
            let mut out = Vec::new();
            for hit in hits {
                if let Ok(Some(fact)) = fact_store.get_by_id(&hit.fact_id, &opts) {
                    out.push(fact);
                }
            }
            if !out.is_empty() {
                return out;
            }
        }
    }

    fact_store
        .find_similar_for_classification(text, entity, key, limit)
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "fallback similarity lookup failed");
            Vec::new()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, DecayClass, Scope, Tier};
    use chrono::Utc;

    fn fact(id: &str, text: &str) -> Fact {
        Fact {
            id: id.to_string(),
            text: text.to_string(),
            summary: None,
            entity: None,
            key: None,
            value: None,
            category: Category::Fact,
            importance: 0.5,
            recall_count: 0,
            last_accessed_at: None,
            decay_class: DecayClass::Stable,
            ttl_seconds: None,
            created_at: Utc::now(),
            last_confirmed_at: Utc::now(),
            tier: Tier::Warm,
            scope: Scope::Global,
            scope_target: None,
            valid_from: Utc::now(),
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
    fn prompt_lists_similar_facts_and_caps_at_three() {
        let facts = vec![fact("1", "a"), fact("2", "b"), fact("3", "c"), fact("4", "d")];
        let prompt = build_prompt("new text", &facts);
        assert!(prompt.contains("new text"));
        assert!(prompt.contains("id=1"));
        assert!(prompt.contains("id=3"));
        assert!(!prompt.contains("id=4"));
    }

    #[test]
    fn prompt_notes_absence_of_similar_facts() {
        let prompt = build_prompt("new text", &[]);
        assert!(prompt.contains("none found"));
    }

    #[test]
    fn fallback_always_adds() {
        let verdict = fallback_add();
        assert_eq!(verdict.decision, ClassifierDecision::Add);
        assert!(verdict.target_id.is_none());
    }
}
