//! Typed fact-link maintenance layered on top of the fact store's
//! link table — auto-linking newly stored facts to their nearest
//! neighbors, expanding a seed set via bounded BFS during recall, and
//! Hebbian co-recall reinforcement for facts injected together.

use crate::config::GraphConfig;
use crate::model::{Link, LinkKind, RankedFact};
use crate::storage::SqliteFactStore;
use crate::vector::VectorStore;

/// Links a newly stored fact to its nearest existing neighbors above
/// `autoLinkMinScore`, capped at `autoLinkLimit`. No-op unless both
/// `graph.enabled` and `graph.autoLink` are set.
pub async fn auto_link_on_store(
    fact_store: &SqliteFactStore,
    vector_store: &dyn VectorStore,
    new_fact_id: &str,
    embedding: &[f32],
    cfg: &GraphConfig,
) {
    if !cfg.enabled || !cfg.auto_link {
        return;
    }

    let hits = vector_store
        .search(embedding, cfg.auto_link_limit + 1, cfg.auto_link_min_score)
        .await;

    for hit in hits {
        if hit.fact_id == new_fact_id {
            continue;
        }
        let link = Link {
            from_id: new_fact_id.to_string(),
            to_id: hit.fact_id,
            kind: LinkKind::RelatedTo,
            strength: hit.score.clamp(0.0, 1.0) as f64,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = fact_store.upsert_link(&link) {
            tracing::warn!(error = %e, "auto-link upsert failed");
        }
    }
}

/// Expands the top `top_n_seeds` of a ranked candidate set via bounded
/// BFS over traversable link kinds, decaying score by link strength
/// per hop and dropping anything below `graph_floor`. No-op unless
/// `graph.enabled` and `graph.useInRecall` are set.
pub fn expand_candidates(
    fact_store: &SqliteFactStore,
    seeds: &[RankedFact],
    cfg: &GraphConfig,
    graph_floor: f32,
    top_n_seeds: usize,
) -> Vec<RankedFact> {
    if !cfg.enabled || !cfg.use_in_recall {
        return Vec::new();
    }

    let kinds = LinkKind::traversable();
    let mut out = Vec::new();

    for seed in seeds.iter().take(top_n_seeds) {
        let hits = match fact_store.neighbors(&seed.fact.id, &kinds, cfg.max_traversal_depth) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, fact_id = %seed.fact.id, "graph expansion failed");
                continue;
            }
        };
        for hit in hits {
            let decay = (hit.strength as f32).powi(hit.depth as i32);
            let score = seed.score * decay;
            if score < graph_floor {
                continue;
            }
            out.push(RankedFact { fact: hit.fact, score, source: "graph" });
        }
    }
    out
}

/// Strengthens the unordered pairwise RELATED_TO links among facts
/// injected together this turn, bounded at `max_ids` pairs' worth of
/// ids to keep the write volume predictable.
pub fn reinforce_co_recall(fact_store: &SqliteFactStore, injected_ids: &[String], max_ids: usize) {
    if injected_ids.len() < 2 {
        return;
    }
    let bounded = &injected_ids[..injected_ids.len().min(max_ids)];
    for i in 0..bounded.len() {
        for j in (i + 1)..bounded.len() {
            if let Err(e) = fact_store.create_or_strengthen_related_link(&bounded[i], &bounded[j]) {
                tracing::warn!(error = %e, "co-recall reinforcement failed");
            }
        }
    }
}
