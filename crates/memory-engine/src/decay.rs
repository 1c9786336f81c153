//! Decay and tier lifecycle: hard-prunes expired facts, soft-decays
//! importance past the TTL checkpoint, runs tier compaction, and spawns
//! the background schedulers the engine starts at construction time.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;

use crate::storage::{CompactionParams, CompactionReport, SqliteFactStore};
use crate::vector::VectorStore;

/// Fraction of TTL elapsed before a fact's importance is soft-decayed.
pub const SOFT_DECAY_FRACTION: f64 = 0.75;

/// Importance floor below which a soft-decayed fact is hard-deleted
/// instead of halved again.
pub const SOFT_DECAY_FLOOR: f64 = 0.1;

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub hard_pruned: usize,
    pub soft_decayed: usize,
    pub soft_expired: usize,
}

/// Runs one prune pass: hard-deletes anything past its hard TTL, then
/// halves the importance of facts past the soft-decay checkpoint
/// (hard-deleting instead if the halved value would fall below
/// `SOFT_DECAY_FLOOR`). Failures on individual facts are logged and
/// skipped rather than aborting the pass.
pub async fn run_prune(fact_store: &SqliteFactStore, vector_store: &dyn VectorStore) -> PruneReport {
    let mut report = PruneReport::default();
    let now = Utc::now();

    let expired = fact_store.expired_fact_ids(now).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "expired_fact_ids lookup failed");
        Vec::new()
    });
    for id in expired {
        match fact_store.hard_delete(&id) {
            Ok(_) => {
                if let Err(e) = vector_store.delete(&id).await {
                    tracing::warn!(error = %e, fact_id = %id, "vector delete failed during hard prune");
                }
                report.hard_pruned += 1;
            }
            Err(e) => tracing::warn!(error = %e, fact_id = %id, "hard delete failed"),
        }
    }

    let due = fact_store
        .facts_past_decay_threshold(now, SOFT_DECAY_FRACTION)
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "facts_past_decay_threshold lookup failed");
            Vec::new()
        });
    for fact in due {
        let halved = fact.importance / 2.0;
        if halved < SOFT_DECAY_FLOOR {
            match fact_store.hard_delete(&fact.id) {
                Ok(_) => {
                    if let Err(e) = vector_store.delete(&fact.id).await {
                        tracing::warn!(error = %e, fact_id = %fact.id, "vector delete failed during soft expiry");
                    }
                    report.soft_expired += 1;
                }
                Err(e) => tracing::warn!(error = %e, fact_id = %fact.id, "hard delete failed during soft expiry"),
            }
        } else if let Err(e) = fact_store.set_importance(&fact.id, halved) {
            tracing::warn!(error = %e, fact_id = %fact.id, "soft decay importance update failed");
        } else {
            report.soft_decayed += 1;
        }
    }

    report
}

/// Runs a tier compaction pass (hot/warm/cold promotion and demotion),
/// logging and defaulting to an empty report on failure rather than
/// propagating.
pub fn run_tier_compaction(fact_store: &SqliteFactStore, params: CompactionParams) -> CompactionReport {
    match fact_store.run_compaction(params) {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(error = %e, "tier compaction failed");
            CompactionReport::default()
        }
    }
}

/// Spawns the periodic prune scheduler: sleeps one interval, runs a
/// pass, logs, repeats. The engine runs an additional pass immediately
/// at startup, before this scheduler's first tick, so a freshly started
/// process doesn't wait a full interval before expired facts are cleared.
pub fn spawn_prune_scheduler(
    fact_store: Arc<SqliteFactStore>,
    vector_store: Arc<dyn VectorStore>,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(StdDuration::from_secs(interval_secs)).await;
            let report = run_prune(&fact_store, vector_store.as_ref()).await;
            tracing::info!(
                hard_pruned = report.hard_pruned,
                soft_decayed = report.soft_decayed,
                soft_expired = report.soft_expired,
                "prune pass complete"
            );
        }
    })
}

/// Spawns the auto-classify scheduler: reclassifies
/// `other`-category facts into a discovered category in batches, once
/// per `interval_secs`, starting after a short initial delay so it
/// doesn't compete with startup work.
pub fn spawn_auto_classify_scheduler<F, Fut>(interval_secs: u64, reclassify_batch: F) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        tokio::time::sleep(StdDuration::from_secs(300)).await;
        loop {
            reclassify_batch().await;
            tokio::time::sleep(StdDuration::from_secs(interval_secs)).await;
        }
    })
}
