//! Lifecycle coordinator: the single owner of every long-lived
//! resource — fact store, vector store handle, WAL, embedder, chat
//! model, and the two background schedulers. Hook handlers borrow these
//! for the duration of a call; nothing here outlives the `Engine`
//! except the vector store, which is reference-counted across handles
//! that may outlive this particular engine instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::capture;
use crate::classify;
use crate::config::EngineConfig;
use crate::decay;
use crate::embedding_cache::CachedEmbedder;
use crate::error::{EngineError, Result, VectorStoreError};
use crate::graph;
use crate::hyde;
use crate::model::{
    Category, ClassifierDecision, DecayClass, Fact, Link, LinkKind, QueryOptions, RankedFact,
    Scope, StoreInput, VectorRecord,
};
use crate::retrieve;
use crate::storage::{CompactionParams, CompactionReport, SqliteFactStore, StoreStats};
use crate::traits::{ChatModel, Embedder, SessionEndEvent, TurnEndEvent, TurnStartEvent, TurnStartResult};
use crate::vector::{VectorStore, VectorStoreHandle};
use crate::wal::{self, Wal};

const WAL_MAX_AGE_SECS: i64 = 300;
/// How many of the top fused candidates are offered to graph expansion;
/// unrelated to `autoRecall.limit`, which bounds the final injected set.
const GRAPH_EXPANSION_SEED_COUNT: usize = 5;
/// How many similar existing facts the classifier is shown.
const CLASSIFY_SIMILAR_LIMIT: usize = 5;
/// Facts reclassified per auto-classify scheduler tick.
const AUTO_CLASSIFY_BATCH_SIZE: usize = 20;

/// `prune(mode)` selects which lifecycle passes run.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneMode {
    /// TTL hard-prune and soft-decay only.
    Ttl,
    /// Tier compaction only.
    Tier,
    /// Both passes, TTL first.
    Both,
}

/// Combined counts from a `prune()` call.
#[derive(Debug, Clone, Default)]
pub struct PruneCounts {
    pub hard_pruned: usize,
    pub soft_decayed: usize,
    pub soft_expired: usize,
    pub promoted_to_hot: usize,
    pub demoted_to_warm: usize,
    pub moved_to_cold: usize,
    pub evicted_from_hot: usize,
}

/// `graph(id, depth)` result: the subgraph reachable from `id` within
/// `depth` hops over traversable link kinds, as plain rows rather than
/// back-pointers.
#[derive(Debug, Clone, Default)]
pub struct GraphResult {
    pub facts: Vec<Fact>,
    pub links: Vec<Link>,
}

/// Aggregate counts and backing-resource sizes for `stats()`.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub store: StoreStats,
    pub vector_count: usize,
    pub embedding_cache_len: usize,
    pub wal_pending: usize,
}

/// A lightweight, non-LLM-by-default synthesis over a recent window of
/// facts. Exact synthesis semantics are left open, so this stays cheap:
/// group by category and tag, surface recurring entities, and only call
/// the chat tier for a prose narrative when one is configured.
#[derive(Debug, Clone, Default)]
pub struct ReflectionReport {
    pub window_fact_count: usize,
    pub by_category: HashMap<String, usize>,
    pub top_tags: Vec<(String, usize)>,
    pub recurring_entities: Vec<(String, usize)>,
    pub narrative: Option<String>,
}

/// The memory engine: owns every long-lived resource and exposes the
/// host-facing operations and turn hooks.
pub struct Engine {
    config: EngineConfig,
    fact_store: Arc<SqliteFactStore>,
    vector_handle: VectorStoreHandle,
    wal: Arc<Wal>,
    embedder: Arc<CachedEmbedder<Arc<dyn Embedder>>>,
    chat: Option<Arc<dyn ChatModel>>,
    auth_detector: retrieve::AuthFailureDetector,
    /// Per-session reactive-recall counter, cleared on `session_end`.
    /// Counts recalls per (session, target) so `max_recalls_per_target`
    /// above 1 is honored rather than collapsing to a one-shot latch.
    auth_recall_seen: Mutex<HashMap<(String, String), usize>>,
    prune_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    classify_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Opens every backing store, replays any pending WAL entries, and
    /// spawns the two background schedulers. Also runs one prune pass
    /// immediately so a freshly started process doesn't wait a full
    /// interval before expired facts are cleared.
    pub async fn new(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        chat: Option<Arc<dyn ChatModel>>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(crate::error::ConfigError::from_io)?;

        let fact_store = Arc::new(SqliteFactStore::open(config.data_dir.join("facts.sqlite3"))?);
        let vector_handle = VectorStoreHandle::open(
            config.data_dir.join("vectors").join("index.usearch"),
            config.vector_dimensions,
        )?;

        let wal_path = if config.wal.wal_path.is_absolute() {
            config.wal.wal_path.clone()
        } else {
            config.data_dir.join(&config.wal.wal_path)
        };
        let wal = Arc::new(Wal::new(wal_path));

        let embedder = Arc::new(CachedEmbedder::new(embedder, config.embedding_cache_capacity));
        let auth_detector = retrieve::AuthFailureDetector::new(&config.auto_recall.auth_failure.patterns);

        let engine = Self {
            config,
            fact_store,
            vector_handle,
            wal,
            embedder,
            chat,
            auth_detector,
            auth_recall_seen: Mutex::new(HashMap::new()),
            prune_handle: Mutex::new(None),
            classify_handle: Mutex::new(None),
        };

        engine.recover_wal().await;
        let startup_report = decay::run_prune(&engine.fact_store, engine.vector_store().as_ref()).await;
        tracing::info!(
            hard_pruned = startup_report.hard_pruned,
            soft_decayed = startup_report.soft_decayed,
            soft_expired = startup_report.soft_expired,
            "startup prune pass complete"
        );
        engine.spawn_schedulers();
        Ok(engine)
    }

    fn vector_store(&self) -> Arc<dyn VectorStore> {
        self.vector_handle.store() as Arc<dyn VectorStore>
    }

    /// Drops and rebuilds the vector index at `new_dim`, then re-embeds
    /// and re-stores every active fact so the index isn't left empty.
    /// Failures along the way are logged; a fact that fails to
    /// re-embed simply stays without a vector record until the next
    /// successful store or recall repopulates it.
    async fn repair_vector_dimensions(&self, new_dim: usize) {
        tracing::warn!(new_dim, "vector dimension mismatch detected, rebuilding index");
        if let Err(e) = self.vector_store().recreate(new_dim).await {
            tracing::error!(error = %e, "vector index recreate failed, auto-repair aborted");
            return;
        }
        let facts = match self.fact_store.all_active_facts() {
            Ok(facts) => facts,
            Err(e) => {
                tracing::error!(error = %e, "could not load facts for re-embedding after vector auto-repair");
                return;
            }
        };
        let mut reembedded = 0usize;
        for fact in &facts {
            let vector = match self.embedder.embed(&fact.text).await {
                Ok(vector) => vector,
                Err(e) => {
                    tracing::warn!(error = %e, fact_id = %fact.id, "embedding failed during vector auto-repair");
                    continue;
                }
            };
            match self
                .vector_store()
                .store(VectorRecord {
                    fact_id: fact.id.clone(),
                    vector,
                    category: fact.category.clone(),
                    importance: fact.importance,
                })
                .await
            {
                Ok(()) => reembedded += 1,
                Err(e) => tracing::warn!(error = %e, fact_id = %fact.id, "re-store failed during vector auto-repair"),
            }
        }
        tracing::info!(total = facts.len(), reembedded, new_dim, "vector auto-repair complete");
    }

    /// Replays every WAL entry still within `maxAge` through the normal
    /// store path, removing each on success. Replay is idempotent
    /// because `store` dedups by exact text (and fuzzy hash, if
    /// enabled), so a crash between the append and the fact-store write
    /// produces exactly one row either way.
    async fn recover_wal(&self) {
        if !self.config.wal.enabled {
            return;
        }
        let entries = match self.wal.recover(Duration::seconds(WAL_MAX_AGE_SECS)) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "WAL recovery read failed");
                return;
            }
        };
        for entry in entries {
            let input: StoreInput = match serde_json::from_value(entry.data.clone()) {
                Ok(input) => input,
                Err(e) => {
                    tracing::warn!(error = %e, wal_id = %entry.id, "skipping unparsable WAL entry");
                    continue;
                }
            };
            match self.fact_store.store(input, self.config.hot_admission_importance) {
                Ok(fact) => {
                    if let Ok(vector) = self.embedder.embed(&fact.text).await {
                        let _ = self
                            .vector_store()
                            .store(VectorRecord {
                                fact_id: fact.id.clone(),
                                vector,
                                category: fact.category.clone(),
                                importance: fact.importance,
                            })
                            .await;
                    }
                    if let Err(e) = self.wal.remove(&entry.id) {
                        tracing::warn!(error = %e, wal_id = %entry.id, "failed to compact replayed WAL entry");
                    }
                }
                Err(e) => tracing::warn!(error = %e, wal_id = %entry.id, "WAL replay store failed"),
            }
        }
    }

    fn spawn_schedulers(&self) {
        let prune_handle = decay::spawn_prune_scheduler(
            self.fact_store.clone(),
            self.vector_store(),
            self.config.prune_interval_secs,
        );
        *self.prune_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(prune_handle);

        let fact_store = self.fact_store.clone();
        let classify_handle = decay::spawn_auto_classify_scheduler(self.config.auto_classify_interval_secs, move || {
            let fact_store = fact_store.clone();
            async move {
                let batch = match fact_store.facts_with_category_other(AUTO_CLASSIFY_BATCH_SIZE) {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(error = %e, "auto-classify batch lookup failed");
                        return;
                    }
                };
                for fact in batch {
                    let discovered = Category::parse(fact.tags.first().map(String::as_str).unwrap_or("other"));
                    if let Err(e) = fact_store.mark_category_discovered(discovered.as_str()) {
                        tracing::warn!(error = %e, "failed to record discovered category");
                        continue;
                    }
                    if let Err(e) = fact_store.set_category(&fact.id, &discovered) {
                        tracing::warn!(error = %e, fact_id = %fact.id, "auto-classify category update failed");
                    }
                }
            }
        });
        *self.classify_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(classify_handle);
    }

    // ------------------------------------------------------------------
    // Host-facing operations
    // ------------------------------------------------------------------

    /// Commits a new fact through the WAL-guarded write path: `WAL.append
    /// → factStore.store → vectorStore.store → WAL.remove`.
    /// A vector embedding failure is logged rather than propagated — the
    /// fact row is the commit boundary, and the retriever tolerates a
    /// missing vector record.
    pub async fn store(&self, input: StoreInput) -> Result<Fact> {
        let wal_id = Uuid::new_v4().to_string();
        if self.config.wal.enabled {
            let data = serde_json::to_value(&input).map_err(crate::error::WalError::from)?;
            self.wal.append(&wal::store_entry(wal_id.clone(), data))?;
        }

        let fact = self.fact_store.store(input, self.config.hot_admission_importance)?;

        match self.embedder.embed(&fact.text).await {
            Ok(vector) => {
                let record = VectorRecord {
                    fact_id: fact.id.clone(),
                    vector: vector.clone(),
                    category: fact.category.clone(),
                    importance: fact.importance,
                };
                match self.vector_store().store(record.clone()).await {
                    Ok(()) => {
                        graph::auto_link_on_store(&self.fact_store, self.vector_store().as_ref(), &fact.id, &vector, &self.config.graph).await;
                    }
                    Err(VectorStoreError::InvalidDimensions { got, .. }) if self.config.vector_auto_repair => {
                        self.repair_vector_dimensions(got).await;
                        if let Err(e) = self.vector_store().store(record).await {
                            tracing::error!(error = %e, fact_id = %fact.id, "vector store write failed after auto-repair");
                        } else {
                            graph::auto_link_on_store(&self.fact_store, self.vector_store().as_ref(), &fact.id, &vector, &self.config.graph).await;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, fact_id = %fact.id, "vector store write failed, fact persisted without a vector record");
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, fact_id = %fact.id, "embedding failed, fact persisted without a vector record");
            }
        }

        if self.config.wal.enabled {
            if let Err(e) = self.wal.remove(&wal_id) {
                tracing::warn!(error = %e, wal_id = %wal_id, "failed to compact WAL after commit");
            }
        }
        Ok(fact)
    }

    /// Runs the full hybrid-search pipeline (FTS ∪ ANN, RRF, adjustments,
    /// graph expansion) and returns the ranked facts directly, refreshing
    /// access bookkeeping on whatever is returned.
    pub async fn recall(&self, query: &str, opts: QueryOptions) -> Result<Vec<Fact>> {
        let ranked = self.run_retrieval(query, &opts, self.config.auto_recall.limit).await?;
        let ids: Vec<String> = ranked.iter().map(|r| r.fact.id.clone()).collect();
        self.fact_store.refresh_accessed_facts(&ids)?;
        graph::reinforce_co_recall(&self.fact_store, &ids, self.config.recall_hebbian_max);
        Ok(ranked.into_iter().map(|r| r.fact).collect())
    }

    /// Shared retrieval core used by `recall()` and the `turn_start` hook:
    /// FTS search, optional HyDE-expanded ANN search, RRF fusion, post-fusion
    /// adjustments, graph expansion, entity-lookup merge, and tier/validity
    /// filtering.
    async fn run_retrieval(&self, query: &str, opts: &QueryOptions, limit: usize) -> Result<Vec<RankedFact>> {
        let fts = self.fact_store.search(query, limit.max(20), opts)?;

        let query_vector = if self.config.search.hyde_enabled {
            hyde::hyde_embedding(self.embedder.as_ref(), self.chat.as_deref(), query).await.ok()
        } else {
            self.embedder.embed(query).await.ok()
        };
        let ann = if let Some(vector) = query_vector {
            if self.config.vector_auto_repair && vector.len() != self.vector_store().dimensions() {
                self.repair_vector_dimensions(vector.len()).await;
            }
            let hits = self.vector_store().search(&vector, limit.max(20), self.config.auto_recall.min_score).await;
            let mut resolved = Vec::new();
            for hit in hits {
                if let Ok(Some(fact)) = self.fact_store.get_by_id(&hit.fact_id, opts) {
                    resolved.push(RankedFact { fact, score: hit.score, source: "ann" });
                }
            }
            resolved
        } else {
            Vec::new()
        };

        let mut fused = retrieve::reciprocal_rank_fusion(&fts, &ann);
        retrieve::apply_post_fusion_adjustments(&mut fused, &self.config.auto_recall, Utc::now());

        if self.config.auto_recall.entity_lookup.enabled {
            for entity in &self.config.auto_recall.entity_lookup.entities {
                let entity_facts = self
                    .fact_store
                    .lookup(Some(entity.as_str()), None, None, opts.scope_filter.clone())
                    .unwrap_or_default();
                let capped: Vec<Fact> = entity_facts
                    .into_iter()
                    .take(self.config.auto_recall.entity_lookup.max_facts_per_entity)
                    .collect();
                retrieve::merge_entity_facts(&mut fused, capped, self.config.auto_recall.min_score);
            }
        }

        if self.config.graph.enabled && self.config.graph.use_in_recall {
            let expanded = graph::expand_candidates(&self.fact_store, &fused, &self.config.graph, self.config.graph_floor, GRAPH_EXPANSION_SEED_COUNT);
            let existing: std::collections::HashSet<String> = fused.iter().map(|c| c.fact.id.clone()).collect();
            for candidate in expanded {
                if !existing.contains(&candidate.fact.id) {
                    fused.push(candidate);
                }
            }
            fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        }

        let tiering_enabled = self.config.memory_tiering.enabled;
        let filtered = retrieve::filter_candidates(fused, tiering_enabled, opts.as_of, opts.include_superseded);
        Ok(filtered.into_iter().take(limit).collect())
    }

    /// Hard-deletes a fact and its vector record. Unlike TTL expiry,
    /// this is always an explicit, caller-driven removal.
    pub async fn forget(&self, id: &str) -> Result<bool> {
        let existed = self.fact_store.hard_delete(id)?;
        if existed {
            if let Err(e) = self.vector_store().delete(id).await {
                tracing::warn!(error = %e, fact_id = %id, "vector delete failed during forget");
            }
        }
        Ok(existed)
    }

    /// Structured entity/key/tag lookup, bypassing hybrid ranking
    /// entirely.
    pub fn lookup(&self, entity: Option<&str>, key: Option<&str>, opts: &QueryOptions) -> Result<Vec<Fact>> {
        Ok(self.fact_store.lookup(entity, key, None, opts.scope_filter.clone())?)
    }

    /// Creates or strengthens a typed edge between two facts. `strength`
    /// defaults to 0.5 when omitted.
    pub fn link(&self, from: &str, to: &str, kind: LinkKind, strength: Option<f64>) -> Result<Link> {
        let link = Link {
            from_id: from.to_string(),
            to_id: to.to_string(),
            kind,
            strength: strength.unwrap_or(0.5),
            created_at: Utc::now(),
        };
        self.fact_store.upsert_link(&link)?;
        Ok(link)
    }

    /// Returns the subgraph reachable from `id` within `depth` hops over
    /// traversable link kinds. Built from repeated single-hop
    /// `neighbors` calls rather than in-memory back-pointers: each
    /// level's frontier is expanded node-by-node so the originating
    /// endpoint of every edge is known, which the fact store's
    /// depth-bounded BFS alone doesn't expose.
    pub fn graph(&self, id: &str, depth: Option<u32>) -> Result<GraphResult> {
        let max_depth = depth.unwrap_or(self.config.graph.max_traversal_depth).max(1);
        let kinds = LinkKind::traversable();

        let mut result = GraphResult::default();
        let mut visited: std::collections::HashSet<String> = std::collections::HashSet::new();
        visited.insert(id.to_string());
        if let Some(root) = self.fact_store.get_by_id(id, &QueryOptions::default())? {
            result.facts.push(root);
        }

        let mut frontier = vec![id.to_string()];
        for _ in 0..max_depth {
            let mut next_frontier = Vec::new();
            for node in &frontier {
                let hits = self.fact_store.neighbors(node, &kinds, 1)?;
                for hit in hits {
                    result.links.push(Link {
                        from_id: node.clone(),
                        to_id: hit.fact.id.clone(),
                        kind: hit.kind,
                        strength: hit.strength,
                        created_at: hit.fact.created_at,
                    });
                    if visited.insert(hit.fact.id.clone()) {
                        next_frontier.push(hit.fact.id.clone());
                        result.facts.push(hit.fact);
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }
        Ok(result)
    }

    /// A lightweight synthesis over facts created within `window` of
    /// now: grouping by category/entity/tags, plus an optional
    /// one-paragraph narrative from the chat tier when one is
    /// configured, rather than driving a full consolidation pass.
    pub async fn reflect(&self, window: Duration) -> Result<ReflectionReport> {
        let since = Utc::now() - window;
        let recent = self.fact_store.get_facts_for_consolidation(500)?;
        let recent: Vec<Fact> = recent.into_iter().filter(|f| f.created_at >= since).collect();

        let mut by_category: HashMap<String, usize> = HashMap::new();
        let mut tag_counts: HashMap<String, usize> = HashMap::new();
        let mut entity_counts: HashMap<String, usize> = HashMap::new();
        for fact in &recent {
            *by_category.entry(fact.category.as_str().to_string()).or_insert(0) += 1;
            for tag in &fact.tags {
                *tag_counts.entry(tag.clone()).or_insert(0) += 1;
            }
            if let Some(entity) = &fact.entity {
                *entity_counts.entry(entity.clone()).or_insert(0) += 1;
            }
        }
        let mut top_tags: Vec<(String, usize)> = tag_counts.into_iter().collect();
        top_tags.sort_by(|a, b| b.1.cmp(&a.1));
        top_tags.truncate(10);
        let mut recurring_entities: Vec<(String, usize)> = entity_counts.into_iter().filter(|(_, n)| *n > 1).collect();
        recurring_entities.sort_by(|a, b| b.1.cmp(&a.1));

        let narrative = if let Some(chat) = &self.chat {
            if recent.is_empty() {
                None
            } else {
                let mut prompt = String::from("Summarize the recurring themes in these recent memories in one short paragraph:\n");
                for fact in recent.iter().take(30) {
                    prompt.push_str("- ");
                    prompt.push_str(&fact.text);
                    prompt.push('\n');
                }
                match crate::traits::chat_default(chat.as_ref(), prompt, 200).await {
                    Ok(text) => Some(text),
                    Err(e) => {
                        tracing::warn!(error = %e, "reflect narrative generation failed");
                        None
                    }
                }
            }
        } else {
            None
        };

        Ok(ReflectionReport {
            window_fact_count: recent.len(),
            by_category,
            top_tags,
            recurring_entities,
            narrative,
        })
    }

    /// Stores `label` as a checkpoint fact: `decayClass = checkpoint`, a
    /// short TTL, admitted straight to hot.
    pub async fn checkpoint(&self, label: &str) -> Result<Fact> {
        self.store(StoreInput {
            text: label.to_string(),
            category: Some(Category::Fact),
            decay_class: Some(DecayClass::Checkpoint),
            importance: Some(0.9),
            ..Default::default()
        })
        .await
    }

    /// Runs the requested lifecycle pass(es) and returns their combined
    /// counts.
    pub async fn prune(&self, mode: PruneMode) -> PruneCounts {
        let mut counts = PruneCounts::default();
        if matches!(mode, PruneMode::Ttl | PruneMode::Both) {
            let report = decay::run_prune(&self.fact_store, self.vector_store().as_ref()).await;
            counts.hard_pruned = report.hard_pruned;
            counts.soft_decayed = report.soft_decayed;
            counts.soft_expired = report.soft_expired;
        }
        if matches!(mode, PruneMode::Tier | PruneMode::Both) {
            let report = self.run_tier_compaction();
            counts.promoted_to_hot = report.promoted_to_hot;
            counts.demoted_to_warm = report.demoted_to_warm;
            counts.moved_to_cold = report.moved_to_cold;
            counts.evicted_from_hot = report.evicted_from_hot;
        }
        counts
    }

    fn run_tier_compaction(&self) -> CompactionReport {
        decay::run_tier_compaction(
            &self.fact_store,
            CompactionParams {
                inactive_preference_days: self.config.memory_tiering.inactive_preference_days,
                hot_max_tokens: self.config.memory_tiering.hot_max_tokens,
                hot_max_facts: self.config.memory_tiering.hot_max_facts,
            },
        )
    }

    /// Aggregate counts and resource sizes.
    pub async fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            store: self.fact_store.stats()?,
            vector_count: self.vector_store().count().await,
            embedding_cache_len: self.embedder.len(),
            wal_pending: self.wal.valid_entries(Duration::seconds(WAL_MAX_AGE_SECS)).map(|v| v.len()).unwrap_or(0),
        })
    }

    // ------------------------------------------------------------------
    // Turn hooks
    // ------------------------------------------------------------------

    /// Builds the `prepend` blob: hot memories, relevant procedures,
    /// relevant memories, then any auth-failure credential hint, in that
    /// fixed order.
    pub async fn on_turn_start(&self, event: TurnStartEvent) -> Result<TurnStartResult> {
        let scope_filter = self.scope_filter_from_config();

        let hot = self
            .fact_store
            .get_hot_facts(Some(self.config.memory_tiering.hot_max_tokens), scope_filter.clone())
            .unwrap_or_default();
        let hot_block = retrieve::wrap_hot_memories(&hot);

        let procedures = self.fact_store.find_procedures_for_task(&event.prompt, 5).unwrap_or_default();
        let procedures_block = retrieve::wrap_procedures(&procedures);

        let mut relevant_block = None;
        let mut injected_ids = Vec::new();
        if self.config.auto_recall.enabled {
            let opts = QueryOptions { scope_filter: scope_filter.clone(), ..Default::default() };
            let ranked = self
                .run_retrieval(&event.prompt, &opts, self.config.auto_recall.limit)
                .await
                .unwrap_or_default();
            let shaped = retrieve::shape_with_optional_summary(&ranked, &self.config.auto_recall, self.chat.as_deref()).await;
            injected_ids = shaped.injected_ids.clone();
            relevant_block = retrieve::wrap_relevant_memories(&shaped, self.config.auto_recall.injection_format);

            if !injected_ids.is_empty() {
                if let Err(e) = self.fact_store.refresh_accessed_facts(&injected_ids) {
                    tracing::warn!(error = %e, "refresh_accessed_facts failed during turn_start");
                }
                graph::reinforce_co_recall(&self.fact_store, &injected_ids, self.config.recall_hebbian_max);
            }
        }

        let credential_hints = self.reactive_auth_recall(&event).await;

        let prepend = retrieve::assemble_prepend(hot_block, procedures_block, relevant_block, &credential_hints);
        Ok(TurnStartResult { prepend })
    }

    fn scope_filter_from_config(&self) -> Option<(Scope, Option<String>)> {
        self.config
            .auto_recall
            .scope_filter
            .as_ref()
            .and_then(|s| Scope::parse(s))
            .map(|scope| (scope, None))
    }

    /// Scans this turn's tool output for auth-failure signals and, if a
    /// stored credential fact exists for the extracted target and the
    /// per-target recall cap hasn't been hit this session, returns a
    /// credential-hint block naming only entity/category/key.
    async fn reactive_auth_recall(&self, event: &TurnStartEvent) -> Vec<String> {
        if !self.config.auto_recall.auth_failure.enabled {
            return Vec::new();
        }
        let session_key = event.session_id.clone().unwrap_or_default();
        let mut hints = Vec::new();

        for tool_result in &event.tool_results {
            if !self.auth_detector.detect(tool_result) {
                continue;
            }
            let Some(target) = self.auth_detector.extract_target(tool_result) else { continue };

            let dedup_key = (session_key.clone(), target.clone());
            {
                let mut seen = self.auth_recall_seen.lock().unwrap_or_else(|e| e.into_inner());
                let count = seen.entry(dedup_key).or_insert(0);
                if *count >= self.config.auto_recall.auth_failure.max_recalls_per_target {
                    continue;
                }
                *count += 1;
            }

            let facts = self.fact_store.lookup(Some(target.as_str()), None, None, None).unwrap_or_default();
            if let Some(fact) = facts.into_iter().next() {
                hints.push(retrieve::format_credential_hint(&fact));
            }
        }
        hints
    }

    /// Runs capture over the turn's messages, commits each surviving
    /// candidate (through the classifier first if `store.classifyBeforeWrite`
    /// is set), and opportunistically runs tier compaction if tiering is
    /// enabled.
    pub async fn on_turn_end(&self, event: TurnEndEvent) -> Result<()> {
        let messages = [event.user_message.as_str(), event.assistant_message.as_str()];
        let candidates = capture::capture_turn(&messages, self.config.capture_max_chars, self.config.capture_max_per_turn);

        for candidate in candidates {
            if let Err(e) = self.commit_candidate(candidate.input).await {
                tracing::warn!(error = %e, "capture commit failed, skipping candidate");
            }
        }

        if self.config.memory_tiering.enabled {
            let _ = self.run_tier_compaction();
        }
        Ok(())
    }

    /// Runs a single capture candidate through the classifier (if
    /// enabled) and applies its verdict: `ADD` stores unconditionally,
    /// `UPDATE`/`DELETE` supersede the named target before storing
    /// (DELETE stores nothing further), `NOOP` drops it.
    async fn commit_candidate(&self, input: StoreInput) -> Result<()> {
        if !self.config.store.classify_before_write {
            self.store(input).await?;
            return Ok(());
        }

        let embedding = self.embedder.embed(&input.text).await.ok();
        let similar = classify::gather_similar_facts(
            self.vector_store().as_ref(),
            &self.fact_store,
            embedding.as_deref(),
            &input.text,
            input.entity.as_deref(),
            input.key.as_deref(),
            CLASSIFY_SIMILAR_LIMIT,
        )
        .await;

        let verdict = match &self.chat {
            Some(chat) => classify::classify(chat.as_ref(), &input.text, &similar).await,
            None => {
                self.store(input).await?;
                return Ok(());
            }
        };

        match verdict.decision {
            ClassifierDecision::Add => {
                self.store(input).await?;
            }
            ClassifierDecision::Update => {
                if let Some(target_id) = &verdict.target_id {
                    let mut with_supersedes = input;
                    with_supersedes.supersedes_id = Some(target_id.clone());
                    let new_fact = self.store(with_supersedes).await?;
                    self.fact_store.supersede(target_id, Some(&new_fact.id), Utc::now())?;
                } else {
                    self.store(input).await?;
                }
            }
            ClassifierDecision::Delete => {
                if let Some(target_id) = &verdict.target_id {
                    self.fact_store.supersede(target_id, None, Utc::now())?;
                }
            }
            ClassifierDecision::Noop => {}
        }
        Ok(())
    }

    /// Clears per-session state.
    pub fn on_session_end(&self, event: SessionEndEvent) {
        let Some(session_id) = event.session_id else { return };
        let mut seen = self.auth_recall_seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.retain(|(session, _), _| session != &session_id);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(handle) = self.prune_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        if let Some(handle) = self.classify_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, crate::error::TransientError> {
            let mut v = vec![0.0f32; 8];
            for (i, b) in text.bytes().enumerate().take(8) {
                v[i] = b as f32;
            }
            Ok(v)
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    async fn test_engine() -> (Engine, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.vector_dimensions = 8;
        config.wal.wal_path = PathBuf::from("test.wal.ndjson");
        let engine = Engine::new(config, Arc::new(FixedEmbedder), None).await.unwrap();
        (engine, dir)
    }

    #[tokio::test]
    async fn store_then_recall_finds_it() {
        let (engine, _dir) = test_engine().await;
        engine
            .store(StoreInput { text: "I prefer dark mode".to_string(), category: Some(Category::Preference), ..Default::default() })
            .await
            .unwrap();
        let results = engine.recall("dark mode", QueryOptions::default()).await.unwrap();
        assert!(results.iter().any(|f| f.text.contains("dark mode")));
    }

    #[tokio::test]
    async fn forget_removes_fact() {
        let (engine, _dir) = test_engine().await;
        let fact = engine.store(StoreInput { text: "temporary note".to_string(), ..Default::default() }).await.unwrap();
        assert!(engine.forget(&fact.id).await.unwrap());
        assert!(!engine.forget(&fact.id).await.unwrap());
    }

    #[tokio::test]
    async fn checkpoint_has_checkpoint_decay_class() {
        let (engine, _dir) = test_engine().await;
        let fact = engine.checkpoint("end of sprint 12").await.unwrap();
        assert_eq!(fact.decay_class, DecayClass::Checkpoint);
    }

    #[tokio::test]
    async fn graph_reaches_two_hop_neighbor() {
        let (engine, _dir) = test_engine().await;
        let a = engine.store(StoreInput { text: "fact a".to_string(), ..Default::default() }).await.unwrap();
        let b = engine.store(StoreInput { text: "fact b".to_string(), ..Default::default() }).await.unwrap();
        let c = engine.store(StoreInput { text: "fact c".to_string(), ..Default::default() }).await.unwrap();
        engine.link(&a.id, &b.id, LinkKind::RelatedTo, Some(0.9)).unwrap();
        engine.link(&b.id, &c.id, LinkKind::RelatedTo, Some(0.9)).unwrap();

        let result = engine.graph(&a.id, Some(2)).unwrap();
        let ids: Vec<&str> = result.facts.iter().map(|f| f.id.as_str()).collect();
        assert!(ids.contains(&c.id.as_str()));
        assert_eq!(result.links.len(), 2);
    }

    #[tokio::test]
    async fn stats_reflects_stored_fact() {
        let (engine, _dir) = test_engine().await;
        engine.store(StoreInput { text: "one fact".to_string(), ..Default::default() }).await.unwrap();
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.store.total_facts, 1);
    }
}
