//! SQLite-backed fact store: row store, FTS5 index, link table, and
//! procedure table. Separate reader/writer connections under their
//! own mutexes so readers are never blocked behind a writer holding
//! the write lock longer than a single statement, and `&self` methods
//! so the engine can hold a single `Arc<SqliteFactStore>` as the sole
//! writer with concurrent, snapshot-consistent readers.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::FactStoreError;
use crate::model::{
    Category, DecayClass, Fact, Link, LinkKind, Procedure, ProcedureType, QueryOptions,
    RankedFact, Scope, StoreInput, Tier,
};

use super::fts::sanitize_fts5_query;
use super::migrations::apply_migrations;

pub type Result<T> = std::result::Result<T, FactStoreError>;

/// Aggregate counts returned by `stats()`.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_facts: i64,
    pub hot: i64,
    pub warm: i64,
    pub cold: i64,
    pub superseded: i64,
    pub links: i64,
    pub procedures: i64,
}

/// Parameters for `run_compaction`.
#[derive(Debug, Clone)]
pub struct CompactionParams {
    pub inactive_preference_days: i64,
    pub hot_max_tokens: usize,
    pub hot_max_facts: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CompactionReport {
    pub promoted_to_hot: usize,
    pub demoted_to_warm: usize,
    pub moved_to_cold: usize,
    pub evicted_from_hot: usize,
}

/// A neighbor reached during bounded-depth graph traversal.
#[derive(Debug, Clone)]
pub struct TraversalHit {
    pub fact: Fact,
    pub depth: u32,
    pub kind: LinkKind,
    pub strength: f64,
}

pub struct SqliteFactStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(())
}

impl SqliteFactStore {
    /// Open (creating if needed) the fact store database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer_conn = Connection::open(&path)?;
        configure_connection(&writer_conn)?;
        apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    /// In-memory store, for tests and short-lived sessions. Uses a
    /// named shared-cache database so the reader and writer connections
    /// see the same data (a plain `:memory:` database is private to a
    /// single connection).
    pub fn open_in_memory() -> Result<Self> {
        use rusqlite::OpenFlags;
        let uri = format!("file:memory-{}?mode=memory&cache=shared", Uuid::new_v4());
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        // Keep one connection alive for the lifetime of the store so the
        // shared-cache database isn't dropped once the last connection
        // that created it closes.
        let anchor = Connection::open_with_flags(&uri, flags)?;
        configure_connection(&anchor)?;
        apply_migrations(&anchor)?;

        let reader_conn = Connection::open_with_flags(&uri, flags)?;
        configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(anchor),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reader_or_writer(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // store
    // ------------------------------------------------------------------

    /// Validates scope, computes decay class/tags/hash, dedups, and
    /// inserts. `hot_admission_importance` is the importance threshold
    /// at/above which a fact is admitted straight to the hot tier.
    pub fn store(&self, input: StoreInput, hot_admission_importance: f64) -> Result<Fact> {
        let scope = input.scope.unwrap_or(Scope::Global);
        let scope_target = input.scope_target.clone();
        validate_scope(scope, &scope_target)?;

        let fuzzy_hash = normalized_hash(&input.text);
        let fuzzy_dedupe = input.fuzzy_dedupe.unwrap_or(true);

        // Dedup: exact text + (scope, scopeTarget) match, then (if fuzzy
        // dedup is on) hash match.
        if let Some(existing) = self.find_exact_duplicate(&input.text, scope, scope_target.as_deref())? {
            return Ok(existing);
        }
        if fuzzy_dedupe {
            if let Some(existing) = self.find_hash_duplicate(&fuzzy_hash, scope, scope_target.as_deref())? {
                return Ok(existing);
            }
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let decay_class = input
            .decay_class
            .unwrap_or_else(|| classify_decay(input.entity.as_deref(), input.key.as_deref(), input.value.as_deref(), &input.text));
        let importance = input.importance.unwrap_or(0.5);
        let tags = input
            .tags
            .unwrap_or_else(|| crate::capture::tags::infer_tags(&input.text, input.entity.as_deref()));
        let category = input.category.unwrap_or(Category::Other);

        let tier = if importance >= hot_admission_importance || matches!(decay_class, DecayClass::Active | DecayClass::Checkpoint) {
            Tier::Hot
        } else {
            Tier::Warm
        };

        let valid_from = input.valid_from.unwrap_or(now);
        let ttl_seconds = decay_class.ttl_seconds();

        let fact = Fact {
            id,
            text: input.text,
            summary: input.summary,
            entity: input.entity,
            key: input.key,
            value: input.value,
            category,
            importance,
            recall_count: 0,
            last_accessed_at: None,
            decay_class,
            ttl_seconds,
            created_at: now,
            last_confirmed_at: now,
            tier,
            scope,
            scope_target,
            valid_from,
            valid_until: input.valid_until,
            superseded_at: None,
            superseded_by: None,
            supersedes_id: input.supersedes_id,
            source_date: input.source_date,
            normalized_hash: Some(fuzzy_hash),
            source: input.source,
            tags,
            reinforced_count: 0,
            last_reinforced_at: None,
            reinforced_quotes: Vec::new(),
        };

        self.insert_fact(&fact)?;
        Ok(fact)
    }

    fn insert_fact(&self, fact: &Fact) -> Result<()> {
        let writer = self.writer();
        writer.execute(
            "INSERT INTO facts (
                id, text, summary, entity, key, value, category, importance,
                recall_count, last_accessed_at, decay_class, ttl_seconds,
                created_at, last_confirmed_at, tier, scope, scope_target,
                valid_from, valid_until, superseded_at, superseded_by, supersedes_id,
                source_date, normalized_hash, source, tags,
                reinforced_count, last_reinforced_at, reinforced_quotes
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, ?21, ?22,
                ?23, ?24, ?25, ?26,
                ?27, ?28, ?29
            )",
            params![
                fact.id,
                fact.text,
                fact.summary,
                fact.entity,
                fact.key,
                fact.value,
                fact.category.as_str(),
                fact.importance,
                fact.recall_count,
                fact.last_accessed_at.map(|t| t.to_rfc3339()),
                fact.decay_class.as_str(),
                fact.ttl_seconds,
                fact.created_at.to_rfc3339(),
                fact.last_confirmed_at.to_rfc3339(),
                fact.tier.as_str(),
                fact.scope.as_str(),
                fact.scope_target,
                fact.valid_from.to_rfc3339(),
                fact.valid_until.map(|t| t.to_rfc3339()),
                fact.superseded_at.map(|t| t.to_rfc3339()),
                fact.superseded_by,
                fact.supersedes_id,
                fact.source_date.map(|t| t.to_rfc3339()),
                fact.normalized_hash,
                fact.source,
                serde_json::to_string(&fact.tags).unwrap_or_else(|_| "[]".to_string()),
                fact.reinforced_count,
                fact.last_reinforced_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&fact.reinforced_quotes).unwrap_or_else(|_| "[]".to_string()),
            ],
        )?;
        Ok(())
    }

    fn find_exact_duplicate(&self, text: &str, scope: Scope, scope_target: Option<&str>) -> Result<Option<Fact>> {
        let reader = self.reader_or_writer();
        let mut stmt = reader.prepare(
            "SELECT * FROM facts WHERE text = ?1 AND scope = ?2 AND
             (scope_target IS ?3) AND superseded_at IS NULL LIMIT 1",
        )?;
        let fact = stmt
            .query_row(params![text, scope.as_str(), scope_target], row_to_fact)
            .optional()?;
        Ok(fact)
    }

    fn find_hash_duplicate(&self, hash: &str, scope: Scope, scope_target: Option<&str>) -> Result<Option<Fact>> {
        let reader = self.reader_or_writer();
        let mut stmt = reader.prepare(
            "SELECT * FROM facts WHERE normalized_hash = ?1 AND scope = ?2 AND
             (scope_target IS ?3) AND superseded_at IS NULL LIMIT 1",
        )?;
        let fact = stmt
            .query_row(params![hash, scope.as_str(), scope_target], row_to_fact)
            .optional()?;
        Ok(fact)
    }

    pub fn has_duplicate(&self, text: &str) -> Result<bool> {
        let hash = normalized_hash(text);
        let reader = self.reader_or_writer();
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM facts WHERE (text = ?1 OR normalized_hash = ?2) AND superseded_at IS NULL",
            params![text, hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // getById / search / lookup
    // ------------------------------------------------------------------

    pub fn get_by_id(&self, id: &str, opts: &QueryOptions) -> Result<Option<Fact>> {
        let reader = self.reader_or_writer();
        let fact: Option<Fact> = reader
            .prepare("SELECT * FROM facts WHERE id = ?1")?
            .query_row(params![id], row_to_fact)
            .optional()?;

        Ok(fact.filter(|f| {
            if !opts.include_superseded && f.is_superseded() {
                return false;
            }
            if let Some(as_of) = opts.as_of {
                return f.valid_at(as_of);
            }
            true
        }))
    }

    /// FTS5 full-text search over the row store, ranked by bm25.
    pub fn search(&self, query: &str, limit: usize, opts: &QueryOptions) -> Result<Vec<RankedFact>> {
        let Some(fts_query) = sanitize_fts5_query(query) else {
            return Ok(Vec::new());
        };

        let reader = self.reader_or_writer();
        let mut sql = String::from(
            "SELECT f.*, bm25(fact_fts) AS rank FROM facts f
             JOIN fact_fts ON fact_fts.rowid = f.rowid
             WHERE fact_fts MATCH ?1",
        );
        if !opts.include_superseded {
            sql.push_str(" AND f.superseded_at IS NULL");
        }
        sql.push_str(" ORDER BY rank LIMIT ?2");

        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(params![fts_query, (limit * 3) as i64], |row| {
            let rank: f64 = row.get("rank")?;
            Ok((row_to_fact(row)?, rank))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (fact, rank) = row?;
            if !matches_options(&fact, opts) {
                continue;
            }
            // bm25() is negative-is-better; convert to a positive score.
            let score = (-rank) as f32;
            results.push(RankedFact { fact, score, source: "fts" });
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Structured equality lookup; no FTS.
    pub fn lookup(
        &self,
        entity: Option<&str>,
        key: Option<&str>,
        tag: Option<&str>,
        scope_filter: Option<(Scope, Option<String>)>,
    ) -> Result<Vec<Fact>> {
        let reader = self.reader_or_writer();
        let mut sql = String::from("SELECT * FROM facts WHERE superseded_at IS NULL");
        if entity.is_some() {
            sql.push_str(" AND entity = :entity");
        }
        if key.is_some() {
            sql.push_str(" AND key = :key");
        }
        if tag.is_some() {
            sql.push_str(" AND tags LIKE :tag_like");
        }
        if scope_filter.is_some() {
            sql.push_str(" AND scope = :scope AND (scope_target IS :scope_target)");
        }
        sql.push_str(" ORDER BY importance DESC, last_confirmed_at DESC");

        let tag_like = tag.map(|t| format!("%\"{}\"%", t));
        let (scope_str, scope_target) = match &scope_filter {
            Some((s, t)) => (Some(s.as_str()), t.clone()),
            None => (None, None),
        };

        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::named_params! {
                ":entity": entity,
                ":key": key,
                ":tag_like": tag_like,
                ":scope": scope_str,
                ":scope_target": scope_target,
            },
            row_to_fact,
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find_similar_for_classification(
        &self,
        text: &str,
        entity: Option<&str>,
        key: Option<&str>,
        n: usize,
    ) -> Result<Vec<Fact>> {
        if let (Some(entity), Some(key)) = (entity, key) {
            let mut out = self.lookup(Some(entity), Some(key), None, None)?;
            out.truncate(n);
            if !out.is_empty() {
                return Ok(out);
            }
        }
        let opts = QueryOptions::default();
        let ranked = self.search(text, n, &opts)?;
        Ok(ranked.into_iter().map(|r| r.fact).collect())
    }

    // ------------------------------------------------------------------
    // supersede / refresh-on-access
    // ------------------------------------------------------------------

    /// Idempotent: repeat calls are a no-op if already superseded.
    pub fn supersede(&self, old_id: &str, new_id: Option<&str>, at: DateTime<Utc>) -> Result<()> {
        let writer = self.writer();
        let already: Option<String> = writer
            .query_row("SELECT superseded_at FROM facts WHERE id = ?1", params![old_id], |r| r.get(0))
            .optional()?
            .flatten();
        if already.is_some() {
            return Ok(());
        }

        let updated = writer.execute(
            "UPDATE facts SET superseded_at = ?1, superseded_by = ?2, valid_until = ?1
             WHERE id = ?3 AND superseded_at IS NULL",
            params![at.to_rfc3339(), new_id, old_id],
        )?;
        if updated == 0 {
            return Err(FactStoreError::NotFound(old_id.to_string()));
        }
        Ok(())
    }

    /// Single bulk UPDATE; refresh-on-access only for `{stable, active}`
    /// decay classes, batched at ≤500 ids.
    pub fn refresh_accessed_facts(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let writer = self.writer();
        for chunk in ids.chunks(500) {
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "UPDATE facts SET recall_count = recall_count + 1, last_accessed_at = ?,
                 last_confirmed_at = CASE WHEN decay_class IN ('stable','active') THEN ? ELSE last_confirmed_at END
                 WHERE id IN ({placeholders})"
            );
            let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&now, &now];
            for id in chunk {
                params_vec.push(id);
            }
            writer.execute(&sql, params_vec.as_slice())?;
        }
        Ok(())
    }

    /// Marks a fact reinforced (e.g. the user re-confirms it); bounded
    /// quote history.
    pub fn reinforce(&self, id: &str, quote: Option<&str>) -> Result<()> {
        let writer = self.writer();
        let existing: Option<String> = writer
            .query_row("SELECT reinforced_quotes FROM facts WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        let Some(existing) = existing else {
            return Err(FactStoreError::NotFound(id.to_string()));
        };
        let mut quotes: Vec<String> = serde_json::from_str(&existing).unwrap_or_default();
        if let Some(q) = quote {
            quotes.push(q.to_string());
            const MAX_QUOTES: usize = 10;
            if quotes.len() > MAX_QUOTES {
                let drop = quotes.len() - MAX_QUOTES;
                quotes.drain(0..drop);
            }
        }
        writer.execute(
            "UPDATE facts SET reinforced_count = reinforced_count + 1, last_reinforced_at = ?1,
             reinforced_quotes = ?2 WHERE id = ?3",
            params![Utc::now().to_rfc3339(), serde_json::to_string(&quotes).unwrap_or_default(), id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // hot facts / consolidation / compaction
    // ------------------------------------------------------------------

    pub fn get_hot_facts(&self, token_budget: Option<usize>, scope_filter: Option<(Scope, Option<String>)>) -> Result<Vec<Fact>> {
        let reader = self.reader_or_writer();
        let (scope_str, scope_target) = match &scope_filter {
            Some((s, t)) => (Some(s.as_str()), t.clone()),
            None => (None, None),
        };
        let mut stmt = reader.prepare(
            "SELECT * FROM facts WHERE tier = 'hot' AND superseded_at IS NULL
             AND (:scope IS NULL OR (scope = :scope AND scope_target IS :scope_target))
             ORDER BY importance DESC, last_accessed_at DESC",
        )?;
        let rows = stmt.query_map(
            rusqlite::named_params! { ":scope": scope_str, ":scope_target": scope_target },
            row_to_fact,
        )?;

        let mut out = Vec::new();
        let mut tokens_used = 0usize;
        for row in rows {
            let fact = row?;
            let text = fact.summary.as_deref().unwrap_or(&fact.text);
            let est_tokens = estimate_tokens(text);
            if let Some(budget) = token_budget {
                if tokens_used + est_tokens > budget {
                    break;
                }
            }
            tokens_used += est_tokens;
            out.push(fact);
        }
        Ok(out)
    }

    /// All non-superseded facts, unpaged. Used to repopulate the vector
    /// index after a dimension change.
    pub fn all_active_facts(&self) -> Result<Vec<Fact>> {
        let reader = self.reader_or_writer();
        let mut stmt = reader.prepare("SELECT * FROM facts WHERE superseded_at IS NULL")?;
        let rows = stmt.query_map([], row_to_fact)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_facts_for_consolidation(&self, limit: usize) -> Result<Vec<Fact>> {
        let reader = self.reader_or_writer();
        let mut stmt = reader.prepare(
            "SELECT * FROM facts WHERE superseded_at IS NULL ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_fact)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Tier compaction: completed tasks → cold, long-inactive
    /// preferences → warm, active blockers → hot; hot obeys the
    /// token+count cap, evicting oldest-accessed to warm first.
    pub fn run_compaction(&self, params: CompactionParams) -> Result<CompactionReport> {
        let now = Utc::now();
        let writer = self.writer();
        let mut report = CompactionReport::default();

        // Active blockers (procedure/active decay class with "blocker"-ish
        // tags) → hot.
        let promoted = writer.execute(
            "UPDATE facts SET tier = 'hot' WHERE tier != 'hot' AND superseded_at IS NULL
             AND decay_class = 'active' AND tags LIKE '%\"blocker\"%'",
            [],
        )?;
        report.promoted_to_hot = promoted;

        // Long-inactive preferences → warm.
        let cutoff = (now - Duration::days(params.inactive_preference_days)).to_rfc3339();
        let demoted = writer.execute(
            "UPDATE facts SET tier = 'warm' WHERE tier = 'hot' AND category = 'preference'
             AND superseded_at IS NULL
             AND COALESCE(last_accessed_at, last_confirmed_at) < ?1",
            params![cutoff],
        )?;
        report.demoted_to_warm = demoted;

        // Completed tasks (key = 'task'/'todo' with a done-ish tag) → cold.
        let cold = writer.execute(
            "UPDATE facts SET tier = 'cold' WHERE tier != 'cold' AND superseded_at IS NULL
             AND key IN ('task', 'todo') AND tags LIKE '%\"done\"%'",
            [],
        )?;
        report.moved_to_cold = cold;

        // Enforce hot cap: evict oldest-accessed first.
        let hot_ids: Vec<(String, Option<String>, String)> = {
            let mut stmt = writer.prepare(
                "SELECT id, last_accessed_at, COALESCE(summary, text) FROM facts
                 WHERE tier = 'hot' AND superseded_at IS NULL
                 ORDER BY COALESCE(last_accessed_at, last_confirmed_at) DESC",
            )?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
            let mut v = Vec::new();
            for row in rows {
                v.push(row?);
            }
            v
        };

        let mut kept = 0usize;
        let mut tokens = 0usize;
        for (id, _, text) in &hot_ids {
            let est = estimate_tokens(text);
            if kept + 1 > params.hot_max_facts || tokens + est > params.hot_max_tokens {
                writer.execute("UPDATE facts SET tier = 'warm' WHERE id = ?1", params![id])?;
                report.evicted_from_hot += 1;
            } else {
                kept += 1;
                tokens += est;
            }
        }

        Ok(report)
    }

    // ------------------------------------------------------------------
    // decay / prune
    // ------------------------------------------------------------------

    /// Facts whose `createdAt + ttlSeconds <= now` (permanent exempt).
    pub fn expired_fact_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let reader = self.reader_or_writer();
        let mut stmt = reader.prepare(
            "SELECT id, created_at, ttl_seconds FROM facts WHERE ttl_seconds IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |r| {
            let id: String = r.get(0)?;
            let created_at: String = r.get(1)?;
            let ttl: i64 = r.get(2)?;
            Ok((id, created_at, ttl))
        })?;

        let mut expired = Vec::new();
        for row in rows {
            let (id, created_at, ttl) = row?;
            if let Ok(created) = DateTime::parse_from_rfc3339(&created_at) {
                let created = created.with_timezone(&Utc);
                if created + Duration::seconds(ttl) <= now {
                    expired.push(id);
                }
            }
        }
        Ok(expired)
    }

    pub fn hard_delete(&self, id: &str) -> Result<bool> {
        let writer = self.writer();
        let deleted = writer.execute("DELETE FROM facts WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Facts whose age has passed `fraction` of their TTL (permanent and
    /// already-superseded facts are exempt) — the soft-decay checkpoint.
    pub fn facts_past_decay_threshold(&self, now: DateTime<Utc>, fraction: f64) -> Result<Vec<Fact>> {
        let reader = self.reader_or_writer();
        let mut stmt = reader.prepare(
            "SELECT * FROM facts WHERE ttl_seconds IS NOT NULL AND superseded_at IS NULL",
        )?;
        let rows = stmt.query_map([], row_to_fact)?;

        let mut out = Vec::new();
        for row in rows {
            let fact = row?;
            let Some(ttl) = fact.ttl_seconds else { continue };
            let threshold = fact.created_at + Duration::seconds((ttl as f64 * fraction) as i64);
            if threshold <= now {
                out.push(fact);
            }
        }
        Ok(out)
    }

    pub fn set_importance(&self, id: &str, importance: f64) -> Result<()> {
        let writer = self.writer();
        writer.execute("UPDATE facts SET importance = ?1 WHERE id = ?2", params![importance, id])?;
        Ok(())
    }

    /// Snapshot of every superseded fact id, used by the engine's
    /// 5-minute superseded-row cache to skip redundant lookups during
    /// candidate resolution.
    pub fn superseded_ids(&self) -> Result<std::collections::HashSet<String>> {
        let reader = self.reader_or_writer();
        let mut stmt = reader.prepare("SELECT id FROM facts WHERE superseded_at IS NOT NULL")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = std::collections::HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // links
    // ------------------------------------------------------------------

    pub fn upsert_link(&self, link: &Link) -> Result<()> {
        if link.from_id == link.to_id || link.strength <= 0.0 {
            // Invariant 8: never stored with strength=0 or equal endpoints.
            return Ok(());
        }
        let writer = self.writer();
        writer.execute(
            "INSERT INTO links (from_id, to_id, kind, strength, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(from_id, to_id, kind) DO UPDATE SET strength = excluded.strength",
            params![
                link.from_id,
                link.to_id,
                link.kind.as_str(),
                link.strength,
                link.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Increment strength capped at 1, or create with an initial
    /// strength if absent.
    pub fn strengthen_related(&self, a: &str, b: &str, initial: f64) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let writer = self.writer();
        let existing: Option<f64> = writer
            .query_row(
                "SELECT strength FROM links WHERE from_id = ?1 AND to_id = ?2 AND kind = 'RELATED_TO'",
                params![a, b],
                |r| r.get(0),
            )
            .optional()?;

        match existing {
            Some(strength) => {
                let new_strength = (strength + 0.1).min(1.0);
                writer.execute(
                    "UPDATE links SET strength = ?1 WHERE from_id = ?2 AND to_id = ?3 AND kind = 'RELATED_TO'",
                    params![new_strength, a, b],
                )?;
            }
            None => {
                writer.execute(
                    "INSERT INTO links (from_id, to_id, kind, strength, created_at) VALUES (?1, ?2, 'RELATED_TO', ?3, ?4)",
                    params![a, b, initial.clamp(0.01, 1.0), Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }

    /// Hebbian co-recall strengthening for an unordered pair.
    pub fn create_or_strengthen_related_link(&self, a: &str, b: &str) -> Result<()> {
        self.strengthen_related(a, b, 0.3)
    }

    /// Bounded-depth BFS over the named link kinds, carrying a visited
    /// set to break cycles.
    pub fn neighbors(&self, id: &str, kinds: &[LinkKind], max_depth: u32) -> Result<Vec<TraversalHit>> {
        let reader = self.reader_or_writer();
        let mut visited = std::collections::HashSet::new();
        visited.insert(id.to_string());

        let mut frontier = vec![id.to_string()];
        let mut out = Vec::new();

        for depth in 1..=max_depth {
            let mut next_frontier = Vec::new();
            for node in &frontier {
                let mut stmt = reader.prepare(
                    "SELECT to_id, kind, strength FROM links WHERE from_id = ?1
                     UNION
                     SELECT from_id, kind, strength FROM links WHERE to_id = ?1",
                )?;
                let rows = stmt.query_map(params![node], |r| {
                    let other: String = r.get(0)?;
                    let kind: String = r.get(1)?;
                    let strength: f64 = r.get(2)?;
                    Ok((other, kind, strength))
                })?;

                for row in rows {
                    let (other, kind_str, strength) = row?;
                    let Some(kind) = LinkKind::parse(&kind_str) else { continue };
                    if !kinds.contains(&kind) {
                        continue;
                    }
                    if visited.contains(&other) {
                        continue;
                    }
                    visited.insert(other.clone());
                    next_frontier.push(other.clone());

                    if let Some(fact) = self.get_by_id(&other, &QueryOptions::default())? {
                        out.push(TraversalHit { fact, depth, kind, strength });
                    }
                }
            }
            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }

        Ok(out)
    }

    // ------------------------------------------------------------------
    // procedures
    // ------------------------------------------------------------------

    pub fn store_procedure(&self, proc: &Procedure) -> Result<()> {
        let writer = self.writer();
        writer.execute(
            "INSERT INTO procedures (
                id, task_pattern, recipe_json, proc_type, success_count, failure_count,
                confidence, last_validated, last_failed, promoted_to_skill, skill_path,
                scope, scope_target
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(id) DO UPDATE SET
                success_count = excluded.success_count,
                failure_count = excluded.failure_count,
                confidence = excluded.confidence,
                last_validated = excluded.last_validated,
                last_failed = excluded.last_failed,
                promoted_to_skill = excluded.promoted_to_skill,
                skill_path = excluded.skill_path",
            params![
                proc.id,
                proc.task_pattern,
                proc.recipe_json,
                proc.proc_type.as_str(),
                proc.success_count,
                proc.failure_count,
                proc.confidence,
                proc.last_validated.map(|t| t.to_rfc3339()),
                proc.last_failed.map(|t| t.to_rfc3339()),
                proc.promoted_to_skill as i64,
                proc.skill_path,
                proc.scope.as_str(),
                proc.scope_target,
            ],
        )?;
        Ok(())
    }

    pub fn find_procedures_for_task(&self, task_pattern: &str, limit: usize) -> Result<Vec<Procedure>> {
        let reader = self.reader_or_writer();
        let like = format!("%{}%", task_pattern);
        let mut stmt = reader.prepare(
            "SELECT * FROM procedures WHERE task_pattern LIKE ?1 ORDER BY confidence DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![like, limit as i64], row_to_procedure)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // stats
    // ------------------------------------------------------------------

    pub fn stats(&self) -> Result<StoreStats> {
        let reader = self.reader_or_writer();
        let mut stats = StoreStats::default();
        stats.total_facts = reader.query_row("SELECT COUNT(*) FROM facts", [], |r| r.get(0))?;
        stats.hot = reader.query_row("SELECT COUNT(*) FROM facts WHERE tier='hot'", [], |r| r.get(0))?;
        stats.warm = reader.query_row("SELECT COUNT(*) FROM facts WHERE tier='warm'", [], |r| r.get(0))?;
        stats.cold = reader.query_row("SELECT COUNT(*) FROM facts WHERE tier='cold'", [], |r| r.get(0))?;
        stats.superseded = reader.query_row("SELECT COUNT(*) FROM facts WHERE superseded_at IS NOT NULL", [], |r| r.get(0))?;
        stats.links = reader.query_row("SELECT COUNT(*) FROM links", [], |r| r.get(0))?;
        stats.procedures = reader.query_row("SELECT COUNT(*) FROM procedures", [], |r| r.get(0))?;
        Ok(stats)
    }

    pub fn mark_category_discovered(&self, name: &str) -> Result<()> {
        let writer = self.writer();
        writer.execute(
            "INSERT OR IGNORE INTO discovered_categories (name, first_seen_at) VALUES (?1, ?2)",
            params![name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn facts_with_category_other(&self, limit: usize) -> Result<Vec<Fact>> {
        let reader = self.reader_or_writer();
        let mut stmt = reader.prepare(
            "SELECT * FROM facts WHERE category = 'other' AND superseded_at IS NULL
             ORDER BY created_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_fact)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn set_category(&self, id: &str, category: &Category) -> Result<()> {
        let writer = self.writer();
        writer.execute(
            "UPDATE facts SET category = ?1 WHERE id = ?2",
            params![category.as_str(), id],
        )?;
        Ok(())
    }
}

fn validate_scope(scope: Scope, scope_target: &Option<String>) -> Result<()> {
    match scope {
        Scope::Global if scope_target.is_some() => Err(FactStoreError::InvariantViolation(
            "global scope must not carry a scopeTarget".to_string(),
        )),
        Scope::Global => Ok(()),
        _ if scope_target.as_deref().unwrap_or("").is_empty() => Err(FactStoreError::InvariantViolation(
            "non-global scope requires a non-empty scopeTarget".to_string(),
        )),
        _ => Ok(()),
    }
}

fn matches_options(fact: &Fact, opts: &QueryOptions) -> bool {
    if let Some(tiers) = &opts.tier_filter {
        if !tiers.contains(&fact.tier) {
            return false;
        }
    }
    if let Some((scope, target)) = &opts.scope_filter {
        if fact.scope != *scope || fact.scope_target.as_deref() != target.as_deref() {
            return false;
        }
    }
    if let Some(as_of) = opts.as_of {
        if !fact.valid_at(as_of) {
            return false;
        }
    } else if !opts.include_superseded && fact.is_superseded() {
        return false;
    }
    true
}

/// SHA-256 of lowercased, whitespace-collapsed text, for fuzzy dedup.
pub fn normalized_hash(text: &str) -> String {
    let normalized = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic rule set assigning a decay class from content.
pub fn classify_decay(entity: Option<&str>, key: Option<&str>, _value: Option<&str>, text: &str) -> DecayClass {
    let key_lower = key.map(|k| k.to_lowercase()).unwrap_or_default();
    let entity_lower = entity.map(|e| e.to_lowercase()).unwrap_or_default();
    let text_lower = text.to_lowercase();

    const PERMANENT_KEYS: &[&str] = &["name", "email", "birthday", "decision", "architecture"];
    const ACTIVE_KEYS: &[&str] = &["task", "todo", "sprint", "blocker"];
    const SESSION_KEYS: &[&str] = &["current_file", "temp", "debug"];
    const CHECKPOINT_KEYS: &[&str] = &["checkpoint", "preflight"];

    if PERMANENT_KEYS.contains(&key_lower.as_str()) || entity_lower == "decision" || entity_lower == "convention" {
        return DecayClass::Permanent;
    }
    if CHECKPOINT_KEYS.contains(&key_lower.as_str()) {
        return DecayClass::Checkpoint;
    }
    if SESSION_KEYS.contains(&key_lower.as_str()) || text_lower.contains("this session") {
        return DecayClass::Session;
    }
    if ACTIVE_KEYS.contains(&key_lower.as_str())
        || text_lower.contains("working on")
        || text_lower.contains("need to")
    {
        return DecayClass::Active;
    }
    DecayClass::Stable
}

fn estimate_tokens(s: &str) -> usize {
    (s.len() / 4).max(1)
}

fn row_to_fact(row: &Row) -> rusqlite::Result<Fact> {
    let category: String = row.get("category")?;
    let decay_class: String = row.get("decay_class")?;
    let tier: String = row.get("tier")?;
    let scope: String = row.get("scope")?;
    let tags_json: String = row.get("tags")?;
    let quotes_json: String = row.get("reinforced_quotes")?;

    let parse_dt = |s: Option<String>| -> Option<DateTime<Utc>> {
        s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
    };
    let parse_dt_required = |s: String| -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };

    Ok(Fact {
        id: row.get("id")?,
        text: row.get("text")?,
        summary: row.get("summary")?,
        entity: row.get("entity")?,
        key: row.get("key")?,
        value: row.get("value")?,
        category: Category::parse(&category),
        importance: row.get("importance")?,
        recall_count: row.get("recall_count")?,
        last_accessed_at: parse_dt(row.get("last_accessed_at")?),
        decay_class: DecayClass::parse(&decay_class).unwrap_or(DecayClass::Stable),
        ttl_seconds: row.get("ttl_seconds")?,
        created_at: parse_dt_required(row.get("created_at")?),
        last_confirmed_at: parse_dt_required(row.get("last_confirmed_at")?),
        tier: Tier::parse(&tier).unwrap_or(Tier::Warm),
        scope: Scope::parse(&scope).unwrap_or(Scope::Global),
        scope_target: row.get("scope_target")?,
        valid_from: parse_dt_required(row.get("valid_from")?),
        valid_until: parse_dt(row.get("valid_until")?),
        superseded_at: parse_dt(row.get("superseded_at")?),
        superseded_by: row.get("superseded_by")?,
        supersedes_id: row.get("supersedes_id")?,
        source_date: parse_dt(row.get("source_date")?),
        normalized_hash: row.get("normalized_hash")?,
        source: row.get("source")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        reinforced_count: row.get("reinforced_count")?,
        last_reinforced_at: parse_dt(row.get("last_reinforced_at")?),
        reinforced_quotes: serde_json::from_str(&quotes_json).unwrap_or_default(),
    })
}

fn row_to_procedure(row: &Row) -> rusqlite::Result<Procedure> {
    let proc_type: String = row.get("proc_type")?;
    let scope: String = row.get("scope")?;
    let parse_dt = |s: Option<String>| -> Option<DateTime<Utc>> {
        s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
    };

    Ok(Procedure {
        id: row.get("id")?,
        task_pattern: row.get("task_pattern")?,
        recipe_json: row.get("recipe_json")?,
        proc_type: ProcedureType::parse(&proc_type).unwrap_or(ProcedureType::Positive),
        success_count: row.get("success_count")?,
        failure_count: row.get("failure_count")?,
        confidence: row.get("confidence")?,
        last_validated: parse_dt(row.get("last_validated")?),
        last_failed: parse_dt(row.get("last_failed")?),
        promoted_to_skill: row.get::<_, i64>("promoted_to_skill")? != 0,
        skill_path: row.get("skill_path")?,
        scope: Scope::parse(&scope).unwrap_or(Scope::Global),
        scope_target: row.get("scope_target")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteFactStore {
        SqliteFactStore::open_in_memory().unwrap()
    }

    #[test]
    fn store_then_get_round_trips() {
        let store = store();
        let fact = store
            .store(
                StoreInput {
                    text: "I prefer dark mode".to_string(),
                    category: Some(Category::Preference),
                    ..Default::default()
                },
                0.7,
            )
            .unwrap();
        let fetched = store.get_by_id(&fact.id, &QueryOptions::default()).unwrap();
        assert!(fetched.is_some());
        assert_eq!(fetched.unwrap().text, "I prefer dark mode");
    }

    #[test]
    fn exact_duplicate_store_is_noop() {
        let store = store();
        let a = store
            .store(StoreInput { text: "same text".into(), ..Default::default() }, 0.7)
            .unwrap();
        let b = store
            .store(StoreInput { text: "same text".into(), ..Default::default() }, 0.7)
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn global_scope_rejects_target() {
        let store = store();
        let result = store.store(
            StoreInput {
                text: "x".into(),
                scope: Some(Scope::Global),
                scope_target: Some("u1".into()),
                ..Default::default()
            },
            0.7,
        );
        assert!(result.is_err());
    }

    #[test]
    fn non_global_scope_requires_target() {
        let store = store();
        let result = store.store(
            StoreInput {
                text: "x".into(),
                scope: Some(Scope::User),
                scope_target: None,
                ..Default::default()
            },
            0.7,
        );
        assert!(result.is_err());
    }

    #[test]
    fn supersede_is_idempotent() {
        let store = store();
        let old = store.store(StoreInput { text: "old fact".into(), ..Default::default() }, 0.7).unwrap();
        let new = store.store(StoreInput { text: "new fact".into(), ..Default::default() }, 0.7).unwrap();
        let at = Utc::now();
        store.supersede(&old.id, Some(&new.id), at).unwrap();
        store.supersede(&old.id, Some(&new.id), at + Duration::seconds(5)).unwrap();

        let fetched = store.get_by_id(&old.id, &QueryOptions { include_superseded: true, ..Default::default() }).unwrap().unwrap();
        assert!(fetched.superseded_at.unwrap() <= at + Duration::seconds(1));
    }

    #[test]
    fn superseded_fact_excluded_from_default_get() {
        let store = store();
        let old = store.store(StoreInput { text: "old".into(), ..Default::default() }, 0.7).unwrap();
        store.supersede(&old.id, None, Utc::now()).unwrap();
        let fetched = store.get_by_id(&old.id, &QueryOptions::default()).unwrap();
        assert!(fetched.is_none());
    }

    #[test]
    fn links_reject_self_loops_and_zero_strength() {
        let store = store();
        let a = store.store(StoreInput { text: "a".into(), ..Default::default() }, 0.7).unwrap();
        store
            .upsert_link(&Link { from_id: a.id.clone(), to_id: a.id.clone(), kind: LinkKind::RelatedTo, strength: 0.5, created_at: Utc::now() })
            .unwrap();
        let neighbors = store.neighbors(&a.id, &LinkKind::traversable(), 2).unwrap();
        assert!(neighbors.is_empty());
    }

    #[test]
    fn search_strips_operator_tokens_without_error() {
        let store = store();
        store.store(StoreInput { text: "dark mode preference".into(), ..Default::default() }, 0.7).unwrap();
        let results = store.search(r#""NOT" OR ("#, 10, &QueryOptions::default());
        assert!(results.is_ok());
    }
}
