//! Fact store schema migrations: a `MIGRATIONS` table of forward-only
//! SQL blocks plus `apply_migrations`, tracked via `schema_version`.

/// A single forward migration.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "facts, fact_fts, links, procedures, schema_version",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "performance: page_size 8192, FTS5 porter tokenizer",
        up: MIGRATION_V2_UP,
    },
];

const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS facts (
    id TEXT PRIMARY KEY,
    text TEXT NOT NULL,
    summary TEXT,
    entity TEXT,
    key TEXT,
    value TEXT,
    category TEXT NOT NULL,
    importance REAL NOT NULL DEFAULT 0.5,
    recall_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT,
    decay_class TEXT NOT NULL,
    ttl_seconds INTEGER,
    created_at TEXT NOT NULL,
    last_confirmed_at TEXT NOT NULL,
    tier TEXT NOT NULL DEFAULT 'warm',
    scope TEXT NOT NULL DEFAULT 'global',
    scope_target TEXT,
    valid_from TEXT NOT NULL,
    valid_until TEXT,
    superseded_at TEXT,
    superseded_by TEXT,
    supersedes_id TEXT,
    source_date TEXT,
    normalized_hash TEXT,
    source TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    reinforced_count INTEGER NOT NULL DEFAULT 0,
    last_reinforced_at TEXT,
    reinforced_quotes TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_facts_scope ON facts(scope, scope_target);
CREATE INDEX IF NOT EXISTS idx_facts_tier ON facts(tier);
CREATE INDEX IF NOT EXISTS idx_facts_entity_key ON facts(entity, key);
CREATE INDEX IF NOT EXISTS idx_facts_normalized_hash ON facts(normalized_hash);
CREATE INDEX IF NOT EXISTS idx_facts_superseded ON facts(superseded_at);
CREATE INDEX IF NOT EXISTS idx_facts_created_at ON facts(created_at);
CREATE INDEX IF NOT EXISTS idx_facts_decay_class ON facts(decay_class);
CREATE INDEX IF NOT EXISTS idx_facts_valid ON facts(valid_from, valid_until);

CREATE VIRTUAL TABLE IF NOT EXISTS fact_fts USING fts5(
    id UNINDEXED,
    text,
    summary,
    entity,
    key,
    content='facts',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
    INSERT INTO fact_fts(rowid, id, text, summary, entity, key)
    VALUES (NEW.rowid, NEW.id, NEW.text, NEW.summary, NEW.entity, NEW.key);
END;

CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON facts BEGIN
    INSERT INTO fact_fts(fact_fts, rowid, id, text, summary, entity, key)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.text, OLD.summary, OLD.entity, OLD.key);
END;

CREATE TRIGGER IF NOT EXISTS facts_au AFTER UPDATE ON facts BEGIN
    INSERT INTO fact_fts(fact_fts, rowid, id, text, summary, entity, key)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.text, OLD.summary, OLD.entity, OLD.key);
    INSERT INTO fact_fts(rowid, id, text, summary, entity, key)
    VALUES (NEW.rowid, NEW.id, NEW.text, NEW.summary, NEW.entity, NEW.key);
END;

CREATE TABLE IF NOT EXISTS links (
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    strength REAL NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (from_id, to_id, kind),
    FOREIGN KEY (from_id) REFERENCES facts(id) ON DELETE CASCADE,
    FOREIGN KEY (to_id) REFERENCES facts(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_links_from ON links(from_id);
CREATE INDEX IF NOT EXISTS idx_links_to ON links(to_id);

CREATE TABLE IF NOT EXISTS procedures (
    id TEXT PRIMARY KEY,
    task_pattern TEXT NOT NULL,
    recipe_json TEXT NOT NULL,
    proc_type TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,
    last_validated TEXT,
    last_failed TEXT,
    promoted_to_skill INTEGER NOT NULL DEFAULT 0,
    skill_path TEXT,
    scope TEXT NOT NULL DEFAULT 'global',
    scope_target TEXT
);

CREATE INDEX IF NOT EXISTS idx_procedures_scope ON procedures(scope, scope_target);

CREATE TABLE IF NOT EXISTS discovered_categories (
    name TEXT PRIMARY KEY,
    first_seen_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

const MIGRATION_V2_UP: &str = r#"
DROP TRIGGER IF EXISTS facts_ai;
DROP TRIGGER IF EXISTS facts_ad;
DROP TRIGGER IF EXISTS facts_au;
DROP TABLE IF EXISTS fact_fts;

CREATE VIRTUAL TABLE fact_fts USING fts5(
    id UNINDEXED,
    text,
    summary,
    entity,
    key,
    content='facts',
    content_rowid='rowid',
    tokenize='porter ascii'
);

INSERT INTO fact_fts(fact_fts) VALUES('rebuild');

CREATE TRIGGER facts_ai AFTER INSERT ON facts BEGIN
    INSERT INTO fact_fts(rowid, id, text, summary, entity, key)
    VALUES (NEW.rowid, NEW.id, NEW.text, NEW.summary, NEW.entity, NEW.key);
END;

CREATE TRIGGER facts_ad AFTER DELETE ON facts BEGIN
    INSERT INTO fact_fts(fact_fts, rowid, id, text, summary, entity, key)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.text, OLD.summary, OLD.entity, OLD.key);
END;

CREATE TRIGGER facts_au AFTER UPDATE ON facts BEGIN
    INSERT INTO fact_fts(fact_fts, rowid, id, text, summary, entity, key)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.text, OLD.summary, OLD.entity, OLD.key);
    INSERT INTO fact_fts(rowid, id, text, summary, entity, key)
    VALUES (NEW.rowid, NEW.id, NEW.text, NEW.summary, NEW.entity, NEW.key);
END;

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying fact store migration"
            );
            conn.execute_batch(migration.up)?;

            if migration.version == 2 {
                conn.pragma_update(None, "page_size", 8192)?;
                conn.execute_batch("VACUUM;")?;
            }

            applied += 1;
        }
    }

    Ok(applied)
}
