//! Core data model: facts, links, vector records, procedures, and the
//! closed tagged unions (category, decay class, tier, scope, link kind,
//! WAL operation, classifier decision) that back them.
//!
//! All persistence reads reject unknown tags: every enum here
//! round-trips through `as_str`/`parse` rather than storing free-form
//! strings, and `parse` returns `None` for anything it does not
//! recognize.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fact category. `Discovered` carries categories the auto-classify
/// scheduler promotes `other` facts into at runtime; the fixed set is
/// exhausted by every other variant.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Preference,
    Fact,
    Decision,
    Entity,
    Pattern,
    Rule,
    Procedure,
    Other,
    Discovered(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::Preference => "preference",
            Category::Fact => "fact",
            Category::Decision => "decision",
            Category::Entity => "entity",
            Category::Pattern => "pattern",
            Category::Rule => "rule",
            Category::Procedure => "procedure",
            Category::Other => "other",
            Category::Discovered(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "preference" => Category::Preference,
            "fact" => Category::Fact,
            "decision" => Category::Decision,
            "entity" => Category::Entity,
            "pattern" => Category::Pattern,
            "rule" => Category::Rule,
            "procedure" => Category::Procedure,
            "other" => Category::Other,
            other => Category::Discovered(other.to_string()),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decay class: governs TTL and refresh-on-access.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayClass {
    Permanent,
    Stable,
    Active,
    Session,
    Checkpoint,
}

impl DecayClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecayClass::Permanent => "permanent",
            DecayClass::Stable => "stable",
            DecayClass::Active => "active",
            DecayClass::Session => "session",
            DecayClass::Checkpoint => "checkpoint",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "permanent" => DecayClass::Permanent,
            "stable" => DecayClass::Stable,
            "active" => DecayClass::Active,
            "session" => DecayClass::Session,
            "checkpoint" => DecayClass::Checkpoint,
            _ => return None,
        })
    }

    /// TTL in seconds, or `None` for `permanent` (infinite, never hard-pruned).
    pub fn ttl_seconds(&self) -> Option<i64> {
        match self {
            DecayClass::Permanent => None,
            DecayClass::Stable => Some(90 * 86_400),
            DecayClass::Active => Some(14 * 86_400),
            DecayClass::Session => Some(24 * 3_600),
            DecayClass::Checkpoint => Some(4 * 3_600),
        }
    }

    /// Whether access (recall) refreshes `lastAccessedAt`/`lastConfirmedAt`.
    pub fn refreshes_on_access(&self) -> bool {
        matches!(self, DecayClass::Stable | DecayClass::Active)
    }
}

impl std::fmt::Display for DecayClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Injection-eligibility tier.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "hot" => Tier::Hot,
            "warm" => Tier::Warm,
            "cold" => Tier::Cold,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Multi-tenancy scope dimension.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    User,
    Agent,
    Session,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::User => "user",
            Scope::Agent => "agent",
            Scope::Session => "session",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "global" => Scope::Global,
            "user" => Scope::User,
            "agent" => Scope::Agent,
            "session" => Scope::Session,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed fact-link edge kind.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkKind {
    Supersedes,
    CausedBy,
    PartOf,
    RelatedTo,
    DependsOn,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Supersedes => "SUPERSEDES",
            LinkKind::CausedBy => "CAUSED_BY",
            LinkKind::PartOf => "PART_OF",
            LinkKind::RelatedTo => "RELATED_TO",
            LinkKind::DependsOn => "DEPENDS_ON",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "SUPERSEDES" => LinkKind::Supersedes,
            "CAUSED_BY" => LinkKind::CausedBy,
            "PART_OF" => LinkKind::PartOf,
            "RELATED_TO" => LinkKind::RelatedTo,
            "DEPENDS_ON" => LinkKind::DependsOn,
            _ => return None,
        })
    }

    /// Kinds BFS expansion during recall is allowed to traverse.
    /// SUPERSEDES is history, not topical, and is excluded.
    pub fn traversable() -> [LinkKind; 4] {
        [
            LinkKind::RelatedTo,
            LinkKind::PartOf,
            LinkKind::CausedBy,
            LinkKind::DependsOn,
        ]
    }
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// WAL mutation kind.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalOperation {
    Store,
    Update,
    Remove,
}

impl WalOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalOperation::Store => "store",
            WalOperation::Update => "update",
            WalOperation::Remove => "remove",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "store" => WalOperation::Store,
            "update" => WalOperation::Update,
            "remove" => WalOperation::Remove,
            _ => return None,
        })
    }
}

/// Classifier verdict.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClassifierDecision {
    Add,
    Update,
    Delete,
    Noop,
}

impl ClassifierDecision {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_uppercase().as_str() {
            "ADD" => ClassifierDecision::Add,
            "UPDATE" => ClassifierDecision::Update,
            "DELETE" => ClassifierDecision::Delete,
            "NOOP" => ClassifierDecision::Noop,
            _ => return None,
        })
    }
}

/// Procedure type: whether a learned tool-call pattern worked or failed.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureType {
    Positive,
    Negative,
}

impl ProcedureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureType::Positive => "positive",
            ProcedureType::Negative => "negative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "positive" => ProcedureType::Positive,
            "negative" => ProcedureType::Negative,
            _ => return None,
        })
    }
}

/// The primary unit of memory.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub text: String,
    pub summary: Option<String>,
    pub entity: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub category: Category,
    pub importance: f64,
    pub recall_count: i64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub decay_class: DecayClass,
    /// Derived from `decay_class`; `None` means infinite (permanent).
    pub ttl_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    pub tier: Tier,
    pub scope: Scope,
    pub scope_target: Option<String>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub superseded_by: Option<String>,
    pub supersedes_id: Option<String>,
    pub source_date: Option<DateTime<Utc>>,
    pub normalized_hash: Option<String>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub reinforced_count: i64,
    pub last_reinforced_at: Option<DateTime<Utc>>,
    pub reinforced_quotes: Vec<String>,
}

impl Fact {
    /// Invariant 3: a fact with `supersededAt != null` never appears in
    /// default retrieval.
    pub fn is_superseded(&self) -> bool {
        self.superseded_at.is_some()
    }

    /// Invariant 3: point-in-time validity check for `asOf` queries.
    pub fn valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_until.map(|u| u > at).unwrap_or(true)
    }
}

/// Input to `FactStore::store`. Fields left `None` are computed by the
/// store (decay class, tags, hash).
///
/// Serializable so the engine's WAL-guarded commit path can log a
/// pending write before it reaches the fact store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreInput {
    pub text: String,
    pub summary: Option<String>,
    pub entity: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub category: Option<Category>,
    pub importance: Option<f64>,
    pub decay_class: Option<DecayClass>,
    pub scope: Option<Scope>,
    pub scope_target: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub source_date: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub tags: Option<Vec<String>>,
    pub supersedes_id: Option<String>,
    /// Overrides `store.fuzzyDedupe` for this call; `None` defers to the
    /// engine's configured default.
    pub fuzzy_dedupe: Option<bool>,
}

impl Default for Category {
    fn default() -> Self {
        Category::Other
    }
}

/// Typed edge between two facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub from_id: String,
    pub to_id: String,
    pub kind: LinkKind,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

/// `(factId, vector, category, importance)` row kept in lock-step with
/// the fact store.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub fact_id: String,
    pub vector: Vec<f32>,
    pub category: Category,
    pub importance: f64,
}

/// A result from vector search: the fact id and its cosine score.
#[derive(Debug, Clone)]
pub struct VectorSearchResult {
    pub fact_id: String,
    pub score: f32,
}

/// Learned tool-call pattern.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Procedure {
    pub id: String,
    pub task_pattern: String,
    pub recipe_json: String,
    pub proc_type: ProcedureType,
    pub success_count: i64,
    pub failure_count: i64,
    pub confidence: f64,
    pub last_validated: Option<DateTime<Utc>>,
    pub last_failed: Option<DateTime<Utc>>,
    pub promoted_to_skill: bool,
    pub skill_path: Option<String>,
    pub scope: Scope,
    pub scope_target: Option<String>,
}

/// `(id, timestamp, operation, data)` WAL row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: WalOperation,
    pub data: serde_json::Value,
}

/// Result of a fact-store search/lookup: the fact plus its rank score.
#[derive(Debug, Clone)]
pub struct RankedFact {
    pub fact: Fact,
    pub score: f32,
    /// Which backend(s) contributed this candidate ("fts", "ann", or "both").
    pub source: &'static str,
}

/// Options shared by `search`/`getById`/`lookup`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub tier_filter: Option<Vec<Tier>>,
    pub scope_filter: Option<(Scope, Option<String>)>,
    pub reinforcement_boost: bool,
    pub as_of: Option<DateTime<Utc>>,
    pub include_superseded: bool,
}
