//! Engine configuration.
//!
//! A single `EngineConfig`, serde `Deserialize`/`Serialize` + `Default`,
//! loaded from a JSON file or built programmatically. No generic
//! config-loading crate; a handful of env vars are read directly at
//! startup instead.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Injection format for `<relevant-memories>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionFormat {
    Full,
    Short,
    Minimal,
    Progressive,
    ProgressiveHybrid,
}

impl Default for InjectionFormat {
    fn default() -> Self {
        InjectionFormat::Short
    }
}

/// `multiAgent.defaultStoreScope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultStoreScope {
    Global,
    Agent,
    Auto,
}

impl Default for DefaultStoreScope {
    fn default() -> Self {
        DefaultStoreScope::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityLookupConfig {
    pub enabled: bool,
    pub entities: Vec<String>,
    pub max_facts_per_entity: usize,
}

impl Default for EntityLookupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            entities: Vec::new(),
            max_facts_per_entity: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFailureConfig {
    pub enabled: bool,
    pub patterns: Vec<String>,
    pub max_recalls_per_target: usize,
    pub include_vault_hints: bool,
}

impl Default for AuthFailureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: Vec::new(),
            max_recalls_per_target: 1,
            include_vault_hints: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRecallConfig {
    pub enabled: bool,
    pub limit: usize,
    pub min_score: f32,
    pub max_tokens: usize,
    pub max_per_memory_chars: usize,
    pub injection_format: InjectionFormat,
    pub use_summary_in_injection: bool,
    pub summarize_when_over_budget: bool,
    pub prefer_long_term: bool,
    pub use_importance_recency: bool,
    pub entity_lookup: EntityLookupConfig,
    pub progressive_index_max_tokens: usize,
    pub progressive_max_candidates: usize,
    pub progressive_pinned_recall_count: i64,
    pub progressive_group_by_category: bool,
    pub auth_failure: AuthFailureConfig,
    pub scope_filter: Option<String>,
}

impl Default for AutoRecallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 10,
            min_score: 0.5,
            max_tokens: 1500,
            max_per_memory_chars: 240,
            injection_format: InjectionFormat::default(),
            use_summary_in_injection: true,
            summarize_when_over_budget: false,
            prefer_long_term: true,
            use_importance_recency: true,
            entity_lookup: EntityLookupConfig::default(),
            progressive_index_max_tokens: 400,
            progressive_max_candidates: 40,
            progressive_pinned_recall_count: 3,
            progressive_group_by_category: false,
            auth_failure: AuthFailureConfig::default(),
            scope_filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    pub classify_before_write: bool,
    pub fuzzy_dedupe: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            classify_before_write: false,
            fuzzy_dedupe: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphConfig {
    pub enabled: bool,
    pub auto_link: bool,
    pub auto_link_min_score: f32,
    pub auto_link_limit: usize,
    pub max_traversal_depth: u32,
    pub use_in_recall: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_link: true,
            auto_link_min_score: 0.75,
            auto_link_limit: 3,
            max_traversal_depth: 2,
            use_in_recall: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalConfig {
    pub enabled: bool,
    pub wal_path: PathBuf,
    pub max_age_secs: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wal_path: PathBuf::from("memory.wal.ndjson"),
            max_age_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTieringConfig {
    pub enabled: bool,
    pub hot_max_tokens: usize,
    pub hot_max_facts: usize,
    pub inactive_preference_days: i64,
    pub compaction_on_session_end: bool,
}

impl Default for MemoryTieringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_max_tokens: 2000,
            hot_max_facts: 50,
            inactive_preference_days: 30,
            compaction_on_session_end: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfig {
    pub hyde_enabled: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { hyde_enabled: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiAgentConfig {
    pub orchestrator_id: Option<String>,
    pub default_store_scope: DefaultStoreScope,
}

impl Default for MultiAgentConfig {
    fn default() -> Self {
        Self {
            orchestrator_id: None,
            default_store_scope: DefaultStoreScope::default(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub capture_max_chars: usize,
    pub capture_max_per_turn: usize,
    pub auto_recall: AutoRecallConfig,
    pub store: StoreConfig,
    pub graph: GraphConfig,
    pub wal: WalConfig,
    pub memory_tiering: MemoryTieringConfig,
    pub search: SearchConfig,
    pub multi_agent: MultiAgentConfig,
    /// Importance at/above which a newly stored fact is admitted to
    /// `hot` directly.
    pub hot_admission_importance: f64,
    /// Embedding dimension `D`; must match the configured `Embedder`.
    pub vector_dimensions: usize,
    /// Auto-repair the vector table on dimension mismatch by dropping,
    /// recreating at the new dimension, and re-embedding tracked facts.
    pub vector_auto_repair: bool,
    /// Embedding LRU cache size.
    pub embedding_cache_capacity: usize,
    /// Periodic prune interval, in seconds (default 60 min).
    pub prune_interval_secs: u64,
    /// Auto-classify scheduler interval, in seconds (default 24h).
    pub auto_classify_interval_secs: u64,
    /// Bound on Hebbian co-recall pair strengthening per injection.
    pub recall_hebbian_max: usize,
    /// Score floor below which graph-expanded facts are not merged
    /// into the candidate set.
    pub graph_floor: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            capture_max_chars: 2000,
            capture_max_per_turn: 3,
            auto_recall: AutoRecallConfig::default(),
            store: StoreConfig::default(),
            graph: GraphConfig::default(),
            wal: WalConfig::default(),
            memory_tiering: MemoryTieringConfig::default(),
            search: SearchConfig::default(),
            multi_agent: MultiAgentConfig::default(),
            hot_admission_importance: 0.7,
            vector_dimensions: 768,
            vector_auto_repair: true,
            embedding_cache_capacity: 500,
            prune_interval_secs: 3600,
            auto_classify_interval_secs: 86_400,
            recall_hebbian_max: 12,
            graph_floor: 0.15,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file on disk; falls back to defaults for any
    /// field omitted from the document.
    pub fn load_from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(crate::error::ConfigError::from_io)?;
        serde_json::from_str(&text).map_err(crate::error::ConfigError::from_serde)
    }

    /// Apply the handful of env-var overrides read directly at
    /// startup: data dir and WAL path.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("MEMORY_ENGINE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("MEMORY_ENGINE_WAL_PATH") {
            self.wal.wal_path = PathBuf::from(path);
        }
        self
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.vector_dimensions == 0 {
            return Err(crate::error::ConfigError::InvalidScopeTarget(
                "vector_dimensions must be non-zero".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "memory-engine", "memory-engine")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
