//! # memory-engine
//!
//! A hybrid long-term memory engine for conversational agent runtimes.
//! Facts are captured from turn transcripts, stored durably behind a
//! write-ahead log, embedded and indexed for approximate nearest-neighbor
//! search, and retrieved by fusing full-text (FTS5/BM25) and semantic
//! (HNSW/cosine) search with reciprocal rank fusion.
//!
//! ## Components
//!
//! - **Fact store** ([`storage::SqliteFactStore`]): durable rows, FTS5
//!   index, and the fact-link graph table, all in one SQLite database.
//! - **Vector store** ([`vector::VectorStore`]): an async ANN index kept
//!   in lock-step with the fact store, backed by USearch (HNSW).
//! - **Write-ahead log** ([`wal::Wal`]): an append-only NDJSON log guarding
//!   the fact-store/vector-store commit path against crash-induced
//!   inconsistency.
//! - **Capture pipeline** ([`capture`]): turns raw turn transcripts into
//!   candidate [`model::StoreInput`]s, filtering by sensitivity, trigger
//!   phrase, and category.
//! - **Classifier** ([`classify`]): an optional LLM pass deciding whether a
//!   candidate fact is new, an update to an existing fact, a deletion, or
//!   a no-op.
//! - **Retriever** ([`retrieve`]): hybrid search, graph expansion, tiering,
//!   and the turn-start injection envelope.
//! - **Graph** ([`graph`]): typed fact-to-fact links with bounded traversal
//!   and Hebbian co-recall reinforcement.
//! - **Decay/tier manager** ([`decay`]): soft/hard pruning on TTL and
//!   token-budgeted hot/warm/cold tier compaction.
//! - **Lifecycle coordinator** ([`engine::Engine`]): the host-facing
//!   entry point wiring every component together and hooking turn/session
//!   boundaries.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use memory_engine::{Engine, EngineConfig, StoreInput};
//!
//! # async fn run(embedder: Arc<dyn memory_engine::Embedder>) -> memory_engine::Result<()> {
//! let engine = Engine::new(EngineConfig::default(), embedder, None).await?;
//!
//! engine.store(StoreInput {
//!     text: "The user prefers dark mode".to_string(),
//!     ..Default::default()
//! }).await?;
//!
//! let facts = engine.recall("what theme do I like", Default::default()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod capture;
pub mod classify;
pub mod config;
pub mod decay;
pub mod embedding_cache;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hyde;
pub mod model;
pub mod retrieve;
pub mod storage;
pub mod traits;
pub mod vector;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, GraphResult, PruneCounts, PruneMode, ReflectionReport};
pub use error::{
    CaptureError, ClassifyError, ConfigError, EngineError, FactStoreError, Result, TransientError,
    VectorStoreError, WalError,
};
pub use model::{
    Category, ClassifierDecision, DecayClass, Fact, Link, LinkKind, Procedure, ProcedureType,
    QueryOptions, RankedFact, Scope, StoreInput, Tier, VectorRecord, VectorSearchResult,
    WalOperation,
};
pub use traits::{
    ChatModel, ChatRequest, ChatTier, Embedder, SessionEndEvent, TurnEndEvent, TurnStartEvent,
    TurnStartResult,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
