//! Error taxonomy for the memory engine.
//!
//! Each component gets its own error enum (mirroring the old `StorageError` /
//! `VectorSearchError` split); `EngineError` composes them for operations that
//! cross component boundaries (capture, classify, retrieve).

use thiserror::Error;

/// Config-time error: the engine refuses to load.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid scope target: {0}")]
    InvalidScopeTarget(String),
    #[error("invalid regex in {field}: {source}")]
    InvalidRegex {
        field: String,
        #[source]
        source: regex::Error,
    },
    #[error("missing embedder")]
    MissingEmbedder,
    #[error("missing data directory and could not determine a default: {0}")]
    NoDataDir(String),
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn from_io(e: std::io::Error) -> EngineError {
        EngineError::Config(ConfigError::Io(e))
    }

    pub fn from_serde(e: serde_json::Error) -> EngineError {
        EngineError::Config(ConfigError::Serde(e))
    }
}

/// WAL errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Fact store errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum FactStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("fact not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("initialization error: {0}")]
    Init(String),
}

/// Vector store errors. Search/count/dedup paths never surface these —
/// they log and return empty/zero/false; only store/delete/close propagate.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("index creation failed: {0}")]
    IndexCreation(String),
    #[error("failed to add vector: {0}")]
    IndexAdd(String),
    #[error("search failed: {0}")]
    IndexSearch(String),
    #[error("persistence failed: {0}")]
    IndexPersistence(String),
    #[error("dimension mismatch: expected {expected}, got {got}")]
    InvalidDimensions { expected: usize, got: usize },
}

/// Transient backend error from an `Embedder` or `ChatModel` call.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TransientError {
    #[error("backend timed out")]
    Timeout,
    #[error("backend rate-limited (429)")]
    RateLimited,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Classifier decision parse errors; callers always fall back to ADD on these.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("chat model error: {0}")]
    Chat(#[from] TransientError),
    #[error("could not parse classifier response: {0}")]
    Parse(String),
}

/// Capture-pipeline errors; always logged and swallowed by the caller.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Store(#[from] FactStoreError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
}

/// Top-level error composing every component's error.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    FactStore(#[from] FactStoreError),
    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
