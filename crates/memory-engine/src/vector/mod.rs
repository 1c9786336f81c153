//! Vector store: an embedding-addressed ANN table kept in lock-step
//! with the fact store. Modeled as an async trait (the fact store is
//! synchronous, the vector store is async) with a single production
//! implementation backed by a USearch HNSW index.
//!
//! Search/store/count/dedup paths never panic on backend failure: they
//! log and return empty/zero/false; only `store`/`delete`/`close`
//! surface errors to the caller.

mod usearch_store;

pub use usearch_store::{UsearchVectorStore, VectorStoreHandle};

use async_trait::async_trait;

use crate::error::VectorStoreError;
use crate::model::{VectorRecord, VectorSearchResult};

/// Async capability trait the retriever and classifier depend on,
/// never the concrete backend.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace by `factId`.
    async fn store(&self, record: VectorRecord) -> Result<(), VectorStoreError>;

    /// Cosine search; results with `score < min_score` are dropped.
    /// Dimension mismatch returns an empty result (a warning is logged)
    /// unless auto-repair is driven by the caller.
    async fn search(&self, vector: &[f32], limit: usize, min_score: f32) -> Vec<VectorSearchResult>;

    /// Approximate top-1 dedup check: true when cosine >= threshold.
    async fn has_duplicate(&self, vector: &[f32], dedup_threshold: f32) -> bool;

    async fn delete(&self, fact_id: &str) -> Result<(), VectorStoreError>;

    async fn count(&self) -> usize;

    /// Reference-counted close: deferred until refcount hits zero.
    async fn close(&self);

    fn dimensions(&self) -> usize;

    /// Drop and recreate the index at `new_dim`, clearing all vectors.
    /// Used by the engine's auto-repair path on dimension mismatch;
    /// re-embedding tracked facts is the caller's job.
    async fn recreate(&self, new_dim: usize) -> Result<(), VectorStoreError>;
}
