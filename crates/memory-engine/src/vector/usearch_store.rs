//! USearch-backed HNSW vector store (cosine metric, incremental
//! add/remove, key↔id mapping, disk persistence), carrying a
//! `(factId, vector, category, importance)` vector record rather than
//! a bare `(key, vector)` pair.
//!
//! Reference-counted singleton: more than one hook path may hold the
//! store concurrently, so `close` only tears down the index once
//! every holder has released it, and `open` after a full close clears
//! the stale slot so a fresh index can be created rather than handing
//! back a half-torn-down one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::error::VectorStoreError;
use crate::model::{Category, VectorRecord, VectorSearchResult};

use super::VectorStore;

const DEFAULT_CONNECTIVITY: usize = 16;
const DEFAULT_EXPANSION_ADD: usize = 128;
const DEFAULT_EXPANSION_SEARCH: usize = 64;

struct Metadata {
    category: Category,
    importance: f64,
}

struct IndexState {
    index: Index,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    metadata: HashMap<String, Metadata>,
    next_id: u64,
}

fn build_index(dimensions: usize) -> Result<Index, VectorStoreError> {
    let options = IndexOptions {
        dimensions,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F32,
        connectivity: DEFAULT_CONNECTIVITY,
        expansion_add: DEFAULT_EXPANSION_ADD,
        expansion_search: DEFAULT_EXPANSION_SEARCH,
        multi: false,
    };
    Index::new(&options).map_err(|e| VectorStoreError::IndexCreation(e.to_string()))
}

impl IndexState {
    fn new(dimensions: usize) -> Result<Self, VectorStoreError> {
        Ok(Self {
            index: build_index(dimensions)?,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            metadata: HashMap::new(),
            next_id: 0,
        })
    }

    fn reserve_for_one_more(&self) -> Result<(), VectorStoreError> {
        let capacity = self.index.capacity();
        let size = self.index.size();
        if size >= capacity {
            let new_capacity = std::cmp::max(capacity * 2, 16);
            self.index
                .reserve(new_capacity)
                .map_err(|e| VectorStoreError::IndexCreation(e.to_string()))?;
        }
        Ok(())
    }
}

/// HNSW-backed implementation of `VectorStore`.
pub struct UsearchVectorStore {
    state: Mutex<IndexState>,
    dimensions: AtomicUsize,
    path: Option<PathBuf>,
}

impl UsearchVectorStore {
    pub fn open(dimensions: usize, path: Option<PathBuf>) -> Result<Self, VectorStoreError> {
        let state = match &path {
            Some(p) if p.exists() => Self::load_state(p, dimensions).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "vector store load failed, starting empty");
                IndexState::new(dimensions).expect("fresh index creation cannot fail")
            }),
            _ => IndexState::new(dimensions)?,
        };
        Ok(Self {
            state: Mutex::new(state),
            dimensions: AtomicUsize::new(dimensions),
            path,
        })
    }

    fn load_state(path: &Path, dimensions: usize) -> Result<IndexState, VectorStoreError> {
        let index = build_index(dimensions)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorStoreError::IndexPersistence("invalid path".to_string()))?;
        index
            .load(path_str)
            .map_err(|e| VectorStoreError::IndexPersistence(e.to_string()))?;

        let meta_path = path.with_extension("meta.json");
        let meta_str = std::fs::read_to_string(&meta_path)
            .map_err(|e| VectorStoreError::IndexPersistence(e.to_string()))?;
        let meta: serde_json::Value = serde_json::from_str(&meta_str)
            .map_err(|e| VectorStoreError::IndexPersistence(e.to_string()))?;

        let key_to_id: HashMap<String, u64> = serde_json::from_value(meta["key_to_id"].clone())
            .map_err(|e| VectorStoreError::IndexPersistence(e.to_string()))?;
        let next_id = meta["next_id"].as_u64().unwrap_or(0);
        let metadata: HashMap<String, (String, f64)> =
            serde_json::from_value(meta["metadata"].clone()).unwrap_or_default();

        let id_to_key: HashMap<u64, String> = key_to_id.iter().map(|(k, v)| (*v, k.clone())).collect();
        let metadata = metadata
            .into_iter()
            .map(|(id, (cat, imp))| (id, Metadata { category: Category::parse(&cat), importance: imp }))
            .collect();

        Ok(IndexState {
            index,
            key_to_id,
            id_to_key,
            metadata,
            next_id,
        })
    }

    fn persist(&self, state: &IndexState) -> Result<(), VectorStoreError> {
        let Some(path) = &self.path else { return Ok(()) };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| VectorStoreError::IndexPersistence(e.to_string()))?;
            }
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorStoreError::IndexPersistence("invalid path".to_string()))?;
        state
            .index
            .save(path_str)
            .map_err(|e| VectorStoreError::IndexPersistence(e.to_string()))?;

        let metadata: HashMap<&String, (&'static str, f64)> = state
            .metadata
            .iter()
            .map(|(id, m)| (id, (m.category.as_str(), m.importance)))
            .collect();
        let meta = serde_json::json!({
            "key_to_id": state.key_to_id,
            "next_id": state.next_id,
            "metadata": metadata,
        });
        std::fs::write(
            path.with_extension("meta.json"),
            serde_json::to_string(&meta).unwrap_or_default(),
        )
        .map_err(|e| VectorStoreError::IndexPersistence(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl VectorStore for UsearchVectorStore {
    async fn store(&self, record: VectorRecord) -> Result<(), VectorStoreError> {
        let dimensions = self.dimensions.load(Ordering::SeqCst);
        if record.vector.len() != dimensions {
            return Err(VectorStoreError::InvalidDimensions {
                expected: dimensions,
                got: record.vector.len(),
            });
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(&existing_id) = state.key_to_id.get(&record.fact_id) {
            let _ = state.index.remove(existing_id);
            state.reserve_for_one_more()?;
            state
                .index
                .add(existing_id, &record.vector)
                .map_err(|e| VectorStoreError::IndexAdd(e.to_string()))?;
        } else {
            state.reserve_for_one_more()?;
            let id = state.next_id;
            state.next_id += 1;
            state
                .index
                .add(id, &record.vector)
                .map_err(|e| VectorStoreError::IndexAdd(e.to_string()))?;
            state.key_to_id.insert(record.fact_id.clone(), id);
            state.id_to_key.insert(id, record.fact_id.clone());
        }
        state.metadata.insert(
            record.fact_id.clone(),
            Metadata { category: record.category, importance: record.importance },
        );

        if let Err(e) = self.persist(&state) {
            tracing::warn!(error = %e, "vector store persistence failed");
        }
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize, min_score: f32) -> Vec<VectorSearchResult> {
        let dimensions = self.dimensions.load(Ordering::SeqCst);
        if vector.len() != dimensions {
            tracing::warn!(
                expected = dimensions,
                got = vector.len(),
                "vector search dimension mismatch, returning empty"
            );
            return Vec::new();
        }
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.index.size() == 0 {
            return Vec::new();
        }
        let results = match state.index.search(vector, limit) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "vector search failed, returning empty");
                return Vec::new();
            }
        };

        results
            .keys
            .iter()
            .zip(results.distances.iter())
            .filter_map(|(key, distance)| {
                let fact_id = state.id_to_key.get(key)?;
                let score = 1.0 - distance;
                if score < min_score {
                    return None;
                }
                Some(VectorSearchResult { fact_id: fact_id.clone(), score })
            })
            .collect()
    }

    async fn has_duplicate(&self, vector: &[f32], dedup_threshold: f32) -> bool {
        let top = self.search(vector, 1, 0.0).await;
        top.first().map(|r| r.score >= dedup_threshold).unwrap_or(false)
    }

    async fn delete(&self, fact_id: &str) -> Result<(), VectorStoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = state.key_to_id.remove(fact_id) {
            state.id_to_key.remove(&id);
            state.metadata.remove(fact_id);
            state
                .index
                .remove(id)
                .map_err(|e| VectorStoreError::IndexAdd(e.to_string()))?;
            if let Err(e) = self.persist(&state) {
                tracing::warn!(error = %e, "vector store persistence failed after delete");
            }
        }
        Ok(())
    }

    async fn count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).index.size()
    }

    async fn close(&self) {
        // Index is flushed on every mutating call; nothing extra to do
        // for the owned instance. `VectorStoreHandle` governs the
        // refcounted lifetime across shared holders.
    }

    fn dimensions(&self) -> usize {
        self.dimensions.load(Ordering::SeqCst)
    }

    async fn recreate(&self, new_dim: usize) -> Result<(), VectorStoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = IndexState::new(new_dim)?;
        self.dimensions.store(new_dim, Ordering::SeqCst);
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(path.with_extension("meta.json"));
        }
        Ok(())
    }
}

struct Singleton {
    store: std::sync::Arc<UsearchVectorStore>,
    refcount: AtomicUsize,
}

static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Singleton>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<PathBuf, Singleton>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Reference-counted handle onto a per-path `UsearchVectorStore`
/// singleton. `open` clears any stale slot left by a prior `close` so
/// reconnects after close work.
pub struct VectorStoreHandle {
    path: PathBuf,
    store: std::sync::Arc<UsearchVectorStore>,
}

impl VectorStoreHandle {
    pub fn open(path: PathBuf, dimensions: usize) -> Result<Self, VectorStoreError> {
        let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = reg.get(&path) {
            existing.refcount.fetch_add(1, Ordering::SeqCst);
            return Ok(Self { path, store: existing.store.clone() });
        }
        let store = std::sync::Arc::new(UsearchVectorStore::open(dimensions, Some(path.clone()))?);
        reg.insert(
            path.clone(),
            Singleton { store: store.clone(), refcount: AtomicUsize::new(1) },
        );
        Ok(Self { path, store })
    }

    pub fn store(&self) -> std::sync::Arc<UsearchVectorStore> {
        self.store.clone()
    }
}

impl Clone for VectorStoreHandle {
    fn clone(&self) -> Self {
        let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = reg.get(&self.path) {
            existing.refcount.fetch_add(1, Ordering::SeqCst);
        }
        Self { path: self.path.clone(), store: self.store.clone() }
    }
}

impl Drop for VectorStoreHandle {
    fn drop(&mut self) {
        let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = reg.get(&self.path) {
            if existing.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
                reg.remove(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_of(seed: f32, dim: usize) -> Vec<f32> {
        (0..dim).map(|i| ((i as f32 + seed) / dim as f32).sin()).collect()
    }

    #[tokio::test]
    async fn store_then_search_round_trips() {
        let store = UsearchVectorStore::open(16, None).unwrap();
        store
            .store(VectorRecord { fact_id: "a".into(), vector: vec_of(1.0, 16), category: Category::Fact, importance: 0.5 })
            .await
            .unwrap();
        let results = store.search(&vec_of(1.0, 16), 5, 0.0).await;
        assert_eq!(results[0].fact_id, "a");
    }

    #[tokio::test]
    async fn dimension_mismatch_returns_empty() {
        let store = UsearchVectorStore::open(16, None).unwrap();
        let results = store.search(&vec![0.0; 4], 5, 0.0).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn min_score_floor_drops_weak_matches() {
        let store = UsearchVectorStore::open(8, None).unwrap();
        store
            .store(VectorRecord { fact_id: "a".into(), vector: vec_of(1.0, 8), category: Category::Fact, importance: 0.5 })
            .await
            .unwrap();
        let results = store.search(&vec_of(1.0, 8), 5, 1.1).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_from_search() {
        let store = UsearchVectorStore::open(8, None).unwrap();
        store
            .store(VectorRecord { fact_id: "a".into(), vector: vec_of(1.0, 8), category: Category::Fact, importance: 0.5 })
            .await
            .unwrap();
        store.delete("a").await.unwrap();
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn recreate_clears_all_vectors_at_new_dimension() {
        let store = UsearchVectorStore::open(8, None).unwrap();
        store
            .store(VectorRecord { fact_id: "a".into(), vector: vec_of(1.0, 8), category: Category::Fact, importance: 0.5 })
            .await
            .unwrap();
        store.recreate(16).await.unwrap();
        assert_eq!(store.count().await, 0);
        assert_eq!(store.dimensions(), 16);
        store
            .store(VectorRecord { fact_id: "b".into(), vector: vec_of(1.0, 16), category: Category::Fact, importance: 0.5 })
            .await
            .unwrap();
        assert_eq!(store.count().await, 1);
    }

    #[test]
    fn handle_refcount_shares_and_tears_down_on_last_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vec.usearch");
        let a = VectorStoreHandle::open(path.clone(), 8).unwrap();
        let b = a.clone();
        assert!(std::sync::Arc::ptr_eq(&a.store(), &b.store()));
        drop(a);
        drop(b);
        let c = VectorStoreHandle::open(path, 8).unwrap();
        assert_eq!(c.store().dimensions(), 8);
    }
}
