//! Embedding cache: an in-memory LRU on text → vector, default 500
//! entries, owned by the lifecycle coordinator and shared across every
//! call site that embeds query or capture text.
//!
//! Wraps any `Embedder` rather than replacing it, so the retriever and
//! classifier keep depending on the trait alone.

use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;

use crate::error::TransientError;
use crate::traits::Embedder;

/// Decorates an `Embedder` with an LRU cache keyed on the exact input
/// text. A cache hit never calls the inner embedder.
pub struct CachedEmbedder<E: Embedder> {
    inner: E,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity).unwrap_or(std::num::NonZeroUsize::new(1).unwrap());
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of entries currently cached; exposed for `stats()`.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, TransientError> {
        if let Some(hit) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(text) {
            return Ok(hit.clone());
        }
        let vector = self.inner.embed(text).await?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        dim: usize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, TransientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32; self.dim])
        }

        fn dimensions(&self) -> usize {
            self.dim
        }
    }

    #[tokio::test]
    async fn repeated_text_hits_cache_not_inner() {
        let inner = CountingEmbedder { calls: AtomicUsize::new(0), dim: 4 };
        let cached = CachedEmbedder::new(inner, 10);

        cached.embed("hello").await.unwrap();
        cached.embed("hello").await.unwrap();
        cached.embed("world").await.unwrap();

        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.len(), 2);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let inner = CountingEmbedder { calls: AtomicUsize::new(0), dim: 4 };
        let cached = CachedEmbedder::new(inner, 1);

        cached.embed("a").await.unwrap();
        cached.embed("b").await.unwrap();
        // "a" was evicted, so embedding it again calls the inner embedder.
        cached.embed("a").await.unwrap();

        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 3);
    }
}
