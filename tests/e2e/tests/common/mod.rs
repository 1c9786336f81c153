use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use memory_engine::{ChatModel, ChatRequest, Embedder, EngineConfig, TransientError};
use tempfile::TempDir;

/// A deterministic embedder: byte-sum-ish projection so distinct texts
/// land at distinct points, but near-duplicate phrasing stays close.
pub struct WordHashEmbedder {
    dim: usize,
}

impl WordHashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

#[async_trait]
impl Embedder for WordHashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, TransientError> {
        let mut v = vec![0.0f32; self.dim];
        for word in text.to_lowercase().split_whitespace() {
            let mut hash: u64 = 1469598103934665603;
            for b in word.bytes() {
                hash ^= b as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            v[(hash as usize) % self.dim] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dim
    }
}

/// A chat model that updates a fact by id when the prompt mentions it,
/// otherwise adds. Lets classification tests exercise `on_turn_end`
/// without a real LLM.
pub struct ScriptedClassifier {
    pub update_target: Option<String>,
    pub calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn new(update_target: Option<String>) -> Self {
        Self {
            update_target,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedClassifier {
    async fn complete(&self, request: ChatRequest) -> Result<String, TransientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(target) = &self.update_target {
            if request.prompt.contains(target.as_str()) {
                return Ok(format!(
                    "{{\"decision\":\"UPDATE\",\"targetId\":\"{target}\",\"rationale\":\"newer info\"}}"
                ));
            }
        }
        Ok("{\"decision\":\"ADD\",\"targetId\":null,\"rationale\":null}".to_string())
    }
}

/// Spins up an `Engine` rooted in a fresh temp dir with an 8-dimensional
/// embedder; returns the temp dir alongside so it outlives the engine.
pub async fn test_engine_with(
    configure: impl FnOnce(&mut EngineConfig),
    chat: Option<Arc<dyn ChatModel>>,
) -> (memory_engine::Engine, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.vector_dimensions = 16;
    config.wal.wal_path = PathBuf::from("e2e.wal.ndjson");
    configure(&mut config);
    let engine = memory_engine::Engine::new(config, Arc::new(WordHashEmbedder::new(16)), chat)
        .await
        .unwrap();
    (engine, dir)
}

pub async fn test_engine() -> (memory_engine::Engine, TempDir) {
    test_engine_with(|_| {}, None).await
}
