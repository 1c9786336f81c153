//! Runtime-facing contracts: what the host provides to the engine.
//! Modeled as async trait objects — the retriever and capture pipeline
//! depend only on these traits, never on a concrete provider.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ClassifyError, TransientError};

/// Chat-model tier selection is the caller's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTier {
    Nano,
    Default,
    Heavy,
}

/// A single chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub tier: ChatTier,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// Text → fixed-dimension vector. May fail; the caller may cache
/// results.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single piece of text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, TransientError>;

    /// Fixed output dimension. Must be stable across a deployment.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts; default implementation calls `embed`
    /// sequentially for providers with no native batch path.
    async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, TransientError>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await);
        }
        out
    }
}

/// Lets the engine hold a single `Arc<dyn Embedder>` and still wrap it
/// in `CachedEmbedder`, which is generic over `E: Embedder` rather than
/// over the trait object directly.
#[async_trait]
impl Embedder for Arc<dyn Embedder> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, TransientError> {
        self.as_ref().embed(text).await
    }

    fn dimensions(&self) -> usize {
        self.as_ref().dimensions()
    }
}

/// Prompt → text; tiered, retriable.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String, TransientError>;
}

/// Convenience helper for the HyDE call shape:
/// `chat.default("Write a short factual statement that answers: {prompt}")`.
pub async fn chat_default(
    chat: &dyn ChatModel,
    prompt: impl Into<String>,
    max_tokens: u32,
) -> Result<String, TransientError> {
    chat.complete(ChatRequest {
        tier: ChatTier::Default,
        prompt: prompt.into(),
        max_tokens,
        temperature: None,
    })
    .await
}

/// Bounded-retry helper shared by embedder/chat call sites, local to
/// the call site rather than a global queue.
pub async fn with_retries<T, F, Fut>(
    mut attempt: F,
    max_attempts: u32,
) -> Result<T, TransientError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TransientError>>,
{
    let mut backoff_ms: u64 = 100;
    let mut last_err = TransientError::Backend("no attempts made".to_string());
    for attempt_num in 0..max_attempts {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = e;
                if attempt_num + 1 < max_attempts {
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(5_000);
                }
            }
        }
    }
    Err(last_err)
}

/// Turn-level events the lifecycle coordinator hooks. The host
/// runtime fires these; `turn_start` may return a `prepend` blob that
/// is inserted verbatim before the agent's system prompt.
#[derive(Debug, Clone)]
pub struct TurnStartEvent {
    pub prompt: String,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// Raw tool-result text from the current turn, scanned for
    /// auth-failure signals.
    pub tool_results: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TurnStartResult {
    pub prepend: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TurnEndEvent {
    pub user_message: String,
    pub assistant_message: String,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionEndEvent {
    pub session_id: Option<String>,
}

/// Classifier decision payload parsed from an LLM response.
#[derive(Debug, Clone)]
pub struct ClassifierVerdict {
    pub decision: crate::model::ClassifierDecision,
    pub target_id: Option<String>,
    pub rationale: Option<String>,
}

/// Parses the classifier's chat completion. Tolerant of minor
/// formatting since the prompt asks for a compact decision line; falls
/// back to `ADD` (via the caller) on any parse failure.
pub fn parse_classifier_response(raw: &str) -> Result<ClassifierVerdict, ClassifyError> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let decision_str = value
            .get("decision")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClassifyError::Parse("missing decision field".to_string()))?;
        let decision = crate::model::ClassifierDecision::parse(decision_str)
            .ok_or_else(|| ClassifyError::Parse(format!("unknown decision {decision_str}")))?;
        let target_id = value
            .get("targetId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let rationale = value
            .get("rationale")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        return Ok(ClassifierVerdict {
            decision,
            target_id,
            rationale,
        });
    }

    // Fallback: first line is the verb, optional "targetId=..." follows.
    let mut lines = trimmed.lines();
    let first = lines
        .next()
        .ok_or_else(|| ClassifyError::Parse("empty response".to_string()))?;
    let verb = first.split_whitespace().next().unwrap_or("");
    let decision = crate::model::ClassifierDecision::parse(verb)
        .ok_or_else(|| ClassifyError::Parse(format!("unrecognized verb {verb}")))?;
    let target_id = trimmed
        .split("targetId=")
        .nth(1)
        .map(|rest| rest.split_whitespace().next().unwrap_or("").trim_matches(|c| c == '"' || c == ',').to_string())
        .filter(|s| !s.is_empty());

    Ok(ClassifierVerdict {
        decision,
        target_id,
        rationale: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_classifier_response() {
        let raw = r#"{"decision":"UPDATE","targetId":"f1","rationale":"newer info"}"#;
        let verdict = parse_classifier_response(raw).unwrap();
        assert_eq!(verdict.decision, crate::model::ClassifierDecision::Update);
        assert_eq!(verdict.target_id.as_deref(), Some("f1"));
    }

    #[test]
    fn parses_plain_text_fallback() {
        let raw = "ADD";
        let verdict = parse_classifier_response(raw).unwrap();
        assert_eq!(verdict.decision, crate::model::ClassifierDecision::Add);
        assert!(verdict.target_id.is_none());
    }

    #[test]
    fn rejects_unknown_decision() {
        assert!(parse_classifier_response("MAYBE").is_err());
    }
}
