//! HyDE query expansion: embed an LLM-generated hypothetical answer
//! instead of the raw prompt, on the theory that an answer sits
//! closer in embedding space to the facts that would confirm it than
//! the question does.
//!
//! The chat-tier call (`chat.default(...)`) is the primary path. When
//! no `ChatModel` is configured, or the call fails, this falls back to
//! a zero-latency template-expansion centroid: embed a small set of
//! fixed paraphrase templates around the prompt and average the
//! resulting vectors, rather than embedding the bare prompt a second
//! time.

use crate::error::TransientError;
use crate::traits::{chat_default, ChatModel, Embedder};

const HYDE_MAX_TOKENS: u32 = 120;
/// Guards against a runaway completion; HyDE answers are meant to be short.
const HYDE_MAX_CHARS: usize = 600;

const FALLBACK_TEMPLATES: &[&str] = &[
    "A fact about {q}.",
    "Information regarding {q}.",
    "Details describing {q}.",
];

/// Builds the hypothetical-document text via the chat tier. Returns
/// `None` on any failure so the caller can fall back to the template
/// centroid or the raw prompt.
pub async fn hyde_chat_text(chat: &dyn ChatModel, prompt: &str) -> Option<String> {
    let wrapped = format!("Write a short factual statement that answers: {prompt}");
    match chat_default(chat, wrapped, HYDE_MAX_TOKENS).await {
        Ok(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.chars().take(HYDE_MAX_CHARS).collect())
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "HyDE chat expansion failed");
            None
        }
    }
}

/// Embeds the centroid of a handful of fixed paraphrase templates
/// around `prompt`. Used when no chat model is configured, or the chat
/// path failed, so recall degrades gracefully rather than blocking on
/// an unavailable tier.
pub async fn hyde_template_centroid(
    embedder: &dyn Embedder,
    prompt: &str,
) -> Result<Vec<f32>, TransientError> {
    let dim = embedder.dimensions();
    let mut centroid = vec![0.0f32; dim];
    let mut count = 0usize;

    for template in FALLBACK_TEMPLATES {
        let text = template.replace("{q}", prompt);
        let vector = embedder.embed(&text).await?;
        for (c, v) in centroid.iter_mut().zip(vector.iter()) {
            *c += v;
        }
        count += 1;
    }

    if count > 0 {
        for c in centroid.iter_mut() {
            *c /= count as f32;
        }
    }
    Ok(centroid)
}

/// Full HyDE pipeline for the retriever's ANN leg: chat-tier expansion
/// first, template centroid on failure or absence, the raw prompt
/// embedded directly if even that centroid call fails.
pub async fn hyde_embedding(
    embedder: &dyn Embedder,
    chat: Option<&dyn ChatModel>,
    prompt: &str,
) -> Result<Vec<f32>, TransientError> {
    if let Some(chat) = chat {
        if let Some(text) = hyde_chat_text(chat, prompt).await {
            return embedder.embed(&text).await;
        }
    }
    match hyde_template_centroid(embedder, prompt).await {
        Ok(vector) => Ok(vector),
        Err(e) => {
            tracing::warn!(error = %e, "HyDE template centroid failed, embedding raw prompt");
            embedder.embed(prompt).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedEmbedder { dim: usize }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, TransientError> {
            Ok(vec![text.len() as f32; self.dim])
        }

        fn dimensions(&self) -> usize {
            self.dim
        }
    }

    #[tokio::test]
    async fn template_centroid_averages_three_templates() {
        let embedder = FixedEmbedder { dim: 2 };
        let centroid = hyde_template_centroid(&embedder, "dark mode").await.unwrap();
        let expected: f32 = FALLBACK_TEMPLATES
            .iter()
            .map(|t| t.replace("{q}", "dark mode").len() as f32)
            .sum::<f32>()
            / FALLBACK_TEMPLATES.len() as f32;
        assert!((centroid[0] - expected).abs() < 1e-3);
    }

    #[tokio::test]
    async fn full_pipeline_falls_back_without_chat() {
        let embedder = FixedEmbedder { dim: 4 };
        let vector = hyde_embedding(&embedder, None, "what theme do I like").await.unwrap();
        assert_eq!(vector.len(), 4);
    }
}
