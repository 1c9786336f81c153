//! Capture pipeline: turns a completed turn's messages into at most
//! `captureMaxPerTurn` fact candidates.

pub mod category;
pub mod extract;
pub mod filters;
pub mod lang;
pub mod tags;

use crate::model::StoreInput;

/// One candidate produced by the pipeline, ready for the classifier
/// or direct commit.
#[derive(Debug, Clone)]
pub struct CaptureCandidate {
    pub input: StoreInput,
}

/// Runs steps 1-6 of the pipeline over a single message, returning
/// `None` if any filter rejects it. Step 7 (hand off to the classifier)
/// and the WAL-guarded commit live in the engine, not here — this
/// function has no storage dependency.
pub fn capture_message(text: &str, max_chars: usize) -> Option<CaptureCandidate> {
    let shaped = filters::shape_filter(text, max_chars)?;
    if !filters::sensitivity_filter(&shaped) {
        tracing::debug!("capture rejected: sensitivity filter");
        return None;
    }
    if !filters::trigger_filter(&shaped) {
        return None;
    }

    let category = category::detect_category(&shaped);
    let fields = extract::extract_fields(&shaped);
    let inferred_tags = tags::infer_tags(&shaped, fields.entity.as_deref());

    Some(CaptureCandidate {
        input: StoreInput {
            text: shaped,
            category: Some(category),
            entity: fields.entity,
            key: fields.key,
            value: fields.value,
            tags: Some(inferred_tags),
            ..Default::default()
        },
    })
}

/// Runs capture over every message in a turn (user then assistant, in
/// that order), capping the result at `max_per_turn` (default 3).
pub fn capture_turn(messages: &[&str], max_chars: usize, max_per_turn: usize) -> Vec<CaptureCandidate> {
    let mut candidates = Vec::new();
    for message in messages {
        if candidates.len() >= max_per_turn {
            break;
        }
        if let Some(candidate) = capture_message(message, max_chars) {
            candidates.push(candidate);
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_message_round_trip() {
        let candidate = capture_message("I prefer dark mode in my editor", 2000).unwrap();
        assert_eq!(candidate.input.text, "I prefer dark mode in my editor");
    }

    #[test]
    fn capture_message_rejects_small_talk() {
        assert!(capture_message("lol nice", 2000).is_none());
    }

    #[test]
    fn capture_turn_respects_max_per_turn() {
        let messages = [
            "I prefer tabs over spaces",
            "We decided to use Postgres for storage",
            "Always run tests before pushing",
            "Never commit secrets to the repo",
        ];
        let candidates = capture_turn(&messages, 2000, 3);
        assert_eq!(candidates.len(), 3);
    }
}
