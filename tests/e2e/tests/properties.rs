//! Invariant, round-trip, and boundary-behavior properties exercised
//! through the full `Engine` (WAL → fact store → vector store),
//! complementing the per-component `#[cfg(test)]` unit tests and the
//! named scenarios in `scenarios.rs`.

#[path = "common/mod.rs"]
mod common;

use memory_engine::{LinkKind, QueryOptions, Scope, StoreInput};

use common::test_engine;

/// `f.scope = global ⇔ f.scopeTarget = null`, round-tripped through the
/// full commit path.
#[tokio::test]
async fn scope_global_iff_no_scope_target() {
    let (engine, _dir) = test_engine().await;

    let global = engine
        .store(StoreInput {
            text: "a globally-scoped fact about the public roadmap".to_string(),
            scope: Some(Scope::Global),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(global.scope, Scope::Global);
    assert!(global.scope_target.is_none());

    let scoped = engine
        .store(StoreInput {
            text: "a user-scoped fact about favorite editor settings".to_string(),
            scope: Some(Scope::User),
            scope_target: Some("user-42".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(scoped.scope, Scope::User);
    assert_eq!(scoped.scope_target.as_deref(), Some("user-42"));
}

/// A non-global scope without a target is a config/invariant error the
/// engine refuses at the boundary rather than silently defaulting.
#[tokio::test]
async fn scope_without_target_is_rejected() {
    let (engine, _dir) = test_engine().await;

    let result = engine
        .store(StoreInput {
            text: "a fact claiming user scope with no target given".to_string(),
            scope: Some(Scope::User),
            scope_target: None,
            ..Default::default()
        })
        .await;
    assert!(result.is_err());
}

/// A global-scoped fact with a scope target set is rejected the same way.
#[tokio::test]
async fn global_scope_with_target_is_rejected() {
    let (engine, _dir) = test_engine().await;

    let result = engine
        .store(StoreInput {
            text: "a fact claiming global scope but also naming a target".to_string(),
            scope: Some(Scope::Global),
            scope_target: Some("should-not-be-here".to_string()),
            ..Default::default()
        })
        .await;
    assert!(result.is_err());
}

/// `store(x); store(x)` returns the first call's id both times (exact
/// dedup) and does not grow the store.
#[tokio::test]
async fn exact_dedup_is_idempotent() {
    let (engine, _dir) = test_engine().await;

    let first = engine
        .store(StoreInput {
            text: "the deployment pipeline runs on every push to main".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let before = engine.stats().await.unwrap().store.total_facts;

    let second = engine
        .store(StoreInput {
            text: "the deployment pipeline runs on every push to main".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(engine.stats().await.unwrap().store.total_facts, before);
}

/// Fuzzy dedup (on by default): two facts whose normalized text matches
/// (case/whitespace differences only) within the same scope collapse to
/// one row.
#[tokio::test]
async fn fuzzy_dedup_collapses_normalized_duplicates() {
    let (engine, _dir) = test_engine().await;

    let first = engine
        .store(StoreInput {
            text: "The roadmap review happens every Friday".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let second = engine
        .store(StoreInput {
            text: "the   roadmap review happens every friday  ".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
}

/// `recover()` on a WAL whose entries are already committed must leave
/// fact-store state unchanged (replaying an already-applied store is a
/// dedup no-op, not a duplicate row).
#[tokio::test]
async fn recover_on_already_committed_wal_is_a_no_op() {
    let (engine, dir) = test_engine().await;

    let fact = engine
        .store(StoreInput {
            text: "the backup job runs nightly at 2am UTC".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let before = engine.stats().await.unwrap().store.total_facts;

    // Append a WAL entry describing a store that has ALREADY landed
    // (same text, so dedup makes the replay a no-op).
    let wal_path = dir.path().join("e2e.wal.ndjson");
    let wal = memory_engine::wal::Wal::new(&wal_path);
    let pending = serde_json::to_value(&StoreInput {
        text: fact.text.clone(),
        ..Default::default()
    })
    .unwrap();
    wal.append(&memory_engine::wal::store_entry("already-committed-1", pending)).unwrap();

    let entries = wal.recover(chrono::Duration::minutes(5)).unwrap();
    assert_eq!(entries.len(), 1);
    for entry in &entries {
        let input: StoreInput = serde_json::from_value(entry.data.clone()).unwrap();
        engine.store(input).await.unwrap();
        wal.remove(&entry.id).unwrap();
    }

    assert_eq!(engine.stats().await.unwrap().store.total_facts, before);
    assert!(wal.valid_entries(chrono::Duration::minutes(5)).unwrap().is_empty());
}

/// Tag inference is a pure, stable function: `inferTags(t) = inferTags(t)`.
#[test]
fn tag_inference_is_stable() {
    let text = "I need to fix the flaky login test before Friday's release";
    let first = memory_engine::capture::tags::infer_tags(text, None);
    let second = memory_engine::capture::tags::infer_tags(text, None);
    assert_eq!(first, second);
}

/// FTS query safety: operator tokens are stripped so a query containing
/// raw FTS5 syntax still returns a valid (possibly empty) ordered list
/// through the full recall path rather than a syntax error.
#[tokio::test]
async fn recall_with_fts_operator_tokens_does_not_error() {
    let (engine, _dir) = test_engine().await;

    engine
        .store(StoreInput {
            text: "the team decided NOT to migrate the cache layer this quarter".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let result = engine.recall("\"NOT\" OR (cache", QueryOptions::default()).await;
    assert!(result.is_ok());
}

/// A link is never stored with `strength = 0` or with equal endpoints:
/// the call succeeds (the engine's `link` op doesn't itself reject the
/// request) but no edge is persisted, so the graph traversal never
/// surfaces it.
#[tokio::test]
async fn link_rejects_zero_strength_and_self_loops() {
    let (engine, _dir) = test_engine().await;

    let a = engine
        .store(StoreInput { text: "fact A about the release checklist".to_string(), ..Default::default() })
        .await
        .unwrap();
    let b = engine
        .store(StoreInput { text: "fact B about the release checklist sign-off".to_string(), ..Default::default() })
        .await
        .unwrap();

    engine.link(&a.id, &a.id, LinkKind::RelatedTo, Some(0.5)).unwrap();
    engine.link(&a.id, &b.id, LinkKind::RelatedTo, Some(0.0)).unwrap();

    let graph = engine.graph(&a.id, Some(2)).unwrap();
    assert!(graph.links.is_empty());
    assert!(!graph.facts.iter().any(|f| f.id == b.id));
}

/// A genuine `RELATED_TO` link with positive strength between distinct
/// facts is persisted and shows up in `graph()`.
#[tokio::test]
async fn link_with_positive_strength_is_persisted() {
    let (engine, _dir) = test_engine().await;

    let a = engine
        .store(StoreInput { text: "fact A about the onboarding checklist".to_string(), ..Default::default() })
        .await
        .unwrap();
    let b = engine
        .store(StoreInput { text: "fact B about the onboarding sign-off step".to_string(), ..Default::default() })
        .await
        .unwrap();

    engine.link(&a.id, &b.id, LinkKind::RelatedTo, Some(0.8)).unwrap();

    let graph = engine.graph(&a.id, Some(1)).unwrap();
    assert!(graph.links.iter().any(|l| l.from_id == a.id && l.to_id == b.id));
    assert!(graph.facts.iter().any(|f| f.id == b.id));
}

/// `forget` hard-deletes the fact; a second `forget` on the same id is a
/// no-op that reports nothing existed, never an error.
#[tokio::test]
async fn forget_is_idempotent() {
    let (engine, _dir) = test_engine().await;

    let fact = engine
        .store(StoreInput { text: "a fact the caller is about to explicitly forget".to_string(), ..Default::default() })
        .await
        .unwrap();

    assert!(engine.forget(&fact.id).await.unwrap());
    assert!(!engine.forget(&fact.id).await.unwrap());
}
