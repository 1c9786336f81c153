//! End-to-end scenarios, one per named case.

#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use memory_engine::{
    Category, DecayClass, LinkKind, QueryOptions, Scope, SessionEndEvent, StoreInput,
    TurnEndEvent, TurnStartEvent,
};

use common::{test_engine, test_engine_with, ScriptedClassifier};

/// Scenario 1: preference capture and recall.
#[tokio::test]
async fn preference_capture_and_recall() {
    let (engine, _dir) = test_engine().await;

    engine
        .on_turn_end(TurnEndEvent {
            user_message: "I prefer dark mode".to_string(),
            assistant_message: "Noted, I'll use dark mode going forward.".to_string(),
            agent_id: None,
            session_id: Some("session-1".to_string()),
            user_id: None,
        })
        .await
        .unwrap();

    assert!(engine.stats().await.unwrap().store.total_facts >= 1);
    let stored = engine
        .lookup(None, None, &QueryOptions::default())
        .unwrap()
        .into_iter()
        .find(|f| f.text.contains("dark mode"))
        .expect("captured preference fact");
    assert_eq!(stored.category, Category::Preference);
    assert_eq!(stored.decay_class, DecayClass::Stable);

    let result = engine
        .on_turn_start(TurnStartEvent {
            prompt: "what UI mode do I prefer?".to_string(),
            agent_id: None,
            session_id: Some("session-1".to_string()),
            user_id: None,
            tool_results: Vec::new(),
        })
        .await
        .unwrap();
    let prepend = result.prepend.expect("relevant memories should be injected");
    assert!(prepend.contains("dark mode"));

    let recalled = engine
        .lookup(None, None, &QueryOptions::default())
        .unwrap()
        .into_iter()
        .find(|f| f.id == stored.id)
        .unwrap();
    assert_eq!(recalled.recall_count, 1);
}

/// Scenario 2: update via classification.
#[tokio::test]
async fn update_via_classification() {
    // `f1`'s id has to be known before the scripted classifier can be
    // built, so store it through a plain engine first, then hand its
    // own fact-store database to a second engine wired with the
    // classifier that targets it.
    let (seed_engine, dir) = test_engine().await;
    let f1 = seed_engine
        .store(StoreInput {
            text: "User's primary database is MySQL".to_string(),
            category: Some(Category::Decision),
            decay_class: Some(DecayClass::Permanent),
            ..Default::default()
        })
        .await
        .unwrap();
    let before = f1.created_at;
    drop(seed_engine);

    let chat: Arc<dyn memory_engine::ChatModel> =
        Arc::new(ScriptedClassifier::new(Some(f1.id.clone())));
    let mut config = memory_engine::EngineConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.vector_dimensions = 16;
    config.wal.wal_path = std::path::PathBuf::from("e2e.wal.ndjson");
    config.store.classify_before_write = true;
    let engine = memory_engine::Engine::new(
        config,
        Arc::new(common::WordHashEmbedder::new(16)),
        Some(chat),
    )
    .await
    .unwrap();

    engine
        .on_turn_end(TurnEndEvent {
            user_message: "We decided to move off MySQL and use PostgreSQL as our database instead".to_string(),
            assistant_message: "Understood.".to_string(),
            agent_id: None,
            session_id: None,
            user_id: None,
        })
        .await
        .unwrap();

    let default_recall = engine.recall("what database", QueryOptions::default()).await.unwrap();
    assert!(!default_recall.iter().any(|f| f.id == f1.id));

    let historical = engine
        .recall(
            "what database",
            QueryOptions {
                as_of: Some(before),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(historical.iter().any(|f| f.id == f1.id));
}

/// Scenario 3: crash recovery — a WAL entry with no matching fact row
/// is replayed and committed on the next startup.
#[tokio::test]
async fn crash_recovery_replays_pending_wal_entry() {
    let (engine, dir) = test_engine().await;
    engine
        .store(StoreInput {
            text: "a fact already committed before the crash".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let prior_facts = engine.stats().await.unwrap().store.total_facts;
    drop(engine);

    // Simulate: WAL append succeeded, process was killed before the
    // fact-store write landed. Append directly to the same WAL file the
    // next engine instance will recover from.
    let wal_path = dir.path().join("e2e.wal.ndjson");
    let wal = memory_engine::wal::Wal::new(&wal_path);
    let pending = serde_json::to_value(&StoreInput {
        text: "a fact written to the WAL right before the crash".to_string(),
        ..Default::default()
    })
    .unwrap();
    wal.append(&memory_engine::wal::store_entry("crash-1", pending)).unwrap();

    let config = {
        let mut c = memory_engine::EngineConfig::default();
        c.data_dir = dir.path().to_path_buf();
        c.vector_dimensions = 16;
        c.wal.wal_path = std::path::PathBuf::from("e2e.wal.ndjson");
        c
    };
    let recovered_engine = memory_engine::Engine::new(
        config,
        Arc::new(common::WordHashEmbedder::new(16)),
        None,
    )
    .await
    .unwrap();

    let stats = recovered_engine.stats().await.unwrap();
    assert_eq!(stats.store.total_facts, prior_facts + 1);
    assert_eq!(stats.wal_pending, 0);
}

/// Scenario 4: tier eviction under a small hot-tier budget.
#[tokio::test]
async fn tier_eviction_keeps_hot_max_facts() {
    let (engine, _dir) = test_engine_with(
        |c| {
            c.memory_tiering.hot_max_facts = 3;
            c.memory_tiering.hot_max_tokens = 100_000;
        },
        None,
    )
    .await;

    for i in 0..4 {
        engine
            .store(StoreInput {
                text: format!("high importance fact number {i} about the project roadmap"),
                importance: Some(0.95),
                ..Default::default()
            })
            .await
            .unwrap();
        // Ensure distinct `lastAccessedAt` ordering for LRU eviction.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let counts = engine.prune(memory_engine::PruneMode::Tier).await;
    assert_eq!(counts.evicted_from_hot, 1);

    let all = engine.lookup(None, None, &QueryOptions::default()).unwrap();
    let hot_count = all.iter().filter(|f| f.tier == memory_engine::Tier::Hot).count();
    assert_eq!(hot_count, 3);
}

/// Scenario 5: graph recall expands to a directly-linked second hop
/// within `graphFloor`.
#[tokio::test]
async fn graph_recall_expands_related_facts() {
    let (engine, _dir) = test_engine_with(|c| c.graph_floor = 0.1, None).await;

    let a = engine
        .store(StoreInput { text: "the roadmap review is scheduled for next week".to_string(), ..Default::default() })
        .await
        .unwrap();
    let b = engine
        .store(StoreInput { text: "the roadmap review depends on the Q3 budget sign-off".to_string(), ..Default::default() })
        .await
        .unwrap();
    let c = engine
        .store(StoreInput { text: "the Q3 budget sign-off needs finance approval".to_string(), ..Default::default() })
        .await
        .unwrap();
    engine.link(&a.id, &b.id, LinkKind::RelatedTo, Some(0.9)).unwrap();
    engine.link(&b.id, &c.id, LinkKind::RelatedTo, Some(0.9)).unwrap();

    let results = engine.recall("roadmap review schedule", QueryOptions::default()).await.unwrap();
    let ids: Vec<&str> = results.iter().map(|f| f.id.as_str()).collect();
    assert!(ids.contains(&a.id.as_str()));
    assert!(ids.contains(&b.id.as_str()));
}

/// Scenario 6: auth-failure reactive recall surfaces a credential hint
/// without leaking the stored secret value.
#[tokio::test]
async fn auth_failure_reactive_recall() {
    let (engine, _dir) = test_engine().await;

    engine
        .store(StoreInput {
            text: "SSH credentials for the staging box are stored in the vault".to_string(),
            entity: Some("10.0.0.5".to_string()),
            key: Some("ssh_password".to_string()),
            value: Some("hunter2-super-secret".to_string()),
            category: Some(Category::Fact),
            scope: Some(Scope::Global),
            ..Default::default()
        })
        .await
        .unwrap();

    let result = engine
        .on_turn_start(TurnStartEvent {
            prompt: "why did the deploy fail?".to_string(),
            agent_id: None,
            session_id: Some("session-auth".to_string()),
            user_id: None,
            tool_results: vec![
                "ssh admin@10.0.0.5 -> Permission denied (publickey).".to_string(),
            ],
        })
        .await
        .unwrap();

    let prepend = result.prepend.expect("credential hint should be injected");
    assert!(prepend.contains("10.0.0.5"));
    assert!(prepend.contains("technical") || prepend.contains("fact"));
    assert!(!prepend.contains("hunter2-super-secret"));

    engine.on_session_end(SessionEndEvent { session_id: Some("session-auth".to_string()) });
}
