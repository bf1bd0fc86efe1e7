// Integration tests for encounters: message counting, spawning and catching
// against the SQLite store.

use std::sync::Arc;
use std::time::Duration;

use pokecatch_backend::config::Config;
use pokecatch_backend::creature_data::StaticCreatureData;
use pokecatch_backend::db::memory::InMemoryStore;
use pokecatch_backend::db::Database;
use pokecatch_backend::engine::notify::Notification;
use pokecatch_backend::engine::{Engine, MessageOutcome, PersistenceStore};

async fn test_db() -> Arc<Database> {
    Arc::new(Database::new("sqlite::memory:").await.unwrap())
}

fn config_with_threshold(threshold: u32) -> Config {
    Config {
        default_drop_threshold: threshold,
        retry_base_delay: Duration::ZERO,
        ..Config::default()
    }
}

#[tokio::test]
async fn test_threshold_three_scenario() {
    let db = test_db().await;
    let engine = Engine::new(
        &config_with_threshold(3),
        db.clone(),
        Arc::new(StaticCreatureData::with_defaults()),
    );
    let mut notifications = engine.notifier().subscribe();
    let chat = -1001;

    assert_eq!(
        engine.handle_message(chat, 1, Some("ash"), "hi").await.unwrap(),
        MessageOutcome::Counted
    );
    assert_eq!(
        engine.handle_message(chat, 2, Some("misty"), "hello").await.unwrap(),
        MessageOutcome::Counted
    );
    let encounter = match engine.handle_message(chat, 1, Some("ash"), "anyone?").await.unwrap() {
        MessageOutcome::Spawned(encounter) => encounter,
        other => panic!("third message should spawn, got {other:?}"),
    };
    assert_eq!(
        notifications.recv().await.unwrap(),
        Notification::EncounterSpawned {
            chat_id: chat,
            name: encounter.name.clone(),
            image_ref: encounter.image_ref.clone(),
        }
    );

    // Fourth message names the creature: Misty catches it.
    let caught = engine
        .handle_message(chat, 2, Some("misty"), &encounter.name.to_uppercase())
        .await
        .unwrap();
    assert_eq!(caught, MessageOutcome::Caught(encounter.clone()));
    assert!(engine.spawns().active_encounter(chat).is_none());
    assert_eq!(db.get_collection(2).await.unwrap(), vec![encounter.name.clone()]);

    // The same text again finds nothing to catch.
    let again = engine
        .handle_message(chat, 1, Some("ash"), &encounter.name)
        .await
        .unwrap();
    assert_eq!(again, MessageOutcome::Counted);
    assert!(db.get_collection(1).await.unwrap().is_empty());
    assert_eq!(db.get_collection(2).await.unwrap().len(), 1);

    let profile = db.get_profile(2).await.unwrap().unwrap();
    assert_eq!(profile.username.as_deref(), Some("misty"));
    assert_eq!(profile.creature_count, 1);
}

#[tokio::test]
async fn test_chat_threshold_setting_is_used() {
    let db = test_db().await;
    db.set_drop_threshold(55, 1).await.unwrap();
    let engine = Engine::new(
        &config_with_threshold(50),
        db.clone(),
        Arc::new(StaticCreatureData::with_defaults()),
    );

    assert!(matches!(
        engine.handle_message(55, 1, None, "x").await.unwrap(),
        MessageOutcome::Spawned(_)
    ));
    // Other chats still use the default.
    assert_eq!(
        engine.handle_message(56, 1, None, "x").await.unwrap(),
        MessageOutcome::Counted
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_catches_credit_exactly_once() {
    let db = test_db().await;
    let engine = Engine::new(
        &config_with_threshold(1),
        db.clone(),
        Arc::new(StaticCreatureData::with_defaults()),
    );
    let chat = 7;

    let encounter = match engine.handle_message(chat, 100, None, "go").await.unwrap() {
        MessageOutcome::Spawned(encounter) => encounter,
        other => panic!("expected a spawn, got {other:?}"),
    };
    // Keep the losers' messages from spawning a replacement.
    db.set_drop_threshold(chat, 1_000).await.unwrap();

    let mut handles = Vec::new();
    for user_id in 1..=16 {
        let engine = engine.clone();
        let name = encounter.name.clone();
        handles.push(tokio::spawn(async move {
            engine.handle_message(chat, user_id, None, &name).await
        }));
    }

    let mut winners = Vec::new();
    for (i, handle) in handles.into_iter().enumerate() {
        if let MessageOutcome::Caught(_) = handle.await.unwrap().unwrap() {
            winners.push(i as i64 + 1);
        }
    }
    assert_eq!(winners.len(), 1, "exactly one claim wins");

    let mut credited = 0;
    for user_id in 1..=16 {
        credited += db.get_collection(user_id).await.unwrap().len();
    }
    assert_eq!(credited, 1);
    assert_eq!(db.get_collection(winners[0]).await.unwrap(), vec![encounter.name]);
}

#[tokio::test]
async fn test_failed_spawn_retries_on_next_message() {
    let db = test_db().await;
    let creatures = Arc::new(StaticCreatureData::with_defaults());
    let engine = Engine::new(&config_with_threshold(3), db, creatures.clone());

    engine.handle_message(1, 1, None, "a").await.unwrap();
    engine.handle_message(1, 1, None, "b").await.unwrap();
    creatures.set_unavailable(true);
    let err = engine.handle_message(1, 1, None, "c").await.unwrap_err();
    assert!(err.is_transient());
    assert!(engine.spawns().active_encounter(1).is_none());
    assert_eq!(engine.spawns().message_count(1), 2);

    creatures.set_unavailable(false);
    assert!(matches!(
        engine.handle_message(1, 1, None, "d").await.unwrap(),
        MessageOutcome::Spawned(_)
    ));
    assert_eq!(engine.spawns().message_count(1), 0);
}

#[tokio::test]
async fn test_failed_credit_keeps_encounter_catchable() {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::new(
        &config_with_threshold(1),
        store.clone(),
        Arc::new(StaticCreatureData::with_defaults()),
    );

    let encounter = match engine.handle_message(3, 1, None, "go").await.unwrap() {
        MessageOutcome::Spawned(encounter) => encounter,
        other => panic!("expected a spawn, got {other:?}"),
    };

    store.set_unavailable(true);
    let err = engine
        .handle_message(3, 2, None, &encounter.name)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(engine.spawns().active_encounter(3), Some(encounter.clone()));

    store.set_unavailable(false);
    assert_eq!(
        engine.handle_message(3, 2, None, &encounter.name).await.unwrap(),
        MessageOutcome::Caught(encounter.clone())
    );
    assert_eq!(store.get_collection(2).await.unwrap(), vec![encounter.name]);
}
