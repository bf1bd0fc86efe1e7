// Integration tests for duels: full battles with payouts, and challenge expiry.

use std::sync::Arc;
use std::time::Duration;

use pokecatch_backend::config::Config;
use pokecatch_backend::creature_data::StaticCreatureData;
use pokecatch_backend::db::memory::InMemoryStore;
use pokecatch_backend::db::Database;
use pokecatch_backend::engine::battle::{ParticipantState, RoundResult, StatChoice};
use pokecatch_backend::engine::notify::Notification;
use pokecatch_backend::engine::{CreatureStats, Engine, PersistenceStore, UserId};
use pokecatch_backend::error::EngineError;
use tokio::sync::broadcast::error::TryRecvError;

const ASH: UserId = 1;
const GARY: UserId = 2;

fn test_config() -> Config {
    Config {
        challenge_timeout: Duration::from_secs(60),
        retry_base_delay: Duration::ZERO,
        ..Config::default()
    }
}

/// Ash's creatures are huge on hp and useless on attack; Gary's are even
/// across the board. The stat Ash picks decides every round.
fn roster() -> Vec<CreatureStats> {
    let mut roster = Vec::new();
    for i in 1..=5 {
        roster.push(CreatureStats::new(&format!("tank{i}"), [100, 0, 0, 0, 0, 0]));
        roster.push(CreatureStats::new(&format!("rival{i}"), [50, 50, 50, 50, 50, 50]));
    }
    roster
}

async fn seeded(store: &dyn PersistenceStore) {
    for i in 1..=5 {
        store.add_creature(ASH, &format!("tank{i}")).await.unwrap();
        store.add_creature(GARY, &format!("rival{i}")).await.unwrap();
    }
}

/// Play a whole battle where Ash picks `ash_stats[round]` and Gary always picks hp.
async fn play(engine: &Engine, ash_stats: [&str; 5]) -> Vec<StatChoice> {
    let mut results = Vec::new();
    for stat in ash_stats {
        assert_eq!(
            engine.battles().choose_stat(ASH, stat).await.unwrap(),
            StatChoice::Waiting
        );
        results.push(engine.battles().choose_stat(GARY, "hp").await.unwrap());
    }
    results
}

#[tokio::test]
async fn test_five_round_battle_three_two() {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    seeded(db.as_ref()).await;
    let engine = Engine::new(
        &test_config(),
        db.clone(),
        Arc::new(StaticCreatureData::new(roster())),
    );
    let mut notifications = engine.notifier().subscribe();

    engine.battles().create_challenge(ASH, GARY).await.unwrap();
    let start = engine.battles().accept_challenge(ASH, GARY).await.unwrap();
    assert_eq!(start.challenger_team.len(), 5);
    assert_eq!(start.opponent_team.len(), 5);
    assert_eq!(engine.battles().participant_state(ASH), ParticipantState::Active);

    let results = play(&engine, ["hp", "hp", "attack", "hp", "attack"]).await;
    assert_eq!(results.len(), 5);
    for r in &results[..4] {
        assert!(matches!(r, StatChoice::RoundResolved(_)));
    }
    let summary = match &results[4] {
        StatChoice::BattleFinished(summary) => summary.clone(),
        other => panic!("fifth round should end the battle, got {other:?}"),
    };

    assert_eq!(summary.rounds.len(), 5);
    assert_eq!(summary.challenger.score, 3);
    assert_eq!(summary.opponent.score, 2);
    assert_eq!(summary.winner, Some(ASH));
    assert_eq!((summary.challenger.reward, summary.opponent.reward), (30, 20));
    assert!(summary.paid);
    assert_eq!(
        summary.rounds[2].result,
        RoundResult::Winner { user_id: GARY }
    );
    // Each side is valued on its own chosen stat.
    assert_eq!(summary.rounds[2].challenger.value, 0);
    assert_eq!(summary.rounds[2].opponent.value, 50);

    assert_eq!(db.get_currency(ASH).await.unwrap(), 30);
    assert_eq!(db.get_currency(GARY).await.unwrap(), 20);
    assert_eq!(db.get_profile(ASH).await.unwrap().unwrap().battle_wins, 1);
    assert_eq!(db.get_profile(GARY).await.unwrap().unwrap().battle_wins, 0);

    assert_eq!(engine.battles().participant_state(ASH), ParticipantState::Idle);
    assert_eq!(engine.battles().participant_state(GARY), ParticipantState::Idle);
    assert!(matches!(
        engine.battles().choose_stat(ASH, "hp").await,
        Err(EngineError::NoActiveSession(ASH))
    ));

    let mut finished = 0;
    while let Ok(n) = notifications.try_recv() {
        if let Notification::BattleFinished { summary: s } = n {
            assert_eq!(s, summary);
            finished += 1;
        }
    }
    assert_eq!(finished, 1);
}

#[tokio::test]
async fn test_sweep_pays_fifty_and_nothing() {
    let store = Arc::new(InMemoryStore::new());
    seeded(store.as_ref()).await;
    let engine = Engine::new(
        &test_config(),
        store.clone(),
        Arc::new(StaticCreatureData::new(roster())),
    );

    engine.battles().create_challenge(GARY, ASH).await.unwrap();
    engine.battles().accept_challenge(GARY, ASH).await.unwrap();

    // Gary challenged this time; Ash picking attack loses every round.
    let results = play(&engine, ["attack"; 5]).await;
    let summary = match results.last() {
        Some(StatChoice::BattleFinished(summary)) => summary.clone(),
        other => panic!("expected the battle to finish, got {other:?}"),
    };
    assert_eq!(summary.winner, Some(GARY));
    assert_eq!(summary.challenger.score, 5);
    assert_eq!(summary.challenger.reward, 50);
    assert_eq!(summary.opponent.reward, 0);

    assert_eq!(store.get_currency(GARY).await.unwrap(), 50);
    assert_eq!(store.get_currency(ASH).await.unwrap(), 0);
}

#[tokio::test]
async fn test_short_collection_fights_fewer_rounds() {
    let store = Arc::new(InMemoryStore::new());
    seeded(store.as_ref()).await;
    store.add_creature(3, "rival1").await.unwrap();
    store.add_creature(3, "rival2").await.unwrap();
    let engine = Engine::new(&test_config(), store, Arc::new(StaticCreatureData::new(roster())));

    engine.battles().create_challenge(ASH, 3).await.unwrap();
    let start = engine.battles().accept_challenge(ASH, 3).await.unwrap();
    assert_eq!(start.opponent_team.len(), 2);

    engine.battles().choose_stat(3, "speed").await.unwrap();
    assert!(matches!(
        engine.battles().choose_stat(ASH, "hp").await.unwrap(),
        StatChoice::RoundResolved(_)
    ));
    engine.battles().choose_stat(ASH, "hp").await.unwrap();
    assert!(matches!(
        engine.battles().choose_stat(3, "speed").await.unwrap(),
        StatChoice::BattleFinished(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_challenge_expires_once() {
    let store = Arc::new(InMemoryStore::new());
    seeded(store.as_ref()).await;
    let engine = Engine::new(&test_config(), store, Arc::new(StaticCreatureData::new(roster())));
    let mut notifications = engine.notifier().subscribe();

    engine.battles().create_challenge(ASH, GARY).await.unwrap();
    assert!(matches!(
        notifications.recv().await.unwrap(),
        Notification::ChallengeIssued { .. }
    ));

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(
        engine.battles().participant_state(GARY),
        ParticipantState::ChallengePending
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        notifications.recv().await.unwrap(),
        Notification::ChallengeExpired {
            challenger_id: ASH,
            opponent_id: GARY
        }
    );
    assert_eq!(engine.battles().participant_state(ASH), ParticipantState::Idle);
    assert_eq!(engine.battles().participant_state(GARY), ParticipantState::Idle);

    assert!(matches!(
        engine.battles().accept_challenge(ASH, GARY).await,
        Err(EngineError::NoPendingChallenge { .. })
    ));

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(matches!(notifications.try_recv(), Err(TryRecvError::Empty)));

    // Both are free to start over.
    engine.battles().create_challenge(GARY, ASH).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_accept_before_expiry_suppresses_timeout() {
    let store = Arc::new(InMemoryStore::new());
    seeded(store.as_ref()).await;
    let engine = Engine::new(&test_config(), store, Arc::new(StaticCreatureData::new(roster())));
    let mut notifications = engine.notifier().subscribe();

    engine.battles().create_challenge(ASH, GARY).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    engine.battles().accept_challenge(ASH, GARY).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    while let Ok(n) = notifications.try_recv() {
        assert!(
            !matches!(n, Notification::ChallengeExpired { .. }),
            "accepted challenge must not expire"
        );
    }
    assert_eq!(engine.battles().participant_state(ASH), ParticipantState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_decline_before_expiry_suppresses_timeout() {
    let store = Arc::new(InMemoryStore::new());
    seeded(store.as_ref()).await;
    let engine = Engine::new(&test_config(), store, Arc::new(StaticCreatureData::new(roster())));
    let mut notifications = engine.notifier().subscribe();

    engine.battles().create_challenge(ASH, GARY).await.unwrap();
    engine.battles().decline_challenge(ASH, GARY).unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let mut seen = Vec::new();
    while let Ok(n) = notifications.try_recv() {
        seen.push(n);
    }
    assert_eq!(seen.len(), 2);
    assert!(matches!(seen[1], Notification::ChallengeDeclined { .. }));
}
