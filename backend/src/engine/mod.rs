// Spawn & battle engine: shared types, collaborator traits and the `Engine` facade.

pub mod battle;
pub mod notify;
pub mod rewards;
pub mod spawn;
pub mod timeout;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::db::UserProfile;
use crate::error::{CreatureDataError, EngineResult, PersistenceError};
use crate::metrics;
use crate::retry::RetryPolicy;

use battle::BattleSessionManager;
use notify::{Notification, Notifier};
use spawn::{ChatSpawnStore, SpawnController};
use timeout::ChallengeTimeoutScheduler;

pub type UserId = i64;
pub type ChatId = i64;

/// Lock a std mutex, recovering the data if a previous holder panicked.
/// Engine locks only guard short in-memory bookkeeping, so the data is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Creature data ────────────────────────────────────────────────────

/// The six base stats a player can pick from in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stat {
    Hp,
    Attack,
    Defense,
    SpecialAttack,
    SpecialDefense,
    Speed,
}

impl Stat {
    pub const ALL: [Stat; 6] = [
        Stat::Hp,
        Stat::Attack,
        Stat::Defense,
        Stat::SpecialAttack,
        Stat::SpecialDefense,
        Stat::Speed,
    ];

    /// Parse a stat name. Accepts the canonical names and the short button
    /// aliases (`sp_attack`, `sp_defense`), case-insensitively.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hp" => Some(Stat::Hp),
            "attack" => Some(Stat::Attack),
            "defense" => Some(Stat::Defense),
            "special_attack" | "sp_attack" => Some(Stat::SpecialAttack),
            "special_defense" | "sp_defense" => Some(Stat::SpecialDefense),
            "speed" => Some(Stat::Speed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stat::Hp => "hp",
            Stat::Attack => "attack",
            Stat::Defense => "defense",
            Stat::SpecialAttack => "special_attack",
            Stat::SpecialDefense => "special_defense",
            Stat::Speed => "speed",
        }
    }
}

impl std::fmt::Display for Stat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A creature as it appears in an encounter: a name and something to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatureInfo {
    pub name: String,
    pub image_ref: Option<String>,
}

/// Base stats of one creature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatureStats {
    pub name: String,
    pub image_ref: Option<String>,
    pub hp: i32,
    pub attack: i32,
    pub defense: i32,
    pub special_attack: i32,
    pub special_defense: i32,
    pub speed: i32,
}

impl CreatureStats {
    /// Build from values ordered as `Stat::ALL`.
    pub fn new(name: &str, values: [i32; 6]) -> Self {
        let [hp, attack, defense, special_attack, special_defense, speed] = values;
        Self {
            name: name.to_string(),
            image_ref: None,
            hp,
            attack,
            defense,
            special_attack,
            special_defense,
            speed,
        }
    }

    pub fn get(&self, stat: Stat) -> i32 {
        match stat {
            Stat::Hp => self.hp,
            Stat::Attack => self.attack,
            Stat::Defense => self.defense,
            Stat::SpecialAttack => self.special_attack,
            Stat::SpecialDefense => self.special_defense,
            Stat::Speed => self.speed,
        }
    }
}

// ── Collaborators ────────────────────────────────────────────────────

/// Durable user balances, collections and chat settings.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Register a user (or refresh their username). Safe to call on every message.
    async fn ensure_user(
        &self,
        user_id: UserId,
        username: Option<&str>,
    ) -> Result<(), PersistenceError>;

    async fn get_collection(&self, user_id: UserId) -> Result<Vec<String>, PersistenceError>;

    async fn add_creature(&self, user_id: UserId, name: &str) -> Result<(), PersistenceError>;

    /// The chat's stored threshold, or `None` when the chat uses the default.
    async fn get_drop_threshold(&self, chat_id: ChatId) -> Result<Option<u32>, PersistenceError>;

    async fn set_drop_threshold(
        &self,
        chat_id: ChatId,
        threshold: u32,
    ) -> Result<(), PersistenceError>;

    async fn get_currency(&self, user_id: UserId) -> Result<i64, PersistenceError>;

    async fn adjust_currency(&self, user_id: UserId, delta: i64) -> Result<(), PersistenceError>;

    async fn increment_win_count(&self, user_id: UserId) -> Result<(), PersistenceError>;

    async fn get_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, PersistenceError>;
}

/// Lookup service for creature names, artwork and base stats.
#[async_trait]
pub trait CreatureDataProvider: Send + Sync {
    /// A random spawnable creature. Fails with `Unavailable` once retries are spent.
    async fn fetch_random(&self) -> Result<CreatureInfo, CreatureDataError>;

    /// Stats by name. Fails with `NotFound` for an unrecognized name.
    async fn fetch_stats(&self, name: &str) -> Result<CreatureStats, CreatureDataError>;
}

// ── Facade ───────────────────────────────────────────────────────────

/// What a plain chat message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The message named the active encounter and the sender caught it.
    Caught(CreatureInfo),
    /// The message reached the drop threshold and a new encounter appeared.
    Spawned(CreatureInfo),
    /// The message only advanced the chat's counter.
    Counted,
}

/// Owns the spawn controller, the battle manager and the notification channel.
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn PersistenceStore>,
    creatures: Arc<dyn CreatureDataProvider>,
    spawns: SpawnController,
    battles: BattleSessionManager,
    notifier: Notifier,
}

impl Engine {
    pub fn new(
        config: &Config,
        store: Arc<dyn PersistenceStore>,
        creatures: Arc<dyn CreatureDataProvider>,
    ) -> Self {
        let retry = RetryPolicy::new(crate::retry::DEFAULT_MAX_ATTEMPTS, config.retry_base_delay);
        let notifier = Notifier::new(notify::DEFAULT_CAPACITY);

        let spawns = SpawnController::new(
            ChatSpawnStore::new(),
            store.clone(),
            creatures.clone(),
            config.default_drop_threshold,
            retry,
        );
        let battles = BattleSessionManager::new(
            ChallengeTimeoutScheduler::new(config.challenge_timeout),
            store.clone(),
            creatures.clone(),
            notifier.clone(),
            retry,
        );

        Self {
            store,
            creatures,
            spawns,
            battles,
            notifier,
        }
    }

    pub fn spawns(&self) -> &SpawnController {
        &self.spawns
    }

    pub fn battles(&self) -> &BattleSessionManager {
        &self.battles
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    pub fn creatures(&self) -> &Arc<dyn CreatureDataProvider> {
        &self.creatures
    }

    /// Handle an ordinary chat message: a correct guess catches the active
    /// encounter, anything else counts toward the next spawn.
    pub async fn handle_message(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        username: Option<&str>,
        text: &str,
    ) -> EngineResult<MessageOutcome> {
        if let Err(e) = self.store.ensure_user(user_id, username).await {
            // Catching and counting still work without the profile row.
            tracing::warn!(user_id, "Failed to register user: {e}");
        }

        if let Some(caught) = self.spawns.resolve_catch(chat_id, user_id, text) {
            if let Err(e) = self.store.add_creature(user_id, &caught.name).await {
                tracing::error!(
                    chat_id,
                    user_id,
                    creature = %caught.name,
                    "Failed to credit caught creature: {e}"
                );
                self.spawns.restore_encounter(chat_id, caught);
                return Err(e.into());
            }
            metrics::CREATURES_CAUGHT_TOTAL.inc();
            self.notifier.send(Notification::CreatureCaught {
                chat_id,
                user_id,
                name: caught.name.clone(),
            });
            return Ok(MessageOutcome::Caught(caught));
        }

        if !self.spawns.record_message(chat_id).await? {
            return Ok(MessageOutcome::Counted);
        }

        let encounter = match self.spawns.spawn_encounter(chat_id).await {
            Ok(encounter) => encounter,
            Err(e) => {
                self.spawns.rearm(chat_id);
                return Err(e);
            }
        };
        self.notifier.send(Notification::EncounterSpawned {
            chat_id,
            name: encounter.name.clone(),
            image_ref: encounter.image_ref.clone(),
        });
        Ok(MessageOutcome::Spawned(encounter))
    }
}
