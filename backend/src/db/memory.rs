// In-process store with the same contract as the SQLite database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::engine::{lock, ChatId, PersistenceStore, UserId};
use crate::error::PersistenceError;

use super::UserProfile;

#[derive(Debug, Clone, Default)]
struct UserRecord {
    username: Option<String>,
    joined_on: String,
    battle_wins: i64,
    coins: i64,
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, UserRecord>,
    catches: HashMap<UserId, Vec<String>>,
    thresholds: HashMap<ChatId, u32>,
}

impl Tables {
    fn user(&mut self, user_id: UserId) -> &mut UserRecord {
        self.users.entry(user_id).or_insert_with(|| UserRecord {
            joined_on: Utc::now().date_naive().to_string(),
            ..UserRecord::default()
        })
    }
}

/// Mutex-guarded maps. Used by tests and for running without a database file.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a transient pool timeout until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop everything a user has caught.
    pub fn clear_collection(&self, user_id: UserId) {
        lock(&self.tables).catches.remove(&user_id);
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn ensure_user(
        &self,
        user_id: UserId,
        username: Option<&str>,
    ) -> Result<(), PersistenceError> {
        self.check()?;
        let mut tables = lock(&self.tables);
        let user = tables.user(user_id);
        if let Some(name) = username {
            user.username = Some(name.to_string());
        }
        Ok(())
    }

    async fn get_collection(&self, user_id: UserId) -> Result<Vec<String>, PersistenceError> {
        self.check()?;
        Ok(lock(&self.tables)
            .catches
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_creature(&self, user_id: UserId, name: &str) -> Result<(), PersistenceError> {
        self.check()?;
        let mut tables = lock(&self.tables);
        tables.user(user_id);
        tables
            .catches
            .entry(user_id)
            .or_default()
            .push(name.to_string());
        Ok(())
    }

    async fn get_drop_threshold(&self, chat_id: ChatId) -> Result<Option<u32>, PersistenceError> {
        self.check()?;
        Ok(lock(&self.tables).thresholds.get(&chat_id).copied())
    }

    async fn set_drop_threshold(
        &self,
        chat_id: ChatId,
        threshold: u32,
    ) -> Result<(), PersistenceError> {
        self.check()?;
        if threshold < 1 {
            return Err(PersistenceError::InvalidThreshold(threshold.into()));
        }
        lock(&self.tables).thresholds.insert(chat_id, threshold);
        Ok(())
    }

    async fn get_currency(&self, user_id: UserId) -> Result<i64, PersistenceError> {
        self.check()?;
        Ok(lock(&self.tables)
            .users
            .get(&user_id)
            .map(|u| u.coins)
            .unwrap_or(0))
    }

    async fn adjust_currency(&self, user_id: UserId, delta: i64) -> Result<(), PersistenceError> {
        self.check()?;
        lock(&self.tables).user(user_id).coins += delta;
        Ok(())
    }

    async fn increment_win_count(&self, user_id: UserId) -> Result<(), PersistenceError> {
        self.check()?;
        lock(&self.tables).user(user_id).battle_wins += 1;
        Ok(())
    }

    async fn get_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, PersistenceError> {
        self.check()?;
        let tables = lock(&self.tables);
        Ok(tables.users.get(&user_id).map(|user| UserProfile {
            user_id,
            username: user.username.clone(),
            joined_on: user.joined_on.clone(),
            battle_wins: user.battle_wins,
            coins: user.coins,
            creature_count: tables.catches.get(&user_id).map_or(0, |c| c.len() as i64),
        }))
    }
}
