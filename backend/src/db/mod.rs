// Database access layer (SQLite via sqlx).

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::engine::{ChatId, PersistenceStore, UserId};
use crate::error::PersistenceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserProfile {
    pub user_id: i64,
    pub username: Option<String>,
    pub joined_on: String,
    pub battle_wins: i64,
    pub coins: i64,
    pub creature_count: i64,
}

/// One line of a collection summary: a creature and how many are owned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollectionEntry {
    pub name: String,
    pub count: i64,
}

/// Group a raw collection by name, most-owned first, then alphabetically.
pub fn summarize_collection(creatures: &[String]) -> Vec<CollectionEntry> {
    let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
    for name in creatures {
        *counts.entry(name.as_str()).or_default() += 1;
    }
    let mut entries: Vec<CollectionEntry> = counts
        .into_iter()
        .map(|(name, count)| CollectionEntry {
            name: name.to_string(),
            count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    entries
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        // Every connection to `:memory:` opens its own empty database.
        let in_memory = database_url.contains(":memory:");
        let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(database_url).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                username TEXT,
                joined_on TEXT NOT NULL DEFAULT (date('now')),
                battle_wins INTEGER NOT NULL DEFAULT 0,
                coins INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS catches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                creature TEXT NOT NULL,
                caught_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_catches_user ON catches(user_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_settings (
                chat_id INTEGER PRIMARY KEY,
                drop_threshold INTEGER NOT NULL CHECK (drop_threshold >= 1)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    /// Insert the user, or refresh their username if one is given.
    pub async fn upsert_user(
        &self,
        user_id: i64,
        username: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO users (user_id, username) VALUES (?, ?) \
             ON CONFLICT(user_id) DO UPDATE \
             SET username = COALESCE(excluded.username, users.username)",
        )
        .bind(user_id)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn user_profile(&self, user_id: i64) -> Result<Option<UserProfile>, sqlx::Error> {
        let row = sqlx::query_as::<_, UserProfile>(
            "SELECT u.user_id, u.username, u.joined_on, u.battle_wins, u.coins, \
             (SELECT COUNT(*) FROM catches c WHERE c.user_id = u.user_id) AS creature_count \
             FROM users u WHERE u.user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn coins(&self, user_id: i64) -> Result<i64, sqlx::Error> {
        let coins = sqlx::query_scalar::<_, i64>("SELECT coins FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(coins.unwrap_or(0))
    }

    /// Add `delta` to the balance, creating the user if needed.
    pub async fn add_coins(&self, user_id: i64, delta: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO users (user_id, coins) VALUES (?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET coins = users.coins + excluded.coins",
        )
        .bind(user_id)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_battle_win(&self, user_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO users (user_id, battle_wins) VALUES (?, 1) \
             ON CONFLICT(user_id) DO UPDATE SET battle_wins = users.battle_wins + 1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Catches ───────────────────────────────────────────────────────

    pub async fn record_catch(&self, user_id: i64, creature: &str) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO users (user_id) VALUES (?)")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO catches (user_id, creature) VALUES (?, ?)")
            .bind(user_id)
            .bind(creature)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Every creature the user has caught, duplicates included, in catch order.
    pub async fn list_catches(&self, user_id: i64) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT creature FROM catches WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ── Chat settings ─────────────────────────────────────────────────

    pub async fn chat_threshold(&self, chat_id: i64) -> Result<Option<i64>, sqlx::Error> {
        let row = sqlx::query_scalar::<_, i64>(
            "SELECT drop_threshold FROM chat_settings WHERE chat_id = ?",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn set_chat_threshold(
        &self,
        chat_id: i64,
        threshold: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO chat_settings (chat_id, drop_threshold) VALUES (?, ?) \
             ON CONFLICT(chat_id) DO UPDATE SET drop_threshold = excluded.drop_threshold",
        )
        .bind(chat_id)
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for Database {
    async fn ensure_user(
        &self,
        user_id: UserId,
        username: Option<&str>,
    ) -> Result<(), PersistenceError> {
        Ok(self.upsert_user(user_id, username).await?)
    }

    async fn get_collection(&self, user_id: UserId) -> Result<Vec<String>, PersistenceError> {
        Ok(self.list_catches(user_id).await?)
    }

    async fn add_creature(&self, user_id: UserId, name: &str) -> Result<(), PersistenceError> {
        Ok(self.record_catch(user_id, name).await?)
    }

    async fn get_drop_threshold(&self, chat_id: ChatId) -> Result<Option<u32>, PersistenceError> {
        let stored = self.chat_threshold(chat_id).await?;
        Ok(stored.and_then(|t| u32::try_from(t).ok()).filter(|t| *t >= 1))
    }

    async fn set_drop_threshold(
        &self,
        chat_id: ChatId,
        threshold: u32,
    ) -> Result<(), PersistenceError> {
        if threshold < 1 {
            return Err(PersistenceError::InvalidThreshold(threshold.into()));
        }
        Ok(self.set_chat_threshold(chat_id, threshold.into()).await?)
    }

    async fn get_currency(&self, user_id: UserId) -> Result<i64, PersistenceError> {
        Ok(self.coins(user_id).await?)
    }

    async fn adjust_currency(&self, user_id: UserId, delta: i64) -> Result<(), PersistenceError> {
        Ok(self.add_coins(user_id, delta).await?)
    }

    async fn increment_win_count(&self, user_id: UserId) -> Result<(), PersistenceError> {
        Ok(self.add_battle_win(user_id).await?)
    }

    async fn get_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, PersistenceError> {
        Ok(self.user_profile(user_id).await?)
    }
}
