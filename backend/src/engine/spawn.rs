// Per-chat message counting and encounter lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{EngineResult, PersistenceError};
use crate::metrics;
use crate::retry::{retry_transient, RetryPolicy};

use super::{lock, ChatId, CreatureDataProvider, CreatureInfo, PersistenceStore, UserId};

/// Spawn bookkeeping for one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSpawnState {
    pub chat_id: ChatId,
    pub message_count: u32,
    /// Last threshold read from the store; `None` means the chat uses the default.
    pub drop_threshold: Option<u32>,
    /// The unclaimed encounter, if any.
    pub encounter: Option<CreatureInfo>,
}

impl ChatSpawnState {
    fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            message_count: 0,
            drop_threshold: None,
            encounter: None,
        }
    }
}

/// All chats' spawn state. The outer map is locked only to find or create a
/// chat's entry; the work itself happens under that chat's own lock.
#[derive(Debug, Clone, Default)]
pub struct ChatSpawnStore {
    chats: Arc<Mutex<HashMap<ChatId, Arc<Mutex<ChatSpawnState>>>>>,
}

impl ChatSpawnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The chat's state, created on first use.
    fn chat(&self, chat_id: ChatId) -> Arc<Mutex<ChatSpawnState>> {
        lock(&self.chats)
            .entry(chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(ChatSpawnState::new(chat_id))))
            .clone()
    }

    fn existing(&self, chat_id: ChatId) -> Option<Arc<Mutex<ChatSpawnState>>> {
        lock(&self.chats).get(&chat_id).cloned()
    }

    /// Copy of a chat's current state.
    pub fn snapshot(&self, chat_id: ChatId) -> Option<ChatSpawnState> {
        self.existing(chat_id).map(|chat| lock(&chat).clone())
    }

    /// Number of chats seen so far.
    pub fn len(&self) -> usize {
        lock(&self.chats).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decides when encounters spawn and who catches them.
#[derive(Clone)]
pub struct SpawnController {
    chats: ChatSpawnStore,
    store: Arc<dyn PersistenceStore>,
    creatures: Arc<dyn CreatureDataProvider>,
    default_threshold: u32,
    retry: RetryPolicy,
}

impl SpawnController {
    pub fn new(
        chats: ChatSpawnStore,
        store: Arc<dyn PersistenceStore>,
        creatures: Arc<dyn CreatureDataProvider>,
        default_threshold: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            chats,
            store,
            creatures,
            default_threshold: default_threshold.max(1),
            retry,
        }
    }

    pub fn chats(&self) -> &ChatSpawnStore {
        &self.chats
    }

    /// Threshold for chats without a stored setting.
    pub fn default_threshold(&self) -> u32 {
        self.default_threshold
    }

    /// Count one message. Returns true when this message reaches the chat's
    /// drop threshold, in which case the counter starts over from zero.
    pub async fn record_message(&self, chat_id: ChatId) -> EngineResult<bool> {
        let store = self.store.clone();
        let stored = retry_transient(
            "persistence",
            self.retry,
            PersistenceError::is_transient,
            move || {
                let store = store.clone();
                async move { store.get_drop_threshold(chat_id).await }
            },
        )
        .await?;
        let threshold = stored
            .filter(|t| *t >= 1)
            .unwrap_or(self.default_threshold);

        let chat = self.chats.chat(chat_id);
        let mut state = lock(&chat);
        state.drop_threshold = stored;
        state.message_count += 1;

        if state.message_count >= threshold {
            state.message_count = 0;
            tracing::debug!(chat_id, threshold, "Drop threshold reached");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Fetch a random creature and make it the chat's active encounter,
    /// replacing any unclaimed one. On failure the chat keeps what it had.
    pub async fn spawn_encounter(&self, chat_id: ChatId) -> EngineResult<CreatureInfo> {
        let creature = self.creatures.fetch_random().await?;

        let chat = self.chats.chat(chat_id);
        let replaced = lock(&chat).encounter.replace(creature.clone());

        match replaced {
            Some(old) => {
                tracing::debug!(chat_id, escaped = %old.name, "Unclaimed encounter replaced");
            }
            None => metrics::ACTIVE_ENCOUNTERS.inc(),
        }
        metrics::ENCOUNTERS_SPAWNED_TOTAL.inc();
        tracing::info!(chat_id, creature = %creature.name, "Encounter spawned");
        Ok(creature)
    }

    /// Try to catch the chat's active encounter with `text`.
    ///
    /// The comparison ignores case and surrounding whitespace. The first
    /// matching claim takes the encounter; every later claim sees nothing.
    /// The caller must credit the returned creature to `claimant_id`.
    pub fn resolve_catch(
        &self,
        chat_id: ChatId,
        claimant_id: UserId,
        text: &str,
    ) -> Option<CreatureInfo> {
        let chat = self.chats.existing(chat_id)?;
        let guess = text.trim();

        let caught = {
            let mut state = lock(&chat);
            let matches = state
                .encounter
                .as_ref()
                .is_some_and(|e| e.name.eq_ignore_ascii_case(guess));
            if !matches {
                return None;
            }
            state.encounter.take()
        };

        metrics::ACTIVE_ENCOUNTERS.dec();
        tracing::info!(
            chat_id,
            user_id = claimant_id,
            creature = ?caught.as_ref().map(|c| &c.name),
            "Encounter caught"
        );
        caught
    }

    /// Put back an encounter whose catch could not be credited. A newer
    /// spawn that took its place wins; returns whether it was restored.
    pub fn restore_encounter(&self, chat_id: ChatId, creature: CreatureInfo) -> bool {
        let chat = self.chats.chat(chat_id);
        let mut state = lock(&chat);
        if state.encounter.is_some() {
            return false;
        }
        state.encounter = Some(creature);
        metrics::ACTIVE_ENCOUNTERS.inc();
        true
    }

    /// Give back the count consumed by a trigger whose spawn failed, so the
    /// next message in the chat triggers again.
    pub fn rearm(&self, chat_id: ChatId) {
        let chat = self.chats.chat(chat_id);
        let mut state = lock(&chat);
        let threshold = state
            .drop_threshold
            .filter(|t| *t >= 1)
            .unwrap_or(self.default_threshold);
        state.message_count += threshold - 1;
        tracing::debug!(
            chat_id,
            message_count = state.message_count,
            "Spawn trigger rearmed"
        );
    }

    pub fn active_encounter(&self, chat_id: ChatId) -> Option<CreatureInfo> {
        self.chats.snapshot(chat_id).and_then(|s| s.encounter)
    }

    pub fn message_count(&self, chat_id: ChatId) -> u32 {
        self.chats
            .snapshot(chat_id)
            .map(|s| s.message_count)
            .unwrap_or(0)
    }
}
