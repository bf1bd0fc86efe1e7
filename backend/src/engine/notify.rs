// Outbound notifications for the presentation layer.

use serde::Serialize;
use tokio::sync::broadcast;

use super::battle::{BattleSummary, RoundOutcome};
use super::{ChatId, UserId};

pub const DEFAULT_CAPACITY: usize = 1024;

/// Everything the engine tells players. The transport decides how to render it.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A wild creature appeared in a chat.
    EncounterSpawned {
        chat_id: ChatId,
        name: String,
        image_ref: Option<String>,
    },
    CreatureCaught {
        chat_id: ChatId,
        user_id: UserId,
        name: String,
    },
    ChallengeIssued {
        challenger_id: UserId,
        opponent_id: UserId,
        expires_in_secs: u64,
    },
    ChallengeDeclined {
        challenger_id: UserId,
        opponent_id: UserId,
    },
    /// Nobody answered in time. Sent once and addressed to both parties.
    ChallengeExpired {
        challenger_id: UserId,
        opponent_id: UserId,
    },
    /// An accepted challenge could not start.
    BattleCanceled {
        challenger_id: UserId,
        opponent_id: UserId,
        reason: String,
    },
    BattleStarted {
        challenger_id: UserId,
        opponent_id: UserId,
        first_picker: UserId,
        rounds: usize,
    },
    /// Ask a player to pick a stat for the given round.
    StatPrompt {
        user_id: UserId,
        round: u32,
        opponent_chose: bool,
    },
    RoundResolved {
        challenger_id: UserId,
        opponent_id: UserId,
        outcome: RoundOutcome,
    },
    BattleFinished {
        summary: BattleSummary,
    },
    /// An operation was refused; `reason` is fit to show the user.
    Rejected {
        user_id: UserId,
        reason: String,
    },
    /// An operation failed for reasons outside the user's control.
    Failed {
        user_id: Option<UserId>,
        chat_id: Option<ChatId>,
        reason: String,
    },
}

impl Notification {
    /// Users a direct message should go to. Chat-wide notifications return none.
    pub fn recipients(&self) -> Vec<UserId> {
        match self {
            Notification::EncounterSpawned { .. } | Notification::CreatureCaught { .. } => vec![],
            Notification::ChallengeIssued { opponent_id, .. } => vec![*opponent_id],
            Notification::ChallengeDeclined { challenger_id, .. } => vec![*challenger_id],
            Notification::ChallengeExpired {
                challenger_id,
                opponent_id,
            }
            | Notification::BattleCanceled {
                challenger_id,
                opponent_id,
                ..
            }
            | Notification::BattleStarted {
                challenger_id,
                opponent_id,
                ..
            }
            | Notification::RoundResolved {
                challenger_id,
                opponent_id,
                ..
            } => vec![*challenger_id, *opponent_id],
            Notification::StatPrompt { user_id, .. } | Notification::Rejected { user_id, .. } => {
                vec![*user_id]
            }
            Notification::BattleFinished { summary } => {
                vec![summary.challenger.user_id, summary.opponent.user_id]
            }
            Notification::Failed { user_id, .. } => user_id.iter().copied().collect(),
        }
    }
}

/// Fan-out of notifications to any number of subscribers.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish a notification. Having no subscribers is not an error.
    pub fn send(&self, notification: Notification) {
        tracing::trace!(?notification, "notify");
        let _ = self.tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
