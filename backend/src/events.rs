// Inbound chat events and the worker that feeds them to the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::engine::notify::Notification;
use crate::engine::{ChatId, Engine, UserId};
use crate::error::{EngineError, EngineResult};
use crate::metrics;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Something a player did in a chat, already parsed by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A plain text message: either a catch attempt or a tick of the spawn counter.
    Message {
        chat_id: ChatId,
        user_id: UserId,
        #[serde(default)]
        username: Option<String>,
        text: String,
    },
    Challenge {
        challenger_id: UserId,
        opponent_id: UserId,
    },
    /// The opponent's answer to a pending challenge.
    Respond {
        challenger_id: UserId,
        opponent_id: UserId,
        accept: bool,
    },
    PickStat {
        user_id: UserId,
        stat: String,
    },
}

impl ChatEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::Message { .. } => "message",
            ChatEvent::Challenge { .. } => "challenge",
            ChatEvent::Respond { .. } => "respond",
            ChatEvent::PickStat { .. } => "pick_stat",
        }
    }

    /// The user whose action this is.
    pub fn actor(&self) -> UserId {
        match self {
            ChatEvent::Message { user_id, .. } | ChatEvent::PickStat { user_id, .. } => *user_id,
            ChatEvent::Challenge { challenger_id, .. } => *challenger_id,
            ChatEvent::Respond { opponent_id, .. } => *opponent_id,
        }
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            ChatEvent::Message { chat_id, .. } => Some(*chat_id),
            _ => None,
        }
    }
}

pub type EventSender = mpsc::Sender<ChatEvent>;

pub fn event_channel(capacity: usize) -> (EventSender, mpsc::Receiver<ChatEvent>) {
    mpsc::channel(capacity.max(1))
}

/// Drain the event queue, handling each event on its own task.
pub fn spawn_event_worker(engine: Engine, mut rx: mpsc::Receiver<ChatEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                // Errors are already reported to the players and counted.
                let _ = handle_event(&engine, event).await;
            });
        }
        tracing::info!("Event queue closed, worker exiting");
    });
}

async fn dispatch(engine: &Engine, event: ChatEvent) -> EngineResult<()> {
    match event {
        ChatEvent::Message {
            chat_id,
            user_id,
            username,
            text,
        } => {
            engine
                .handle_message(chat_id, user_id, username.as_deref(), &text)
                .await?;
        }
        ChatEvent::Challenge {
            challenger_id,
            opponent_id,
        } => {
            engine
                .battles()
                .create_challenge(challenger_id, opponent_id)
                .await?;
        }
        ChatEvent::Respond {
            challenger_id,
            opponent_id,
            accept: true,
        } => {
            engine
                .battles()
                .accept_challenge(challenger_id, opponent_id)
                .await?;
        }
        ChatEvent::Respond {
            challenger_id,
            opponent_id,
            accept: false,
        } => {
            engine
                .battles()
                .decline_challenge(challenger_id, opponent_id)?;
        }
        ChatEvent::PickStat { user_id, stat } => {
            engine.battles().choose_stat(user_id, &stat).await?;
        }
    }
    Ok(())
}

/// Run one event through the engine. Failures are logged, counted and
/// reported to the acting player before being returned.
pub async fn handle_event(engine: &Engine, event: ChatEvent) -> EngineResult<()> {
    let kind = event.kind();
    let actor = event.actor();
    let chat_id = event.chat_id();

    metrics::EVENTS_RECEIVED_TOTAL.with_label_values(&[kind]).inc();
    let _timer = metrics::EVENT_HANDLING_SECONDS
        .with_label_values(&[kind])
        .start_timer();

    let result = dispatch(engine, event).await;
    if let Err(e) = &result {
        report_error(engine, kind, actor, chat_id, e);
    }
    result
}

fn report_error(
    engine: &Engine,
    kind: &str,
    actor: UserId,
    chat_id: Option<ChatId>,
    error: &EngineError,
) {
    metrics::ENGINE_ERRORS_TOTAL
        .with_label_values(&[error.kind()])
        .inc();

    let notification = if error.is_invalid_state() {
        tracing::debug!(event = kind, user_id = actor, "Rejected: {error}");
        Notification::Rejected {
            user_id: actor,
            reason: error.to_string(),
        }
    } else {
        tracing::warn!(event = kind, user_id = actor, ?chat_id, "Event failed: {error}");
        let reason = if error.is_transient() {
            "Something went wrong, please try again in a moment.".to_string()
        } else {
            error.to_string()
        };
        Notification::Failed {
            user_id: Some(actor),
            chat_id,
            reason,
        }
    };
    engine.notifier().send(notification);
}
