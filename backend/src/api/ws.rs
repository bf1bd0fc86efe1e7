// WebSocket handler for notification streaming.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;

use super::AppState;
use crate::engine::notify::Notification;
use crate::engine::UserId;
use crate::metrics;

#[derive(Debug, Default, Deserialize)]
pub struct NotificationFilter {
    /// Only forward chat-wide notifications and those addressed to this user.
    pub user_id: Option<UserId>,
}

impl NotificationFilter {
    pub fn wants(&self, notification: &Notification) -> bool {
        match self.user_id {
            None => true,
            Some(user_id) => {
                let recipients = notification.recipients();
                recipients.is_empty() || recipients.contains(&user_id)
            }
        }
    }
}

/// WebSocket upgrade handler for notification streaming.
pub async fn ws_notifications(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(filter): Query<NotificationFilter>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, filter))
}

async fn handle_ws(mut socket: WebSocket, state: AppState, filter: NotificationFilter) {
    let mut rx = state.engine.notifier().subscribe();
    metrics::CONNECTED_WEBSOCKETS.inc();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(notification) => {
                        if !filter.wants(&notification) {
                            continue;
                        }
                        let text = match serde_json::to_string(&notification) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::error!("Failed to encode notification: {e}");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("WebSocket client lagged, skipped {n} notifications");
                    }
                }
            }
            // Clients only listen; watch for the disconnect.
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    metrics::CONNECTED_WEBSOCKETS.dec();
}
