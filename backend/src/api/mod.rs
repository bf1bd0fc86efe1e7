// HTTP API routes (event intake, player lookups, chat settings, metrics)

pub mod ws;

use axum::{
    body::Body,
    extract::{Json, Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;

use crate::db::summarize_collection;
use crate::engine::{ChatId, Engine, UserId};
use crate::error::{CreatureDataError, PersistenceError};
use crate::events::{ChatEvent, EventSender};
use crate::metrics;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SetThresholdRequest {
    pub drop_threshold: i64,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub events: EventSender,
}

// ── Error helper ──────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

fn internal_error(e: PersistenceError) -> impl IntoResponse {
    tracing::error!("Persistence error: {e}");
    if e.is_transient() {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "Storage temporarily unavailable");
    }
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(engine: Engine, events: EventSender) -> Router {
    let state = AppState { engine, events };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        // Chat events
        .route("/api/events", post(post_event))
        // Players
        .route("/api/users/{id}/collection", get(get_collection))
        .route("/api/users/{id}/profile", get(get_profile))
        // Creatures
        .route("/api/creatures/{name}", get(get_creature))
        // Chat settings
        .route(
            "/api/chats/{id}/threshold",
            get(get_threshold).put(set_threshold),
        )
        // WebSocket
        .route("/ws/notifications", get(ws::ws_notifications))
        .layer(middleware::from_fn(track_requests))
        .with_state(state)
}

/// Count every request by method, normalized path and status.
async fn track_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let response = next.run(req).await;
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), endpoint.as_str(), response.status().as_str()])
        .inc();
    response
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "pokecatch-backend" }))
}

async fn get_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics::gather_metrics(),
    )
}

// ── Event intake ──────────────────────────────────────────────────────

async fn post_event(
    State(state): State<AppState>,
    Json(event): Json<ChatEvent>,
) -> impl IntoResponse {
    let kind = event.kind();
    match state.events.try_send(event) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "queued", "kind": kind })))
            .into_response(),
        Err(TrySendError::Full(_)) => {
            tracing::warn!(kind, "Event queue full, rejecting event");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Event queue is full").into_response()
        }
        Err(TrySendError::Closed(_)) => {
            tracing::error!(kind, "Event queue closed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Event worker is not running")
                .into_response()
        }
    }
}

// ── Player handlers ───────────────────────────────────────────────────

async fn get_collection(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> impl IntoResponse {
    match state.engine.store().get_collection(user_id).await {
        Ok(creatures) => {
            let summary = summarize_collection(&creatures);
            (
                StatusCode::OK,
                Json(json!({
                    "user_id": user_id,
                    "total": creatures.len(),
                    "creatures": summary,
                })),
            )
                .into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> impl IntoResponse {
    match state.engine.store().get_profile(user_id).await {
        Ok(Some(profile)) => (StatusCode::OK, Json(json!(profile))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "User not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// ── Creature handlers ─────────────────────────────────────────────────

async fn get_creature(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.engine.creatures().fetch_stats(&name).await {
        Ok(stats) => (StatusCode::OK, Json(json!(stats))).into_response(),
        Err(CreatureDataError::NotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "Creature not found").into_response()
        }
        Err(e @ CreatureDataError::Unavailable(_)) => {
            tracing::warn!(creature = %name, "Creature lookup failed: {e}");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Creature data unavailable")
                .into_response()
        }
    }
}

// ── Chat settings handlers ────────────────────────────────────────────

async fn get_threshold(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
) -> impl IntoResponse {
    match state.engine.store().get_drop_threshold(chat_id).await {
        Ok(stored) => {
            let default = state.engine.spawns().default_threshold();
            (
                StatusCode::OK,
                Json(json!({
                    "chat_id": chat_id,
                    "drop_threshold": stored.unwrap_or(default),
                    "is_default": stored.is_none(),
                })),
            )
                .into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn set_threshold(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Json(req): Json<SetThresholdRequest>,
) -> impl IntoResponse {
    let threshold = match u32::try_from(req.drop_threshold) {
        Ok(t) if t >= 1 => t,
        _ => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "drop_threshold must be a positive integer",
            )
            .into_response()
        }
    };

    match state.engine.store().set_drop_threshold(chat_id, threshold).await {
        Ok(()) => {
            tracing::info!(chat_id, threshold, "Drop threshold updated");
            (
                StatusCode::OK,
                Json(json!({
                    "chat_id": chat_id,
                    "drop_threshold": threshold,
                    "is_default": false,
                })),
            )
                .into_response()
        }
        Err(PersistenceError::InvalidThreshold(_)) => json_error(
            StatusCode::BAD_REQUEST,
            "drop_threshold must be a positive integer",
        )
        .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::to_bytes;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::creature_data::StaticCreatureData;
    use crate::db::memory::InMemoryStore;
    use crate::engine::PersistenceStore;
    use crate::events::event_channel;

    struct Harness {
        app: Router,
        store: Arc<InMemoryStore>,
        creatures: Arc<StaticCreatureData>,
        events: tokio::sync::mpsc::Receiver<ChatEvent>,
    }

    fn harness(queue_capacity: usize) -> Harness {
        let config = Config {
            default_drop_threshold: 10,
            retry_base_delay: Duration::ZERO,
            ..Config::default()
        };
        let store = Arc::new(InMemoryStore::new());
        let creatures = Arc::new(StaticCreatureData::with_defaults());
        let engine = Engine::new(&config, store.clone(), creatures.clone());
        let (tx, rx) = event_channel(queue_capacity);
        Harness {
            app: router(engine, tx),
            store,
            creatures,
            events: rx,
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(4);
        let (status, body) = send(&h.app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_post_event_is_queued() {
        let mut h = harness(1);
        let event = json!({"type": "challenge", "challenger_id": 1, "opponent_id": 2});

        let (status, body) = send(&h.app, json_req("POST", "/api/events", event.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["kind"], "challenge");

        // Capacity is one and nothing drains the queue.
        let (status, _) = send(&h.app, json_req("POST", "/api/events", event)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(
            h.events.recv().await.unwrap(),
            ChatEvent::Challenge {
                challenger_id: 1,
                opponent_id: 2
            }
        );
    }

    #[tokio::test]
    async fn test_post_malformed_event() {
        let h = harness(4);
        let (status, _) = send(
            &h.app,
            json_req("POST", "/api/events", json!({"type": "dance"})),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_collection_and_profile() {
        let h = harness(4);
        h.store.ensure_user(5, Some("gary")).await.unwrap();
        for name in ["rattata", "eevee", "rattata"] {
            h.store.add_creature(5, name).await.unwrap();
        }

        let (status, body) = send(&h.app, get_req("/api/users/5/collection")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        assert_eq!(body["creatures"][0]["name"], "rattata");
        assert_eq!(body["creatures"][0]["count"], 2);

        let (status, body) = send(&h.app, get_req("/api/users/5/profile")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["username"], "gary");
        assert_eq!(body["creature_count"], 3);

        let (status, _) = send(&h.app, get_req("/api/users/404/profile")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_creature_lookup_statuses() {
        let h = harness(4);
        let (status, body) = send(&h.app, get_req("/api/creatures/pikachu")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["speed"], 90);

        let (status, _) = send(&h.app, get_req("/api/creatures/digimon")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.creatures.set_unavailable(true);
        let (status, _) = send(&h.app, get_req("/api/creatures/pikachu")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_threshold_roundtrip() {
        let h = harness(4);
        let (status, body) = send(&h.app, get_req("/api/chats/-42/threshold")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["drop_threshold"], 10);
        assert_eq!(body["is_default"], true);

        let (status, _) = send(
            &h.app,
            json_req("PUT", "/api/chats/-42/threshold", json!({"drop_threshold": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&h.app, get_req("/api/chats/-42/threshold")).await;
        assert_eq!(body["drop_threshold"], 4);
        assert_eq!(body["is_default"], false);

        for bad in [0, -3] {
            let (status, _) = send(
                &h.app,
                json_req("PUT", "/api/chats/-42/threshold", json!({"drop_threshold": bad})),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_storage_outage_maps_to_503() {
        let h = harness(4);
        h.store.set_unavailable(true);
        let (status, body) = send(&h.app, get_req("/api/users/1/collection")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::register_metrics();
        let h = harness(4);
        send(&h.app, get_req("/health")).await;
        let response = h.app.clone().oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("pokecatch_api_requests_total"));
    }
}
