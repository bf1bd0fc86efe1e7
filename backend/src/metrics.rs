// Prometheus metrics definitions for the catch & duel backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Duels currently in progress.
    pub static ref ACTIVE_BATTLES: IntGauge =
        IntGauge::new("pokecatch_active_battles", "Duels currently in progress").unwrap();

    /// Challenges waiting for an answer.
    pub static ref PENDING_CHALLENGES: IntGauge =
        IntGauge::new("pokecatch_pending_challenges", "Challenges waiting for an answer").unwrap();

    /// Chats with an unclaimed encounter.
    pub static ref ACTIVE_ENCOUNTERS: IntGauge =
        IntGauge::new("pokecatch_active_encounters", "Chats with an unclaimed encounter").unwrap();

    /// Live notification WebSocket connections.
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("pokecatch_connected_websockets", "Live WebSocket connections").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Inbound chat events, by kind.
    pub static ref EVENTS_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pokecatch_events_received_total", "Inbound chat events"),
        &["kind"],
    )
    .unwrap();

    /// Encounters spawned into chats.
    pub static ref ENCOUNTERS_SPAWNED_TOTAL: IntCounter = IntCounter::new(
        "pokecatch_encounters_spawned_total",
        "Encounters spawned",
    )
    .unwrap();

    /// Encounters claimed by a player.
    pub static ref CREATURES_CAUGHT_TOTAL: IntCounter = IntCounter::new(
        "pokecatch_creatures_caught_total",
        "Encounters claimed",
    )
    .unwrap();

    /// Challenges by outcome (issued, accepted, declined, expired, canceled).
    pub static ref CHALLENGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pokecatch_challenges_total", "Challenges by outcome"),
        &["outcome"],
    )
    .unwrap();

    /// Rounds resolved across all duels.
    pub static ref ROUNDS_RESOLVED_TOTAL: IntCounter = IntCounter::new(
        "pokecatch_rounds_resolved_total",
        "Rounds resolved",
    )
    .unwrap();

    /// Finished duels, by result (win, sweep, tie).
    pub static ref BATTLES_COMPLETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pokecatch_battles_completed_total", "Finished duels"),
        &["result"],
    )
    .unwrap();

    /// Retried calls to external collaborators, by collaborator.
    pub static ref EXTERNAL_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pokecatch_external_retries_total", "Retried external calls"),
        &["target"],
    )
    .unwrap();

    /// Operations rejected or failed, by error kind.
    pub static ref ENGINE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pokecatch_engine_errors_total", "Engine operations that failed"),
        &["kind"],
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pokecatch_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Time from first event to handled, by event kind.
    pub static ref EVENT_HANDLING_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "pokecatch_event_handling_seconds",
            "Event handling duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0]),
        &["kind"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_BATTLES.clone()),
        Box::new(PENDING_CHALLENGES.clone()),
        Box::new(ACTIVE_ENCOUNTERS.clone()),
        Box::new(CONNECTED_WEBSOCKETS.clone()),
        Box::new(EVENTS_RECEIVED_TOTAL.clone()),
        Box::new(ENCOUNTERS_SPAWNED_TOTAL.clone()),
        Box::new(CREATURES_CAUGHT_TOTAL.clone()),
        Box::new(CHALLENGES_TOTAL.clone()),
        Box::new(ROUNDS_RESOLVED_TOTAL.clone()),
        Box::new(BATTLES_COMPLETED_TOTAL.clone()),
        Box::new(EXTERNAL_RETRIES_TOTAL.clone()),
        Box::new(ENGINE_ERRORS_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(EVENT_HANDLING_SECONDS.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            // Registering twice (tests, restarts of the router) is harmless.
            tracing::debug!("metric already registered: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Normalize a URL path for metric labels: replace numeric path segments with `:id`
/// to prevent cardinality explosion.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<i64>().is_ok() {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
