use std::sync::Arc;

use tower_http::cors::CorsLayer;

use pokecatch_backend::api;
use pokecatch_backend::config::Config;
use pokecatch_backend::creature_data::PokeApiClient;
use pokecatch_backend::db::Database;
use pokecatch_backend::engine::Engine;
use pokecatch_backend::events::{self, DEFAULT_QUEUE_CAPACITY};
use pokecatch_backend::metrics;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::load();
    metrics::register_metrics();

    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let creatures = PokeApiClient::from_config(&config).expect("Failed to create HTTP client");

    let engine = Engine::new(&config, Arc::new(db), Arc::new(creatures));

    let (events_tx, events_rx) = events::event_channel(DEFAULT_QUEUE_CAPACITY);
    events::spawn_event_worker(engine.clone(), events_rx);

    let app = api::router(engine, events_tx).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!(
        port = config.port,
        drop_threshold = config.default_drop_threshold,
        challenge_timeout_secs = config.challenge_timeout.as_secs(),
        "Pokecatch backend listening"
    );
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
