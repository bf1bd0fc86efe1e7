pub mod api;
pub mod config;
pub mod creature_data;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod retry;
