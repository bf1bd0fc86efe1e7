// Application configuration, loaded from environment variables and CLI flags.

use std::time::Duration;

/// Messages per chat between encounters when a chat has no stored threshold.
pub const DEFAULT_DROP_THRESHOLD: u32 = 10;

/// Seconds a challenge stays open before it expires.
pub const DEFAULT_CHALLENGE_TIMEOUT_SECS: u64 = 60;

/// Only the first generation of creatures can spawn.
pub const DEFAULT_POKEDEX_MAX_ID: u32 = 151;

pub const DEFAULT_POKEAPI_BASE_URL: &str = "https://pokeapi.co/api/v2";

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Drop threshold used for chats that never set one.
    pub default_drop_threshold: u32,
    /// How long a challenge waits for an answer.
    pub challenge_timeout: Duration,
    /// Base URL of the creature data API.
    pub pokeapi_base_url: String,
    /// Highest creature id `fetch_random` draws from.
    pub pokedex_max_id: u32,
    /// First backoff delay for retried external calls; doubles per attempt.
    pub retry_base_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite:pokecatch.db?mode=rwc".to_string(),
            port: 3000,
            default_drop_threshold: DEFAULT_DROP_THRESHOLD,
            challenge_timeout: Duration::from_secs(DEFAULT_CHALLENGE_TIMEOUT_SECS),
            pokeapi_base_url: DEFAULT_POKEAPI_BASE_URL.to_string(),
            pokedex_max_id: DEFAULT_POKEDEX_MAX_ID,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:pokecatch.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `DEFAULT_DROP_THRESHOLD` - messages between encounters (default: 10)
    /// - `CHALLENGE_TIMEOUT_SECS` - challenge expiry (default: 60)
    /// - `POKEAPI_BASE_URL` - creature data API (default: `https://pokeapi.co/api/v2`)
    /// - `POKEDEX_MAX_ID` - highest spawnable creature id (default: 151)
    /// - `RETRY_BASE_DELAY_MS` - first retry delay for external calls (default: 500)
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let defaults = Config::default();

        let database_url = std::env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| env_parse("PORT"))
            .unwrap_or(defaults.port);

        // A zero threshold would spawn on every message and reset nothing.
        let default_drop_threshold = env_parse::<u32>("DEFAULT_DROP_THRESHOLD")
            .filter(|t| *t >= 1)
            .unwrap_or(defaults.default_drop_threshold);

        let challenge_timeout = env_parse::<u64>("CHALLENGE_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.challenge_timeout);

        let pokeapi_base_url =
            std::env::var("POKEAPI_BASE_URL").unwrap_or(defaults.pokeapi_base_url);

        let pokedex_max_id = env_parse::<u32>("POKEDEX_MAX_ID")
            .filter(|id| *id >= 1)
            .unwrap_or(defaults.pokedex_max_id);

        let retry_base_delay = env_parse::<u64>("RETRY_BASE_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_base_delay);

        Config {
            database_url,
            port,
            default_drop_threshold,
            challenge_timeout,
            pokeapi_base_url,
            pokedex_max_id,
            retry_base_delay,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
