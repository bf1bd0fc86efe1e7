// Creature lookups: the PokeAPI client and a fixed in-process table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::Config;
use crate::engine::{CreatureDataProvider, CreatureInfo, CreatureStats};
use crate::error::CreatureDataError;
use crate::retry::{retry_transient, RetryPolicy, DEFAULT_MAX_ATTEMPTS};

/// Per-request timeout for PokeAPI calls.
const REQUEST_TIMEOUT_SECS: u64 = 5;

// ── PokeAPI response shapes ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PokemonResponse {
    name: String,
    #[serde(default)]
    sprites: Sprites,
    #[serde(default)]
    stats: Vec<StatEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct Sprites {
    #[serde(default)]
    other: Option<OtherSprites>,
}

#[derive(Debug, Deserialize)]
struct OtherSprites {
    #[serde(rename = "official-artwork", default)]
    official_artwork: Option<Artwork>,
}

#[derive(Debug, Deserialize)]
struct Artwork {
    front_default: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatEntry {
    base_stat: i32,
    stat: NamedResource,
}

#[derive(Debug, Deserialize)]
struct NamedResource {
    name: String,
}

impl PokemonResponse {
    fn artwork(&self) -> Option<String> {
        self.sprites
            .other
            .as_ref()
            .and_then(|o| o.official_artwork.as_ref())
            .and_then(|a| a.front_default.clone())
    }

    fn into_stats(self) -> CreatureStats {
        let image_ref = self.artwork();
        let base: HashMap<String, i32> = self
            .stats
            .into_iter()
            .map(|s| (s.stat.name, s.base_stat))
            .collect();
        let get = |key: &str| base.get(key).copied().unwrap_or(0);

        CreatureStats {
            name: self.name,
            image_ref,
            hp: get("hp"),
            attack: get("attack"),
            defense: get("defense"),
            special_attack: get("special-attack"),
            special_defense: get("special-defense"),
            speed: get("speed"),
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// HTTP client for `{base_url}/pokemon/{id-or-name}`.
#[derive(Clone)]
pub struct PokeApiClient {
    client: Client,
    base_url: String,
    max_id: u32,
    retry: RetryPolicy,
}

impl PokeApiClient {
    pub fn new(base_url: &str, max_id: u32, retry: RetryPolicy) -> Result<Self, CreatureDataError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("pokecatch-backend/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_id: max_id.max(1),
            retry,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, CreatureDataError> {
        Self::new(
            &config.pokeapi_base_url,
            config.pokedex_max_id,
            RetryPolicy::new(DEFAULT_MAX_ATTEMPTS, config.retry_base_delay),
        )
    }

    fn pokemon_url(&self, key: &str) -> String {
        format!("{}/pokemon/{}", self.base_url, key)
    }

    async fn get_pokemon_once(&self, key: &str) -> Result<PokemonResponse, CreatureDataError> {
        let response = self.client.get(self.pokemon_url(key)).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CreatureDataError::NotFound(key.to_string()));
        }
        if !status.is_success() {
            return Err(CreatureDataError::Unavailable(format!(
                "PokeAPI returned status {}",
                status.as_u16()
            )));
        }
        Ok(response.json().await?)
    }

    async fn get_pokemon(&self, key: &str) -> Result<PokemonResponse, CreatureDataError> {
        retry_transient(
            "creature_data",
            self.retry,
            CreatureDataError::is_transient,
            move || async move { self.get_pokemon_once(key).await },
        )
        .await
    }
}

#[async_trait]
impl CreatureDataProvider for PokeApiClient {
    async fn fetch_random(&self) -> Result<CreatureInfo, CreatureDataError> {
        let id = rand::thread_rng().gen_range(1..=self.max_id);
        let pokemon = self.get_pokemon(&id.to_string()).await.map_err(|e| match e {
            // Every id in range should exist; a gap is an upstream problem.
            CreatureDataError::NotFound(key) => {
                CreatureDataError::Unavailable(format!("no creature with id {key}"))
            }
            other => other,
        })?;

        tracing::debug!(id, name = %pokemon.name, "Fetched random creature");
        Ok(CreatureInfo {
            image_ref: pokemon.artwork(),
            name: pokemon.name,
        })
    }

    async fn fetch_stats(&self, name: &str) -> Result<CreatureStats, CreatureDataError> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return Err(CreatureDataError::NotFound(name.to_string()));
        }
        Ok(self.get_pokemon(&key).await?.into_stats())
    }
}

// ── Fixed table ──────────────────────────────────────────────────────

/// A handful of well-known creatures, for offline runs and tests.
pub fn default_roster() -> Vec<CreatureStats> {
    vec![
        CreatureStats::new("bulbasaur", [45, 49, 49, 65, 65, 45]),
        CreatureStats::new("charmander", [39, 52, 43, 60, 50, 65]),
        CreatureStats::new("squirtle", [44, 48, 65, 50, 64, 43]),
        CreatureStats::new("pikachu", [35, 55, 40, 50, 50, 90]),
        CreatureStats::new("eevee", [55, 55, 50, 45, 65, 55]),
        CreatureStats::new("snorlax", [160, 110, 65, 65, 110, 30]),
        CreatureStats::new("mewtwo", [106, 110, 90, 154, 90, 130]),
        CreatureStats::new("gengar", [60, 65, 60, 130, 75, 110]),
    ]
}

/// Serves creatures from a fixed list. Can be switched into an outage.
#[derive(Debug)]
pub struct StaticCreatureData {
    roster: Vec<CreatureStats>,
    by_name: HashMap<String, usize>,
    unavailable: AtomicBool,
}

impl StaticCreatureData {
    pub fn new(roster: Vec<CreatureStats>) -> Self {
        let by_name = roster
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.to_lowercase(), i))
            .collect();
        Self {
            roster,
            by_name,
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_roster())
    }

    /// While set, every lookup fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CreatureDataError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CreatureDataError::Unavailable(
                "creature data switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CreatureDataProvider for StaticCreatureData {
    async fn fetch_random(&self) -> Result<CreatureInfo, CreatureDataError> {
        self.check()?;
        let creature = self
            .roster
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| CreatureDataError::Unavailable("roster is empty".to_string()))?;
        Ok(CreatureInfo {
            name: creature.name.clone(),
            image_ref: creature.image_ref.clone(),
        })
    }

    async fn fetch_stats(&self, name: &str) -> Result<CreatureStats, CreatureDataError> {
        self.check()?;
        self.by_name
            .get(&name.trim().to_lowercase())
            .map(|&i| self.roster[i].clone())
            .ok_or_else(|| CreatureDataError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Stat;

    const PIKACHU_JSON: &str = r#"{
        "id": 25,
        "name": "pikachu",
        "sprites": {
            "front_default": "https://example.invalid/25.png",
            "other": {
                "official-artwork": {
                    "front_default": "https://example.invalid/official-artwork/25.png"
                }
            }
        },
        "stats": [
            {"base_stat": 35, "effort": 0, "stat": {"name": "hp", "url": ""}},
            {"base_stat": 55, "effort": 0, "stat": {"name": "attack", "url": ""}},
            {"base_stat": 40, "effort": 0, "stat": {"name": "defense", "url": ""}},
            {"base_stat": 50, "effort": 0, "stat": {"name": "special-attack", "url": ""}},
            {"base_stat": 50, "effort": 0, "stat": {"name": "special-defense", "url": ""}},
            {"base_stat": 90, "effort": 2, "stat": {"name": "speed", "url": ""}}
        ]
    }"#;

    #[test]
    fn test_parse_pokeapi_response() {
        let response: PokemonResponse = serde_json::from_str(PIKACHU_JSON).unwrap();
        assert_eq!(
            response.artwork().as_deref(),
            Some("https://example.invalid/official-artwork/25.png")
        );

        let stats = response.into_stats();
        assert_eq!(stats.name, "pikachu");
        assert_eq!(stats.get(Stat::Hp), 35);
        assert_eq!(stats.get(Stat::SpecialAttack), 50);
        assert_eq!(stats.get(Stat::Speed), 90);
    }

    #[test]
    fn test_parse_without_artwork() {
        let response: PokemonResponse =
            serde_json::from_str(r#"{"name": "missingno", "sprites": {"other": null}}"#).unwrap();
        assert!(response.artwork().is_none());
        let stats = response.into_stats();
        assert_eq!(stats.get(Stat::Attack), 0);
    }

    #[test]
    fn test_pokemon_url_trims_slash() {
        let client = PokeApiClient::new("https://pokeapi.co/api/v2/", 151, RetryPolicy::immediate())
            .unwrap();
        assert_eq!(
            client.pokemon_url("pikachu"),
            "https://pokeapi.co/api/v2/pokemon/pikachu"
        );
    }

    #[tokio::test]
    async fn test_unreachable_api_is_unavailable() {
        // Nothing listens on port 1.
        let client = PokeApiClient::new("http://127.0.0.1:1/api/v2", 151, RetryPolicy::immediate())
            .unwrap();
        let err = client.fetch_random().await.unwrap_err();
        assert!(err.is_transient(), "got {err:?}");

        let err = client.fetch_stats("  ").await.unwrap_err();
        assert!(matches!(err, CreatureDataError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_static_lookup() {
        let data = StaticCreatureData::with_defaults();
        let snorlax = data.fetch_stats("Snorlax").await.unwrap();
        assert_eq!(snorlax.hp, 160);

        assert!(matches!(
            data.fetch_stats("agumon").await,
            Err(CreatureDataError::NotFound(name)) if name == "agumon"
        ));

        let random = data.fetch_random().await.unwrap();
        assert!(default_roster().iter().any(|c| c.name == random.name));
    }

    #[tokio::test]
    async fn test_static_outage() {
        let data = StaticCreatureData::with_defaults();
        data.set_unavailable(true);
        assert!(data.fetch_random().await.unwrap_err().is_transient());
        assert!(data.fetch_stats("eevee").await.unwrap_err().is_transient());

        data.set_unavailable(false);
        assert!(data.fetch_stats("eevee").await.is_ok());
    }
}
