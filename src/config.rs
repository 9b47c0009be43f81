use crate::cache;
use crate::events::DEFAULT_CHANNEL_CAPACITY;
use crate::guard::DEFAULT_COOLDOWN;
use crate::models::DEFAULT_PASSING_SCORE;
use crate::registry;
use crate::timer::TICK_INTERVAL;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Knobs of a single exam session instance.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub submit_cooldown: Duration,
    pub tick_interval: Duration,
    pub default_passing_score: f64,
    pub event_channel_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            submit_cooldown: DEFAULT_COOLDOWN,
            tick_interval: TICK_INTERVAL,
            default_passing_score: DEFAULT_PASSING_SCORE,
            event_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub local_state_path: Option<String>,
    pub tests_seed_path: Option<String>,
    pub test_cache_ttl: Duration,
    pub test_cache_capacity: usize,
    pub session_idle_ttl: Duration,
    pub session_capacity: usize,
    /// Required by the publish routes; they are disabled when unset.
    pub admin_token: Option<String>,
    pub engine: EngineSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            local_state_path: None,
            tests_seed_path: None,
            test_cache_ttl: cache::DEFAULT_TTL,
            test_cache_capacity: cache::DEFAULT_CAPACITY,
            session_idle_ttl: registry::DEFAULT_IDLE_TTL,
            session_capacity: registry::DEFAULT_CAPACITY,
            admin_token: None,
            engine: EngineSettings::default(),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_opt(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring invalid value for {}: {:?}", key, raw);
            default
        }),
        None => default,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        let engine = EngineSettings {
            submit_cooldown: Duration::from_millis(env_parse(
                "SUBMIT_COOLDOWN_MS",
                defaults.engine.submit_cooldown.as_millis() as u64,
            )),
            tick_interval: defaults.engine.tick_interval,
            default_passing_score: env_parse(
                "DEFAULT_PASSING_SCORE",
                defaults.engine.default_passing_score,
            ),
            event_channel_capacity: env_parse(
                "EVENT_CHANNEL_CAPACITY",
                defaults.engine.event_channel_capacity,
            ),
        };
        Self {
            host: env_opt("BACKEND_HOST").unwrap_or(defaults.host),
            port: env_parse("BACKEND_PORT", defaults.port),
            local_state_path: env_opt("LOCAL_STATE_PATH"),
            tests_seed_path: env_opt("TESTS_SEED_PATH"),
            test_cache_ttl: Duration::from_secs(env_parse(
                "TEST_CACHE_TTL_SECS",
                defaults.test_cache_ttl.as_secs(),
            )),
            test_cache_capacity: env_parse("TEST_CACHE_CAPACITY", defaults.test_cache_capacity),
            session_idle_ttl: Duration::from_secs(env_parse(
                "SESSION_IDLE_TTL_SECS",
                defaults.session_idle_ttl.as_secs(),
            )),
            session_capacity: env_parse("SESSION_REGISTRY_CAPACITY", defaults.session_capacity),
            admin_token: env_opt("ADMIN_TOKEN"),
            engine,
        }
    }
}
