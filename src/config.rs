//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use std::path::PathBuf;
use std::time::Duration;

/// Plotforge configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory path.
    pub data_dir: PathBuf,

    /// Seconds a pending game proposal stays actionable.
    pub pending_game_timeout: Duration,

    /// How long a vote cache entry survives after its last mutation.
    pub vote_entry_ttl: Duration,

    /// Minimum spacing between opportunistic vote cache sweeps.
    pub vote_sweep_interval: Duration,

    /// Delay before a coalesced cache flush hits disk.
    pub cache_save_delay: Duration,

    /// Lifetime of a one-time web start token.
    pub web_token_ttl: Duration,

    /// Interval between store connection health pings.
    pub db_ping_interval: Duration,

    /// Upper bound for history commands (rounds per forwarded bundle).
    pub history_limit: usize,

    /// LLM call tuning.
    pub llm: LlmSettings,
}

/// LLM client tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct LlmSettings {
    /// Wall-clock timeout for a single completion call.
    pub request_timeout: Duration,

    /// Total attempts per completion (first try included).
    pub max_retries: u32,

    /// Base delay for exponential backoff.
    pub base_delay: Duration,

    /// Ceiling for any single backoff sleep.
    pub max_delay: Duration,

    /// Maximum number of pooled per-credential clients.
    pub pool_capacity: usize,

    /// Idle time after which a pooled client is evicted.
    pub pool_idle_timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            pool_capacity: 20,
            pool_idle_timeout: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn load() -> Result<Self> {
        let data_dir = match std::env::var("PLOTFORGE_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .map(|d| d.join("plotforge"))
                .unwrap_or_else(|| PathBuf::from("./data")),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let pending_game_timeout =
            duration_from_env("PLOTFORGE_PENDING_GAME_TIMEOUT_SECS", 300)?;

        Ok(Self {
            data_dir,
            pending_game_timeout,
            vote_entry_ttl: Duration::from_secs(24 * 3600),
            vote_sweep_interval: Duration::from_secs(3600),
            cache_save_delay: Duration::from_millis(500),
            web_token_ttl: Duration::from_secs(600),
            db_ping_interval: Duration::from_secs(60),
            history_limit: 10,
            llm: LlmSettings::default(),
        })
    }

    /// Get the SQLite database path.
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("ai_gm.db")
    }

    /// Get the volatile cache dump path.
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache.json")
    }

    /// Get the channel flag store path.
    pub fn channel_config_path(&self) -> PathBuf {
        self.data_dir.join("channel_config.json")
    }
}

fn duration_from_env(key: &str, default_secs: u64) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => {
            let secs: u64 = raw.parse().map_err(|_| {
                ConfigError::Invalid(format!("{key} must be a number of seconds, got '{raw}'"))
            })?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}
