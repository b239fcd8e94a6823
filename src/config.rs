//! TOML service configuration.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::scoring::feeds::{FeedParameters, Remix, default_feeds};

/// Upper bound on the scoring lookback window.
pub const LOOKBACK_HARD_LIMIT_HOURS: u64 = 4 * 24;

/// Failures while loading a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file at {path:?}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`Config`].
    #[error("failed to parse config file at {path:?}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("{message}")]
    Validation {
        /// What is wrong, naming the key.
        message: String,
    },
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Service identity and logging.
    #[serde(default)]
    pub service: ServiceConfig,
    /// Commit subscription. The only required section.
    pub firehose: FirehoseConfig,
    /// Relevance caches.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Unknown-entity backfill.
    #[serde(default)]
    pub backfill: BackfillConfig,
    /// Feed ranking.
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Durable state.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Service identity and logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Subscription name the cursor is stored under.
    pub name: String,
    /// `tracing` filter directive, e.g. `skyrank=debug,info`.
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "skyrank".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Commit subscription settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirehoseConfig {
    /// Relay URL.
    pub endpoint: String,
    /// Commits per applied batch.
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    /// Raw frames buffered between the reader and the worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Cap on the reconnect delay.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl FirehoseConfig {
    /// Defaults around `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            flush_every: default_flush_every(),
            queue_capacity: default_queue_capacity(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

fn default_flush_every() -> usize {
    2000
}

fn default_queue_capacity() -> usize {
    5000
}

fn default_max_backoff_secs() -> u64 {
    64
}

/// Relevance cache sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries per cache.
    pub capacity: usize,
    /// Seconds between hit/miss reports.
    pub stats_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            stats_interval_secs: 60,
        }
    }
}

/// Backfill cadence and paging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Seconds between drains.
    pub interval_secs: u64,
    /// Queue entries per page.
    pub page_size: usize,
    /// Passes per drain before giving up for this round.
    pub max_passes: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            page_size: 100,
            max_passes: 8,
        }
    }
}

/// Stale-post refresh after each scoring run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Refresh at all.
    pub enabled: bool,
    /// Posts younger than this are not refreshed.
    pub min_age_mins: u64,
    /// Posts rescanned more recently than this are skipped.
    pub rescan_after_hours: u64,
    /// Posts refreshed per run.
    pub limit: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_age_mins: 20,
            rescan_after_hours: 6,
            limit: 500,
        }
    }
}

/// Feed ranking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Cooldown between runs.
    pub interval_secs: u64,
    /// Window of posts and likes considered; clamped to [`LOOKBACK_HARD_LIMIT_HOURS`].
    pub lookback_hours: u64,
    /// Posts per feed version.
    pub max_posts: usize,
    /// In-network candidates kept after scoring.
    pub in_network_limit: usize,
    /// Out-of-network candidates kept after scoring.
    pub out_of_network_limit: usize,
    /// Versions older than this are pruned.
    pub prune_after_mins: u64,
    /// Stale-post refresh.
    pub refresh: RefreshConfig,
    /// Feeds ranked on every run.
    pub feeds: Vec<FeedParameters>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            lookback_hours: LOOKBACK_HARD_LIMIT_HOURS,
            max_posts: 500,
            in_network_limit: 1000,
            out_of_network_limit: 100,
            prune_after_mins: 60,
            refresh: RefreshConfig::default(),
            feeds: default_feeds(),
        }
    }
}

impl ScoringConfig {
    /// Lookback clamped to the hard limit.
    pub fn effective_lookback_hours(&self) -> u64 {
        self.lookback_hours.min(LOOKBACK_HARD_LIMIT_HOURS)
    }
}

/// Durable state settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("skyrank.sqlite3"),
        }
    }
}

/// Reads, parses and validates the config at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate(&cfg)?;

    Ok(cfg)
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}

/// Checks value ranges the types cannot express.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.firehose.endpoint.trim().is_empty() {
        return Err(invalid("firehose.endpoint must be non-empty."));
    }
    if cfg.service.name.trim().is_empty() {
        return Err(invalid("service.name must be non-empty."));
    }
    if cfg.firehose.flush_every == 0 {
        return Err(invalid("firehose.flush_every must be greater than zero."));
    }
    if cfg.firehose.queue_capacity == 0 {
        return Err(invalid("firehose.queue_capacity must be greater than zero."));
    }
    if cfg.cache.capacity == 0 {
        return Err(invalid("cache.capacity must be greater than zero."));
    }
    if cfg.backfill.page_size == 0 {
        return Err(invalid("backfill.page_size must be greater than zero."));
    }
    if cfg.backfill.max_passes == 0 {
        return Err(invalid("backfill.max_passes must be greater than zero."));
    }
    if cfg.scoring.max_posts == 0 {
        return Err(invalid("scoring.max_posts must be greater than zero."));
    }
    if cfg.scoring.lookback_hours == 0 {
        return Err(invalid("scoring.lookback_hours must be greater than zero."));
    }

    let mut names = hashbrown::HashSet::new();
    for feed in &cfg.scoring.feeds {
        if feed.name.trim().is_empty() {
            return Err(invalid("scoring.feeds[].name must be non-empty."));
        }
        if !names.insert(feed.name.as_str()) {
            return Err(ConfigError::Validation {
                message: format!("scoring.feeds has a duplicate feed named {:?}.", feed.name),
            });
        }
        if let Some(decay) = &feed.decay
            && (!decay.alpha.is_finite()
                || !decay.gamma.is_finite()
                || decay.alpha <= 0.0
                || decay.inflection_secs == 0)
        {
            return Err(ConfigError::Validation {
                message: format!(
                    "scoring.feeds.{}.decay needs a positive finite alpha, finite gamma and a non-zero inflection.",
                    feed.name
                ),
            });
        }
        match feed.remix {
            Remix::LimitSubpopulation { ratio: 0 } | Remix::TopChronological { count: 0 } => {
                return Err(ConfigError::Validation {
                    message: format!("scoring.feeds.{}.remix needs a non-zero size.", feed.name),
                });
            }
            _ => {}
        }
    }

    Ok(())
}
