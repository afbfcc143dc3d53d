use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::cache::{CacheConfig, RedisConfig, ReconnectPolicy};

/// Where source statistics are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsBackend {
    /// JSON snapshot under `DATA_DIR`.
    #[default]
    File,
    /// One blob in the shared cache. Needs `REDIS_URL`.
    Redis,
    Memory,
}

impl FromStr for StatsBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "json" => Ok(Self::File),
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("Unknown STATS_BACKEND '{}', expected file, redis or memory", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Caché local
    pub cache_size: usize,
    pub cache_ttl_low: Duration,
    pub cache_ttl_normal: Duration,
    pub cache_ttl_high: Duration,
    pub cache_update_age_on_get: bool,

    // Caché compartido
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    pub redis_reconnect_attempts: u32,
    pub redis_reconnect_base_delay: Duration,

    // Estadísticas
    pub stats_backend: StatsBackend,
    pub data_dir: PathBuf,

    // Resolver
    pub resolver_url: String,
    pub resolve_timeout: Duration,
    pub default_sources: Vec<String>,

    // Rendimiento
    pub maintenance_interval: Duration,
    pub worker_threads: usize,
}

impl Config {
    /// Loads `.env` (if any) and then the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Builds a config from any variable source. Unset or blank variables
    /// take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let duration = |key: &str, default: Duration| -> Result<Duration> {
            match var(key) {
                Some(raw) => humantime::parse_duration(raw.trim())
                    .with_context(|| format!("{} is not a valid duration: '{}'", key, raw)),
                None => Ok(default),
            }
        };

        Ok(Self {
            // Caché local
            cache_size: match var("CACHE_SIZE") {
                Some(v) => v.trim().parse().context("CACHE_SIZE must be an integer")?,
                None => defaults.cache_size,
            },
            cache_ttl_low: duration("CACHE_TTL_LOW", defaults.cache_ttl_low)?,
            cache_ttl_normal: duration("CACHE_TTL_NORMAL", defaults.cache_ttl_normal)?,
            cache_ttl_high: duration("CACHE_TTL_HIGH", defaults.cache_ttl_high)?,
            cache_update_age_on_get: match var("CACHE_UPDATE_AGE_ON_GET") {
                Some(v) => v
                    .trim()
                    .parse()
                    .context("CACHE_UPDATE_AGE_ON_GET must be true or false")?,
                None => defaults.cache_update_age_on_get,
            },

            // Caché compartido
            redis_url: var("REDIS_URL"),
            redis_key_prefix: var("REDIS_KEY_PREFIX").unwrap_or(defaults.redis_key_prefix),
            redis_reconnect_attempts: match var("REDIS_RECONNECT_ATTEMPTS") {
                Some(v) => v
                    .trim()
                    .parse()
                    .context("REDIS_RECONNECT_ATTEMPTS must be an integer")?,
                None => defaults.redis_reconnect_attempts,
            },
            redis_reconnect_base_delay: duration(
                "REDIS_RECONNECT_BASE_DELAY",
                defaults.redis_reconnect_base_delay,
            )?,

            // Estadísticas
            stats_backend: match var("STATS_BACKEND") {
                Some(v) => v.parse()?,
                None => defaults.stats_backend,
            },
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),

            // Resolver
            resolver_url: var("RESOLVER_URL").unwrap_or(defaults.resolver_url),
            resolve_timeout: duration("RESOLVE_TIMEOUT", defaults.resolve_timeout)?,
            default_sources: match var("DEFAULT_SOURCES") {
                Some(v) => parse_source_list(&v),
                None => defaults.default_sources,
            },

            // Rendimiento
            maintenance_interval: duration("MAINTENANCE_INTERVAL", defaults.maintenance_interval)?,
            worker_threads: match var("WORKER_THREADS") {
                Some(v) => v.trim().parse().context("WORKER_THREADS must be an integer")?,
                None => defaults.worker_threads,
            },
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Cache size and worker threads must be greater than 0
    /// - TTLs must be non-zero and ordered `low <= normal <= high`
    /// - `RESOLVER_URL` (and `REDIS_URL` when set) must parse as URLs
    /// - `STATS_BACKEND=redis` requires `REDIS_URL`
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }

        if self.cache_ttl_low.is_zero() || self.cache_ttl_normal.is_zero() || self.cache_ttl_high.is_zero() {
            anyhow::bail!("Cache TTLs must be greater than 0");
        }

        if self.cache_ttl_low > self.cache_ttl_normal || self.cache_ttl_normal > self.cache_ttl_high {
            anyhow::bail!(
                "Cache TTLs must satisfy low <= normal <= high, got {:?} / {:?} / {:?}",
                self.cache_ttl_low,
                self.cache_ttl_normal,
                self.cache_ttl_high
            );
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        if self.resolve_timeout.is_zero() || self.maintenance_interval.is_zero() {
            anyhow::bail!("Resolve timeout and maintenance interval must be greater than 0");
        }

        self.resolver_url()?;

        match &self.redis_url {
            Some(url) => {
                Url::parse(url).with_context(|| format!("Invalid REDIS_URL: '{}'", url))?;
            }
            None if self.stats_backend == StatsBackend::Redis => {
                anyhow::bail!("STATS_BACKEND=redis requires REDIS_URL");
            }
            None => {}
        }

        Ok(())
    }

    pub fn resolver_url(&self) -> Result<Url> {
        Url::parse(&self.resolver_url)
            .with_context(|| format!("Invalid RESOLVER_URL: '{}'", self.resolver_url))
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_items: self.cache_size,
            ttl_low: self.cache_ttl_low,
            ttl_normal: self.cache_ttl_normal,
            ttl_high: self.cache_ttl_high,
            update_age_on_get: self.cache_update_age_on_get,
        }
    }

    pub fn redis_config(&self) -> Option<RedisConfig> {
        self.redis_url
            .as_ref()
            .map(|url| RedisConfig::new(url.clone()).with_key_prefix(self.redis_key_prefix.clone()))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.redis_reconnect_attempts,
            base_delay: self.redis_reconnect_base_delay,
            ..ReconnectPolicy::default()
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Credentials embedded in `REDIS_URL` are never printed.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Cache: {} items, TTL {} / {} / {}\n  \
            Shared: {}\n  \
            Stats: {:?} ({})\n  \
            Resolver: {} (timeout {})\n  \
            Sources: {}\n  \
            Runtime: {} workers, maintenance every {}",
            self.cache_size,
            humantime::format_duration(self.cache_ttl_low),
            humantime::format_duration(self.cache_ttl_normal),
            humantime::format_duration(self.cache_ttl_high),
            self.redis_url
                .as_deref()
                .map(redact_url)
                .unwrap_or_else(|| "disabled".to_string()),
            self.stats_backend,
            self.data_dir.display(),
            self.resolver_url,
            humantime::format_duration(self.resolve_timeout),
            self.default_sources.join(","),
            self.worker_threads,
            humantime::format_duration(self.maintenance_interval),
        )
    }
}

/// Splits a comma separated source list, dropping blanks.
pub fn parse_source_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid>".to_string(),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            cache_size: 1000,
            cache_ttl_low: Duration::from_secs(300),
            cache_ttl_normal: Duration::from_secs(3600),
            cache_ttl_high: Duration::from_secs(21600),
            cache_update_age_on_get: false,

            redis_url: None,
            redis_key_prefix: "unblock:".to_string(),
            redis_reconnect_attempts: 5,
            redis_reconnect_base_delay: Duration::from_millis(500),

            stats_backend: StatsBackend::File,
            data_dir: "./data".into(),

            resolver_url: "http://127.0.0.1:8080".to_string(),
            resolve_timeout: Duration::from_secs(10),
            default_sources: parse_source_list("kugou,kuwo,migu,qq,bilibili,youtube"),

            maintenance_interval: Duration::from_secs(300),
            worker_threads: num_cpus::get(),
        }
    }
}
