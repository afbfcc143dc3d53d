//! # Cache Module
//!
//! Two-tier caching in front of the expensive upstream lookups.
//!
//! [`CacheStore`] unifies a bounded in-process LRU (always present) with an
//! optional shared tier (Redis, when configured and reachable) behind one
//! get/set/delete API. [`MusicCache`] sits on top and owns the key scheme for
//! songs, sources and searches so nothing else builds raw keys.
//!
//! ## Tiers
//!
//! - **Local**: [`LRUCache`], bounded by `CACHE_SIZE`, TTL per entry, evicts
//!   the least recently used entry when full.
//! - **Shared**: [`SharedTier`] over a [`SharedBackend`]. Hits are promoted into
//!   the local tier for whatever lifetime the shared entry has left, capped at
//!   the `Low` TTL. Failures are logged and swallowed; the store simply keeps
//!   serving from the local tier.
//!
//! ## TTL priorities
//!
//! | Priority | Default TTL | Typical use |
//! |----------|-------------|-------------|
//! | `Low`    | 5 minutes   | source match lists, search results |
//! | `Normal` | 1 hour      | resolved song info |
//! | `High`   | 6 hours     | rarely changing metadata |
//!
//! An explicit TTL in [`CacheOptions`] always wins over the priority default.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_unblock::cache::{CacheConfig, CacheOptions, CachePriority, CacheStore};
//!
//! # async fn example() {
//! let cache = CacheStore::new(CacheConfig::default());
//!
//! cache
//!     .set("song:1", &"https://example.com/1.mp3", CacheOptions::default())
//!     .await;
//!
//! let url: Option<String> = cache.get("song:1").await;
//! assert!(url.is_some());
//!
//! cache
//!     .set("search:foo", &vec!["1", "2"], CacheOptions::priority(CachePriority::Low))
//!     .await;
//! # }
//! ```

pub mod error;
pub mod lru_cache;
pub mod memory_backend;
pub mod music;
pub mod redis_backend;
pub mod shared;

pub use error::{CacheError, CacheResult};
pub use lru_cache::LRUCache;
pub use memory_backend::MemoryBackend;
pub use music::MusicCache;
pub use redis_backend::{RedisBackend, RedisConfig};
pub use shared::{ReconnectPolicy, SharedBackend, SharedTier};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::{debug, info, warn};

use shared::{escape_brackets, escape_glob, glob_match};

/// Named TTL tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Which tiers a write goes to. The local tier is always written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    /// In-process only.
    Local,
    /// In-process plus the shared tier, when it is reachable.
    #[default]
    Both,
}

/// Options for a single cache write.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheOptions {
    /// Overrides the priority-derived TTL when set.
    pub ttl: Option<Duration>,
    pub level: CacheLevel,
    pub priority: CachePriority,
}

impl CacheOptions {
    pub fn priority(priority: CachePriority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_level(mut self, level: CacheLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Local tier sizing and the TTL assigned to each priority.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_items: usize,
    pub ttl_low: Duration,
    pub ttl_normal: Duration,
    pub ttl_high: Duration,
    /// Refresh an entry's age whenever the local tier serves it.
    pub update_age_on_get: bool,
}

impl CacheConfig {
    pub fn ttl_for(&self, priority: CachePriority) -> Duration {
        match priority {
            CachePriority::Low => self.ttl_low,
            CachePriority::Normal => self.ttl_normal,
            CachePriority::High => self.ttl_high,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            ttl_low: Duration::from_secs(300),       // 5 minutos
            ttl_normal: Duration::from_secs(3600),   // 1 hora
            ttl_high: Duration::from_secs(6 * 3600), // 6 horas
            update_age_on_get: false,
        }
    }
}

/// Hit/miss counters plus a snapshot of the tiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 before any lookup.
    pub hit_rate: f64,
    pub local_entries: usize,
    pub local_capacity: usize,
    pub evictions: u64,
    pub shared_available: bool,
}

impl CacheStats {
    /// Hit rate rendered as a percentage with two decimals, e.g. `"50.00%"`.
    pub fn hit_rate_percent(&self) -> String {
        format!("{:.2}%", self.hit_rate * 100.0)
    }
}

/// Two-tier cache store.
///
/// All values go through `serde_json`, so anything `Serialize +
/// DeserializeOwned` can be cached and round-trips through the shared tier.
/// Writes are best effort and never fail the caller.
#[derive(Debug)]
pub struct CacheStore {
    local: LRUCache<String, Value>,
    shared: Option<SharedTier>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Local-only store.
    pub fn new(config: CacheConfig) -> Self {
        let local = LRUCache::new(config.max_items).with_update_age_on_get(config.update_age_on_get);
        info!(
            "🗄️ Cache local iniciado con capacidad de {} entradas",
            local.capacity()
        );

        Self {
            local,
            shared: None,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Store backed by a shared tier. The tier's connection is managed by the
    /// caller (see [`SharedTier::connect`]).
    pub fn with_shared(config: CacheConfig, shared: SharedTier) -> Self {
        let mut store = Self::new(config);
        info!("🔗 Cache compartido configurado: {}", shared.backend_name());
        store.shared = Some(shared);
        store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn shared_tier(&self) -> Option<&SharedTier> {
        self.shared.as_ref()
    }

    fn available_shared(&self) -> Option<&SharedTier> {
        self.shared.as_ref().filter(|tier| tier.is_available())
    }

    /// TTL a write with `options` will get.
    pub fn resolve_ttl(&self, options: &CacheOptions) -> Duration {
        options
            .ttl
            .unwrap_or_else(|| self.config.ttl_for(options.priority))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(value) = self.local.get(key) {
            match serde_json::from_value::<T>(value) {
                Ok(decoded) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("✅ Cache hit local: {}", key);
                    return Some(decoded);
                }
                Err(e) => {
                    warn!("⚠️ Valor local ilegible para {}: {}", key, e);
                    self.local.remove(key);
                }
            }
        }

        if let Some(decoded) = self.get_shared::<T>(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(decoded);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("❌ Cache miss: {}", key);
        None
    }

    async fn get_shared<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let tier = self.available_shared()?;

        let (raw, remaining) = match tier.get_with_ttl(key).await {
            Ok(Some(found)) => found,
            Ok(None) => return None,
            Err(e) => {
                debug!("Cache compartido no respondió para {}: {}", key, e);
                return None;
            }
        };

        let decoded = serde_json::from_str::<Value>(&raw).and_then(|value| {
            serde_json::from_value::<T>(value.clone()).map(|decoded| (value, decoded))
        });

        match decoded {
            Ok((value, decoded)) => {
                // A promoted copy never outlives the shared entry
                let ttl = remaining.map_or(self.config.ttl_low, |left| left.min(self.config.ttl_low));
                self.local.insert_with_ttl(key.to_string(), value, ttl);
                debug!("✅ Cache hit compartido, promovido a local: {}", key);
                Some(decoded)
            }
            Err(e) => {
                warn!("🗑️ Entrada corrupta en cache compartido {}: {}", key, e);
                if let Err(e) = tier.del(&[key.to_string()]).await {
                    warn!("No se pudo borrar la entrada corrupta {}: {}", key, e);
                }
                None
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: CacheOptions) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!("⚠️ No se pudo serializar {} para el cache: {}", key, e);
                return;
            }
        };
        let ttl = self.resolve_ttl(&options);

        if options.level == CacheLevel::Both {
            if let Some(tier) = self.available_shared() {
                let raw = value.to_string();
                if let Err(e) = tier.set(key, &raw, Some(ttl)).await {
                    warn!("⚠️ Error escribiendo {} en cache compartido: {}", key, e);
                }
            }
        }

        self.local.insert_with_ttl(key.to_string(), value, ttl);
        debug!("💾 Cacheado {} por {:?}", key, ttl);
    }

    /// Existence check. Does not touch hit/miss counters and does not promote
    /// shared entries.
    pub async fn has(&self, key: &str) -> bool {
        if self.local.contains(key) {
            return true;
        }
        match self.available_shared() {
            Some(tier) => matches!(tier.get(key).await, Ok(Some(_))),
            None => false,
        }
    }

    /// Removes `key` from both tiers. Idempotent.
    pub async fn delete(&self, key: &str) {
        self.local.remove(key);
        if let Some(tier) = self.available_shared() {
            if let Err(e) = tier.del(&[key.to_string()]).await {
                warn!("⚠️ Error borrando {} del cache compartido: {}", key, e);
            }
        }
    }

    /// Removes every key starting with `prefix` from both tiers and returns
    /// how many entries were dropped (local and shared counted separately).
    pub async fn delete_by_prefix(&self, prefix: &str) -> usize {
        let local = self.local.remove_where(|key| key.starts_with(prefix));
        let shared = self
            .delete_shared_matching(&format!("{}*", escape_glob(prefix)))
            .await;

        debug!("🧹 {} entradas borradas con prefijo {}", local + shared, prefix);
        local + shared
    }

    /// Like [`CacheStore::delete_by_prefix`] but with a glob (`*`, `?`).
    ///
    /// There are no character classes: `[` and `]` match themselves in both
    /// tiers.
    pub async fn delete_by_pattern(&self, pattern: &str) -> usize {
        let local = self.local.remove_where(|key| glob_match(pattern, key));
        let shared = self.delete_shared_matching(&escape_brackets(pattern)).await;

        debug!("🧹 {} entradas borradas con patrón {}", local + shared, pattern);
        local + shared
    }

    async fn delete_shared_matching(&self, pattern: &str) -> usize {
        let Some(tier) = self.available_shared() else {
            return 0;
        };

        let keys = match tier.keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("⚠️ Error listando claves {} en cache compartido: {}", pattern, e);
                return 0;
            }
        };

        match tier.del(&keys).await {
            Ok(deleted) => deleted as usize,
            Err(e) => {
                warn!("⚠️ Error borrando claves {} en cache compartido: {}", pattern, e);
                0
            }
        }
    }

    /// Drops expired local entries. The shared tier expires on its own.
    pub fn cleanup_expired(&self) -> usize {
        let removed = self.local.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
        removed
    }

    /// Empties the local tier and every key this store can see in the shared
    /// tier.
    pub async fn clear(&self) {
        self.local.clear();
        self.delete_shared_matching("*").await;
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        CacheStats {
            hits,
            misses,
            hit_rate,
            local_entries: self.local.len(),
            local_capacity: self.local.capacity(),
            evictions: self.local.evictions(),
            shared_available: self.available_shared().is_some(),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
