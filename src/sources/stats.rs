use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{seeded_quality, DEFAULT_QUALITY_SEEDS};
use crate::storage::{StatsSnapshot, StatsStore, StorageError};

/// Outcome history of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub total_requests: u64,
    /// Successful requests. Never exceeds `total_requests`.
    pub available_count: u64,
    /// Running mean over successful requests only.
    pub avg_response_time_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// `available_count / total_requests`, 0 with no requests.
    pub success_rate: f64,
    /// Static 0-100 audio quality rating.
    pub quality_score: u8,
}

impl SourceStats {
    pub fn seeded(quality_score: u8) -> Self {
        Self {
            total_requests: 0,
            available_count: 0,
            avg_response_time_ms: 0.0,
            last_success_at: None,
            last_failure_at: None,
            success_rate: 0.0,
            quality_score: quality_score.min(100),
        }
    }

    fn record(&mut self, success: bool, response_time_ms: f64, now: DateTime<Utc>) {
        self.total_requests += 1;

        if success {
            self.available_count += 1;
            self.last_success_at = Some(now);

            // Failed calls carry no useful latency, only successes feed the mean
            let n = self.available_count as f64;
            self.avg_response_time_ms =
                (self.avg_response_time_ms * (n - 1.0) + response_time_ms) / n;
        } else {
            self.last_failure_at = Some(now);
        }

        self.recompute_success_rate();
    }

    fn recompute_success_rate(&mut self) {
        self.success_rate = if self.total_requests == 0 {
            0.0
        } else {
            self.available_count as f64 / self.total_requests as f64
        };
    }

    /// Repairs a snapshot loaded from disk so the invariants hold again.
    fn sanitized(mut self) -> Self {
        self.available_count = self.available_count.min(self.total_requests);
        if !self.avg_response_time_ms.is_finite() || self.avg_response_time_ms < 0.0 {
            self.avg_response_time_ms = 0.0;
        }
        self.quality_score = self.quality_score.min(100);
        self.recompute_success_rate();
        self
    }
}

/// Single source of truth for how each source has performed.
///
/// Mutations happen synchronously under the per-key [`DashMap`] lock, so two
/// concurrent `record_result` calls for the same source never lose an
/// increment. Persistence runs afterwards; saves are serialized and each one
/// writes the newest table. A failing store only costs durability: stats keep
/// working in memory.
pub struct SourceStatsRegistry {
    stats: DashMap<String, SourceStats>,
    seeds: Vec<(String, u8)>,
    store: Arc<dyn StatsStore>,
    persist_lock: Mutex<()>,
}

impl SourceStatsRegistry {
    /// Registry seeded with [`DEFAULT_QUALITY_SEEDS`], without loading anything.
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        Self::with_seeds(store, DEFAULT_QUALITY_SEEDS)
    }

    pub fn with_seeds(store: Arc<dyn StatsStore>, seeds: &[(&str, u8)]) -> Self {
        let registry = Self {
            stats: DashMap::new(),
            seeds: seeds
                .iter()
                .map(|(id, score)| (id.to_string(), *score))
                .collect(),
            store,
            persist_lock: Mutex::new(()),
        };
        registry.seed_all();
        registry
    }

    /// Seeds, then overlays whatever snapshot the store holds.
    pub async fn load(store: Arc<dyn StatsStore>) -> Self {
        let registry = Self::new(store);
        registry.restore().await;
        registry
    }

    /// Overlays the persisted snapshot on the current table. A missing or
    /// unreadable snapshot leaves the seeds in place.
    pub async fn restore(&self) {
        match self.store.load_all().await {
            Ok(snapshot) => {
                let count = snapshot.len();
                for (id, stats) in snapshot {
                    self.stats.insert(id, stats.sanitized());
                }
                info!(
                    "📂 Cargadas estadísticas de {} fuentes desde {}",
                    count,
                    self.store.describe()
                );
            }
            Err(e) => warn!(
                "⚠️ No se pudieron cargar estadísticas desde {}: {}, usando valores iniciales",
                self.store.describe(),
                e
            ),
        }
    }

    fn seed_quality(&self, source_id: &str) -> u8 {
        let seeds: Vec<(&str, u8)> = self
            .seeds
            .iter()
            .map(|(id, score)| (id.as_str(), *score))
            .collect();
        seeded_quality(&seeds, source_id)
    }

    fn is_seeded(&self, source_id: &str) -> bool {
        self.seeds.iter().any(|(id, _)| id == source_id)
    }

    fn seed_all(&self) {
        for (id, score) in &self.seeds {
            self.stats.insert(id.clone(), SourceStats::seeded(*score));
        }
    }

    /// Records one resolution attempt and persists the table.
    ///
    /// Returns the updated stats of `source_id`.
    pub async fn record_result(
        &self,
        source_id: &str,
        success: bool,
        response_time_ms: f64,
    ) -> SourceStats {
        let response_time_ms = if response_time_ms.is_finite() {
            response_time_ms.max(0.0)
        } else {
            0.0
        };

        let updated = {
            let mut entry = self
                .stats
                .entry(source_id.to_string())
                .or_insert_with(|| SourceStats::seeded(self.seed_quality(source_id)));
            entry.record(success, response_time_ms, Utc::now());
            entry.clone()
        };

        debug!(
            "📈 {} {} en {:.0}ms (éxito {:.0}%)",
            source_id,
            if success { "ok" } else { "falló" },
            response_time_ms,
            updated.success_rate * 100.0
        );

        self.persist().await;
        updated
    }

    pub fn get(&self, source_id: &str) -> Option<SourceStats> {
        self.stats.get(source_id).map(|entry| entry.clone())
    }

    pub fn get_all(&self) -> StatsSnapshot {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Resets one source (or every source with `None`) to its seed values.
    pub async fn reset_stats(&self, source_id: Option<&str>) {
        match source_id {
            Some(id) => {
                let quality = self.seed_quality(id);
                self.stats.insert(id.to_string(), SourceStats::seeded(quality));
                info!("🔄 Estadísticas de {} reiniciadas", id);
            }
            None => {
                // In place, so seeded sources never vanish mid-reset
                self.stats.retain(|id, _| self.is_seeded(id));
                for mut entry in self.stats.iter_mut() {
                    let quality = self.seed_quality(entry.key());
                    *entry.value_mut() = SourceStats::seeded(quality);
                }
                for (id, score) in &self.seeds {
                    self.stats
                        .entry(id.clone())
                        .or_insert_with(|| SourceStats::seeded(*score));
                }
                info!("🔄 Estadísticas de todas las fuentes reiniciadas");
            }
        }
        self.persist().await;
    }

    /// Writes the current table to the store.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.get_all();
        self.store.save_all(&snapshot).await
    }

    async fn persist(&self) {
        if let Err(e) = self.flush().await {
            warn!(
                "⚠️ Error guardando estadísticas en {}: {}",
                self.store.describe(),
                e
            );
        }
    }
}

impl std::fmt::Debug for SourceStatsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStatsRegistry")
            .field("sources", &self.stats.len())
            .field("store", &self.store.describe())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn registry() -> (SourceStatsRegistry, Arc<MemoryStorage>) {
        let store = Arc::new(MemoryStorage::new());
        (SourceStatsRegistry::new(store.clone()), store)
    }

    #[test]
    fn test_known_sources_are_seeded() {
        let (registry, _) = registry();
        let kugou = registry.get("kugou").unwrap();
        assert_eq!(kugou.quality_score, 80);
        assert_eq!(kugou.total_requests, 0);
        assert_eq!(kugou.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_running_average_over_successes() {
        let (registry, _) = registry();
        for latency in [100.0, 200.0, 300.0] {
            registry.record_result("kugou", true, latency).await;
        }
        registry.record_result("kugou", false, 5000.0).await;

        let stats = registry.get("kugou").unwrap();
        assert_eq!(stats.avg_response_time_ms, 200.0);
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.available_count, 3);
        assert_eq!(stats.success_rate, 0.75);
        assert!(stats.last_success_at.is_some());
        assert!(stats.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_counters_are_monotonic() {
        let (registry, _) = registry();
        let outcomes = [true, false, false, true, false, true, true];

        let mut previous = 0;
        for (i, success) in outcomes.iter().enumerate() {
            let stats = registry.record_result("kuwo", *success, 120.0).await;
            assert!(stats.total_requests >= previous);
            assert_eq!(stats.total_requests, i as u64 + 1);
            assert!(stats.available_count <= stats.total_requests);
            previous = stats.total_requests;
        }
    }

    #[tokio::test]
    async fn test_unknown_source_created_lazily() {
        let (registry, _) = registry();
        assert!(registry.get("newcomer").is_none());

        registry.record_result("newcomer", false, 0.0).await;

        let stats = registry.get("newcomer").unwrap();
        assert_eq!(stats.quality_score, crate::sources::NEUTRAL_QUALITY_SCORE);
        assert_eq!(stats.total_requests, 1);
    }

    #[tokio::test]
    async fn test_reset_single_source() {
        let (registry, _) = registry();
        for _ in 0..3 {
            registry.record_result("kugou", false, 0.0).await;
        }
        registry.record_result("kuwo", true, 90.0).await;

        registry.reset_stats(Some("kugou")).await;

        let kugou = registry.get("kugou").unwrap();
        assert_eq!(kugou.total_requests, 0);
        assert_eq!(kugou.quality_score, 80);
        assert_eq!(registry.get("kuwo").unwrap().total_requests, 1);
    }

    #[tokio::test]
    async fn test_reset_all_sources() {
        let (registry, _) = registry();
        registry.record_result("kuwo", true, 90.0).await;
        registry.record_result("newcomer", true, 90.0).await;

        registry.reset_stats(None).await;

        assert_eq!(registry.get("kuwo").unwrap().total_requests, 0);
        assert!(registry.get("newcomer").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reset_all_never_drops_seeded_sources() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);

        let resetter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    registry.reset_stats(None).await;
                }
            })
        };

        while !resetter.is_finished() {
            assert!(registry.get("qq").is_some(), "seeded source missing during reset");
            tokio::task::yield_now().await;
        }
        resetter.await.unwrap();
    }

    #[tokio::test]
    async fn test_record_after_reset_all_is_kept() {
        let (registry, _) = registry();
        registry.record_result("kugou", false, 0.0).await;

        registry.reset_stats(None).await;
        registry.record_result("kugou", true, 100.0).await;

        let kugou = registry.get("kugou").unwrap();
        assert_eq!(kugou.total_requests, 1);
        assert_eq!(kugou.available_count, 1);
        assert_eq!(kugou.quality_score, 80);
    }

    #[tokio::test]
    async fn test_every_mutation_is_persisted() {
        let (registry, store) = registry();
        registry.record_result("migu", true, 250.0).await;

        let saved = store.snapshot();
        assert_eq!(saved.get("migu").unwrap().total_requests, 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_stats_in_memory() {
        let (registry, store) = registry();
        store.set_fail_saves(true);

        let stats = registry.record_result("migu", true, 250.0).await;

        assert_eq!(stats.total_requests, 1);
        assert_eq!(registry.get("migu").unwrap().total_requests, 1);
        assert!(registry.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_load_overlays_snapshot_on_seeds() {
        let mut saved = StatsSnapshot::new();
        let mut kugou = SourceStats::seeded(80);
        kugou.total_requests = 10;
        // corrupt: more successes than requests
        kugou.available_count = 12;
        saved.insert("kugou".to_string(), kugou);

        let registry = SourceStatsRegistry::load(Arc::new(MemoryStorage::with_snapshot(saved))).await;

        let kugou = registry.get("kugou").unwrap();
        assert_eq!(kugou.available_count, 10);
        assert_eq!(kugou.success_rate, 1.0);
        // untouched seeds remain
        assert_eq!(registry.get("qq").unwrap().quality_score, 90);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_do_not_lose_updates() {
        let (registry, store) = registry();
        let registry = Arc::new(registry);

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.record_result("kugou", i % 2 == 0, 100.0).await;
                })
            })
            .collect();
        futures::future::join_all(tasks).await;

        let stats = registry.get("kugou").unwrap();
        assert_eq!(stats.total_requests, 50);
        assert_eq!(stats.available_count, 25);
        // the last save always carries the newest table
        assert_eq!(store.snapshot().get("kugou").unwrap().total_requests, 50);
    }
}
