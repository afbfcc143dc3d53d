use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::cache::MusicCache;
use crate::sources::{
    NetworkClass, ResolveError, Resolver, SongMatch, SourceRanker, SourceStatsRegistry,
};

/// Outcome of a successful [`ResolutionService::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub track_id: String,
    pub song: SongMatch,
    /// Served from cache without asking the upstream.
    pub cached: bool,
    /// Upstream calls made, 0 on a cache hit.
    pub attempts: usize,
}

/// Cache, ranking, upstream call and bookkeeping for one track.
///
/// Two concurrent requests for the same uncached track may both reach the
/// upstream; re-resolution is idempotent so there is no per-track lock.
pub struct ResolutionService {
    cache: MusicCache,
    registry: Arc<SourceStatsRegistry>,
    ranker: SourceRanker,
    resolver: Arc<dyn Resolver>,
    attempt_timeout: Duration,
}

impl ResolutionService {
    pub fn new(
        cache: MusicCache,
        registry: Arc<SourceStatsRegistry>,
        resolver: Arc<dyn Resolver>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            ranker: SourceRanker::new(registry.clone()),
            registry,
            resolver,
            attempt_timeout,
        }
    }

    pub fn cache(&self) -> &MusicCache {
        &self.cache
    }

    pub fn ranker(&self) -> &SourceRanker {
        &self.ranker
    }

    pub fn registry(&self) -> &SourceStatsRegistry {
        &self.registry
    }

    /// Resolves `track_id` to a playable match.
    ///
    /// Sources are tried one at a time in ranked order, each under
    /// `attempt_timeout`. Every attempt is recorded in the registry,
    /// a timeout as a failure.
    pub async fn resolve(
        &self,
        track_id: &str,
        candidates: &[String],
        network: NetworkClass,
    ) -> Result<Resolution, ResolveError> {
        if let Some(song) = self.cache.get_song_info(track_id).await {
            debug!("🎯 {} servido desde caché ({})", track_id, song.source);
            return Ok(Resolution {
                track_id: track_id.to_string(),
                song,
                cached: true,
                attempts: 0,
            });
        }

        let order = self.attempt_order(track_id, candidates, network).await;
        if order.is_empty() {
            return Err(ResolveError::NoSources(track_id.to_string()));
        }

        let mut last_error = ResolveError::NotFound(track_id.to_string());
        for (attempt, source_id) in order.iter().enumerate() {
            match self.try_source(track_id, source_id).await {
                Ok(song) => {
                    self.remember(track_id, source_id, &song).await;
                    info!(
                        "✅ {} resuelto con {} (intento {}/{})",
                        track_id,
                        source_id,
                        attempt + 1,
                        order.len()
                    );
                    return Ok(Resolution {
                        track_id: track_id.to_string(),
                        song,
                        cached: false,
                        attempts: attempt + 1,
                    });
                }
                Err(e) => {
                    debug!("❌ {} falló con {}: {}", track_id, source_id, e);
                    last_error = e;
                }
            }
        }

        warn!("⚠️ Ninguna fuente pudo resolver {}", track_id);
        Err(ResolveError::Exhausted {
            track_id: track_id.to_string(),
            attempts: order.len(),
            last: Box::new(last_error),
        })
    }

    /// Drops everything cached for `track_id`.
    pub async fn invalidate(&self, track_id: &str) {
        self.cache.clear_song_cache(track_id).await;
    }

    /// Network-adjusted ranking with sources known to have resolved this
    /// track moved to the front.
    ///
    /// When the network filter leaves nothing, the unadjusted ranking is used
    /// so constrained clients still get an answer.
    async fn attempt_order(
        &self,
        track_id: &str,
        candidates: &[String],
        network: NetworkClass,
    ) -> Vec<String> {
        let mut order = self.ranker.adjust_sources_for_network(candidates, network);
        if order.is_empty() && !candidates.is_empty() {
            debug!("📶 Filtro de red {} vació la lista, usando orden base", network);
            order = self.ranker.rank_sources(candidates);
        }

        if let Some(known) = self.cache.get_source_match_result(track_id).await {
            let (mut preferred, rest): (Vec<_>, Vec<_>) =
                order.into_iter().partition(|id| known.contains(id));
            preferred.extend(rest);
            order = preferred;
        }

        order
    }

    async fn try_source(&self, track_id: &str, source_id: &str) -> Result<SongMatch, ResolveError> {
        let sources = [source_id.to_string()];
        let started = Instant::now();

        let outcome = match timeout(self.attempt_timeout, self.resolver.resolve(track_id, &sources)).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout {
                track_id: track_id.to_string(),
                source_id: source_id.to_string(),
                timeout: self.attempt_timeout,
            }),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.registry
            .record_result(source_id, outcome.is_ok(), elapsed_ms)
            .await;

        outcome
    }

    async fn remember(&self, track_id: &str, source_id: &str, song: &SongMatch) {
        self.cache.cache_song_info(track_id, song).await;
        self.cache
            .cache_song_source_info(track_id, source_id, song)
            .await;
        self.cache.add_source_match(track_id, source_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheStore};
    use crate::sources::MockResolver;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn song(source: &str) -> SongMatch {
        SongMatch {
            url: format!("https://{}.example/track.mp3", source),
            source: source.to_string(),
            br: Some(320_000),
            size: None,
            md5: None,
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn service(resolver: impl Resolver + 'static, seeds: &[(&str, u8)]) -> ResolutionService {
        let cache = MusicCache::new(Arc::new(CacheStore::new(CacheConfig::default())));
        let registry = Arc::new(SourceStatsRegistry::with_seeds(
            Arc::new(MemoryStorage::new()),
            seeds,
        ));
        ResolutionService::new(cache, registry, Arc::new(resolver), TIMEOUT)
    }

    #[tokio::test]
    async fn test_falls_through_to_next_source() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve()
            .times(2)
            .returning(|track_id: &str, sources: &[String]| match sources[0].as_str() {
                "a" => Err(ResolveError::NotFound(track_id.to_string())),
                other => Ok(song(other)),
            });
        let service = service(resolver, &[("a", 90), ("b", 70)]);

        let resolution = service
            .resolve("1", &ids(&["b", "a"]), NetworkClass::Wifi)
            .await
            .unwrap();

        assert_eq!(resolution.song.source, "b");
        assert_eq!(resolution.attempts, 2);
        assert!(!resolution.cached);

        let a = service.registry().get("a").unwrap();
        assert_eq!((a.total_requests, a.available_count), (1, 0));
        let b = service.registry().get("b").unwrap();
        assert_eq!((b.total_requests, b.available_count), (1, 1));

        let cache = service.cache();
        assert_eq!(cache.get_song_source_info("1", "b").await, Some(song("b")));
        assert_eq!(cache.get_source_match_result("1").await, Some(ids(&["b"])));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_upstream() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|_: &str, sources: &[String]| Ok(song(&sources[0])));
        let service = service(resolver, &[("a", 90)]);

        let first = service.resolve("1", &ids(&["a"]), NetworkClass::Wifi).await.unwrap();
        let second = service.resolve("1", &ids(&["a"]), NetworkClass::Wifi).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.attempts, 0);
        assert_eq!(second.song, first.song);
        assert_eq!(service.registry().get("a").unwrap().total_requests, 1);
    }

    #[tokio::test]
    async fn test_known_source_is_tried_first() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|_: &str, sources: &[String]| {
                assert_eq!(sources, ["b".to_string()]);
                Ok(song("b"))
            });
        let service = service(resolver, &[("a", 95), ("b", 60)]);
        service.cache().add_source_match("1", "b").await;

        let resolution = service
            .resolve("1", &ids(&["a", "b"]), NetworkClass::Wifi)
            .await
            .unwrap();
        assert_eq!(resolution.attempts, 1);
    }

    #[tokio::test]
    async fn test_all_sources_failing() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve()
            .times(2)
            .returning(|_: &str, _: &[String]| Err(ResolveError::Upstream("HTTP 502".into())));
        let service = service(resolver, &[("a", 90), ("b", 70)]);

        let err = service
            .resolve("1", &ids(&["a", "b"]), NetworkClass::Wifi)
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::Exhausted { attempts: 2, .. }));
        assert_eq!(service.registry().get("a").unwrap().total_requests, 1);
        assert_eq!(service.registry().get("b").unwrap().total_requests, 1);
        assert_eq!(service.cache().get_song_info("1").await, None);
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve().times(0);
        let service = service(resolver, &[]);

        let err = service.resolve("1", &[], NetworkClass::Wifi).await.unwrap_err();
        assert!(matches!(err, ResolveError::NoSources(id) if id == "1"));
    }

    #[tokio::test]
    async fn test_network_filter_emptying_list_falls_back() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|_: &str, sources: &[String]| Ok(song(&sources[0])));
        let service = service(resolver, &[("heavy", 95)]);
        service.registry().record_result("heavy", true, 900.0).await;

        let resolution = service
            .resolve("1", &ids(&["heavy"]), NetworkClass::TwoG)
            .await
            .unwrap();
        assert_eq!(resolution.song.source, "heavy");
    }

    /// Never answers in time.
    struct StalledResolver;

    #[async_trait]
    impl Resolver for StalledResolver {
        async fn resolve(&self, _track_id: &str, _sources: &[String]) -> Result<SongMatch, ResolveError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ResolveError::Upstream("unreachable".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let service = service(StalledResolver, &[("slow", 80)]);

        let err = service
            .resolve("1", &ids(&["slow"]), NetworkClass::Wifi)
            .await
            .unwrap_err();

        match err {
            ResolveError::Exhausted { last, .. } => {
                assert!(matches!(*last, ResolveError::Timeout { ref source_id, .. } if source_id == "slow"))
            }
            other => panic!("unexpected error: {other}"),
        }

        let stats = service.registry().get("slow").unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.available_count, 0);
        assert!(stats.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_resolution() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve()
            .times(2)
            .returning(|_: &str, sources: &[String]| Ok(song(&sources[0])));
        let service = service(resolver, &[("a", 90)]);

        service.resolve("1", &ids(&["a"]), NetworkClass::Wifi).await.unwrap();
        service.invalidate("1").await;
        let again = service.resolve("1", &ids(&["a"]), NetworkClass::Wifi).await.unwrap();

        assert!(!again.cached);
    }
}
