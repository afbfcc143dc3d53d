use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use super::{shared::escape_glob, CacheOptions, CachePriority, CacheStore};
use crate::sources::SongMatch;

/// Longest a source match list may live, whatever the caller asks for.
pub const SOURCE_MATCH_TTL_CAP: Duration = Duration::from_secs(3600);

/// Domain view over [`CacheStore`].
///
/// Owns the key scheme:
///
/// - `song:{id}`: resolved song info, source agnostic
/// - `song:{id}:{source}`: song info as resolved by one source
/// - `source:{id}`: sources known to resolve `id`
/// - `search:{query}`: search results, query normalized
///
/// Source availability changes faster than song metadata, so match lists are
/// written with low priority and a TTL capped at [`SOURCE_MATCH_TTL_CAP`].
#[derive(Debug, Clone)]
pub struct MusicCache {
    store: Arc<CacheStore>,
}

impl MusicCache {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn song_key(id: &str) -> String {
        format!("song:{}", id)
    }

    pub fn song_source_key(id: &str, source: &str) -> String {
        format!("song:{}:{}", id, source)
    }

    pub fn source_key(id: &str) -> String {
        format!("source:{}", id)
    }

    pub fn search_key(query: &str) -> String {
        format!("search:{}", normalize_search_query(query))
    }

    pub async fn cache_song_info(&self, id: &str, info: &SongMatch) {
        self.store
            .set(
                &Self::song_key(id),
                info,
                CacheOptions::priority(CachePriority::Normal),
            )
            .await;
    }

    pub async fn get_song_info(&self, id: &str) -> Option<SongMatch> {
        self.store.get(&Self::song_key(id)).await
    }

    pub async fn cache_song_source_info(&self, id: &str, source: &str, info: &SongMatch) {
        self.store
            .set(
                &Self::song_source_key(id, source),
                info,
                CacheOptions::priority(CachePriority::Normal),
            )
            .await;
    }

    pub async fn get_song_source_info(&self, id: &str, source: &str) -> Option<SongMatch> {
        self.store.get(&Self::song_source_key(id, source)).await
    }

    /// Caches the sources known to resolve `id`. `ttl` is capped at
    /// [`SOURCE_MATCH_TTL_CAP`]; without one the low-priority TTL applies.
    pub async fn cache_source_match_result(
        &self,
        id: &str,
        sources: &[String],
        ttl: Option<Duration>,
    ) {
        let mut options = CacheOptions::priority(CachePriority::Low);
        options.ttl = Some(
            ttl.unwrap_or_else(|| self.store.config().ttl_low)
                .min(SOURCE_MATCH_TTL_CAP),
        );

        self.store
            .set(&Self::source_key(id), sources, options)
            .await;
    }

    pub async fn get_source_match_result(&self, id: &str) -> Option<Vec<String>> {
        self.store.get(&Self::source_key(id)).await
    }

    /// Appends `source` to the match list of `id` if missing.
    ///
    /// Two concurrent calls may race and one append can be lost; the list is
    /// a hint, not a record.
    pub async fn add_source_match(&self, id: &str, source: &str) {
        let mut sources = self.get_source_match_result(id).await.unwrap_or_default();
        if sources.iter().any(|s| s == source) {
            return;
        }
        sources.push(source.to_string());
        self.cache_source_match_result(id, &sources, None).await;
    }

    pub async fn cache_search_result(&self, query: &str, results: &[SongMatch]) {
        self.store
            .set(
                &Self::search_key(query),
                results,
                CacheOptions::priority(CachePriority::Low),
            )
            .await;
    }

    pub async fn get_search_result(&self, query: &str) -> Option<Vec<SongMatch>> {
        self.store.get(&Self::search_key(query)).await
    }

    /// Drops `song:{id}`, every `song:{id}:*` entry and `source:{id}`.
    pub async fn clear_song_cache(&self, id: &str) {
        let song_key = Self::song_key(id);
        self.store.delete(&song_key).await;
        let removed = self
            .store
            .delete_by_prefix(&format!("{}:", song_key))
            .await;
        self.store.delete(&Self::source_key(id)).await;

        info!("🗑️ Cache de la canción {} limpiado ({} variantes)", id, removed);
    }

    /// Drops every source-specific song entry resolved through `source`.
    pub async fn clear_source_cache(&self, source: &str) -> usize {
        let pattern = format!("song:*:{}", escape_glob(source));
        let removed = self.store.delete_by_pattern(&pattern).await;

        info!("🗑️ Cache de la fuente {} limpiado: {} entradas", source, removed);
        removed
    }
}

/// Lowercases and collapses whitespace so equivalent queries share a key.
fn normalize_search_query(query: &str) -> String {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    debug!("🔍 Query normalizada: '{}' -> '{}'", query, normalized);
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use pretty_assertions::assert_eq;

    fn song(source: &str) -> SongMatch {
        SongMatch {
            url: format!("https://{}.example/1.mp3", source),
            source: source.to_string(),
            br: Some(320_000),
            size: None,
            md5: None,
        }
    }

    fn music_cache() -> MusicCache {
        MusicCache::new(Arc::new(CacheStore::new(CacheConfig::default())))
    }

    #[test]
    fn test_key_scheme() {
        assert_eq!(MusicCache::song_key("1"), "song:1");
        assert_eq!(MusicCache::song_source_key("1", "kugou"), "song:1:kugou");
        assert_eq!(MusicCache::source_key("1"), "source:1");
        assert_eq!(MusicCache::search_key("  Hello   World "), "search:hello world");
    }

    #[tokio::test]
    async fn test_song_info_round_trip() {
        let cache = music_cache();
        cache.cache_song_info("1", &song("kugou")).await;
        cache.cache_song_source_info("1", "kuwo", &song("kuwo")).await;

        assert_eq!(cache.get_song_info("1").await, Some(song("kugou")));
        assert_eq!(
            cache.get_song_source_info("1", "kuwo").await,
            Some(song("kuwo"))
        );
        assert_eq!(cache.get_song_source_info("1", "migu").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_match_ttl_is_capped() {
        let cache = music_cache();
        cache
            .cache_source_match_result("1", &["kugou".to_string()], Some(Duration::from_secs(86400)))
            .await;

        tokio::time::advance(SOURCE_MATCH_TTL_CAP + Duration::from_secs(1)).await;
        assert_eq!(cache.get_source_match_result("1").await, None);
    }

    #[tokio::test]
    async fn test_add_source_match_dedups() {
        let cache = music_cache();
        cache.add_source_match("1", "kugou").await;
        cache.add_source_match("1", "kuwo").await;
        cache.add_source_match("1", "kugou").await;

        assert_eq!(
            cache.get_source_match_result("1").await,
            Some(vec!["kugou".to_string(), "kuwo".to_string()])
        );
    }

    #[tokio::test]
    async fn test_clear_song_cache() {
        let cache = music_cache();
        cache.cache_song_info("1", &song("kugou")).await;
        cache.cache_song_source_info("1", "kugou", &song("kugou")).await;
        cache.add_source_match("1", "kugou").await;
        cache.cache_song_info("10", &song("kuwo")).await;

        cache.clear_song_cache("1").await;

        assert_eq!(cache.get_song_info("1").await, None);
        assert_eq!(cache.get_song_source_info("1", "kugou").await, None);
        assert_eq!(cache.get_source_match_result("1").await, None);
        assert_eq!(cache.get_song_info("10").await, Some(song("kuwo")));
    }

    #[tokio::test]
    async fn test_clear_song_cache_reaches_shared_tier() {
        use crate::cache::{MemoryBackend, ReconnectPolicy, SharedTier};

        let backend = Arc::new(MemoryBackend::new());
        let tier = SharedTier::new(
            backend.clone(),
            ReconnectPolicy {
                max_attempts: 0,
                ..ReconnectPolicy::default()
            },
            Duration::from_secs(1),
        );
        tier.connect().await;
        let cache = MusicCache::new(Arc::new(CacheStore::with_shared(CacheConfig::default(), tier)));

        cache.cache_song_info("1", &song("kugou")).await;
        cache.add_source_match("1", "kugou").await;
        cache.cache_song_info("10", &song("kuwo")).await;
        // variant cached by another node only
        backend.insert_raw("song:1:qq", &serde_json::to_string(&song("qq")).unwrap());
        backend.insert_raw("other:1", "\"keep\"");

        cache.clear_song_cache("1").await;

        assert_eq!(backend.peek_raw("song:1"), None);
        assert_eq!(backend.peek_raw("song:1:qq"), None);
        assert_eq!(backend.peek_raw("source:1"), None);
        assert!(backend.peek_raw("song:10").is_some());
        assert_eq!(backend.peek_raw("other:1").as_deref(), Some("\"keep\""));
        assert_eq!(cache.get_song_source_info("1", "qq").await, None);
    }

    #[tokio::test]
    async fn test_clear_source_cache() {
        let cache = music_cache();
        cache.cache_song_source_info("1", "kugou", &song("kugou")).await;
        cache.cache_song_source_info("2", "kugou", &song("kugou")).await;
        cache.cache_song_source_info("2", "kuwo", &song("kuwo")).await;

        assert_eq!(cache.clear_source_cache("kugou").await, 2);
        assert_eq!(cache.get_song_source_info("2", "kugou").await, None);
        assert_eq!(
            cache.get_song_source_info("2", "kuwo").await,
            Some(song("kuwo"))
        );
    }

    #[tokio::test]
    async fn test_search_results() {
        let cache = music_cache();
        cache
            .cache_search_result("Jay Chou", &[song("kugou"), song("qq")])
            .await;

        let found = cache.get_search_result("jay   chou").await;
        assert_eq!(found.map(|r| r.len()), Some(2));
    }
}
