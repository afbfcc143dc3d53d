//! Shared (distributed) cache tier.
//!
//! [`SharedBackend`] is the minimal key/value contract a distributed store has
//! to offer. [`SharedTier`] wraps a backend and owns its connection lifecycle:
//! a reachable flag flipped by connect/error/close events and a bounded
//! exponential-backoff reconnect loop. Once the loop gives up the tier stays
//! dark and the cache runs local-only, which is a supported steady state.
//!
//! There is no read-your-own-write guarantee across processes sharing a
//! backend. Entries are short-lived and non-authoritative.

use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{CacheError, CacheResult};

/// Key/value operations the shared tier needs from a distributed store.
///
/// Keys are passed unprefixed; namespacing is the backend's job.
#[async_trait]
pub trait SharedBackend: Send + Sync + 'static {
    /// (Re)establishes the connection.
    async fn connect(&self) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Like [`SharedBackend::get`], plus the entry's remaining lifetime
    /// (`None` when it never expires). Both are read atomically.
    async fn get_with_ttl(&self, key: &str) -> CacheResult<Option<(String, Option<Duration>)>>;

    /// `ttl = None` stores the value without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Deletes the given keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> CacheResult<u64>;

    /// Returns every key matching a glob `pattern` (`*`, `?`, `\` escapes).
    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>>;

    fn name(&self) -> &'static str;
}

/// Bounded exponential backoff for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (zero based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

struct SharedTierInner {
    backend: Arc<dyn SharedBackend>,
    policy: ReconnectPolicy,
    op_timeout: Duration,
    reachable: AtomicBool,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
}

/// A shared backend plus its reachability state.
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct SharedTier {
    inner: Arc<SharedTierInner>,
}

impl SharedTier {
    /// `op_timeout` bounds every backend call; an elapsed timeout counts as
    /// a connection loss.
    pub fn new(
        backend: Arc<dyn SharedBackend>,
        policy: ReconnectPolicy,
        op_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SharedTierInner {
                backend,
                policy,
                op_timeout,
                reachable: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// First connection attempt. Failure starts the reconnect loop.
    pub async fn connect(&self) {
        let backend = self.inner.backend.name();
        match timeout(self.inner.op_timeout, self.inner.backend.connect()).await {
            Ok(Ok(())) => self.on_connected(),
            Ok(Err(e)) => {
                warn!("⚠️ Cache compartido {} no disponible: {}", backend, e);
                self.on_closed();
            }
            Err(_) => {
                warn!("⏰ Timeout conectando al cache compartido {}", backend);
                self.on_closed();
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Connection established (initially or after a reconnect).
    pub fn on_connected(&self) {
        if !self.inner.reachable.swap(true, Ordering::SeqCst) {
            info!("🔗 Cache compartido {} conectado", self.backend_name());
        }
    }

    /// Connection closed or lost: go dark and try to come back.
    pub fn on_closed(&self) {
        if self.inner.reachable.swap(false, Ordering::SeqCst) {
            warn!(
                "🔌 Cache compartido {} desconectado, usando solo cache local",
                self.backend_name()
            );
        }
        self.spawn_reconnect();
    }

    /// Stops any running reconnect loop. The tier stays in its current state.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.run(self.inner.backend.get(key)).await
    }

    pub async fn get_with_ttl(&self, key: &str) -> CacheResult<Option<(String, Option<Duration>)>> {
        self.run(self.inner.backend.get_with_ttl(key)).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.run(self.inner.backend.set(key, value, ttl)).await
    }

    pub async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run(self.inner.backend.del(keys)).await
    }

    pub async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.run(self.inner.backend.keys(pattern)).await
    }

    async fn run<T, F>(&self, op: F) -> CacheResult<T>
    where
        F: std::future::Future<Output = CacheResult<T>>,
    {
        if !self.is_available() {
            return Err(CacheError::Connection(format!(
                "{} no disponible",
                self.backend_name()
            )));
        }

        let result = match timeout(self.inner.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.inner.op_timeout)),
        };

        if let Err(e) = &result {
            if e.is_connection_loss() {
                self.on_closed();
            }
        }
        result
    }

    fn spawn_reconnect(&self) {
        if self.inner.policy.max_attempts == 0 || self.inner.shutdown.is_cancelled() {
            return;
        }
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let tier = self.clone();
        tokio::spawn(async move {
            tier.reconnect_loop().await;
            tier.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(&self) {
        let policy = &self.inner.policy;
        let backend = self.backend_name();

        for attempt in 0..policy.max_attempts {
            let base = policy.delay_for(attempt);
            let jitter_ms = fastrand::u64(0..=(base.as_millis() as u64 / 10));
            let delay = base + Duration::from_millis(jitter_ms);
            debug!(
                "🔄 Reintento {}/{} de conexión a {} en {:?}",
                attempt + 1,
                policy.max_attempts,
                backend,
                delay
            );

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match timeout(self.inner.op_timeout, self.inner.backend.connect()).await {
                Ok(Ok(())) => {
                    self.on_connected();
                    return;
                }
                Ok(Err(e)) => debug!("❌ Reconexión a {} falló: {}", backend, e),
                Err(_) => debug!("⏰ Timeout reconectando a {}", backend),
            }
        }

        warn!(
            "⚠️ Cache compartido {} inalcanzable tras {} intentos, continuando solo con cache local",
            backend, policy.max_attempts
        );
    }
}

impl std::fmt::Debug for SharedTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTier")
            .field("backend", &self.backend_name())
            .field("available", &self.is_available())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum GlobToken {
    Any,
    One,
    Literal(char),
}

fn tokenize(pattern: &str) -> Vec<GlobToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '*' => GlobToken::Any,
            '?' => GlobToken::One,
            '\\' => GlobToken::Literal(chars.next().unwrap_or('\\')),
            other => GlobToken::Literal(other),
        });
    }
    tokens
}

/// Matches `text` against a Redis-style glob (`*`, `?` and `\` escapes).
///
/// Character classes are not supported: `[` and `]` match themselves.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = tokenize(pattern);
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while t < text.len() {
        let single = match pattern.get(p) {
            Some(GlobToken::One) => true,
            Some(GlobToken::Literal(c)) => *c == text[t],
            _ => false,
        };

        if single {
            p += 1;
            t += 1;
        } else if pattern.get(p) == Some(&GlobToken::Any) {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }

    while pattern.get(p) == Some(&GlobToken::Any) {
        p += 1;
    }
    p == pattern.len()
}

/// Escapes every unescaped `[` and `]` in a glob so a backend with
/// character-class support (Redis `KEYS`) reads them literally, the way
/// [`glob_match`] does.
pub fn escape_brackets(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                escaped.push(c);
                if let Some(next) = chars.next() {
                    escaped.push(next);
                }
            }
            '[' | ']' => {
                escaped.push('\\');
                escaped.push(c);
            }
            other => escaped.push(other),
        }
    }
    escaped
}

/// Escapes glob metacharacters so `s` matches only itself.
pub fn escape_glob(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;

    const OP_TIMEOUT: Duration = Duration::from_secs(2);

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("song:1*", "song:1"));
        assert!(glob_match("song:1*", "song:1:kugou"));
        assert!(!glob_match("song:1*", "other:1"));
        assert!(glob_match("song:*:kugou", "song:42:kugou"));
        assert!(!glob_match("song:*:kugou", "song:42:kuwo"));
        assert!(glob_match("s?ng", "song"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn test_escape_glob_matches_literally() {
        let pattern = format!("{}*", escape_glob("q:a*b?"));
        assert!(glob_match(&pattern, "q:a*b?xyz"));
        assert!(!glob_match(&pattern, "q:aXXb?xyz"));
    }

    #[test]
    fn test_brackets_are_literal_in_both_tiers() {
        assert_eq!(escape_brackets("search:[ab]*"), "search:\\[ab\\]*");
        // already escaped brackets are left alone
        assert_eq!(escape_brackets("q:\\[x"), "q:\\[x");

        let pattern = escape_brackets("search:[ab]*");
        assert!(glob_match(&pattern, "search:[ab]1"));
        assert!(!glob_match(&pattern, "search:a1"));
        assert_eq!(glob_match("search:[ab]*", "search:[ab]1"), glob_match(&pattern, "search:[ab]1"));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = fast_policy(10);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_marks_available() {
        let backend = Arc::new(MemoryBackend::new());
        let tier = SharedTier::new(backend, fast_policy(3), OP_TIMEOUT);
        assert!(!tier.is_available());

        tier.connect().await;
        assert!(tier.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_outage() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let tier = SharedTier::new(backend.clone(), fast_policy(5), OP_TIMEOUT);

        tier.connect().await;
        assert!(!tier.is_available());

        backend.set_available(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(tier.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_bounded_attempts() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let tier = SharedTier::new(backend.clone(), fast_policy(3), OP_TIMEOUT);

        tier.connect().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!tier.is_available());
        // initial attempt + 3 retries
        assert_eq!(backend.connect_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_failure_flips_flag() {
        let backend = Arc::new(MemoryBackend::new());
        let tier = SharedTier::new(backend.clone(), fast_policy(0), OP_TIMEOUT);
        tier.connect().await;

        backend.set_available(false);
        assert!(tier.get("k").await.is_err());
        assert!(!tier.is_available());
        assert!(tier.set("k", "v", None).await.is_err());
    }
}
