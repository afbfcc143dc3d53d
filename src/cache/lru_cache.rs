use lru::LruCache;
use parking_lot::Mutex;
use std::{
    borrow::Borrow,
    hash::Hash,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

/// Entrada del cache local con expiración absoluta
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
            ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn touch(&mut self, now: Instant) {
        self.expires_at = now + self.ttl;
    }
}

/// Bounded, TTL-aware LRU map used as the in-process cache tier.
///
/// When full, inserting a new key evicts the least recently used entry
/// regardless of how much TTL it has left. Expired entries are dropped
/// lazily on access and in bulk by [`LRUCache::cleanup_expired`].
///
/// Clones share the same underlying storage.
#[derive(Debug)]
pub struct LRUCache<K: Hash + Eq, V> {
    data: Arc<Mutex<LruCache<K, CacheEntry<V>>>>,
    evictions: Arc<AtomicU64>,
    update_age_on_get: bool,
}

impl<K, V> LRUCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            data: Arc::new(Mutex::new(LruCache::new(capacity))),
            evictions: Arc::new(AtomicU64::new(0)),
            update_age_on_get: false,
        }
    }

    /// Reset an entry's age every time it is read.
    pub fn with_update_age_on_get(mut self, enabled: bool) -> Self {
        self.update_age_on_get = enabled;
        self
    }

    /// Inserts a value, returning the previous value stored under `key`.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) -> Option<V> {
        let mut data = self.data.lock();
        let pushed = data.push(key.clone(), CacheEntry::new(value, ttl));

        match pushed {
            Some((old_key, old)) if old_key == key => Some(old.value),
            Some(_) => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut data = self.data.lock();
        let now = Instant::now();

        if data.peek(key)?.is_expired(now) {
            data.pop(key);
            return None;
        }

        let entry = data.get_mut(key)?;
        if self.update_age_on_get {
            entry.touch(now);
        }
        Some(entry.value.clone())
    }

    /// Existence check that neither promotes the entry nor resets its age.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut data = self.data.lock();
        let expired = match data.peek(key) {
            Some(entry) => entry.is_expired(Instant::now()),
            None => return false,
        };

        if expired {
            data.pop(key);
        }
        !expired
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.data.lock().pop(key).map(|entry| entry.value)
    }

    /// Removes every key matching `predicate`, returning how many were dropped.
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let mut data = self.data.lock();
        let doomed: Vec<K> = data
            .iter()
            .filter(|(key, _)| predicate(*key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            data.pop(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.lock().cap().get()
    }

    /// Entries pushed out by capacity pressure since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.data.lock().clear();
    }

    /// Limpia entradas expiradas y retorna el número de elementos removidos
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let removed = self.remove_where_entry(|entry| entry.is_expired(now));

        if removed > 0 {
            debug!("Limpiadas {} entradas expiradas del cache", removed);
        }

        removed
    }

    fn remove_where_entry<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheEntry<V>) -> bool,
    {
        let mut data = self.data.lock();
        let doomed: Vec<K> = data
            .iter()
            .filter(|(_, entry)| predicate(*entry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            data.pop(key);
        }
        doomed.len()
    }
}

impl<K, V> Clone for LRUCache<K, V>
where
    K: Hash + Eq,
{
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            evictions: self.evictions.clone(),
            update_age_on_get: self.update_age_on_get,
        }
    }
}
