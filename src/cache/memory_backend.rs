//! In-process [`SharedBackend`] used by tests and single-node setups.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};
use tokio::time::Instant;

use super::error::{CacheError, CacheResult};
use super::shared::{glob_match, SharedBackend};

/// A `HashMap` pretending to be a distributed store.
///
/// Availability can be toggled to simulate outages, and raw strings can be
/// injected to simulate entries written by another (possibly buggy) node.
#[derive(Debug)]
pub struct MemoryBackend {
    data: Mutex<HashMap<String, (String, Option<Instant>)>>,
    available: AtomicBool,
    connect_attempts: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            connect_attempts: AtomicU32::new(0),
        }
    }

    /// Simulates the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Stores `value` verbatim, bypassing availability and serialization.
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.data
            .lock()
            .insert(key.to_string(), (value.to_string(), None));
    }

    /// Reads a value verbatim, ignoring availability.
    pub fn peek_raw(&self, key: &str) -> Option<String> {
        self.data.lock().get(key).map(|(value, _)| value.clone())
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Connection("memory backend offline".to_string()))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedBackend for MemoryBackend {
    async fn connect(&self) -> CacheResult<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check_available()?;
        let mut data = self.data.lock();

        let expired = match data.get(key) {
            Some((_, Some(expires_at))) => Instant::now() >= *expires_at,
            Some((_, None)) => false,
            None => return Ok(None),
        };

        if expired {
            data.remove(key);
            return Ok(None);
        }
        Ok(data.get(key).map(|(value, _)| value.clone()))
    }

    async fn get_with_ttl(&self, key: &str) -> CacheResult<Option<(String, Option<Duration>)>> {
        self.check_available()?;
        let mut data = self.data.lock();
        let now = Instant::now();

        let Some((value, expires_at)) = data.get(key).cloned() else {
            return Ok(None);
        };

        match expires_at {
            Some(at) if now >= at => {
                data.remove(key);
                Ok(None)
            }
            Some(at) => Ok(Some((value, Some(at - now)))),
            None => Ok(Some((value, None))),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.check_available()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.data
            .lock()
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        self.check_available()?;
        let mut data = self.data.lock();
        Ok(keys.iter().filter(|k| data.remove(*k).is_some()).count() as u64)
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .data
            .lock()
            .iter()
            .filter(|(_, (_, expires_at))| expires_at.map_or(true, |at| now < at))
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
