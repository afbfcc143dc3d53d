use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::cache::{CacheError, SharedTier};
use crate::sources::SourceStats;

/// Snapshot of every source's statistics, keyed by source id.
pub type StatsSnapshot = BTreeMap<String, SourceStats>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] CacheError),
}

/// Durable side-store for source statistics.
///
/// `load_all` on a store that has never been written returns an empty
/// snapshot, not an error.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn load_all(&self) -> Result<StatsSnapshot, StorageError>;

    async fn save_all(&self, stats: &StatsSnapshot) -> Result<(), StorageError>;

    fn describe(&self) -> String;
}

/// Manager de almacenamiento basado en archivos JSON
///
/// Writes go to a temp file that is renamed over the snapshot, so a crash
/// mid-write leaves the previous snapshot intact.
#[derive(Debug)]
pub struct JsonStorage {
    file_path: PathBuf,
}

impl JsonStorage {
    pub const FILE_NAME: &'static str = "source_stats.json";

    pub async fn new(data_dir: PathBuf) -> Result<Self, StorageError> {
        // Crear directorio de datos si no existe
        fs::create_dir_all(&data_dir).await?;
        info!("📁 Storage inicializado en: {}", data_dir.display());

        Ok(Self {
            file_path: data_dir.join(Self::FILE_NAME),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn temp_path(&self) -> PathBuf {
        self.file_path.with_extension("json.tmp")
    }
}

#[async_trait]
impl StatsStore for JsonStorage {
    async fn load_all(&self) -> Result<StatsSnapshot, StorageError> {
        let content = match fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Sin snapshot previo en {}", self.file_path.display());
                return Ok(StatsSnapshot::new());
            }
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(StatsSnapshot::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save_all(&self, stats: &StatsSnapshot) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(stats)?;
        let temp = self.temp_path();

        fs::write(&temp, content).await?;
        fs::rename(&temp, &self.file_path).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.file_path.display())
    }
}

/// Stats kept as one JSON blob under a single key of the shared tier.
///
/// Calls go through [`SharedTier`], so each one is bounded by the tier's
/// operation timeout and fails fast while the backend is unreachable.
#[derive(Debug)]
pub struct SharedStorage {
    tier: SharedTier,
    key: String,
}

impl SharedStorage {
    pub fn new(tier: SharedTier, key: impl Into<String>) -> Self {
        Self {
            tier,
            key: key.into(),
        }
    }
}

#[async_trait]
impl StatsStore for SharedStorage {
    async fn load_all(&self) -> Result<StatsSnapshot, StorageError> {
        match self.tier.get(&self.key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(StatsSnapshot::new()),
        }
    }

    async fn save_all(&self, stats: &StatsSnapshot) -> Result<(), StorageError> {
        let raw = serde_json::to_string(stats)?;
        self.tier.set(&self.key, &raw, None).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.tier.backend_name(), self.key)
    }
}

/// Volatile store: stats survive only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<StatsSnapshot>,
    fail_saves: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing snapshot, as if it had been persisted earlier.
    pub fn with_snapshot(snapshot: StatsSnapshot) -> Self {
        Self {
            data: Mutex::new(snapshot),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent save fail, to exercise degraded mode.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.data.lock().clone()
    }
}

#[async_trait]
impl StatsStore for MemoryStorage {
    async fn load_all(&self) -> Result<StatsSnapshot, StorageError> {
        Ok(self.snapshot())
    }

    async fn save_all(&self, stats: &StatsSnapshot) -> Result<(), StorageError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "save disabled",
            )));
        }
        *self.data.lock() = stats.clone();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
