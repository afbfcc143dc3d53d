use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::sources::SourceStatsRegistry;

/// What one sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_removed: usize,
    pub stats_flushed: bool,
}

/// Drops expired local cache entries and flushes the stats snapshot.
pub async fn run_maintenance_once(
    cache: &CacheStore,
    registry: &SourceStatsRegistry,
) -> SweepReport {
    let expired_removed = cache.cleanup_expired();

    let stats_flushed = match registry.flush().await {
        Ok(()) => true,
        Err(e) => {
            warn!("⚠️ Error en flush periódico de estadísticas: {}", e);
            false
        }
    };

    debug!(
        "🧹 Mantenimiento: {} entradas expiradas, flush {}",
        expired_removed,
        if stats_flushed { "ok" } else { "falló" }
    );

    SweepReport {
        expired_removed,
        stats_flushed,
    }
}

/// Runs [`run_maintenance_once`] every `every` until `shutdown` is cancelled.
///
/// The first sweep happens one period after spawning. Cancelling stops the
/// loop between sweeps; a sweep in progress finishes first.
pub fn spawn_maintenance(
    cache: Arc<CacheStore>,
    registry: Arc<SourceStatsRegistry>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("🔧 Mantenimiento programado cada {:?}", every);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    run_maintenance_once(&cache, &registry).await;
                }
            }
        }

        info!("🛑 Tarea de mantenimiento detenida");
    })
}
