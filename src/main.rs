use anyhow::Result;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use open_unblock::cache::{CacheStore, MusicCache, RedisBackend, SharedBackend, SharedTier};
use open_unblock::config::{parse_source_list, Config, StatsBackend};
use open_unblock::maintenance::spawn_maintenance;
use open_unblock::service::ResolutionService;
use open_unblock::sources::{HttpResolver, NetworkClass, SourceRanker, SourceStatsRegistry};
use open_unblock::storage::{JsonStorage, MemoryStorage, SharedStorage, StatsStore};

/// Bound on every shared-tier call.
const SHARED_OP_TIMEOUT: Duration = Duration::from_secs(2);
const STATS_KEY: &str = "stats:sources";

const USAGE: &str = "Uso: open-unblock [--network <wifi|4g|3g|2g>] [--sources a,b,...] <track-id>...\n       open-unblock --stats\n       open-unblock --health-check";

#[derive(Debug, Default, PartialEq)]
struct Args {
    network: NetworkClass,
    sources: Option<Vec<String>>,
    track_ids: Vec<String>,
    stats: bool,
    health_check: bool,
}

fn parse_args<I>(args: I) -> Result<Args>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--health-check" => parsed.health_check = true,
            "--stats" => parsed.stats = true,
            "--network" => {
                let Some(value) = args.next() else {
                    anyhow::bail!("--network requiere un valor");
                };
                parsed.network = value.parse().unwrap_or_default();
            }
            "--sources" => {
                let Some(value) = args.next() else {
                    anyhow::bail!("--sources requiere un valor");
                };
                parsed.sources = Some(parse_source_list(&value));
            }
            flag if flag.starts_with("--") => anyhow::bail!("Opción desconocida: {}\n{}", flag, USAGE),
            _ => parsed.track_ids.push(arg),
        }
    }

    Ok(parsed)
}

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_unblock=debug".parse()?)
                .add_directive("redis=info".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("🎵 Iniciando Open Unblock v{}", env!("CARGO_PKG_VERSION"));

    let args = parse_args(std::env::args().skip(1))?;

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config, args))
}

async fn run(config: Config, args: Args) -> Result<()> {
    let resolver = Arc::new(HttpResolver::new(config.resolver_url()?, config.resolve_timeout)?);

    // Manejar health check si es necesario
    if args.health_check {
        return match resolver.health_check().await {
            Ok(()) => {
                println!("OK");
                Ok(())
            }
            Err(e) => anyhow::bail!("Resolver no disponible en {}: {}", resolver.base_url(), e),
        };
    }

    if !args.stats && args.track_ids.is_empty() {
        anyhow::bail!("{}", USAGE);
    }

    // Inicializar caché compartido
    let tier = match config.redis_config() {
        Some(redis_config) => {
            let backend: Arc<dyn SharedBackend> = Arc::new(RedisBackend::new(redis_config)?);
            Some(SharedTier::new(backend, config.reconnect_policy(), SHARED_OP_TIMEOUT))
        }
        None => None,
    };
    if let Some(tier) = &tier {
        tier.connect().await;
    }

    let store = Arc::new(match tier.clone() {
        Some(tier) => CacheStore::with_shared(config.cache_config(), tier),
        None => CacheStore::new(config.cache_config()),
    });

    // Inicializar estadísticas de fuentes
    let stats_store: Arc<dyn StatsStore> = match (config.stats_backend, &tier) {
        (StatsBackend::File, _) => Arc::new(JsonStorage::new(config.data_dir.clone()).await?),
        (StatsBackend::Redis, Some(tier)) => Arc::new(SharedStorage::new(tier.clone(), STATS_KEY)),
        (StatsBackend::Redis, None) => anyhow::bail!("STATS_BACKEND=redis requiere REDIS_URL"),
        (StatsBackend::Memory, _) => Arc::new(MemoryStorage::new()),
    };
    let registry = Arc::new(SourceStatsRegistry::load(stats_store).await);

    let shutdown = CancellationToken::new();
    let maintenance = spawn_maintenance(
        store.clone(),
        registry.clone(),
        config.maintenance_interval,
        shutdown.clone(),
    );

    if args.stats {
        print_stats(registry.clone(), &store, &config)?;
    } else {
        let service = ResolutionService::new(
            MusicCache::new(store.clone()),
            registry.clone(),
            resolver,
            config.resolve_timeout,
        );
        let candidates = args.sources.unwrap_or_else(|| config.default_sources.clone());

        tokio::select! {
            _ = resolve_all(&service, &args.track_ids, &candidates, args.network) => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("⚠️ Señal de shutdown recibida, cerrando...");
            }
        }
    }

    // Shutdown ordenado
    shutdown.cancel();
    if let Err(e) = maintenance.await {
        error!("Error al detener mantenimiento: {:?}", e);
    }
    if let Err(e) = registry.flush().await {
        warn!("⚠️ No se pudo guardar el snapshot final de estadísticas: {}", e);
    }
    if let Some(tier) = &tier {
        tier.shutdown();
    }

    let stats = store.stats();
    info!(
        "📊 Cache: {} hits, {} misses ({})",
        stats.hits,
        stats.misses,
        stats.hit_rate_percent()
    );
    Ok(())
}

/// Resolves every id concurrently and prints one JSON line per id, in input
/// order.
async fn resolve_all(
    service: &ResolutionService,
    track_ids: &[String],
    candidates: &[String],
    network: NetworkClass,
) {
    let results = join_all(
        track_ids
            .iter()
            .map(|id| service.resolve(id, candidates, network)),
    )
    .await;

    for (id, result) in track_ids.iter().zip(results) {
        let line = match result {
            Ok(resolution) => serde_json::to_value(&resolution)
                .unwrap_or_else(|e| json!({ "track_id": id, "error": e.to_string() })),
            Err(e) => json!({ "track_id": id, "error": e.to_string() }),
        };
        println!("{}", line);
    }
}

fn print_stats(
    registry: Arc<SourceStatsRegistry>,
    store: &CacheStore,
    config: &Config,
) -> Result<()> {
    let ranker = SourceRanker::new(registry.clone());
    let report = json!({
        "sources": registry.get_all(),
        "ranking": ranker.rank_sources(&config.default_sources),
        "cache": store.stats(),
        "hit_rate": store.stats().hit_rate_percent(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
