//! Wiring: config, stores, indices, watcher, pool, signals.

use anyhow::{bail, Context, Result};
use cardmint_catalog::{CatalogHandle, CatalogIndex, ReferenceStore};
use cardmint_inference::{
    LocalExtractor, Orchestrator, PassthroughPipeline, PrimaryExtractor, QuotaLedger,
};
use cardmint_logging::{cardmint_home, init_logging, LogConfig};
use cardmint_protocol::config::{Config, ConfigHandle};
use cardmint_protocol::ids::ProcessorId;
use cardmint_sentinel::worker::{CapturePayload, StageRunner, JOB_TYPE_CAPTURE};
use cardmint_sentinel::{JobQueue, Lane, PoolConfig, ScanStore, SessionStore, WorkerPool};
use cardmint_watcher::{kiosk_router, CaptureEvent, CaptureSink, KioskState, Watcher, WatcherConfig};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DRAIN_REQUEST_FILE: &str = "drain.request";
const DRAIN_POLL_MS: u64 = 500;

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    }
}

/// `cardmint migrate`
pub async fn migrate(config: Config) -> Result<()> {
    let url = config.database_url(&cardmint_home());
    cardmint_sentinel::open_store(&url).await?;
    println!("migrations applied");
    Ok(())
}

/// `cardmint drain` — ask a running station to drain, wait until it does.
pub async fn request_drain(timeout_secs: u64) -> Result<()> {
    let marker = cardmint_home().join(DRAIN_REQUEST_FILE);
    std::fs::create_dir_all(cardmint_home())?;
    std::fs::write(&marker, chrono::Utc::now().to_rfc3339())
        .with_context(|| format!("Failed to write {}", marker.display()))?;
    info!("Drain requested via {}", marker.display());

    let deadline = std::time::Instant::now() + Duration::from_secs(timeout_secs);
    while marker.exists() {
        if std::time::Instant::now() >= deadline {
            bail!("running process did not acknowledge the drain in {timeout_secs}s");
        }
        tokio::time::sleep(Duration::from_millis(DRAIN_POLL_MS)).await;
    }
    println!("drained");
    Ok(())
}

/// Watcher sink backed by the durable queue. Depth is the combined waiting
/// depth of both lanes, the number the backpressure bound compares against.
struct QueueSink {
    queue: JobQueue,
    max_attempts: u32,
}

impl CaptureSink for QueueSink {
    async fn depth(&self) -> Result<u64> {
        let capture = self.queue.depth(Lane::Capture).await?;
        let processing = self.queue.depth(Lane::Processing).await?;
        Ok(capture + processing)
    }

    async fn enqueue(&self, event: CaptureEvent) -> Result<()> {
        let payload = CapturePayload {
            path: event.path.display().to_string(),
            filename: event.filename,
            arrived_at_ms: event.arrived_at_ms,
            sequence: event.sequence,
            fingerprint: event.fingerprint,
        };
        self.queue
            .push(
                Lane::Capture,
                JOB_TYPE_CAPTURE,
                &serde_json::to_string(&payload)?,
                0,
                self.max_attempts,
            )
            .await?;
        Ok(())
    }
}

/// `cardmint run`
pub async fn run(config: Config, verbose: bool) -> Result<()> {
    init_logging(LogConfig {
        app_name: "cardmint",
        verbose,
    })?;
    let home = cardmint_home();
    info!("CardMint starting (home: {})", home.display());

    // Durable store first; everything hangs off it.
    let url = config.database_url(&home);
    let pool = cardmint_sentinel::open_store(&url).await?;
    let store = ScanStore::new(pool.clone());
    let sessions = SessionStore::new(pool.clone());
    let queue = JobQueue::new(pool.clone(), config.queue.backoff_base_ms);

    // Crash recovery: stale leases and wedged in-flight jobs are eligible
    // again before any worker starts.
    store.reclaim_stale_leases(config.lease.expiry_secs).await?;
    queue
        .requeue_stale_active(config.lease.expiry_secs * 1000)
        .await?;
    // Ended sessions older than the retention window go away at startup.
    const SESSION_RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;
    sessions.prune_ended(SESSION_RETENTION_MS).await?;

    // Read-mostly indices.
    let catalog = match &config.catalog.csv_path {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open catalog CSV: {}", path.display()))?;
            CatalogIndex::from_csv(file)?
        }
        None => {
            warn!("No catalog CSV configured; every scan will be unmatched");
            CatalogIndex::default()
        }
    };
    let catalog = CatalogHandle::new(catalog);
    let reference = Arc::new(ReferenceStore::open(
        config.reference.csv_path.clone(),
        config.reference.lru_capacity,
        Duration::from_secs(config.reference.ttl_secs),
    ));

    // Inference paths.
    let primary = if config.inference.endpoint.is_empty() {
        warn!("No primary inference endpoint; running on the fallback path only");
        None
    } else {
        Some(PrimaryExtractor::new(&config.inference)?)
    };
    let fallback = LocalExtractor::new(
        config.inference.fallback_command.clone(),
        config.inference.fallback_args.clone(),
        Duration::from_millis(config.inference.timeout_ms),
    );
    let quota = QuotaLedger::new(
        config.inference.daily_quota,
        config.inference.quota_warning_threshold,
    );
    let backend = Arc::new(Orchestrator::new(primary, fallback, quota));

    let config_handle = ConfigHandle::new(config.clone());
    let runner = Arc::new(StageRunner {
        store: store.clone(),
        queue: queue.clone(),
        backend,
        pipeline: Arc::new(PassthroughPipeline),
        catalog,
        reference,
        config: config_handle,
        processor: ProcessorId::new(),
    });

    let worker_pool = Arc::new(WorkerPool::new(
        Arc::clone(&runner),
        queue.clone(),
        store.clone(),
        PoolConfig::from_config(&config.queue),
    ));
    worker_pool.start();

    // Capture ingress.
    let sink = Arc::new(QueueSink {
        queue: queue.clone(),
        max_attempts: config.queue.max_attempts,
    });
    let watcher = Arc::new(Watcher::new(
        WatcherConfig::from_config(&config.watch),
        Arc::clone(&sink),
    ));
    watcher.start();

    // Optional kiosk callback surface.
    let kiosk_running = Arc::new(AtomicBool::new(true));
    if config.watch.kiosk_enabled {
        let state = Arc::new(KioskState {
            drop_dir: config.watch.drop_dir.clone(),
            running: Arc::clone(&kiosk_running),
            spool_depth: Arc::new(AtomicU64::new(0)),
            degraded: Arc::new(AtomicBool::new(false)),
            camera_model: "drop-dir".to_string(),
        });
        let addr = config.watch.kiosk_bind_addr.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Kiosk surface failed to bind {addr}: {e}");
                    return;
                }
            };
            info!("Kiosk surface on {addr}");
            if let Err(e) = axum::serve(listener, kiosk_router(state)).await {
                error!("Kiosk surface stopped: {e}");
            }
        });
    }

    // Run until ctrl-c or a drain request.
    let drain_marker = home.join(DRAIN_REQUEST_FILE);
    let _ = std::fs::remove_file(&drain_marker);
    info!("CardMint running");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("signal handler failed")?;
                info!("Interrupt received; draining");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(DRAIN_POLL_MS)) => {
                if drain_marker.exists() {
                    info!("Drain requested; draining");
                    break;
                }
            }
        }
    }

    watcher.stop();
    kiosk_running.store(false, Ordering::SeqCst);
    worker_pool.drain().await;
    worker_pool.shutdown().await;
    let _ = std::fs::remove_file(&drain_marker);
    info!("CardMint stopped");
    Ok(())
}
