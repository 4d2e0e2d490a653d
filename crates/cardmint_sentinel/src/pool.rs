//! Worker pool.
//!
//! Bounded parallelism over the two queue lanes with a global rate limit,
//! exponential retry via the queue, depth-based auto-pause of the expensive
//! lane, and graceful drain for shutdown and hot reload.

use crate::db::queue::{JobQueue, Lane, QueueJob};
use crate::db::scans::ScanStore;
use crate::worker::{InferenceBackend, StageRunner};
use cardmint_protocol::metrics::{Metrics, METRICS};
use cardmint_protocol::status::JobStatus;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// Dispatch backoff when a lane is empty (ms).
const DISPATCH_BACKOFF_BASE_MS: u64 = 50;
const DISPATCH_BACKOFF_MAX_MS: u64 = 1_000;
const DISPATCH_BACKOFF_JITTER_MS: u64 = 50;
/// Monitor cadence for depth observation.
const MONITOR_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    JobCompleted(i64),
    JobFailed(i64),
    AutoPaused { depth: u64 },
    AutoResumed { depth: u64 },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub concurrency: usize,
    pub rate_limit_jobs: usize,
    pub rate_limit_window: Duration,
    pub warn_depth: Option<u64>,
    pub auto_pause_depth: u64,
    pub auto_resume_depth: u64,
    pub graceful_shutdown: Duration,
    pub worker_drain: Duration,
}

impl PoolConfig {
    pub fn from_config(cfg: &cardmint_protocol::config::QueueConfig) -> Self {
        Self {
            workers: cfg.workers,
            concurrency: cfg.concurrency,
            rate_limit_jobs: cfg.rate_limit_jobs,
            rate_limit_window: Duration::from_secs(cfg.rate_limit_window_secs),
            warn_depth: cfg.warn_depth,
            auto_pause_depth: cfg.auto_pause_depth,
            auto_resume_depth: cfg.auto_resume_depth,
            graceful_shutdown: Duration::from_millis(cfg.graceful_shutdown_ms),
            worker_drain: Duration::from_millis(cfg.worker_drain_ms),
        }
    }
}

/// Sliding-window rate limiter shared by all workers.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    /// Whether a job would currently be admitted. Does not consume a slot;
    /// empty polls must not eat into the job budget.
    pub fn would_admit(&self) -> bool {
        let now = Instant::now();
        let mut admitted = self
            .admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while let Some(front) = admitted.front() {
            if now.duration_since(*front) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }
        admitted.len() < self.limit
    }

    /// Consume a slot for a job that was actually fetched.
    pub fn record(&self) {
        let mut admitted = self
            .admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        admitted.push_back(Instant::now());
    }

    /// Check-and-consume in one step.
    pub fn try_acquire(&self) -> bool {
        if self.would_admit() {
            self.record();
            true
        } else {
            false
        }
    }
}

/// Depth-triggered pause/resume with hysteresis: pausing at the high
/// watermark and resuming only at the low one prevents flapping.
pub struct AutoGate {
    pause_depth: u64,
    resume_depth: u64,
    paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateChange {
    Paused,
    Resumed,
}

impl AutoGate {
    pub fn new(pause_depth: u64, resume_depth: u64) -> Self {
        debug_assert!(resume_depth < pause_depth);
        Self {
            pause_depth,
            resume_depth,
            paused: false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn observe(&mut self, depth: u64) -> Option<GateChange> {
        if !self.paused && depth >= self.pause_depth {
            self.paused = true;
            return Some(GateChange::Paused);
        }
        if self.paused && depth <= self.resume_depth {
            self.paused = false;
            return Some(GateChange::Resumed);
        }
        None
    }
}

pub struct WorkerPool<B: InferenceBackend> {
    runner: Arc<StageRunner<B>>,
    queue: JobQueue,
    store: ScanStore,
    config: PoolConfig,
    rate: Arc<RateLimiter>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    auto_paused: Arc<AtomicBool>,
    active: Arc<AtomicU64>,
    events: broadcast::Sender<PoolEvent>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: InferenceBackend> WorkerPool<B> {
    pub fn new(
        runner: Arc<StageRunner<B>>,
        queue: JobQueue,
        store: ScanStore,
        config: PoolConfig,
    ) -> Self {
        let rate = Arc::new(RateLimiter::new(
            config.rate_limit_jobs,
            config.rate_limit_window,
        ));
        let (events, _) = broadcast::channel(256);
        Self {
            runner,
            queue,
            store,
            config,
            rate,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            auto_paused: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicU64::new(0)),
            events,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn active_jobs(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Spawn the workers and the depth monitor.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            workers = self.config.workers,
            concurrency = self.config.concurrency,
            "Worker pool starting"
        );

        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for worker_index in 0..self.config.workers {
            handles.push(tokio::spawn(worker_loop(WorkerContext {
                index: worker_index,
                runner: Arc::clone(&self.runner),
                queue: self.queue.clone(),
                concurrency: self.config.concurrency,
                worker_drain: self.config.worker_drain,
                rate: Arc::clone(&self.rate),
                running: Arc::clone(&self.running),
                paused: Arc::clone(&self.paused),
                auto_paused: Arc::clone(&self.auto_paused),
                active: Arc::clone(&self.active),
                events: self.events.clone(),
            })));
        }
        handles.push(tokio::spawn(monitor_loop(MonitorContext {
            store: self.store.clone(),
            config: self.config.clone(),
            running: Arc::clone(&self.running),
            auto_paused: Arc::clone(&self.auto_paused),
            events: self.events.clone(),
        })));
    }

    /// Stop fetching new work in both lanes; in-flight work continues.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Worker pool paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Worker pool resumed");
    }

    /// Pause, then wait for in-flight work to finish, bounded by the
    /// graceful-shutdown budget.
    pub async fn drain(&self) {
        self.pause();
        let deadline = Instant::now() + self.config.graceful_shutdown;
        while self.active.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.active.load(Ordering::SeqCst),
                    "Drain budget exhausted with work still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("Worker pool drained");
    }

    /// Drain, stop the workers, close the event channel and the lanes.
    pub async fn shutdown(&self) {
        self.drain().await;
        self.running.store(false, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            // A wedged worker cannot block the whole shutdown.
            if tokio::time::timeout(self.config.worker_drain, handle)
                .await
                .is_err()
            {
                warn!("Worker did not stop within its drain budget; detaching");
            }
        }
        info!("Worker pool shut down");
    }
}

struct WorkerContext<B: InferenceBackend> {
    index: usize,
    runner: Arc<StageRunner<B>>,
    queue: JobQueue,
    concurrency: usize,
    worker_drain: Duration,
    rate: Arc<RateLimiter>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    auto_paused: Arc<AtomicBool>,
    active: Arc<AtomicU64>,
    events: broadcast::Sender<PoolEvent>,
}

async fn worker_loop<B: InferenceBackend>(ctx: WorkerContext<B>) {
    info!("Worker {} entering event loop", ctx.index);
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut idle_backoff = DISPATCH_BACKOFF_BASE_MS;

    while ctx.running.load(Ordering::SeqCst) {
        // Respect the per-worker concurrency bound before fetching.
        while tasks.len() >= ctx.concurrency {
            tasks.join_next().await;
        }

        if ctx.paused.load(Ordering::SeqCst) || !ctx.rate.would_admit() {
            tokio::time::sleep(Duration::from_millis(DISPATCH_BACKOFF_BASE_MS)).await;
            continue;
        }

        let job = match next_job(&ctx).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let jitter = rand::thread_rng().gen_range(0..=DISPATCH_BACKOFF_JITTER_MS);
                tokio::time::sleep(Duration::from_millis(idle_backoff + jitter)).await;
                idle_backoff = (idle_backoff * 2).min(DISPATCH_BACKOFF_MAX_MS);
                continue;
            }
            Err(e) => {
                Metrics::inc(&METRICS.db_errors);
                error!("Worker {}: queue fetch failed: {e:#}", ctx.index);
                tokio::time::sleep(Duration::from_millis(DISPATCH_BACKOFF_MAX_MS)).await;
                continue;
            }
        };
        idle_backoff = DISPATCH_BACKOFF_BASE_MS;
        ctx.rate.record();

        Metrics::inc(&METRICS.jobs_dispatched);
        ctx.active.fetch_add(1, Ordering::SeqCst);
        let runner = Arc::clone(&ctx.runner);
        let queue = ctx.queue.clone();
        let active = Arc::clone(&ctx.active);
        let events = ctx.events.clone();
        tasks.spawn(async move {
            execute_job(runner, queue, events, job).await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    // Drain this worker's in-flight tasks, bounded so a wedged job cannot
    // hold the loop open.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(ctx.worker_drain, drain).await.is_err() {
        warn!("Worker {}: abandoning in-flight tasks after drain budget", ctx.index);
        tasks.abort_all();
    }
    info!("Worker {} stopped", ctx.index);
}

/// Capture lane first; the processing lane only while not auto-paused.
async fn next_job<B: InferenceBackend>(
    ctx: &WorkerContext<B>,
) -> anyhow::Result<Option<QueueJob>> {
    if let Some(job) = ctx.queue.pop(Lane::Capture).await? {
        return Ok(Some(job));
    }
    if ctx.auto_paused.load(Ordering::SeqCst) {
        return Ok(None);
    }
    ctx.queue.pop(Lane::Processing).await.map_err(Into::into)
}

async fn execute_job<B: InferenceBackend>(
    runner: Arc<StageRunner<B>>,
    queue: JobQueue,
    events: broadcast::Sender<PoolEvent>,
    job: QueueJob,
) {
    match runner.run_job(&job).await {
        Ok(()) => {
            if let Err(e) = queue.complete(job.id).await {
                Metrics::inc(&METRICS.db_errors);
                error!("Job {} finished but could not be recorded: {e:#}", job.id);
                return;
            }
            Metrics::inc(&METRICS.jobs_completed);
            let _ = events.send(PoolEvent::JobCompleted(job.id));
        }
        Err(e) => {
            warn!("Job {} attempt failed: {e:#}", job.id);
            match queue.fail(job.id, &format!("{e:#}")).await {
                Ok(true) => {
                    Metrics::inc(&METRICS.jobs_failed);
                    let _ = events.send(PoolEvent::JobFailed(job.id));
                }
                Ok(false) => {
                    Metrics::inc(&METRICS.jobs_retried);
                }
                Err(record_err) => {
                    // A job that cannot even record its own failure is
                    // logged; the worker carries on.
                    Metrics::inc(&METRICS.db_errors);
                    error!(
                        "Job {} failed AND could not record the failure: {record_err:#}",
                        job.id
                    );
                }
            }
        }
    }
}

struct MonitorContext {
    store: ScanStore,
    config: PoolConfig,
    running: Arc<AtomicBool>,
    auto_paused: Arc<AtomicBool>,
    events: broadcast::Sender<PoolEvent>,
}

/// Observe the operator backlog and gate the expensive lane.
async fn monitor_loop(ctx: MonitorContext) {
    let mut gate = AutoGate::new(ctx.config.auto_pause_depth, ctx.config.auto_resume_depth);
    let mut interval = tokio::time::interval(Duration::from_millis(MONITOR_INTERVAL_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while ctx.running.load(Ordering::SeqCst) {
        interval.tick().await;

        let depth = match ctx.store.count_by_status(JobStatus::OperatorPending).await {
            Ok(depth) => depth,
            Err(e) => {
                error!("Depth observation failed: {e:#}");
                continue;
            }
        };

        if let Some(warn_depth) = ctx.config.warn_depth {
            if depth >= warn_depth {
                warn!(depth, warn_depth, "Operator backlog above warn depth");
            }
        }

        match gate.observe(depth) {
            Some(GateChange::Paused) => {
                ctx.auto_paused.store(true, Ordering::SeqCst);
                warn!(depth, "Auto-pausing the processing lane");
                let _ = ctx.events.send(PoolEvent::AutoPaused { depth });
            }
            Some(GateChange::Resumed) => {
                ctx.auto_paused.store(false, Ordering::SeqCst);
                info!(depth, "Auto-resuming the processing lane");
                let _ = ctx.events.send(PoolEvent::AutoResumed { depth });
            }
            None => {}
        }
    }
}
