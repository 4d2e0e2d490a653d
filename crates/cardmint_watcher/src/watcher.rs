//! Drop-directory watcher with polling-based change detection.

use crate::events::{CaptureEvent, WatcherEvent};
use cardmint_protocol::defaults;
use cardmint_protocol::fingerprint::capture_fingerprint;
use cardmint_protocol::metrics::{Metrics, METRICS};
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Downstream side of the watcher: depth probe plus enqueue.
///
/// `enqueue` runs on a drain task, never on the detection path; both
/// futures must be Send since they run on spawned tasks.
pub trait CaptureSink: Send + Sync + 'static {
    fn depth(&self) -> impl std::future::Future<Output = anyhow::Result<u64>> + Send;
    fn enqueue(
        &self,
        event: CaptureEvent,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub drop_dir: PathBuf,
    pub poll_interval: Duration,
    pub max_queue_depth: u64,
    pub detection_warn: Duration,
}

impl WatcherConfig {
    pub fn from_config(cfg: &cardmint_protocol::config::WatchConfig) -> Self {
        Self {
            drop_dir: cfg.drop_dir.clone(),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            max_queue_depth: cfg.max_queue_depth,
            detection_warn: Duration::from_millis(cfg.detection_warn_ms),
        }
    }
}

/// Bounded fingerprint set: newest entries win, oldest are pruned when the
/// bound is hit.
struct FingerprintSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl FingerprintSet {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false when the fingerprint was already present.
    fn insert(&mut self, fingerprint: String) -> bool {
        if !self.seen.insert(fingerprint.clone()) {
            return false;
        }
        self.order.push_back(fingerprint);
        if self.order.len() > defaults::FINGERPRINT_MAX_ENTRIES {
            while self.order.len() > defaults::FINGERPRINT_PRUNE_TO {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
        true
    }
}

pub struct Watcher<S: CaptureSink> {
    config: WatcherConfig,
    sink: Arc<S>,
    events: broadcast::Sender<WatcherEvent>,
    running: Arc<AtomicBool>,
    /// Queue depth observed at the last tick, for the health surface.
    last_depth: Arc<AtomicU64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pattern: Regex,
}

impl<S: CaptureSink> Watcher<S> {
    pub fn new(config: WatcherConfig, sink: Arc<S>) -> Self {
        let (events, _) = broadcast::channel(64);
        let pattern = Regex::new(&format!("(?i){}", defaults::CAPTURE_FILENAME_PATTERN))
            .expect("static filename pattern");
        Self {
            config,
            sink,
            events,
            running: Arc::new(AtomicBool::new(false)),
            last_depth: Arc::new(AtomicU64::new(0)),
            tasks: Mutex::new(Vec::new()),
            pattern,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatcherEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_depth(&self) -> u64 {
        self.last_depth.load(Ordering::SeqCst)
    }

    /// Begin observation. Idempotent: a second start is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(dir = %self.config.drop_dir.display(), "Watcher starting");
        let _ = self.events.send(WatcherEvent::Started);

        // Drain task: the only place enqueues are awaited.
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<CaptureEvent>();
        let sink = Arc::clone(&self.sink);
        let events = self.events.clone();
        let drain = tokio::spawn(async move {
            while let Some(event) = dispatch_rx.recv().await {
                match sink.enqueue(event.clone()).await {
                    Ok(()) => {
                        Metrics::inc(&METRICS.captures_queued);
                        let _ = events.send(WatcherEvent::Capture(event));
                    }
                    Err(e) => {
                        error!("Failed to enqueue capture {}: {e:#}", event.filename);
                        let _ = events.send(WatcherEvent::Error(format!(
                            "enqueue {}: {e:#}",
                            event.filename
                        )));
                    }
                }
            }
        });

        let poll = tokio::spawn(poll_loop(PollContext {
            config: self.config.clone(),
            sink: Arc::clone(&self.sink),
            events: self.events.clone(),
            running: Arc::clone(&self.running),
            last_depth: Arc::clone(&self.last_depth),
            dispatch: dispatch_tx,
            pattern: self.pattern.clone(),
        }));

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.push(drain);
        tasks.push(poll);
    }

    /// Detach cleanly. Outstanding dispatches may complete; the poll loop
    /// exits at its next tick.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Watcher stopping");
        let _ = self.events.send(WatcherEvent::Stopped);
    }
}

struct PollContext<S: CaptureSink> {
    config: WatcherConfig,
    sink: Arc<S>,
    events: broadcast::Sender<WatcherEvent>,
    running: Arc<AtomicBool>,
    last_depth: Arc<AtomicU64>,
    dispatch: mpsc::UnboundedSender<CaptureEvent>,
    pattern: Regex,
}

async fn poll_loop<S: CaptureSink>(ctx: PollContext<S>) {
    let mut interval = tokio::time::interval(ctx.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut seen_paths: HashSet<PathBuf> = HashSet::new();
    let mut fingerprints = FingerprintSet::new();

    while ctx.running.load(Ordering::SeqCst) {
        interval.tick().await;
        if !ctx.running.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = poll_once(&ctx, &mut seen_paths, &mut fingerprints).await {
            // A broken tick must not starve subsequent detections.
            error!("Watcher poll failed: {e:#}");
            let _ = ctx.events.send(WatcherEvent::Error(format!("{e:#}")));
        }
    }
}

async fn poll_once<S: CaptureSink>(
    ctx: &PollContext<S>,
    seen_paths: &mut HashSet<PathBuf>,
    fingerprints: &mut FingerprintSet,
) -> anyhow::Result<()> {
    let mut dir = match tokio::fs::read_dir(&ctx.config.drop_dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if seen_paths.contains(&path) {
            continue;
        }
        let Some(filename) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        // Atomic-write discriminator: ignore until the temp suffix is
        // renamed away.
        if filename.ends_with(defaults::CAPTURE_TEMP_SUFFIX) {
            continue;
        }
        if !ctx.pattern.is_match(&filename) {
            continue;
        }

        let detection_started = Instant::now();
        seen_paths.insert(path.clone());

        let fingerprint = read_fingerprint(&path).await;
        if let Some(fp) = &fingerprint {
            if !fingerprints.insert(fp.clone()) {
                // Same bytes under a new name; ingress dedup covers this.
                info!(filename, "Duplicate capture fingerprint, skipping");
                continue;
            }
        }

        let depth = ctx.sink.depth().await.unwrap_or(0);
        ctx.last_depth.store(depth, Ordering::SeqCst);
        if depth >= ctx.config.max_queue_depth {
            Metrics::inc(&METRICS.captures_dropped);
            warn!(depth, filename, "Queue saturated, dropping capture");
            let _ = ctx.events.send(WatcherEvent::Backpressure { depth });
            record_detection(ctx, detection_started, &filename);
            continue;
        }

        let event = CaptureEvent {
            sequence: parse_sequence(&filename),
            filename,
            arrived_at_ms: chrono::Utc::now().timestamp_millis(),
            fingerprint,
            path,
        };
        // Fire and forget: the drain task owns the actual enqueue.
        let filename = event.filename.clone();
        let _ = ctx.dispatch.send(event);
        record_detection(ctx, detection_started, &filename);
    }

    Ok(())
}

fn record_detection<S: CaptureSink>(ctx: &PollContext<S>, started: Instant, filename: &str) {
    let elapsed = started.elapsed();
    METRICS.record_detection(elapsed.as_micros() as u64);
    if elapsed > ctx.config.detection_warn {
        METRICS.detection_deferral.store(true, Ordering::Relaxed);
        warn!(
            filename,
            elapsed_ms = elapsed.as_millis() as u64,
            "Capture detection exceeded soft budget"
        );
    }
}

/// First 4 KiB hashed; unreadable files simply skip dedup.
async fn read_fingerprint(path: &Path) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut buf = vec![0u8; defaults::FINGERPRINT_PREFIX_BYTES];
    let n = file.read(&mut buf).await.ok()?;
    buf.truncate(n);
    Some(capture_fingerprint(&buf))
}

/// "DSC00042.JPG" -> 42.
fn parse_sequence(filename: &str) -> Option<u32> {
    let digits: String = filename.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
