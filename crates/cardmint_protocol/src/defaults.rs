//! Canonical default values shared across the pipeline.

/// Filename pattern the capture device assigns.
pub const CAPTURE_FILENAME_PATTERN: &str = r"^DSC\d{5}\.JPG$";
/// Suffix written during a non-atomic copy; ignored until renamed away.
pub const CAPTURE_TEMP_SUFFIX: &str = ".tmp";
/// Watcher poll interval (ms).
pub const DEFAULT_WATCH_POLL_MS: u64 = 250;
/// Queue depth at which the watcher drops captures.
pub const DEFAULT_MAX_QUEUE_DEPTH: u64 = 300;
/// Soft budget for the detection callback (ms).
pub const DETECTION_WARN_BUDGET_MS: u64 = 50;
/// Fingerprint set bound and prune target.
pub const FINGERPRINT_MAX_ENTRIES: usize = 10_000;
pub const FINGERPRINT_PRUNE_TO: usize = 5_000;
/// Bytes hashed for the capture fingerprint.
pub const FINGERPRINT_PREFIX_BYTES: usize = 4096;

/// Worker pool sizing.
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 3;
/// Retry budget per queue job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Exponential backoff base (ms) and cap.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_CAP_MS: u64 = 30_000;
/// Jitter added on top of the exponential backoff (ms).
pub const BACKOFF_JITTER_MIN_MS: u64 = 250;
pub const BACKOFF_JITTER_MAX_MS: u64 = 1_250;
/// Global rate limit: jobs per window.
pub const RATE_LIMIT_JOBS: usize = 100;
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
/// Depth-based auto-pause/resume hysteresis for the primary lane.
pub const DEFAULT_AUTO_PAUSE_DEPTH: u64 = 11;
pub const DEFAULT_AUTO_RESUME_DEPTH: u64 = 8;
/// Graceful shutdown budget and per-worker sub-timeout (ms).
pub const DEFAULT_GRACEFUL_SHUTDOWN_MS: u64 = 10_000;
pub const DEFAULT_WORKER_DRAIN_MS: u64 = 2_500;

/// Per-call inference timeout (ms).
pub const DEFAULT_INFER_TIMEOUT_MS: u64 = 30_000;
/// Hard guardrail on the upload payload.
pub const MAX_UPLOAD_BYTES: u64 = 400 * 1024;
/// Preprocess target: longest edge and JPEG quality.
pub const PREPROCESS_MAX_EDGE_PX: u32 = 1024;
pub const PREPROCESS_JPEG_QUALITY: u8 = 82;
pub const PREPROCESS_TARGET_BYTES: u64 = 250 * 1024;
/// Primary-path retry delay bounds (ms).
pub const PRIMARY_RETRY_MIN_MS: u64 = 250;
pub const PRIMARY_RETRY_MAX_MS: u64 = 500;

/// Resolver decision thresholds.
pub const DEFAULT_AUTO_ACCEPT: f64 = 0.90;
pub const DEFAULT_AUTO_ACCEPT_MARGIN: f64 = 0.10;
pub const DEFAULT_REASONABLE_FLOOR: f64 = 0.40;
/// Path C thresholds.
pub const DEFAULT_PATH_C_MIN_SIGNALS: usize = 2;
pub const DEFAULT_PATH_C_HARD_FILTER: f64 = 0.90;
pub const DEFAULT_PATH_C_SOFT_RERANK: f64 = 0.70;

/// Reference price cache.
pub const DEFAULT_REFERENCE_LRU_CAPACITY: usize = 10_000;
pub const DEFAULT_REFERENCE_TTL_SECS: u64 = 15 * 60;

/// Set-symbol matching.
pub const SYMBOL_MATCH_SCALES: [f64; 3] = [0.75, 1.0, 1.25];
pub const SYMBOL_MATCH_THRESHOLD: f64 = 0.78;

/// Lease expiry: a worker that has not advanced a job within this window
/// loses ownership to the next claimant.
pub const DEFAULT_LEASE_EXPIRY_SECS: i64 = 120;

/// Operator session heartbeat staleness.
pub const SESSION_HEARTBEAT_STALE_SECS: i64 = 90;

/// Webhook staleness window receivers enforce (secs).
pub const DEFAULT_WEBHOOK_STALENESS_SECS: u64 = 300;

/// Default database url, relative to the CardMint home directory.
pub const DEFAULT_DB_FILENAME: &str = "cardmint.sqlite";

/// Kiosk callback bind address.
pub const DEFAULT_KIOSK_BIND_ADDR: &str = "127.0.0.1:7421";
