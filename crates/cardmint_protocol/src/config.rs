//! System configuration.
//!
//! Loaded once at startup from TOML plus `CARDMINT_`-prefixed environment
//! overrides, validated, and exposed as an immutable snapshot. Hot reload
//! replaces the snapshot atomically; in-flight workers keep the snapshot
//! they captured when their job started.

use crate::defaults;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub watch: WatchConfig,
    pub queue: QueueConfig,
    pub inference: InferenceConfig,
    pub resolver: ResolverConfig,
    pub catalog: CatalogConfig,
    pub reference: ReferenceConfig,
    pub webhook: WebhookConfig,
    pub database: DatabaseConfig,
    pub lease: LeaseConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// Catalog snapshot CSV. Absent means an empty catalog (resolver will
    /// park every scan as unmatched).
    pub csv_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Drop directory the capture device writes into.
    pub drop_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub max_queue_depth: u64,
    pub detection_warn_ms: u64,
    pub kiosk_bind_addr: String,
    pub kiosk_enabled: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            drop_dir: PathBuf::from("captures"),
            poll_interval_ms: defaults::DEFAULT_WATCH_POLL_MS,
            max_queue_depth: defaults::DEFAULT_MAX_QUEUE_DEPTH,
            detection_warn_ms: defaults::DETECTION_WARN_BUDGET_MS,
            kiosk_bind_addr: defaults::DEFAULT_KIOSK_BIND_ADDR.to_string(),
            kiosk_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub workers: usize,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub rate_limit_jobs: usize,
    pub rate_limit_window_secs: u64,
    pub warn_depth: Option<u64>,
    pub auto_pause_depth: u64,
    pub auto_resume_depth: u64,
    pub graceful_shutdown_ms: u64,
    pub worker_drain_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: defaults::DEFAULT_WORKERS,
            concurrency: defaults::DEFAULT_WORKER_CONCURRENCY,
            max_attempts: defaults::DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: defaults::DEFAULT_BACKOFF_BASE_MS,
            rate_limit_jobs: defaults::RATE_LIMIT_JOBS,
            rate_limit_window_secs: defaults::RATE_LIMIT_WINDOW_SECS,
            warn_depth: None,
            auto_pause_depth: defaults::DEFAULT_AUTO_PAUSE_DEPTH,
            auto_resume_depth: defaults::DEFAULT_AUTO_RESUME_DEPTH,
            graceful_shutdown_ms: defaults::DEFAULT_GRACEFUL_SHUTDOWN_MS,
            worker_drain_ms: defaults::DEFAULT_WORKER_DRAIN_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InferenceConfig {
    /// Primary extractor endpoint. Empty string disables the primary path.
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_ms: u64,
    pub max_upload_bytes: u64,
    pub daily_quota: Option<u64>,
    pub quota_warning_threshold: u64,
    pub model: String,
    /// Local fallback extractor command and fixed arguments.
    pub fallback_command: String,
    pub fallback_args: Vec<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key_env: "CARDMINT_INFER_API_KEY".to_string(),
            timeout_ms: defaults::DEFAULT_INFER_TIMEOUT_MS,
            max_upload_bytes: defaults::MAX_UPLOAD_BYTES,
            daily_quota: None,
            quota_warning_threshold: 50,
            model: "card-extract-1".to_string(),
            fallback_command: "cardmint-local-extract".to_string(),
            fallback_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    pub auto_accept: f64,
    pub auto_accept_margin: f64,
    pub reasonable_floor: f64,
    pub path_c_enabled: bool,
    pub path_c_min_signals: usize,
    pub path_c_hard_filter: f64,
    pub path_c_soft_rerank: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            auto_accept: defaults::DEFAULT_AUTO_ACCEPT,
            auto_accept_margin: defaults::DEFAULT_AUTO_ACCEPT_MARGIN,
            reasonable_floor: defaults::DEFAULT_REASONABLE_FLOOR,
            path_c_enabled: true,
            path_c_min_signals: defaults::DEFAULT_PATH_C_MIN_SIGNALS,
            path_c_hard_filter: defaults::DEFAULT_PATH_C_HARD_FILTER,
            path_c_soft_rerank: defaults::DEFAULT_PATH_C_SOFT_RERANK,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReferenceConfig {
    pub csv_path: Option<PathBuf>,
    pub lru_capacity: usize,
    pub ttl_secs: u64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            csv_path: None,
            lru_capacity: defaults::DEFAULT_REFERENCE_LRU_CAPACITY,
            ttl_secs: defaults::DEFAULT_REFERENCE_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    /// Empty string disables delivery.
    pub url: String,
    /// Name of the environment variable holding the shared secret.
    pub secret_env: String,
    pub staleness_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret_env: "CARDMINT_WEBHOOK_SECRET".to_string(),
            staleness_secs: defaults::DEFAULT_WEBHOOK_STALENESS_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// sqlite:/path/to/cardmint.sqlite or sqlite::memory:
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    pub expiry_secs: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            expiry_secs: defaults::DEFAULT_LEASE_EXPIRY_SECS,
        }
    }
}

impl Config {
    /// Load from a TOML file, then apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Config> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CARDMINT_DB_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("CARDMINT_WATCH_DIR") {
            self.watch.drop_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CARDMINT_INFER_ENDPOINT") {
            self.inference.endpoint = v;
        }
        if let Ok(v) = std::env::var("CARDMINT_WEBHOOK_URL") {
            self.webhook.url = v;
        }
    }

    /// Reject configurations that would violate pipeline invariants.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("resolver.auto_accept", self.resolver.auto_accept),
            ("resolver.reasonable_floor", self.resolver.reasonable_floor),
            ("resolver.path_c_hard_filter", self.resolver.path_c_hard_filter),
            ("resolver.path_c_soft_rerank", self.resolver.path_c_soft_rerank),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be within [0, 1], got {}", name, value);
            }
        }
        if self.resolver.reasonable_floor > self.resolver.auto_accept {
            bail!("resolver.reasonable_floor must not exceed resolver.auto_accept");
        }
        if self.resolver.path_c_soft_rerank > self.resolver.path_c_hard_filter {
            bail!("resolver.path_c_soft_rerank must not exceed path_c_hard_filter");
        }
        if self.queue.auto_resume_depth >= self.queue.auto_pause_depth {
            bail!(
                "queue.auto_resume_depth ({}) must be below auto_pause_depth ({}) to keep hysteresis",
                self.queue.auto_resume_depth,
                self.queue.auto_pause_depth
            );
        }
        if self.queue.workers == 0 || self.queue.concurrency == 0 {
            bail!("queue.workers and queue.concurrency must be at least 1");
        }
        if self.queue.max_attempts == 0 {
            bail!("queue.max_attempts must be at least 1");
        }
        if self.inference.max_upload_bytes == 0 {
            bail!("inference.max_upload_bytes must be positive");
        }
        if self.lease.expiry_secs <= 0 {
            bail!("lease.expiry_secs must be positive");
        }
        Ok(())
    }

    /// Resolved database url, defaulting under the CardMint home directory.
    pub fn database_url(&self, home: &Path) -> String {
        if self.database.url.is_empty() {
            format!(
                "sqlite:{}",
                home.join(defaults::DEFAULT_DB_FILENAME).display()
            )
        } else {
            self.database.url.clone()
        }
    }
}

/// Shared handle exposing the current configuration snapshot.
///
/// Readers clone the `Arc` once at job start and never observe a partial
/// reload.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swap in a new validated snapshot.
    pub fn reload(&self, config: Config) -> Result<()> {
        config.validate()?;
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
        Ok(())
    }
}
