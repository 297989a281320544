//! Pipeline configuration from `.graphingest/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the per-project data directory.
pub const DATA_DIR: &str = ".graphingest";

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl IngestConfig {
    /// Resolve relative storage paths against the project root.
    pub fn resolve_paths(&mut self, root: &Path) {
        for path in [
            &mut self.cache.path,
            &mut self.store.path,
            &mut self.writer.dead_letter_path,
        ] {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BatcherConfig {
    /// When false every event is dispatched on its own, without debounce.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_batch_size_threshold")]
    pub batch_size_threshold: usize,
}

fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> u64 {
    2000
}
fn default_batch_size_threshold() -> usize {
    50
}

impl BatcherConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
            batch_size_threshold: default_batch_size_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolConfig {
    /// Number of workers (defaults to the CPU count, 2..=16)
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_memory_threshold_percent")]
    pub memory_threshold_percent: f64,
    /// Per-task deadline; 0 disables it
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_backpressure_poll_ms")]
    pub backpressure_poll_ms: u64,
}

fn default_max_queue_size() -> usize {
    1000
}
fn default_memory_threshold_percent() -> f64 {
    85.0
}
fn default_task_timeout_secs() -> u64 {
    300
}
fn default_backpressure_poll_ms() -> u64 {
    100
}

impl PoolConfig {
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| num_cpus::get().clamp(2, 16))
            .max(1)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms.max(1))
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_queue_size: default_max_queue_size(),
            memory_threshold_percent: default_memory_threshold_percent(),
            task_timeout_secs: default_task_timeout_secs(),
            backpressure_poll_ms: default_backpressure_poll_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Bump to invalidate every cached parse result.
    #[serde(default = "default_schema_version")]
    pub schema_version: i64,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(DATA_DIR).join("parse_cache.sqlite")
}
fn default_ttl_days() -> u64 {
    30
}
fn default_max_entries() -> usize {
    10_000
}
fn default_schema_version() -> i64 {
    1
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days * 24 * 60 * 60)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_cache_path(),
            ttl_days: default_ttl_days(),
            max_entries: default_max_entries(),
            schema_version: default_schema_version(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WriterConfig {
    #[serde(default = "default_write_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delays_secs")]
    pub retry_delays_secs: Vec<u64>,
    #[serde(default = "default_dead_letter_path")]
    pub dead_letter_path: PathBuf,
}

fn default_write_batch_size() -> usize {
    500
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delays_secs() -> Vec<u64> {
    vec![1, 2, 4, 8, 16]
}
fn default_dead_letter_path() -> PathBuf {
    PathBuf::from(DATA_DIR).join("dead_letter.jsonl")
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_write_batch_size(),
            max_retries: default_max_retries(),
            retry_delays_secs: default_retry_delays_secs(),
            dead_letter_path: default_dead_letter_path(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(DATA_DIR).join("graph.sqlite")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatcherConfig {
    #[serde(default)]
    pub ignore: Vec<String>,
    /// File extensions worth ingesting (without the dot)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_extensions() -> Vec<String> {
    ["py", "sql", "rs"].iter().map(|s| s.to_string()).collect()
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            extensions: default_extensions(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct MetricsConfig {
    /// e.g. "127.0.0.1:9091"; no HTTP endpoint when unset
    #[serde(default)]
    pub addr: Option<String>,
}

/// Load configuration from `<data_dir>/config.toml`, falling back to defaults.
pub fn load_config(data_dir: &Path) -> IngestConfig {
    let config_path = data_dir.join("config.toml");
    if !config_path.exists() {
        return IngestConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse config.toml: {}", e);
            IngestConfig::default()
        }),
        Err(e) => {
            tracing::warn!("Failed to read config.toml: {}", e);
            IngestConfig::default()
        }
    }
}

pub const DEFAULT_CONFIG: &str = r#"# graphingest configuration
# See: graphingest config --help

[batcher]
enabled = true
debounce_ms = 2000
batch_size_threshold = 50

[pool]
# workers = 8
max_queue_size = 1000
memory_threshold_percent = 85.0
task_timeout_secs = 300
backpressure_poll_ms = 100

[cache]
enabled = true
path = ".graphingest/parse_cache.sqlite"
ttl_days = 30
max_entries = 10000
schema_version = 1

[writer]
batch_size = 500
max_retries = 5
retry_delays_secs = [1, 2, 4, 8, 16]
dead_letter_path = ".graphingest/dead_letter.jsonl"

[store]
path = ".graphingest/graph.sqlite"

[watcher]
ignore = []
extensions = ["py", "sql", "rs"]

[metrics]
# addr = "127.0.0.1:9091"
"#;
