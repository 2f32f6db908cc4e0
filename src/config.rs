use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::error::SystemError;
use crate::executor::QueueType;

/// Configuration of an [`ExecutionSystem`](crate::ExecutionSystem).
///
/// Every field has a default, so an empty JSON object is a valid
/// configuration (memory caching only, small worker pools).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Persistent cache. Disabled when absent.
    pub disk_cache: Option<DiskCacheConfig>,
    pub workers: WorkerConfig,
    pub policy: ResolutionPolicy,
    pub remote: RemoteConfig,
    /// How long a background resolution waits for any cache entry to change
    /// before driving its request tree again.
    pub poll_interval_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            disk_cache: None,
            workers: WorkerConfig::default(),
            policy: ResolutionPolicy::default(),
            remote: RemoteConfig::default(),
            poll_interval_ms: 50,
        }
    }
}

impl SystemConfig {
    pub fn from_json(text: &str) -> Result<Self, SystemError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskCacheConfig {
    pub directory: Utf8PathBuf,
    /// Entries are evicted, least recently used first, above this many bytes.
    #[serde(default = "default_size_limit")]
    pub size_limit: u64,
}

fn default_size_limit() -> u64 {
    1 << 30
}

impl DiskCacheConfig {
    pub fn new(directory: impl Into<Utf8PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            size_limit: default_size_limit(),
        }
    }
}

/// Number of worker threads per queue type.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub calculation: usize,
    pub web_read: usize,
    pub remote_calculation: usize,
    pub disk: usize,
    pub resolution: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            calculation: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            web_read: 8,
            remote_calculation: 4,
            disk: 2,
            resolution: 4,
        }
    }
}

impl WorkerConfig {
    pub fn threads(&self, queue: QueueType) -> usize {
        let n = match queue {
            QueueType::Calculation => self.calculation,
            QueueType::WebRead => self.web_read,
            QueueType::RemoteCalculation => self.remote_calculation,
            QueueType::Disk => self.disk,
            QueueType::Resolution => self.resolution,
        };
        n.max(1)
    }
}

/// Tunables of the resolution engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolutionPolicy {
    /// Composite nodes (arrays, structures, foreground functions) with at most
    /// this many non-trivial children only track those children and evaluate
    /// the rest inline. Above it every child gets its own resolution state.
    pub passthrough_limit: usize,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self {
            passthrough_limit: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// How many times a pending object lookup is retried.
    pub max_retries: u32,
    /// Pause between polls of a calculation that is still running.
    pub retry_delay_ms: u64,
    /// Longest chain of failed dependencies followed to find a root cause.
    pub max_failure_depth: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_retries: 100,
            retry_delay_ms: 250,
            max_failure_depth: 64,
        }
    }
}

impl RemoteConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
