use std::sync::Arc;

use crate::cache::{CacheKey, DiskCache, EntryStatus, MemoryCache};
use crate::config::SystemConfig;
use crate::core::ArcStr;
use crate::error::SystemError;
use crate::executor::{QueueType, RayonScheduler, Scheduler, Work};
use crate::remote::{NoRemote, RemoteService};
use crate::resolve::Resolver;
use crate::value::Value;

/// Application-level scope of a resolution. Part of every cache key, so
/// results computed in one context are never served to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestContext {
    context_id: ArcStr,
}

impl RequestContext {
    pub fn new(context_id: &str) -> Self {
        Self {
            context_id: context_id.into(),
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }
}

struct Inner {
    config: SystemConfig,
    memory: MemoryCache,
    disk: Option<DiskCache>,
    remote: Arc<dyn RemoteService>,
    scheduler: Arc<dyn Scheduler>,
}

/// Owner of everything shared between resolutions: the memory cache, the
/// optional disk cache, the remote service and the scheduler.
///
/// Cheap to clone; clones share state. Dropping the last clone drops the
/// caches.
#[derive(Clone)]
pub struct ExecutionSystem(Arc<Inner>);

impl ExecutionSystem {
    pub fn builder() -> ExecutionSystemBuilder {
        ExecutionSystemBuilder::default()
    }

    /// A system with `config`, rayon worker pools and no remote service.
    pub fn new(config: SystemConfig) -> Result<Self, SystemError> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &SystemConfig {
        &self.0.config
    }

    pub fn memory_cache(&self) -> &MemoryCache {
        &self.0.memory
    }

    pub fn get_disk_cache(&self) -> Option<&DiskCache> {
        self.0.disk.as_ref()
    }

    pub fn remote(&self) -> &Arc<dyn RemoteService> {
        &self.0.remote
    }

    /// Hands `work` to the scheduler on `queue`.
    pub fn submit(&self, queue: QueueType, work: Work) {
        self.0.scheduler.submit(queue, work);
    }

    /// Stores a value in the memory cache, superseding any job computing it.
    pub fn set_cached_data(&self, key: &CacheKey, value: Value) {
        self.0.memory.set_cached_data(key.memory, value);
    }

    /// Forgets a memory-cached value (canceling its job, if any) so the next
    /// demand recomputes it. The disk cache is not touched.
    pub fn reset_cached_data(&self, key: &CacheKey) {
        self.0.memory.reset_cached_data(key.memory);
    }

    /// Status of the memory cache entry for `key`, including job progress.
    pub fn progress(&self, key: &CacheKey) -> Option<EntryStatus> {
        self.0.memory.get(key.memory).map(|entry| entry.status())
    }

    pub fn resolver<'a>(&'a self, context: &'a RequestContext) -> Resolver<'a> {
        Resolver::new(self, context)
    }
}

#[derive(Default)]
pub struct ExecutionSystemBuilder {
    config: SystemConfig,
    remote: Option<Arc<dyn RemoteService>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl ExecutionSystemBuilder {
    pub fn config(mut self, config: SystemConfig) -> Self {
        self.config = config;
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteService>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Replaces the default rayon scheduler.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> Result<ExecutionSystem, SystemError> {
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(RayonScheduler::new(&self.config.workers)?),
        };

        let disk = match &self.config.disk_cache {
            Some(config) => Some(DiskCache::open(config)?),
            None => None,
        };

        Ok(ExecutionSystem(Arc::new(Inner {
            config: self.config,
            memory: MemoryCache::new(),
            disk,
            remote: self.remote.unwrap_or_else(|| Arc::new(NoRemote)),
            scheduler,
        })))
    }
}
