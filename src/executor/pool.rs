use std::collections::BTreeMap;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::WorkerConfig;
use crate::executor::{QueueType, Scheduler, Work};

/// Runs every queue type on its own rayon thread pool.
///
/// Separate pools keep a long-running queue (say, remote reads waiting on a
/// slow service) from occupying the threads another queue needs.
pub struct RayonScheduler {
    pools: BTreeMap<QueueType, ThreadPool>,
}

impl RayonScheduler {
    pub fn new(config: &WorkerConfig) -> Result<Self, rayon::ThreadPoolBuildError> {
        let mut pools = BTreeMap::new();

        for queue in QueueType::ALL {
            let pool = ThreadPoolBuilder::new()
                .num_threads(config.threads(queue))
                .thread_name(move |i| format!("cradle-{queue:?}-{i}").to_lowercase())
                .build()?;
            pools.insert(queue, pool);
        }

        Ok(Self { pools })
    }
}

impl Scheduler for RayonScheduler {
    fn submit(&self, queue: QueueType, work: Work) {
        match self.pools.get(&queue) {
            Some(pool) => pool.spawn(work),
            // every queue type gets a pool in `new`
            None => rayon::spawn(work),
        }
    }
}
