use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::executor::{QueueType, Scheduler, Work};

/// A scheduler that only queues work; the owner decides when it runs.
///
/// Suited to single-threaded hosts that pump jobs from their own loop, and to
/// tests that need to observe exactly which jobs were scheduled.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<(QueueType, Work)>>,
    submitted: Mutex<BTreeMap<QueueType, usize>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued, not yet run, items.
    pub fn pending(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Total number of items ever submitted to `queue`.
    pub fn submitted(&self, queue: QueueType) -> usize {
        self.submitted
            .lock()
            .map(|s| s.get(&queue).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Runs the items queued at the time of the call. Work submitted while
    /// they run stays queued. Returns how many items ran.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<_> = match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return 0,
        };

        let count = batch.len();
        for (_, work) in batch {
            work();
        }
        count
    }

    /// Runs work until the queue is empty or `max_rounds` batches have run.
    /// Returns the total number of items run.
    pub fn run_until_idle(&self, max_rounds: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_rounds {
            let ran = self.run_pending();
            if ran == 0 {
                break;
            }
            total += ran;
        }
        total
    }
}

impl Scheduler for ManualScheduler {
    fn submit(&self, queue: QueueType, work: Work) {
        if let Ok(mut submitted) = self.submitted.lock() {
            *submitted.entry(queue).or_default() += 1;
        }
        if let Ok(mut pending) = self.queue.lock() {
            pending.push_back((queue, work));
        }
    }
}
