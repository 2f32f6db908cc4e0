//! Scheduling interface between the resolution engine and worker threads.
//!
//! The engine never runs work itself. It hands closures to a [`Scheduler`]
//! tagged with a [`QueueType`], and cooperates with cancellation through
//! [`JobController`] / [`CheckIn`].

mod manual;
mod pool;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

pub use crate::executor::manual::ManualScheduler;
pub use crate::executor::pool::RayonScheduler;

use crate::error::JobError;

/// A unit of work handed to a scheduler.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Which queue a piece of work belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Local function execution.
    Calculation,
    /// Reads from the remote storage service.
    WebRead,
    /// Submissions to the remote compute service.
    RemoteCalculation,
    /// Disk cache probes.
    Disk,
    /// Background resolution of whole request trees.
    Resolution,
}

impl QueueType {
    pub const ALL: [QueueType; 5] = [
        QueueType::Calculation,
        QueueType::WebRead,
        QueueType::RemoteCalculation,
        QueueType::Disk,
        QueueType::Resolution,
    ];
}

/// Runs work on behalf of the execution system.
pub trait Scheduler: Send + Sync {
    fn submit(&self, queue: QueueType, work: Work);
}

/// Cancellation flag shared between whoever started a job and the job itself.
#[derive(Debug, Clone, Default)]
pub struct JobController {
    canceled: Arc<AtomicBool>,
}

impl JobController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn same_as(&self, other: &JobController) -> bool {
        Arc::ptr_eq(&self.canceled, &other.canceled)
    }

    pub fn check_in(&self) -> CheckIn {
        CheckIn {
            controller: self.clone(),
        }
    }
}

/// Handed to running jobs so they can stop cooperatively.
#[derive(Debug, Clone)]
pub struct CheckIn {
    controller: JobController,
}

impl CheckIn {
    /// Returns an error once the owning controller has been canceled.
    pub fn check_in(&self) -> Result<(), JobError> {
        if self.controller.is_canceled() {
            Err(JobError::canceled())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_in_observes_cancel() {
        let controller = JobController::new();
        let check_in = controller.check_in();
        assert!(check_in.check_in().is_ok());

        controller.cancel();
        let err = check_in.check_in().unwrap_err();
        assert!(err.is_canceled());
    }

    #[test]
    fn test_controller_identity() {
        let a = JobController::new();
        let b = JobController::new();
        assert!(a.same_as(&a.clone()));
        assert!(!a.same_as(&b));
    }
}
