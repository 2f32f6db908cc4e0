//! Background jobs and the protocol that runs them.
//!
//! A job fills exactly one memory cache entry. Launching goes through the
//! entry's own state machine, so at most one job per entry is ever in
//! flight. When the system has a disk cache and the entry is disk-backed,
//! the disk is probed first (on the DISK queue) and the job only runs on a
//! miss. A successful job writes its result to disk before publishing it.

mod immutable;
mod local;
mod object;
mod remote;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::Level;

pub(crate) use crate::jobs::immutable::ImmutableFetchJob;
pub(crate) use crate::jobs::local::LocalCalculationJob;
pub(crate) use crate::jobs::object::ObjectResolutionJob;
pub(crate) use crate::jobs::remote::RemoteSubmissionJob;

use crate::cache::{CacheEntry, read_value, write_value};
use crate::error::JobError;
use crate::executor::{CheckIn, JobController, QueueType};
use crate::system::ExecutionSystem;
use crate::value::Value;

/// Diagnostic description of a job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub description: String,
    pub queue: QueueType,
}

pub trait BackgroundJob: Send + 'static {
    /// Stages whatever the job needs before it can run.
    fn gather_inputs(&mut self) -> Result<(), JobError> {
        Ok(())
    }

    /// Whether the staged inputs are available. A job that isn't ready is
    /// put back on its queue.
    fn inputs_ready(&self) -> bool {
        true
    }

    fn execute(
        &mut self,
        check_in: &CheckIn,
        progress: &(dyn Fn(f32) + Sync),
    ) -> Result<Value, JobError>;

    fn info(&self) -> JobInfo;
}

/// Starts `job` for `entry` unless the entry is already held or computing.
/// Returns whether a job was started.
pub(crate) fn launch(
    system: &ExecutionSystem,
    entry: &CacheEntry,
    disk_key: Option<String>,
    job: Box<dyn BackgroundJob>,
) -> bool {
    let controller = JobController::new();
    if !entry.try_begin(&controller) {
        return false;
    }

    tracing::debug!("launching {}", job.info().description);

    let run = Run {
        system: system.clone(),
        entry: entry.clone(),
        controller,
        disk_key,
        job,
    };

    if run.disk_key.is_some() && system.get_disk_cache().is_some() {
        system.submit(QueueType::Disk, Box::new(move || run.probe_disk()));
    } else {
        run.submit();
    }
    true
}

/// Starts `job` in place of the value `stale` held by `entry`, skipping the
/// disk probe so the stale value can't come back from disk. The job's result
/// overwrites the disk entry. Returns whether a job was started.
pub(crate) fn relaunch(
    system: &ExecutionSystem,
    entry: &CacheEntry,
    stale: &Value,
    disk_key: Option<String>,
    job: Box<dyn BackgroundJob>,
) -> bool {
    let controller = JobController::new();
    if !entry.try_replace(stale, &controller) {
        return false;
    }

    tracing::debug!("relaunching {}", job.info().description);

    Run {
        system: system.clone(),
        entry: entry.clone(),
        controller,
        disk_key,
        job,
    }
    .submit();
    true
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

struct Run {
    system: ExecutionSystem,
    entry: CacheEntry,
    controller: JobController,
    disk_key: Option<String>,
    job: Box<dyn BackgroundJob>,
}

impl Run {
    fn probe_disk(self) {
        if self.controller.is_canceled() {
            self.entry.finish(&self.controller, Err(JobError::canceled()));
            return;
        }

        let hit = match (self.system.get_disk_cache(), &self.disk_key) {
            (Some(disk), Some(key)) => read_value(disk, key),
            _ => None,
        };

        match hit {
            Some(value) => {
                tracing::debug!("disk cache hit for {}", self.job.info().description);
                self.entry.finish(&self.controller, Ok(value));
            }
            None => self.submit(),
        }
    }

    fn submit(self) {
        let queue = self.job.info().queue;
        let system = self.system.clone();
        system.submit(queue, Box::new(move || self.run()));
    }

    fn run(mut self) {
        let info = self.job.info();
        let span = tracing::span!(Level::INFO, "job", description = %info.description);
        let _enter = span.enter();

        let check_in = self.controller.check_in();
        if let Err(e) = check_in.check_in() {
            self.entry.finish(&self.controller, Err(e));
            return;
        }

        if let Err(e) = self.job.gather_inputs() {
            self.entry.finish(&self.controller, Err(e));
            return;
        }
        if !self.job.inputs_ready() {
            tracing::trace!("inputs not ready, requeueing");
            self.submit();
            return;
        }

        let entry = self.entry.clone();
        let controller = self.controller.clone();
        let report = move |progress: f32| entry.report_progress(&controller, progress);

        let result = match catch_unwind(AssertUnwindSafe(|| self.job.execute(&check_in, &report))) {
            Ok(result) => result,
            Err(panic) => Err(JobError::new(anyhow::anyhow!(
                "Job panicked: {}",
                panic_message(&*panic)
            ))),
        };

        match &result {
            Ok(value) => {
                tracing::debug!("finished");
                if let (Some(disk), Some(key)) = (self.system.get_disk_cache(), &self.disk_key) {
                    write_value(disk, key, value);
                }
            }
            Err(e) if e.is_canceled() => tracing::debug!("canceled"),
            Err(e) => tracing::warn!("failed: {e}"),
        }

        self.entry.finish(&self.controller, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::cache::EntryStatus;
    use crate::config::{DiskCacheConfig, SystemConfig};
    use crate::core::Hash32;
    use crate::executor::ManualScheduler;

    struct Constant(Value);

    impl BackgroundJob for Constant {
        fn execute(&mut self, _: &CheckIn, progress: &(dyn Fn(f32) + Sync)) -> Result<Value, JobError> {
            progress(0.5);
            Ok(self.0.clone())
        }

        fn info(&self) -> JobInfo {
            JobInfo {
                description: "constant".into(),
                queue: QueueType::Calculation,
            }
        }
    }

    struct Panics;

    impl BackgroundJob for Panics {
        fn execute(&mut self, _: &CheckIn, _: &(dyn Fn(f32) + Sync)) -> Result<Value, JobError> {
            panic!("oh no")
        }

        fn info(&self) -> JobInfo {
            JobInfo {
                description: "panics".into(),
                queue: QueueType::Calculation,
            }
        }
    }

    fn system(scheduler: &Arc<ManualScheduler>, config: SystemConfig) -> ExecutionSystem {
        ExecutionSystem::builder()
            .config(config)
            .scheduler(scheduler.clone())
            .build()
            .unwrap()
    }

    fn disk_config(dir: &TempDir) -> SystemConfig {
        let directory = camino::Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        SystemConfig {
            disk_cache: Some(DiskCacheConfig::new(directory)),
            ..Default::default()
        }
    }

    #[test]
    fn test_launch_runs_once() {
        let scheduler = Arc::new(ManualScheduler::new());
        let system = system(&scheduler, SystemConfig::default());
        let entry = system.memory_cache().entry(Hash32::hash(b"k"));

        assert!(launch(&system, &entry, None, Box::new(Constant(Value::Integer(1)))));
        assert!(!launch(&system, &entry, None, Box::new(Constant(Value::Integer(2)))));
        assert_eq!(scheduler.submitted(QueueType::Disk), 0);

        scheduler.run_until_idle(10);
        assert_eq!(entry.value(), Some(Value::Integer(1)));
        assert_eq!(scheduler.submitted(QueueType::Calculation), 1);
    }

    #[test]
    fn test_panic_becomes_failure() {
        let scheduler = Arc::new(ManualScheduler::new());
        let system = system(&scheduler, SystemConfig::default());
        let entry = system.memory_cache().entry(Hash32::hash(b"k"));

        launch(&system, &entry, None, Box::new(Panics));
        scheduler.run_until_idle(10);

        assert_eq!(entry.status(), EntryStatus::Failed);
        assert!(entry.error().unwrap().to_string().contains("oh no"));
    }

    #[test]
    fn test_disk_probe_precedes_job() {
        let dir = TempDir::new().unwrap();
        let scheduler = Arc::new(ManualScheduler::new());

        {
            let system = system(&scheduler, disk_config(&dir));
            let entry = system.memory_cache().entry(Hash32::hash(b"k"));
            launch(&system, &entry, Some("ctx/k".into()), Box::new(Constant(Value::Integer(9))));
            scheduler.run_until_idle(10);
            assert_eq!(entry.value(), Some(Value::Integer(9)));
        }
        assert_eq!(scheduler.submitted(QueueType::Disk), 1);
        assert_eq!(scheduler.submitted(QueueType::Calculation), 1);

        // a fresh process finds the value on disk and never runs the job
        let system = system(&scheduler, disk_config(&dir));
        let entry = system.memory_cache().entry(Hash32::hash(b"k"));
        launch(&system, &entry, Some("ctx/k".into()), Box::new(Panics));
        scheduler.run_until_idle(10);

        assert_eq!(entry.value(), Some(Value::Integer(9)));
        assert_eq!(scheduler.submitted(QueueType::Disk), 2);
        assert_eq!(scheduler.submitted(QueueType::Calculation), 1);
    }

    #[test]
    fn test_relaunch_replaces_stale_value_on_disk() {
        let dir = TempDir::new().unwrap();
        let scheduler = Arc::new(ManualScheduler::new());

        {
            let system = system(&scheduler, disk_config(&dir));
            let entry = system.memory_cache().entry(Hash32::hash(b"k"));
            launch(&system, &entry, Some("ctx/k".into()), Box::new(Constant(Value::Integer(1))));
            scheduler.run_until_idle(10);

            let stale = Value::Integer(7);
            assert!(!relaunch(&system, &entry, &stale, Some("ctx/k".into()), Box::new(Panics)));

            let stale = Value::Integer(1);
            let replacement = Box::new(Constant(Value::Integer(2)));
            assert!(relaunch(&system, &entry, &stale, Some("ctx/k".into()), replacement));
            scheduler.run_until_idle(10);
            assert_eq!(entry.value(), Some(Value::Integer(2)));
        }
        assert_eq!(scheduler.submitted(QueueType::Disk), 1);
        assert_eq!(scheduler.submitted(QueueType::Calculation), 2);

        let system = system(&scheduler, disk_config(&dir));
        let entry = system.memory_cache().entry(Hash32::hash(b"k"));
        launch(&system, &entry, Some("ctx/k".into()), Box::new(Panics));
        scheduler.run_until_idle(10);
        assert_eq!(entry.value(), Some(Value::Integer(2)));
    }

    #[test]
    fn test_canceled_before_running() {
        let scheduler = Arc::new(ManualScheduler::new());
        let system = system(&scheduler, SystemConfig::default());
        let key = Hash32::hash(b"k");
        let entry = system.memory_cache().entry(key);

        launch(&system, &entry, None, Box::new(Constant(Value::Nil)));
        system.memory_cache().reset_cached_data(key);
        scheduler.run_until_idle(10);

        assert_eq!(entry.status(), EntryStatus::Nowhere);
    }
}
