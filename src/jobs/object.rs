use std::sync::Arc;

use crate::config::RemoteConfig;
use crate::error::{JobError, RemoteError};
use crate::executor::{CheckIn, QueueType};
use crate::jobs::{BackgroundJob, JobInfo};
use crate::remote::{CalculationStatus, ObjectLookup, RemoteService, root_failure};
use crate::value::Value;

/// Resolves an object id to the immutable id its data is stored under.
///
/// Objects produced by unfinished calculations answer "pending"; the job
/// waits on the referenced calculation and asks again, up to
/// `max_retries` times. A canceled calculation fails the job; the chain that
/// submitted it decides whether to post it again.
pub(crate) struct ObjectResolutionJob {
    remote: Arc<dyn RemoteService>,
    config: RemoteConfig,
    context_id: String,
    object_id: String,
}

impl ObjectResolutionJob {
    pub(crate) fn new(
        remote: Arc<dyn RemoteService>,
        config: RemoteConfig,
        context_id: &str,
        object_id: &str,
    ) -> Self {
        Self {
            remote,
            config,
            context_id: context_id.to_string(),
            object_id: object_id.to_string(),
        }
    }
}

impl BackgroundJob for ObjectResolutionJob {
    fn execute(
        &mut self,
        check_in: &CheckIn,
        progress: &(dyn Fn(f32) + Sync),
    ) -> Result<Value, JobError> {
        let remote = self.remote.as_ref();
        let ctx = self.context_id.as_str();

        for attempt in 0..=self.config.max_retries {
            check_in.check_in()?;

            let calculation_id = match remote
                .resolve_object(ctx, &self.object_id)
                .map_err(JobError::new)?
            {
                ObjectLookup::Immutable(immutable_id) => return Ok(Value::String(immutable_id)),
                ObjectLookup::Pending { calculation_id } => calculation_id,
            };

            tracing::debug!(
                "object {} pending on calculation {calculation_id} (attempt {attempt})",
                self.object_id
            );

            match remote
                .wait_for_calculation(ctx, &calculation_id)
                .map_err(JobError::new)?
            {
                CalculationStatus::Failed(failure) => {
                    return Err(JobError::new(root_failure(
                        remote,
                        ctx,
                        &calculation_id,
                        failure,
                        self.config.max_failure_depth,
                    )));
                }
                CalculationStatus::Canceled => {
                    return Err(JobError::new(RemoteError::CalculationCanceled(calculation_id)));
                }
                CalculationStatus::Completed | CalculationStatus::Uploading => {}
                CalculationStatus::Calculating { progress: p } => {
                    progress(p);
                    std::thread::sleep(self.config.retry_delay());
                }
                CalculationStatus::Waiting | CalculationStatus::Queued => {
                    std::thread::sleep(self.config.retry_delay());
                }
            }
        }

        Err(JobError::new(RemoteError::RetriesExhausted {
            object_id: self.object_id.clone(),
            attempts: self.config.max_retries.saturating_add(1),
        }))
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            description: format!("object resolution {}", self.object_id),
            queue: QueueType::WebRead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::JobController;
    use crate::remote::CalculationFailure;
    use crate::testing::MockRemote;

    fn config(max_retries: u32) -> RemoteConfig {
        RemoteConfig {
            max_retries,
            retry_delay_ms: 0,
            max_failure_depth: 8,
        }
    }

    fn run(remote: Arc<MockRemote>, max_retries: u32) -> Result<Value, JobError> {
        let mut job = ObjectResolutionJob::new(remote, config(max_retries), "ctx", "obj-1");
        job.execute(&JobController::new().check_in(), &|_: f32| {})
    }

    #[test]
    fn test_direct_lookup() {
        let remote = Arc::new(
            MockRemote::new().with_object("obj-1", vec![ObjectLookup::Immutable("imm-1".into())]),
        );
        assert_eq!(run(remote, 3).unwrap(), Value::String("imm-1".into()));
    }

    #[test]
    fn test_waits_on_pending_calculation() {
        let remote = Arc::new(
            MockRemote::new()
                .with_object(
                    "obj-1",
                    vec![
                        ObjectLookup::Pending {
                            calculation_id: "calc-9".into(),
                        },
                        ObjectLookup::Immutable("imm-1".into()),
                    ],
                )
                .with_status("calc-9", vec![CalculationStatus::Completed]),
        );

        assert_eq!(run(remote.clone(), 3).unwrap(), Value::String("imm-1".into()));
        assert_eq!(remote.calls("resolve_object"), 2);
        assert_eq!(remote.calls("wait_for_calculation"), 1);
    }

    #[test]
    fn test_gives_up_after_retries() {
        let remote = Arc::new(
            MockRemote::new()
                .with_object(
                    "obj-1",
                    vec![ObjectLookup::Pending {
                        calculation_id: "calc-9".into(),
                    }],
                )
                .with_status("calc-9", vec![CalculationStatus::Queued]),
        );

        let err = run(remote.clone(), 2).unwrap_err();
        assert_eq!(
            err.remote(),
            Some(&RemoteError::RetriesExhausted {
                object_id: "obj-1".into(),
                attempts: 3,
            })
        );
        assert_eq!(remote.calls("resolve_object"), 3);
    }

    #[test]
    fn test_failed_calculation_surfaces() {
        let remote = Arc::new(
            MockRemote::new()
                .with_object(
                    "obj-1",
                    vec![ObjectLookup::Pending {
                        calculation_id: "calc-9".into(),
                    }],
                )
                .with_status(
                    "calc-9",
                    vec![CalculationStatus::Failed(CalculationFailure {
                        code: "error".into(),
                        message: "out of memory".into(),
                        failed_dependency: None,
                    })],
                ),
        );

        let err = run(remote, 5).unwrap_err();
        assert_eq!(
            err.remote(),
            Some(&RemoteError::CalculationFailed {
                calculation_id: "calc-9".into(),
                message: "out of memory".into(),
            })
        );
    }
}
