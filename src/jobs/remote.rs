use std::sync::Arc;

use crate::config::RemoteConfig;
use crate::error::{JobError, RemoteError};
use crate::executor::{CheckIn, QueueType};
use crate::jobs::{BackgroundJob, JobInfo};
use crate::remote::{CalculationStatus, RemoteService, root_failure};
use crate::value::Value;

/// Posts a calculation to the remote compute service. The result is the
/// calculation id as a string value.
///
/// A calculation found canceled right after posting is re-posted once from
/// its stored definition; a failed one is reported by its root cause.
/// A job [`replacing`](RemoteSubmissionJob::replacing) a calculation that
/// was canceled later starts with that re-post.
pub(crate) struct RemoteSubmissionJob {
    remote: Arc<dyn RemoteService>,
    config: RemoteConfig,
    context_id: String,
    calculation: Value,
    canceled: Option<String>,
}

impl RemoteSubmissionJob {
    pub(crate) fn new(
        remote: Arc<dyn RemoteService>,
        config: RemoteConfig,
        context_id: &str,
        calculation: Value,
    ) -> Self {
        Self {
            remote,
            config,
            context_id: context_id.to_string(),
            calculation,
            canceled: None,
        }
    }

    /// Re-posts the definition of `calculation_id` instead of posting anew.
    pub(crate) fn replacing(mut self, calculation_id: &str) -> Self {
        self.canceled = Some(calculation_id.to_string());
        self
    }

    fn resubmit(&self, canceled: &str) -> Result<String, JobError> {
        tracing::warn!("calculation {canceled} was canceled, resubmitting");
        let remote = self.remote.as_ref();
        let ctx = self.context_id.as_str();

        let definition = remote
            .calculation_definition(ctx, canceled)
            .map_err(JobError::new)?;
        remote
            .post_calculation(ctx, &definition)
            .map_err(JobError::new)
    }

    fn submit(&self, check_in: &CheckIn) -> Result<String, JobError> {
        let remote = self.remote.as_ref();
        let ctx = self.context_id.as_str();

        let (mut calculation_id, mut resubmitted) = match &self.canceled {
            Some(canceled) => (self.resubmit(canceled)?, true),
            None => (
                remote
                    .post_calculation(ctx, &self.calculation)
                    .map_err(JobError::new)?,
                false,
            ),
        };

        loop {
            check_in.check_in()?;

            match remote
                .calculation_status(ctx, &calculation_id)
                .map_err(JobError::new)?
            {
                CalculationStatus::Canceled if !resubmitted => {
                    calculation_id = self.resubmit(&calculation_id)?;
                    resubmitted = true;
                }
                CalculationStatus::Canceled => {
                    return Err(JobError::new(RemoteError::CalculationCanceled(calculation_id)));
                }
                CalculationStatus::Failed(failure) => {
                    return Err(JobError::new(root_failure(
                        remote,
                        ctx,
                        &calculation_id,
                        failure,
                        self.config.max_failure_depth,
                    )));
                }
                _ => return Ok(calculation_id),
            }
        }
    }
}

impl BackgroundJob for RemoteSubmissionJob {
    fn execute(
        &mut self,
        check_in: &CheckIn,
        _progress: &(dyn Fn(f32) + Sync),
    ) -> Result<Value, JobError> {
        self.submit(check_in).map(Value::String)
    }

    fn info(&self) -> JobInfo {
        let description = match &self.canceled {
            Some(canceled) => format!("resubmission of {canceled} in {}", self.context_id),
            None => format!("remote calculation submission in {}", self.context_id),
        };
        JobInfo {
            description,
            queue: QueueType::RemoteCalculation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::JobController;
    use crate::remote::CalculationFailure;
    use crate::testing::MockRemote;

    fn run(remote: Arc<MockRemote>) -> Result<Value, JobError> {
        let calculation = Value::String("compute".into());
        let mut job =
            RemoteSubmissionJob::new(remote, RemoteConfig::default(), "ctx", calculation);
        job.execute(&JobController::new().check_in(), &|_: f32| {})
    }

    #[test]
    fn test_returns_calculation_id() {
        let remote = Arc::new(MockRemote::new().with_status("calc-1", vec![CalculationStatus::Queued]));

        assert_eq!(run(remote.clone()).unwrap(), Value::String("calc-1".into()));
        assert_eq!(remote.calls("post_calculation"), 1);
    }

    #[test]
    fn test_canceled_is_resubmitted_once() {
        let remote = Arc::new(
            MockRemote::new()
                .with_status("calc-1", vec![CalculationStatus::Canceled])
                .with_status("calc-2", vec![CalculationStatus::Calculating { progress: 0.1 }])
                .with_definition("calc-1", Value::String("compute".into())),
        );

        assert_eq!(run(remote.clone()).unwrap(), Value::String("calc-2".into()));
        assert_eq!(remote.calls("calculation_definition"), 1);
        assert_eq!(remote.calls("post_calculation"), 2);
    }

    #[test]
    fn test_canceled_twice_fails() {
        let remote = Arc::new(
            MockRemote::new()
                .with_status("calc-1", vec![CalculationStatus::Canceled])
                .with_status("calc-2", vec![CalculationStatus::Canceled])
                .with_definition("calc-1", Value::String("compute".into())),
        );

        let err = run(remote.clone()).unwrap_err();
        assert_eq!(
            err.remote(),
            Some(&RemoteError::CalculationCanceled("calc-2".into()))
        );
        assert_eq!(remote.calls("post_calculation"), 2);
    }

    #[test]
    fn test_replacing_reposts_definition() {
        let remote = Arc::new(
            MockRemote::new()
                .with_status("calc-2", vec![CalculationStatus::Queued])
                .with_definition("calc-1", Value::String("compute".into())),
        );
        let mut job = RemoteSubmissionJob::new(
            remote.clone(),
            RemoteConfig::default(),
            "ctx",
            Value::String("compute".into()),
        )
        .replacing("calc-1");
        // the mock numbers posts from 1, so take calc-1 first
        remote.post_calculation("ctx", &Value::Nil).unwrap();

        let id = job.execute(&JobController::new().check_in(), &|_: f32| {}).unwrap();
        assert_eq!(id, Value::String("calc-2".into()));
        assert_eq!(remote.calls("calculation_definition"), 1);
        assert_eq!(remote.posted()[1], Value::String("compute".into()));
    }

    #[test]
    fn test_failure_reports_root_cause() {
        let remote = Arc::new(
            MockRemote::new()
                .with_status(
                    "calc-1",
                    vec![CalculationStatus::Failed(CalculationFailure {
                        code: "dependency".into(),
                        message: "dependency failed".into(),
                        failed_dependency: Some("calc-0".into()),
                    })],
                )
                .with_status(
                    "calc-0",
                    vec![CalculationStatus::Failed(CalculationFailure {
                        code: "error".into(),
                        message: "negative radius".into(),
                        failed_dependency: None,
                    })],
                ),
        );

        let err = run(remote).unwrap_err();
        assert_eq!(
            err.remote(),
            Some(&RemoteError::CalculationFailed {
                calculation_id: "calc-0".into(),
                message: "negative radius".into(),
            })
        );
    }
}
