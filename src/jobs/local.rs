use std::sync::Arc;

use crate::error::JobError;
use crate::executor::{CheckIn, QueueType};
use crate::jobs::{BackgroundJob, JobInfo};
use crate::request::{CallContext, Function};
use crate::value::Value;

/// Runs a registered function over already resolved arguments.
pub(crate) struct LocalCalculationJob {
    function: Arc<dyn Function>,
    args: Vec<Value>,
}

impl LocalCalculationJob {
    pub(crate) fn new(function: Arc<dyn Function>, args: Vec<Value>) -> Self {
        Self { function, args }
    }
}

impl BackgroundJob for LocalCalculationJob {
    fn execute(
        &mut self,
        check_in: &CheckIn,
        progress: &(dyn Fn(f32) + Sync),
    ) -> Result<Value, JobError> {
        check_in.check_in()?;
        let ctx = CallContext::background(check_in, progress);
        Ok(self.function.call(&self.args, &ctx)?)
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            description: format!("local calculation '{}'", self.function.id()),
            queue: QueueType::Calculation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::JobController;
    use crate::request::FnFunction;

    #[test]
    fn test_calls_function_with_args() {
        let function = FnFunction::new("concat", |args, ctx| {
            ctx.report_progress(1.0);
            let joined: String = args.iter().map(|a| a.to_string()).collect();
            Ok(Value::String(joined))
        })
        .into_arc();

        let mut job = LocalCalculationJob::new(
            function,
            vec![Value::Integer(1), Value::Integer(2)],
        );
        let controller = JobController::new();
        let out = job.execute(&controller.check_in(), &|_: f32| {}).unwrap();

        assert_eq!(out, Value::String("12".into()));
        assert_eq!(job.info().queue, QueueType::Calculation);
    }

    #[test]
    fn test_cooperates_with_cancellation() {
        let function = FnFunction::new("loop", |_, ctx| {
            ctx.check_in()?;
            Ok(Value::Nil)
        })
        .into_arc();

        let controller = JobController::new();
        controller.cancel();
        let mut job = LocalCalculationJob::new(function, vec![]);
        let err = job.execute(&controller.check_in(), &|_: f32| {}).unwrap_err();

        assert!(err.is_canceled());
    }
}
