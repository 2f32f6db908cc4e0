use std::sync::Arc;

use crate::error::JobError;
use crate::executor::{CheckIn, QueueType};
use crate::jobs::{BackgroundJob, JobInfo};
use crate::remote::RemoteService;
use crate::value::Value;

/// Downloads immutable data. The result is the raw payload as a blob; the
/// request's descriptor decodes it.
pub(crate) struct ImmutableFetchJob {
    remote: Arc<dyn RemoteService>,
    context_id: String,
    immutable_id: String,
}

impl ImmutableFetchJob {
    pub(crate) fn new(remote: Arc<dyn RemoteService>, context_id: &str, immutable_id: &str) -> Self {
        Self {
            remote,
            context_id: context_id.to_string(),
            immutable_id: immutable_id.to_string(),
        }
    }
}

impl BackgroundJob for ImmutableFetchJob {
    fn execute(
        &mut self,
        check_in: &CheckIn,
        _progress: &(dyn Fn(f32) + Sync),
    ) -> Result<Value, JobError> {
        check_in.check_in()?;
        let data = self
            .remote
            .fetch_immutable(&self.context_id, &self.immutable_id)
            .map_err(JobError::new)?;
        Ok(Value::Blob(data))
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            description: format!("immutable fetch {}", self.immutable_id),
            queue: QueueType::WebRead,
        }
    }
}
