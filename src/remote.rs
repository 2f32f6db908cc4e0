//! Interface to the remote compute and storage service.
//!
//! The engine only consumes this contract; transports live outside the crate.
//! Endpoints named in the docs below are those of the HTTP service the
//! interface mirrors.

use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::value::Value;

/// Answer of an object to immutable-id lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLookup {
    /// The object's data is stored under this immutable id.
    Immutable(String),
    /// HTTP 202: the object is the output of a calculation that hasn't
    /// finished. Wait on it and ask again.
    Pending { calculation_id: String },
}

/// Why a calculation failed, as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationFailure {
    pub code: String,
    pub message: String,
    /// Set when the failure was caused by a failed sub-calculation.
    #[serde(default)]
    pub failed_dependency: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalculationStatus {
    Waiting,
    Queued,
    Calculating { progress: f32 },
    Uploading,
    Completed,
    Failed(CalculationFailure),
    Canceled,
}

pub trait RemoteService: Send + Sync {
    /// `GET /iss/{object_id}/immutable`
    fn resolve_object(&self, context_id: &str, object_id: &str)
    -> Result<ObjectLookup, RemoteError>;

    /// `GET /iss/immutable/{immutable_id}`
    fn fetch_immutable(&self, context_id: &str, immutable_id: &str)
    -> Result<Vec<u8>, RemoteError>;

    /// `POST /calc/{context_id}`, returning the calculation id.
    fn post_calculation(&self, context_id: &str, calculation: &Value)
    -> Result<String, RemoteError>;

    /// `GET /calc/{calculation_id}/status`
    fn calculation_status(
        &self,
        context_id: &str,
        calculation_id: &str,
    ) -> Result<CalculationStatus, RemoteError>;

    /// `GET /calc/{calculation_id}`: the definition the calculation was
    /// posted with.
    fn calculation_definition(
        &self,
        context_id: &str,
        calculation_id: &str,
    ) -> Result<Value, RemoteError>;

    /// Long-polls a calculation. Services without long polling answer with
    /// the current status.
    fn wait_for_calculation(
        &self,
        context_id: &str,
        calculation_id: &str,
    ) -> Result<CalculationStatus, RemoteError> {
        self.calculation_status(context_id, calculation_id)
    }
}

/// Stand-in used when no remote service is configured. Every call fails with
/// [`RemoteError::Unavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemote;

impl RemoteService for NoRemote {
    fn resolve_object(&self, _: &str, _: &str) -> Result<ObjectLookup, RemoteError> {
        Err(RemoteError::Unavailable)
    }

    fn fetch_immutable(&self, _: &str, _: &str) -> Result<Vec<u8>, RemoteError> {
        Err(RemoteError::Unavailable)
    }

    fn post_calculation(&self, _: &str, _: &Value) -> Result<String, RemoteError> {
        Err(RemoteError::Unavailable)
    }

    fn calculation_status(&self, _: &str, _: &str) -> Result<CalculationStatus, RemoteError> {
        Err(RemoteError::Unavailable)
    }

    fn calculation_definition(&self, _: &str, _: &str) -> Result<Value, RemoteError> {
        Err(RemoteError::Unavailable)
    }
}

/// Follows `failed_dependency` links from a failed calculation to the
/// calculation that actually failed, visiting at most `max_depth` links.
///
/// The chain stops early at a dependency whose status can't be read or isn't
/// a failure; the last failure seen is reported.
pub fn root_failure(
    remote: &dyn RemoteService,
    context_id: &str,
    calculation_id: &str,
    failure: CalculationFailure,
    max_depth: usize,
) -> RemoteError {
    let mut calculation_id = calculation_id.to_string();
    let mut failure = failure;

    for _ in 0..max_depth {
        let Some(dependency) = failure.failed_dependency.clone() else {
            break;
        };

        match remote.calculation_status(context_id, &dependency) {
            Ok(CalculationStatus::Failed(next)) => {
                tracing::debug!("calculation {calculation_id} failed because of {dependency}");
                calculation_id = dependency;
                failure = next;
            }
            _ => break,
        }
    }

    RemoteError::CalculationFailed {
        calculation_id,
        message: failure.message,
    }
}
