use std::sync::Arc;

use thiserror::Error;

/// Failure of a background job.
///
/// One job result is shared by every consumer of the cache entry it fills, so
/// the underlying error is reference-counted and cheap to clone.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct JobError(#[from] pub(crate) Arc<anyhow::Error>);

impl JobError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn canceled() -> Self {
        Self::new(Canceled)
    }

    /// Whether the job stopped because its controller was canceled.
    pub fn is_canceled(&self) -> bool {
        self.0.downcast_ref::<Canceled>().is_some()
    }

    /// The remote failure behind this job error, if there is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        self.0.downcast_ref::<RemoteError>()
    }
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        JobError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
#[error("job canceled")]
pub struct Canceled;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("expected {expected}, found {found}")]
    Mismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("integer {0} out of range")]
    OutOfRange(i64),

    #[error("{0}")]
    Custom(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("Couldn't encode value.\n{0}")]
    Encode(String),

    #[error("Couldn't decode value.\n{0}")]
    Decode(String),
}

/// Errors reported by (or about) the remote compute service.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RemoteError {
    #[error("No remote service is configured")]
    Unavailable,

    #[error("Request to {endpoint} failed with status {status}: {message}")]
    Http {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Calculation {calculation_id} failed: {message}")]
    CalculationFailed {
        calculation_id: String,
        message: String,
    },

    #[error("Calculation {0} was canceled")]
    CalculationCanceled(String),

    #[error("Object {object_id} still pending after {attempts} attempts")]
    RetriesExhausted { object_id: String, attempts: u32 },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum DiskCacheError {
    #[error("Disk cache I/O failed.\n{0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Unknown disk cache entry {0}")]
    UnknownEntry(String),
}

/// Everything that can go wrong while resolving a request.
///
/// `Internal` marks a violated engine invariant (a programming error), the
/// other variants carry genuine failures of the computation itself.
#[derive(Debug, Error, Clone)]
pub enum ResolveError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Required value is missing")]
    EmptyOptional,

    #[error("Function '{id}' failed:\n{source}")]
    Function { id: String, source: JobError },
}

impl ResolveError {
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        ResolveError::Internal(msg.into())
    }

    /// Whether this error is an internal invariant violation.
    pub fn is_internal(&self) -> bool {
        matches!(self, ResolveError::Internal(_))
    }
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Couldn't build worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Couldn't open disk cache.\n{0}")]
    Disk(#[from] DiskCacheError),

    #[error("Couldn't parse configuration.\n{0}")]
    Config(#[from] serde_json::Error),

    #[cfg(feature = "logging")]
    #[error("Couldn't install tracing subscriber.\n{0}")]
    Logging(String),
}
