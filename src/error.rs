//! Error taxonomy for the driver core.
//!
//! Every fallible operation in this crate returns a concrete `DriverError`
//! variant rather than a boxed/opaque error, so callers at the CSI service
//! boundary can switch on the variant to pick a wire status code.

use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation already in progress for {key}")]
    AlreadyInProgress { key: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid volume id {id:?}: {reason}")]
    InvalidVolId { id: String, reason: String },

    #[error("context is not a static volume")]
    NonStaticVolume,

    #[error("omap key not found: {0}")]
    KeyNotFound(String),

    #[error("rados object already exists: {0}")]
    ObjectExists(String),

    #[error("rados object not found: {0}")]
    ObjectNotFound(String),

    #[error("snapshot name conflict: {name} already bound to parent {existing}, requested {requested}")]
    SnapNameConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("clone still in progress for {0}")]
    CloneInProgress(String),

    #[error("clone still pending for {0}")]
    ClonePending(String),

    #[error("clone failed for {0}: {1}")]
    CloneFailed(String, String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("internal inconsistency: {0}")]
    Internal(String),

    #[error("external command {program} failed (exit {exit:?}): {stderr}")]
    CommandFailed {
        program: String,
        exit: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse JSON from {program}: {source}; raw output: {raw}")]
    JsonParse {
        program: String,
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Maps a driver error to a CSI wire status, per this crate's error-propagation
    /// policy: transient errors map to codes the orchestrator will retry.
    pub fn to_status(&self) -> tonic::Status {
        use tonic::Code;
        let code = match self {
            DriverError::InvalidArgument(_) => Code::InvalidArgument,
            DriverError::AlreadyInProgress { .. } => Code::Aborted,
            DriverError::NotFound(_)
            | DriverError::KeyNotFound(_)
            | DriverError::ObjectNotFound(_) => Code::NotFound,
            DriverError::InvalidVolId { .. } => Code::Internal,
            DriverError::NonStaticVolume => Code::InvalidArgument,
            DriverError::ObjectExists(_) => Code::AlreadyExists,
            DriverError::SnapNameConflict { .. } => Code::FailedPrecondition,
            DriverError::CloneInProgress(_) => Code::Aborted,
            DriverError::ClonePending(_) => Code::Internal,
            DriverError::CloneFailed(..) => Code::Internal,
            DriverError::PoolNotFound(_) => Code::Internal,
            DriverError::MountFailed(_) => Code::Internal,
            DriverError::Internal(_) => Code::Internal,
            DriverError::CommandFailed { .. } => Code::Internal,
            DriverError::JsonParse { .. } => Code::Internal,
            DriverError::Io(_) => Code::Internal,
        };
        tonic::Status::new(code, self.to_string())
    }

    /// Recoverable-locally errors: callers GC and continue rather
    /// than surfacing them.
    pub fn is_stale_half_state(&self) -> bool {
        matches!(
            self,
            DriverError::KeyNotFound(_) | DriverError::ObjectNotFound(_) | DriverError::NotFound(_)
        )
    }
}
