use crate::config::ConfigError;
use crate::launcher::LaunchError;
use crate::metrics::MetricsError;
use crate::queue::QueueError;
use crate::JobId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdleqError {
    #[error(transparent)]
    QueueError(#[from] QueueError),
    #[error(transparent)]
    MetricsError(#[from] MetricsError),
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
    #[error("Could not determine the current directory: {0}")]
    WorkingDirectory(#[source] std::io::Error),
    #[error("Job {id} was taken off the queue but could not be started, re-add it with `idleq add {command}`: {source}")]
    LaunchFailed {
        id: JobId,
        command: String,
        source: LaunchError,
    },
}

impl IdleqError {
    /// Process exit code for this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            IdleqError::ConfigError(_) => 2,
            IdleqError::QueueError(QueueError::LockTimeout { .. }) => 3,
            IdleqError::QueueError(QueueError::CorruptStore { .. }) => 4,
            IdleqError::QueueError(_) => 1,
            IdleqError::WorkingDirectory(_) => 1,
            IdleqError::MetricsError(_) => 5,
            IdleqError::LaunchFailed { .. } => 6,
        }
    }
}
