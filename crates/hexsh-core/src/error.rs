//! Error taxonomy for the orchestration core.
//!
//! Failures before a job becomes observable are surfaced synchronously
//! to the caller of `spawn`; failures after are surfaced through
//! observers and the job's final state.

use hexsh_types::{Channel, InvalidTransition, JobId};

/// Core result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything the core can fail with.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Creating the pipe/handle set failed; no job was created.
    #[error("failed to create channel endpoints: {0}")]
    EndpointCreation(#[source] std::io::Error),

    /// The child could not be spawned; endpoints are closed.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to launch.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// `write_input` (or `write_data`) after the endpoint was closed.
    #[error("{0} endpoint already closed")]
    InputClosed(Channel),

    /// The channel was not enabled at spawn time.
    #[error("channel {0} is not wired for this child")]
    ChannelDisabled(Channel),

    /// A job-control operation the state machine rejects.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Operation referenced a job the manager does not hold.
    #[error("no such job: {0}")]
    NoSuchJob(JobId),

    /// Signal-style operation on a job that already terminated.
    #[error("job {id} is not live (state {state})")]
    JobNotLive {
        /// The job in question.
        id: JobId,
        /// Its current state.
        state: hexsh_types::JobState,
    },

    /// `wait` gave up before the job terminated.
    #[error("timed out waiting for job {0}")]
    WaitTimeout(JobId),

    /// Signal delivery failed.
    #[error("failed to signal process group: {0}")]
    Signal(#[source] std::io::Error),

    /// Terminal arbitration failed while a TTY exists. (Without a
    /// controlling terminal these operations are success no-ops and
    /// never produce this error.)
    #[error("terminal operation failed: {0}")]
    Terminal(#[source] std::io::Error),

    /// Anything else from the host.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(unix)]
impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(errno))
    }
}
