//! Job identification and listing types.

use serde::{Deserialize, Serialize};

use crate::state::JobState;

/// Unique identifier for a managed job.
///
/// Assigned by the job manager, monotonically increasing, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Information about a job for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job ID.
    pub id: JobId,
    /// Command description (display only).
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Leading process ID, if the job has spawned.
    pub pid: Option<i32>,
    /// Exit code once the job has terminated.
    pub exit_code: Option<i32>,
    /// Wall-clock start, milliseconds since the unix epoch.
    pub started_at_ms: u64,
    /// Wall-clock end, milliseconds since the unix epoch. Zero while live.
    pub ended_at_ms: u64,
}
