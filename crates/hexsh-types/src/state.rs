//! The job lifecycle state machine.
//!
//! A pure transition function over (state, event). The table is total:
//! every pair either yields a new state or a typed
//! [`InvalidTransition`] error that leaves the state unchanged.
//! `Terminated` is absorbing.
//!
//! ```text
//!            Spawn              CtrlZ / ChildStop
//!   None ──────────▶ Foreground ─────────────────▶ Stopped
//!     │                  │  ▲                      │    │
//!     │ SpawnBg          │  └──────── FgCmd ───────┘    │ BgCmd
//!     │            CtrlC │ ChildExit                    ▼
//!     └──────▶ Background ─────────▶ Terminated ◀── Background
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a job.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Not yet spawned.
    None = 0,
    /// Owns the terminal, receives input.
    Foreground = 1,
    /// Runs asynchronously, output buffered.
    Background = 2,
    /// Suspended, waiting for resume.
    Stopped = 3,
    /// Exited; absorbing.
    Terminated = 4,
}

impl JobState {
    /// Decode from the raw discriminant (for atomic storage).
    pub const fn from_u8(raw: u8) -> JobState {
        match raw {
            1 => JobState::Foreground,
            2 => JobState::Background,
            3 => JobState::Stopped,
            4 => JobState::Terminated,
            _ => JobState::None,
        }
    }

    /// True for states a live child can be in.
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            JobState::Foreground | JobState::Background | JobState::Stopped
        )
    }

    /// Every event this state accepts.
    pub fn valid_events(self) -> Vec<JobEvent> {
        JobEvent::ALL
            .iter()
            .copied()
            .filter(|ev| transition(self, *ev).is_ok())
            .collect()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::None => "None",
            JobState::Foreground => "Foreground",
            JobState::Background => "Background",
            JobState::Stopped => "Stopped",
            JobState::Terminated => "Terminated",
        };
        write!(f, "{name}")
    }
}

/// An event driving a job transition.
///
/// The first six originate from the user (via the line editor or the
/// `fg`/`bg` builtins); the next three from the kernel; the last two
/// are internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEvent {
    /// New foreground process.
    Spawn,
    /// New background process.
    SpawnBg,
    /// Ctrl+C — interrupt.
    CtrlC,
    /// Ctrl+Z — suspend.
    CtrlZ,
    /// `fg` — bring to foreground.
    FgCmd,
    /// `bg` — resume in background.
    BgCmd,
    /// Child exited.
    ChildExit,
    /// Child stopped (SIGTSTP/SIGTTIN).
    ChildStop,
    /// Background child attempted to read the terminal.
    TtyRead,
    /// Operation timed out.
    Timeout,
    /// Unrecoverable error.
    Error,
}

impl JobEvent {
    /// Every event, in declaration order.
    pub const ALL: [JobEvent; 11] = [
        JobEvent::Spawn,
        JobEvent::SpawnBg,
        JobEvent::CtrlC,
        JobEvent::CtrlZ,
        JobEvent::FgCmd,
        JobEvent::BgCmd,
        JobEvent::ChildExit,
        JobEvent::ChildStop,
        JobEvent::TtyRead,
        JobEvent::Timeout,
        JobEvent::Error,
    ];
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Rejected (state, event) pair. The state is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("job in state {state} does not accept {event}")]
pub struct InvalidTransition {
    /// The state the job was in.
    pub state: JobState,
    /// The event it rejected.
    pub event: JobEvent,
}

/// Compute the successor state for `(state, event)`.
///
/// Pure and total: the same input always yields the same output, and
/// an invalid pair is an `Err`, never a panic.
pub fn transition(state: JobState, event: JobEvent) -> Result<JobState, InvalidTransition> {
    use JobEvent as E;
    use JobState as S;

    let next = match (state, event) {
        (S::None, E::Spawn) => S::Foreground,
        (S::None, E::SpawnBg) => S::Background,

        (S::Foreground, E::CtrlC) => S::Terminated,
        (S::Foreground, E::CtrlZ) => S::Stopped,
        (S::Foreground, E::ChildExit) => S::Terminated,
        (S::Foreground, E::ChildStop) => S::Stopped,
        (S::Foreground, E::Error) => S::Terminated,

        (S::Background, E::FgCmd) => S::Foreground,
        (S::Background, E::BgCmd) => S::Background,
        (S::Background, E::ChildExit) => S::Terminated,
        (S::Background, E::ChildStop) => S::Stopped,
        // The kernel suspends a background reader before the shell
        // observes anything; the transition mirrors that.
        (S::Background, E::TtyRead) => S::Stopped,
        (S::Background, E::Error) => S::Terminated,

        (S::Stopped, E::CtrlC) => S::Terminated,
        (S::Stopped, E::FgCmd) => S::Foreground,
        (S::Stopped, E::BgCmd) => S::Background,
        (S::Stopped, E::ChildExit) => S::Terminated,
        (S::Stopped, E::Error) => S::Terminated,

        (state, event) => return Err(InvalidTransition { state, event }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_from_none() {
        assert_eq!(transition(JobState::None, JobEvent::Spawn), Ok(JobState::Foreground));
        assert_eq!(transition(JobState::None, JobEvent::SpawnBg), Ok(JobState::Background));
    }

    #[test]
    fn terminated_is_absorbing() {
        for ev in JobEvent::ALL {
            assert!(transition(JobState::Terminated, ev).is_err());
        }
        assert!(JobState::Terminated.valid_events().is_empty());
    }

    #[test]
    fn timeout_is_never_accepted() {
        for st in [
            JobState::None,
            JobState::Foreground,
            JobState::Background,
            JobState::Stopped,
            JobState::Terminated,
        ] {
            assert!(transition(st, JobEvent::Timeout).is_err());
        }
    }

    #[test]
    fn background_tty_read_stops() {
        assert_eq!(
            transition(JobState::Background, JobEvent::TtyRead),
            Ok(JobState::Stopped)
        );
    }

    #[test]
    fn exit_and_error_converge_from_all_live_states() {
        for st in [JobState::Foreground, JobState::Background, JobState::Stopped] {
            assert_eq!(transition(st, JobEvent::ChildExit), Ok(JobState::Terminated));
            assert_eq!(transition(st, JobEvent::Error), Ok(JobState::Terminated));
        }
    }

    /// The full table from the design document, row by row. `None`
    /// entries are invalid.
    #[test]
    fn complete_table() {
        use JobEvent as E;
        use JobState as S;
        let states = [S::None, S::Foreground, S::Background, S::Stopped, S::Terminated];
        #[rustfmt::skip]
        let table: [[Option<S>; 11]; 5] = [
            // Spawn              SpawnBg             CtrlC               CtrlZ             FgCmd               BgCmd               ChildExit           ChildStop         TtyRead           Timeout  Error
            [Some(S::Foreground), Some(S::Background), None,               None,             None,               None,               None,               None,             None,             None,    None],
            [None,                None,               Some(S::Terminated), Some(S::Stopped), None,               None,               Some(S::Terminated), Some(S::Stopped), None,             None,    Some(S::Terminated)],
            [None,                None,               None,               None,             Some(S::Foreground), Some(S::Background), Some(S::Terminated), Some(S::Stopped), Some(S::Stopped), None,    Some(S::Terminated)],
            [None,                None,               Some(S::Terminated), None,             Some(S::Foreground), Some(S::Background), Some(S::Terminated), None,             None,             None,    Some(S::Terminated)],
            [None,                None,               None,               None,             None,               None,               None,               None,             None,             None,    None],
        ];
        let events = [
            E::Spawn, E::SpawnBg, E::CtrlC, E::CtrlZ, E::FgCmd, E::BgCmd,
            E::ChildExit, E::ChildStop, E::TtyRead, E::Timeout, E::Error,
        ];
        for (si, st) in states.iter().enumerate() {
            for (ei, ev) in events.iter().enumerate() {
                let got = transition(*st, *ev).ok();
                assert_eq!(got, table[si][ei], "state {st} event {ev}");
            }
        }
    }

    #[test]
    fn invalid_transition_is_reported_not_panicked() {
        let err = transition(JobState::Terminated, JobEvent::FgCmd).unwrap_err();
        assert_eq!(err.state, JobState::Terminated);
        assert_eq!(err.event, JobEvent::FgCmd);
        assert!(err.to_string().contains("Terminated"));
    }
}
