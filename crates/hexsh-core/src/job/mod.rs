//! Job control: the table of managed children and its policy.
//!
//! ```text
//! line editor ──▶ handle_ctrl_c / handle_ctrl_z ─┐
//! builtins    ──▶ foreground / background / stop ┼──▶ JobManager
//! SIGCHLD     ──▶ self-pipe ──▶ process_events ──┘        │
//!                                                 transition table
//!                                                         │
//!                                              observers (on_status_change)
//! ```
//!
//! The manager owns every [`Job`](crate::JobInfo) record, bridges
//! signals through a self-pipe (handlers never do real work),
//! arbitrates terminal ownership with the foreground job, and reaps
//! children promptly so zombies cannot accumulate.

mod manager;
#[cfg(unix)]
mod signals;

pub use manager::{ChannelCaptures, JobManager, SpawnOptions};
