//! hexsh-core: the process-orchestration core of hexsh.
//!
//! This crate provides:
//!
//! - **Stream fabric**: six logical channels per child, drained by one
//!   worker thread per output channel into lock-free SPSC ring buffers
//! - **Bootstrap**: deterministic channel identity on every host
//!   (descriptor numbers on POSIX, a published handle map elsewhere)
//! - **Process**: spawn/wait/signal with the hex-stream topology wired
//!   in, plus a data-channel pipeline builder
//! - **Terminal**: controlling-terminal arbitration between the shell
//!   and its foreground job
//! - **Jobs**: the job table, signal bridging, and the typed
//!   state machine driving {None, Foreground, Background, Stopped,
//!   Terminated}
//!
//! The interactive line editor, parser/executor, configuration loader,
//! and history store are deliberately external; they drive this crate
//! through [`JobManager`] and [`StreamController`] and never touch the
//! invariants enforced here.

pub mod bootstrap;
pub mod error;
pub mod process;
pub mod stream;
#[cfg(unix)]
pub mod job;
#[cfg(unix)]
pub mod terminal;

pub use error::{Error, Result};

// Channel and job data types (re-exported from hexsh-types).
pub use hexsh_types::{
    transition, Channel, ChannelDirection, HandleMap, InvalidTransition, JobEvent, JobId, JobInfo,
    JobState, OverflowPolicy,
};

pub use bootstrap::{
    map_from_args, map_from_env, retrieve_handle_map, retrieve_validated_handle_map,
    validate_handle_map, MapDelivery, HANDLE_MAP_ENV, HANDLE_MAP_FLAG,
};
pub use process::{HexProcess, ProcessConfig};
#[cfg(unix)]
pub use process::Pipeline;
pub use stream::{
    CancelToken, ChannelEnables, ChannelSet, Drainer, RingBuffer, StreamController,
    DEFAULT_RING_CAPACITY, POLL_INTERVAL_MS,
};

#[cfg(unix)]
pub use job::{ChannelCaptures, JobManager, SpawnOptions};
#[cfg(unix)]
pub use terminal::{Terminal, TerminalModes};
