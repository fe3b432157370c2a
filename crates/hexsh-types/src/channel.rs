//! The hex-stream channel set.
//!
//! Every child managed by hexsh is wired to six logical channels. The
//! set is closed and ordered; indices are stable across platforms:
//!
//! | # | name        | child view | payload              | overflow |
//! |---|-------------|------------|----------------------|----------|
//! | 0 | control-in  | read       | UTF-8 control input  | n/a      |
//! | 1 | control-out | write      | UTF-8 user output    | block    |
//! | 2 | control-err | write      | UTF-8 error output   | block    |
//! | 3 | telemetry   | write      | structured records   | **drop** |
//! | 4 | data-in     | read       | opaque binary        | n/a      |
//! | 5 | data-out    | write      | opaque binary        | block    |
//!
//! Channels 0–2 are the only ones permitted to carry human-readable
//! control text; binary payload never mixes with them. Telemetry never
//! blocks its producer.

use serde::{Deserialize, Serialize};

/// One of the six logical channel identities.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Channel 0: UTF-8 control input (conventional stdin).
    ControlIn = 0,
    /// Channel 1: UTF-8 user output (conventional stdout).
    ControlOut = 1,
    /// Channel 2: UTF-8 error output (conventional stderr).
    ControlErr = 2,
    /// Channel 3: structured log records. Dropped on overflow.
    Telemetry = 3,
    /// Channel 4: opaque binary input to the child.
    DataIn = 4,
    /// Channel 5: opaque binary output from the child.
    DataOut = 5,
}

/// Direction of a channel as seen from the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    /// The child reads from this channel (0, 4).
    ChildReads,
    /// The child writes to this channel (1, 2, 3, 5).
    ChildWrites,
}

/// What a drainer does when its ring buffer cannot accept a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Apply backpressure: retry until the consumer makes room.
    Block,
    /// Discard the excess and count it. Telemetry only.
    Drop,
}

impl Channel {
    /// All six channels in index order.
    pub const ALL: [Channel; 6] = [
        Channel::ControlIn,
        Channel::ControlOut,
        Channel::ControlErr,
        Channel::Telemetry,
        Channel::DataIn,
        Channel::DataOut,
    ];

    /// The four output channels a parent drains.
    pub const OUTPUTS: [Channel; 4] = [
        Channel::ControlOut,
        Channel::ControlErr,
        Channel::Telemetry,
        Channel::DataOut,
    ];

    /// Stable logical index (0..=5).
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Look a channel up by its logical index.
    pub const fn from_index(index: usize) -> Option<Channel> {
        match index {
            0 => Some(Channel::ControlIn),
            1 => Some(Channel::ControlOut),
            2 => Some(Channel::ControlErr),
            3 => Some(Channel::Telemetry),
            4 => Some(Channel::DataIn),
            5 => Some(Channel::DataOut),
            _ => None,
        }
    }

    /// Direction from the child's point of view.
    pub const fn direction(self) -> ChannelDirection {
        match self {
            Channel::ControlIn | Channel::DataIn => ChannelDirection::ChildReads,
            _ => ChannelDirection::ChildWrites,
        }
    }

    /// The overflow policy this channel's drainer must apply.
    ///
    /// Implementations may expose the policy at construction but must
    /// preserve these defaults.
    pub const fn default_policy(self) -> OverflowPolicy {
        match self {
            Channel::Telemetry => OverflowPolicy::Drop,
            _ => OverflowPolicy::Block,
        }
    }

    /// True for the conventional three (0–2), which keep their host
    /// roles in startup-info on every platform.
    pub const fn is_conventional(self) -> bool {
        (self as u8) < 3
    }

    /// Short lowercase name as used in logs and listings.
    pub const fn name(self) -> &'static str {
        match self {
            Channel::ControlIn => "control-in",
            Channel::ControlOut => "control-out",
            Channel::ControlErr => "control-err",
            Channel::Telemetry => "telemetry",
            Channel::DataIn => "data-in",
            Channel::DataOut => "data-out",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
