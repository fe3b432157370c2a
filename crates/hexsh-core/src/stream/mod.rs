//! The hex-stream fabric: endpoints, rings, and drainers for one child.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      StreamController                        │
//! │                                                              │
//! │  ch 0 control-in   ◀── write_input / close_input             │
//! │  ch 4 data-in      ◀── write_data / close_data               │
//! │                                                              │
//! │  ch 1 control-out ──▶ Drainer ──▶ RingBuffer ─┐              │
//! │  ch 2 control-err ──▶ Drainer ──▶ RingBuffer ─┤ read_buffered│
//! │  ch 3 telemetry   ──▶ Drainer ──▶ RingBuffer ─┤ + on_data    │
//! │  ch 5 data-out    ──▶ Drainer ──▶ RingBuffer ─┘              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Drainers run one OS thread each and move bytes into lock-free SPSC
//! rings, so a child can write far past the kernel pipe capacity
//! without anybody calling `read` — the classic `wait()` deadlock
//! cannot happen. Channels 1, 2 and 5 apply backpressure when a ring
//! fills; channel 3 (telemetry) drops and counts instead, so
//! diagnostics can never stall the child.

mod controller;
mod drain;
mod endpoints;
mod ring;

pub use controller::{DataCallback, StreamController};
#[cfg(unix)]
pub use drain::Relay;
#[cfg(target_os = "linux")]
pub use drain::splice_pipe_to_pipe;
pub use drain::{CancelToken, Drainer, POLL_INTERVAL_MS, READ_CHUNK};
pub use endpoints::{ChannelEnables, ChannelSet, Endpoint};
pub use ring::{RingBuffer, DEFAULT_RING_CAPACITY};
