//! Pure data types for hexsh — channels, job lifecycle, handle maps.
//!
//! This crate is a leaf dependency with no I/O and no platform code.
//! It exists so that embedders (REPL front-ends, supervisors, test
//! harnesses) can work with hexsh's type system without pulling in
//! hexsh-core's process and terminal machinery.

pub mod channel;
pub mod handle_map;
pub mod job;
pub mod state;

// Flat re-exports for convenience
pub use channel::*;
pub use handle_map::*;
pub use job::*;
pub use state::*;
