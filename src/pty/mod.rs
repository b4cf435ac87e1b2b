//! PTY management module
//!
//! Spawns shells under pseudo-terminals, frames their output on a prompt
//! marker, and runs the blocking terminal I/O on a bounded worker pool.
//! Uses portable-pty for cross-platform compatibility.

mod framer;
mod pool;
mod process;

pub use framer::*;
pub use pool::*;
pub use process::*;
