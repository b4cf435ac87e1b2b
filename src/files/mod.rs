//! File transfer helpers

mod transfer;

pub use transfer::*;
