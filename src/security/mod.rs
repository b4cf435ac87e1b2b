//! Command security gate

mod validator;

pub use validator::*;
