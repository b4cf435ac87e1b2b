//! WebSocket server module
//!
//! Accepts tool clients over WebSocket and routes their calls to the
//! session engine.

mod handler;
mod protocol;
mod websocket;

pub use handler::ToolHandler;
pub use websocket::{ServerConfig, WebSocketServer};
