//! WebSocket server module
//!
//! Accepts client connections and streams generated replies back to them.

mod websocket;

pub use websocket::*;
