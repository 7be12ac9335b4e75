//! Live timeline sessions over WebSocket.

pub mod handler;
pub mod protocol;

pub use handler::live_handler;
