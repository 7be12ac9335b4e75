//! Domain core for the collaborative video-feedback timeline.
//!
//! Everything in this crate is free of I/O so that the store, the sync hub,
//! the HTTP/WebSocket layer and client tooling all share the same types,
//! validation rules and event protocol.

pub mod annotation;
pub mod config;
pub mod error;
pub mod export;
pub mod identity;
pub mod session;
pub mod timeline;
pub mod types;
pub mod video;
