use std::sync::Arc;

use cuepoint_core::video::InMemoryVideoDirectory;
use cuepoint_events::FeedbackService;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// The timeline engine: store, hub and session registry.
    pub service: Arc<FeedbackService>,
    /// Video descriptors registered by the media pipeline. The service reads
    /// the same directory.
    pub videos: Arc<InMemoryVideoDirectory>,
}
