use axum::routing::{get, put};
use axum::Router;

use crate::handlers::video;
use crate::state::AppState;
use crate::ws;

/// Video timeline routes, nested under `/videos`.
///
/// ```text
/// PUT /{video_id}                register_video
/// GET /{video_id}/annotations    list_annotations
/// GET /{video_id}/presence       list_presence
/// GET /{video_id}/report         export_report
/// GET /{video_id}/live           WebSocket session
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{video_id}", put(video::register_video))
        .route("/{video_id}/annotations", get(video::list_annotations))
        .route("/{video_id}/presence", get(video::list_presence))
        .route("/{video_id}/report", get(video::export_report))
        .route("/{video_id}/live", get(ws::live_handler))
}
