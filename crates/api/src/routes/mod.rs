pub mod health;
pub mod video;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /videos/{video_id}                  register descriptor (PUT)
/// /videos/{video_id}/annotations      list since order key
/// /videos/{video_id}/presence         active sessions
/// /videos/{video_id}/report           export (json | markdown)
/// /videos/{video_id}/live             WebSocket session
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/videos", video::router())
}
