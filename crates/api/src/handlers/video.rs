//! Request/response access to a video's timeline.
//!
//! Live participation goes through the WebSocket transport; these handlers
//! serve the media pipeline (descriptor registration) and read-only
//! consumers (listing, presence, report export).

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use cuepoint_core::export::render_markdown;
use cuepoint_core::types::{OrderKey, VideoId};
use cuepoint_core::video::VideoDescriptor;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthIdentity;
use crate::response::DataResponse;
use crate::state::AppState;

/// Page size when the caller does not ask for one.
pub const DEFAULT_LIST_LIMIT: usize = 200;

/// Largest page a single request may ask for.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Body of `PUT /videos/{video_id}`. The id comes from the path.
#[derive(Debug, Deserialize)]
pub struct RegisterVideo {
    pub url: String,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub frame_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub after: Option<OrderKey>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
    Markdown,
}

#[derive(Debug, Deserialize)]
pub struct ReportParams {
    #[serde(default)]
    pub format: ReportFormat,
}

/// PUT /videos/{video_id}
///
/// Register or replace a video descriptor. 201 when new, 200 otherwise.
pub async fn register_video(
    AuthIdentity(identity): AuthIdentity,
    State(state): State<AppState>,
    Path(video_id): Path<VideoId>,
    Json(input): Json<RegisterVideo>,
) -> AppResult<impl IntoResponse> {
    let descriptor = VideoDescriptor {
        video_id,
        url: input.url,
        duration_ms: input.duration_ms,
        frame_rate: input.frame_rate,
    };
    let created = state.videos.register(descriptor.clone())?;

    tracing::info!(
        video_id = %descriptor.video_id,
        duration_ms = ?descriptor.duration_ms,
        registered_by = %identity.id,
        created,
        "Video descriptor registered"
    );

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(DataResponse { data: descriptor })))
}

/// GET /videos/{video_id}/annotations?after=&limit=
///
/// One page of annotations with order key greater than `after`, tombstones
/// included, ascending.
pub async fn list_annotations(
    _auth: AuthIdentity,
    State(state): State<AppState>,
    Path(video_id): Path<VideoId>,
    Query(params): Query<ListParams>,
) -> AppResult<impl IntoResponse> {
    let after = params.after.unwrap_or(0);
    if after < 0 {
        return Err(AppError::BadRequest(format!("after must be >= 0, got {after}")));
    }
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let annotations = state.service.list_since(&video_id, after, limit).await?;
    Ok(Json(DataResponse { data: annotations }))
}

/// GET /videos/{video_id}/presence
pub async fn list_presence(
    _auth: AuthIdentity,
    State(state): State<AppState>,
    Path(video_id): Path<VideoId>,
) -> AppResult<impl IntoResponse> {
    let sessions = state.service.active_sessions(&video_id).await?;
    Ok(Json(DataResponse { data: sessions }))
}

/// GET /videos/{video_id}/report?format=json|markdown
pub async fn export_report(
    _auth: AuthIdentity,
    State(state): State<AppState>,
    Path(video_id): Path<VideoId>,
    Query(params): Query<ReportParams>,
) -> AppResult<Response> {
    let report = state.service.export_report(&video_id).await?;
    Ok(match params.format {
        ReportFormat::Json => Json(DataResponse { data: report }).into_response(),
        ReportFormat::Markdown => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            render_markdown(&report),
        )
            .into_response(),
    })
}
