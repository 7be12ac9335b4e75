//! Row model for the `annotations` table.

use cuepoint_core::annotation::{Annotation, AnnotationStatus};
use cuepoint_core::error::CoreError;
use cuepoint_core::types::{AnnotationId, OrderKey, Timestamp};
use sqlx::FromRow;

/// A row from the `annotations` table.
#[derive(Debug, Clone, FromRow)]
pub struct AnnotationRow {
    pub id: AnnotationId,
    pub video_id: String,
    pub order_key: OrderKey,
    pub author_id: String,
    pub timestamp_ms: i64,
    pub body: String,
    pub parent_id: Option<AnnotationId>,
    pub status: String,
    pub revision: i64,
    pub position_unverified: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<AnnotationRow> for Annotation {
    type Error = CoreError;

    fn try_from(row: AnnotationRow) -> Result<Self, Self::Error> {
        Ok(Annotation {
            id: row.id,
            video_id: row.video_id,
            order_key: row.order_key,
            author_id: row.author_id,
            timestamp_ms: row.timestamp_ms,
            body: row.body,
            parent_id: row.parent_id,
            status: AnnotationStatus::parse(&row.status)
                .map_err(|e| CoreError::Internal(format!("corrupt annotation row: {e}")))?,
            revision: row.revision,
            position_unverified: row.position_unverified,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
