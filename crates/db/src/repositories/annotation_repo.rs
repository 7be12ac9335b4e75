//! Repository for the `annotations` table.

use cuepoint_core::annotation::Annotation;
use cuepoint_core::types::{AnnotationId, OrderKey};
use sqlx::PgPool;

use crate::models::annotation::AnnotationRow;

/// Column list for annotation queries.
const COLUMNS: &str = "id, video_id, order_key, author_id, timestamp_ms, body, \
    parent_id, status, revision, position_unverified, created_at, updated_at";

/// Raw SQL access to annotations. Order-key assignment is the caller's job.
pub struct AnnotationRepo;

impl AnnotationRepo {
    /// Insert a fully-formed annotation row.
    pub async fn insert(pool: &PgPool, annotation: &Annotation) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO annotations
                (id, video_id, order_key, author_id, timestamp_ms, body, parent_id,
                 status, revision, position_unverified, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(annotation.id)
        .bind(&annotation.video_id)
        .bind(annotation.order_key)
        .bind(&annotation.author_id)
        .bind(annotation.timestamp_ms)
        .bind(&annotation.body)
        .bind(annotation.parent_id)
        .bind(annotation.status.as_str())
        .bind(annotation.revision)
        .bind(annotation.position_unverified)
        .bind(annotation.created_at)
        .bind(annotation.updated_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Overwrite the mutable fields (body, status, revision, updated_at).
    ///
    /// Returns the number of rows touched (0 if the id is unknown).
    pub async fn update_content(pool: &PgPool, annotation: &Annotation) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE annotations SET
                body = $1,
                status = $2,
                revision = $3,
                updated_at = $4
             WHERE id = $5",
        )
        .bind(&annotation.body)
        .bind(annotation.status.as_str())
        .bind(annotation.revision)
        .bind(annotation.updated_at)
        .bind(annotation.id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Find an annotation by its id (secondary index).
    pub async fn find_by_id(
        pool: &PgPool,
        id: AnnotationId,
    ) -> Result<Option<AnnotationRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM annotations WHERE id = $1");
        sqlx::query_as::<_, AnnotationRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Highest order key assigned for a video, or 0.
    pub async fn max_order_key(pool: &PgPool, video_id: &str) -> Result<OrderKey, sqlx::Error> {
        let (max,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(order_key) FROM annotations WHERE video_id = $1")
                .bind(video_id)
                .fetch_one(pool)
                .await?;
        Ok(max.unwrap_or(0))
    }

    /// One page of annotations with `order_key > after`, ascending.
    pub async fn list_since(
        pool: &PgPool,
        video_id: &str,
        after: OrderKey,
        limit: i64,
    ) -> Result<Vec<AnnotationRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM annotations
             WHERE video_id = $1 AND order_key > $2
             ORDER BY order_key ASC
             LIMIT $3"
        );
        sqlx::query_as::<_, AnnotationRow>(&query)
            .bind(video_id)
            .bind(after)
            .bind(limit)
            .fetch_all(pool)
            .await
    }
}
