//! The persistence contract behind [`AnnotationStore`](crate::AnnotationStore).
//!
//! Backends are dumb: they store and fetch fully-formed records. Order-key
//! assignment, validation and permission checks live in the store.

use async_trait::async_trait;
use cuepoint_core::annotation::Annotation;
use cuepoint_core::error::CoreError;
use cuepoint_core::types::{AnnotationId, OrderKey};

use crate::repositories::AnnotationRepo;
use crate::DbPool;

/// Storage operations required by the annotation store.
#[async_trait]
pub trait AnnotationBackend: Send + Sync {
    /// Persist a new record. Fails with `Conflict` if `(video_id, order_key)`
    /// is taken or the parent no longer exists.
    async fn insert(&self, annotation: &Annotation) -> Result<(), CoreError>;

    /// Overwrite body, status, revision and `updated_at` of an existing record.
    async fn update(&self, annotation: &Annotation) -> Result<(), CoreError>;

    async fn find_by_id(&self, id: AnnotationId) -> Result<Option<Annotation>, CoreError>;

    /// Highest order key stored for the video, or 0.
    async fn max_order_key(&self, video_id: &str) -> Result<OrderKey, CoreError>;

    /// Up to `limit` records with `order_key > after`, ascending.
    async fn list_since(
        &self,
        video_id: &str,
        after: OrderKey,
        limit: usize,
    ) -> Result<Vec<Annotation>, CoreError>;

    async fn health_check(&self) -> Result<(), CoreError>;
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

/// PostgreSQL-backed annotation storage.
#[derive(Clone)]
pub struct PgBackend {
    pool: DbPool,
}

impl PgBackend {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl AnnotationBackend for PgBackend {
    async fn insert(&self, annotation: &Annotation) -> Result<(), CoreError> {
        AnnotationRepo::insert(&self.pool, annotation)
            .await
            .map_err(classify_sqlx_error)
    }

    async fn update(&self, annotation: &Annotation) -> Result<(), CoreError> {
        let touched = AnnotationRepo::update_content(&self.pool, annotation)
            .await
            .map_err(classify_sqlx_error)?;
        if touched == 0 {
            return Err(CoreError::not_found("Annotation", annotation.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: AnnotationId) -> Result<Option<Annotation>, CoreError> {
        AnnotationRepo::find_by_id(&self.pool, id)
            .await
            .map_err(classify_sqlx_error)?
            .map(Annotation::try_from)
            .transpose()
    }

    async fn max_order_key(&self, video_id: &str) -> Result<OrderKey, CoreError> {
        AnnotationRepo::max_order_key(&self.pool, video_id)
            .await
            .map_err(classify_sqlx_error)
    }

    async fn list_since(
        &self,
        video_id: &str,
        after: OrderKey,
        limit: usize,
    ) -> Result<Vec<Annotation>, CoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        AnnotationRepo::list_since(&self.pool, video_id, after, limit)
            .await
            .map_err(classify_sqlx_error)?
            .into_iter()
            .map(Annotation::try_from)
            .collect()
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        crate::health_check(&self.pool)
            .await
            .map_err(classify_sqlx_error)
    }
}

/// Map a sqlx error onto the domain taxonomy.
///
/// - Connection-level failures become `StorageUnavailable`.
/// - Foreign-key violations (`23503`) mean the parent vanished: `Conflict`.
/// - Unique violations (`23505`) mean a concurrent writer took the key: `Conflict`.
/// - Everything else is `Internal`.
pub fn classify_sqlx_error(err: sqlx::Error) -> CoreError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => {
            tracing::warn!(error = %err, "Storage backend unavailable");
            CoreError::StorageUnavailable(err.to_string())
        }
        sqlx::Error::RowNotFound => CoreError::not_found("Annotation", "row"),
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("23503") => CoreError::Conflict(
                "referenced parent annotation no longer exists".to_string(),
            ),
            Some("23505") => CoreError::Conflict(format!(
                "duplicate value violates unique constraint: {}",
                db_err.constraint().unwrap_or("unknown")
            )),
            _ => {
                tracing::error!(error = %db_err, "Database error");
                CoreError::Internal("database error".to_string())
            }
        },
        other => {
            tracing::error!(error = %other, "Database error");
            CoreError::Internal("database error".to_string())
        }
    }
}
