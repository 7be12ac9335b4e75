/// Domain error taxonomy shared by the store, registry, hub and transports.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// A referenced record changed underneath the request (e.g. the parent of a
    /// reply vanished mid-flight). Retryable.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The identity token was rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The caller is not allowed to perform the operation (author-only edits).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The storage backend timed out or is down. Retry with backoff.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code, used in HTTP bodies and WebSocket error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Conflict(_))
    }
}
