//! Timeline annotation model and validation.
//!
//! An [`Annotation`] is a timestamp-anchored comment on a video. Its
//! `order_key` is assigned by the annotation store and never changes; edits
//! and deletions bump `revision` instead so that readers can tell two copies
//! of the same annotation apart.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{AnnotationId, IdentityId, OrderKey, Timestamp, VideoId};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default maximum body length, in characters.
pub const DEFAULT_MAX_BODY_CHARS: usize = 4000;

/// Revision assigned to a freshly created annotation.
pub const INITIAL_REVISION: i64 = 1;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of an annotation. Deletion is a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationStatus {
    Active,
    Edited,
    Deleted,
}

/// All valid status strings.
const VALID_STATUS_STRINGS: &[&str] = &["active", "edited", "deleted"];

impl AnnotationStatus {
    /// Return the status as a lowercase string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Edited => "edited",
            Self::Deleted => "deleted",
        }
    }

    /// Parse a status from its storage representation.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "active" => Ok(Self::Active),
            "edited" => Ok(Self::Edited),
            "deleted" => Ok(Self::Deleted),
            _ => Err(CoreError::Validation(format!(
                "Invalid annotation status '{s}'. Must be one of: {}",
                VALID_STATUS_STRINGS.join(", ")
            ))),
        }
    }
}

impl TryFrom<String> for AnnotationStatus {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

// ---------------------------------------------------------------------------
// Annotation
// ---------------------------------------------------------------------------

/// A timeline-anchored comment on a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    pub video_id: VideoId,
    /// Per-video sequence number, strictly increasing and gap-free.
    pub order_key: OrderKey,
    pub author_id: IdentityId,
    /// Position in the video this annotation refers to.
    pub timestamp_ms: i64,
    pub body: String,
    pub parent_id: Option<AnnotationId>,
    pub status: AnnotationStatus,
    /// Starts at [`INITIAL_REVISION`], bumped on every edit or delete.
    pub revision: i64,
    /// Set when the video's duration was unknown at submission time, so the
    /// position could not be checked against it.
    pub position_unverified: bool,
    /// Wall-clock capture time, for display only.
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Annotation {
    pub fn is_deleted(&self) -> bool {
        self.status == AnnotationStatus::Deleted
    }

    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Input for appending a new annotation to the store.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAnnotation {
    pub video_id: VideoId,
    pub author_id: IdentityId,
    pub timestamp_ms: i64,
    pub body: String,
    pub parent_id: Option<AnnotationId>,
    #[serde(default)]
    pub position_unverified: bool,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate an annotation body and return it trimmed.
///
/// Oversized bodies are rejected, never truncated. The limit counts
/// characters, not bytes.
pub fn normalize_body(body: &str, max_chars: usize) -> Result<String, CoreError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation(
            "Annotation body must not be empty".to_string(),
        ));
    }

    let len = trimmed.chars().count();
    if len > max_chars {
        return Err(CoreError::Validation(format!(
            "Annotation body is {len} characters, maximum is {max_chars}"
        )));
    }

    Ok(trimmed.to_string())
}

/// Validate that a media position is non-negative.
pub fn validate_timestamp(timestamp_ms: i64) -> Result<(), CoreError> {
    if timestamp_ms < 0 {
        return Err(CoreError::Validation(format!(
            "timestamp_ms must be >= 0, got {timestamp_ms}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_accepts_known_values() {
        assert_eq!(AnnotationStatus::parse("active").unwrap(), AnnotationStatus::Active);
        assert_eq!(AnnotationStatus::parse("edited").unwrap(), AnnotationStatus::Edited);
        assert_eq!(AnnotationStatus::parse("deleted").unwrap(), AnnotationStatus::Deleted);
    }

    #[test]
    fn status_parse_rejects_unknown() {
        let err = AnnotationStatus::parse("archived").unwrap_err();
        assert!(err.to_string().contains("Invalid annotation status"));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&AnnotationStatus::Deleted).unwrap();
        assert_eq!(json, r#""deleted""#);
    }

    #[test]
    fn body_is_trimmed() {
        assert_eq!(normalize_body("  fix color \n", 4000).unwrap(), "fix color");
    }

    #[test]
    fn blank_body_rejected() {
        assert!(normalize_body("", 4000).is_err());
        assert!(normalize_body("   \t\n", 4000).is_err());
    }

    #[test]
    fn body_at_limit_accepted() {
        let body = "a".repeat(4000);
        assert_eq!(normalize_body(&body, 4000).unwrap().len(), 4000);
    }

    #[test]
    fn oversized_body_rejected_not_truncated() {
        let body = "a".repeat(4001);
        let err = normalize_body(&body, 4000).unwrap_err();
        assert!(err.to_string().contains("maximum is 4000"));
    }

    #[test]
    fn body_limit_counts_characters() {
        // 4000 two-byte characters are within the limit.
        let body = "é".repeat(4000);
        assert!(normalize_body(&body, 4000).is_ok());
    }

    #[test]
    fn negative_timestamp_rejected() {
        assert!(validate_timestamp(-1).is_err());
        assert!(validate_timestamp(0).is_ok());
    }
}
