//! The timeline event protocol.
//!
//! [`TimelineEvent`] is the closed set of events pushed to connected viewers.
//! Annotation events carry the annotation's order key; presence events carry
//! a server timestamp. [`TimelineReplica`] is the client-side half: it applies
//! the stream, detects gaps and yields the resume order to hold across
//! reconnects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::annotation::{Annotation, AnnotationStatus};
use crate::session::LeaveReason;
use crate::types::{IdentityId, OrderKey, SessionId, Timestamp, VideoId};

// ---------------------------------------------------------------------------
// Store changes
// ---------------------------------------------------------------------------

/// What happened to an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Edited,
    Deleted,
}

/// A committed mutation, emitted by the annotation store in order-key order
/// per video.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationChange {
    pub kind: ChangeKind,
    pub annotation: Annotation,
}

impl AnnotationChange {
    pub fn video_id(&self) -> &str {
        &self.annotation.video_id
    }
}

/// Receives committed annotation changes from the store.
///
/// Implementations must not block: the store calls this from its per-video
/// writer while holding the video's serialization slot.
pub trait ChangeListener: Send + Sync {
    fn annotation_changed(&self, change: AnnotationChange);
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events pushed to every connected viewer of a video.
///
/// Serialized with an internally-tagged `"type"` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TimelineEvent {
    #[serde(rename = "annotation.created")]
    AnnotationCreated {
        order_key: OrderKey,
        annotation: Annotation,
    },

    #[serde(rename = "annotation.edited")]
    AnnotationEdited {
        order_key: OrderKey,
        annotation: Annotation,
    },

    #[serde(rename = "annotation.deleted")]
    AnnotationDeleted {
        order_key: OrderKey,
        annotation: Annotation,
    },

    #[serde(rename = "presence.joined")]
    PresenceJoined {
        session_id: SessionId,
        identity: IdentityId,
        display_name: Option<String>,
        cursor_ms: i64,
        at: Timestamp,
    },

    #[serde(rename = "presence.left")]
    PresenceLeft {
        session_id: SessionId,
        identity: IdentityId,
        reason: LeaveReason,
        at: Timestamp,
    },

    #[serde(rename = "presence.cursor_moved")]
    PresenceCursorMoved {
        session_id: SessionId,
        identity: IdentityId,
        cursor_ms: i64,
        at: Timestamp,
    },
}

impl TimelineEvent {
    /// Build the event describing a stored record in its current state.
    ///
    /// Used by catch-up, which ships records rather than change history.
    pub fn from_record(annotation: Annotation) -> Self {
        let kind = match annotation.status {
            AnnotationStatus::Active => ChangeKind::Created,
            AnnotationStatus::Edited => ChangeKind::Edited,
            AnnotationStatus::Deleted => ChangeKind::Deleted,
        };
        Self::from(AnnotationChange { kind, annotation })
    }

    /// The annotation carried by an annotation event.
    pub fn annotation(&self) -> Option<&Annotation> {
        match self {
            Self::AnnotationCreated { annotation, .. }
            | Self::AnnotationEdited { annotation, .. }
            | Self::AnnotationDeleted { annotation, .. } => Some(annotation),
            _ => None,
        }
    }

    pub fn order_key(&self) -> Option<OrderKey> {
        self.annotation().map(|a| a.order_key)
    }

    pub fn is_presence(&self) -> bool {
        self.annotation().is_none()
    }
}

impl From<AnnotationChange> for TimelineEvent {
    fn from(change: AnnotationChange) -> Self {
        let order_key = change.annotation.order_key;
        let annotation = change.annotation;
        match change.kind {
            ChangeKind::Created => Self::AnnotationCreated {
                order_key,
                annotation,
            },
            ChangeKind::Edited => Self::AnnotationEdited {
                order_key,
                annotation,
            },
            ChangeKind::Deleted => Self::AnnotationDeleted {
                order_key,
                annotation,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Client replica
// ---------------------------------------------------------------------------

/// An annotation event skipped over one or more order keys. The client must
/// reconnect with its resume order instead of rendering a partial timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Timeline gap: expected order {expected}, received {received}")]
pub struct GapDetected {
    pub expected: OrderKey,
    pub received: OrderKey,
}

/// Outcome of applying one event to a [`TimelineReplica`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaUpdate {
    /// A new order key was appended.
    Appended,
    /// An already-known annotation moved to a newer revision.
    Updated,
    /// Same or older revision than what the replica holds; ignored.
    Duplicate,
    /// Presence event; no effect on the annotation timeline.
    Presence,
}

/// Client-side view of one video's timeline.
#[derive(Debug, Clone)]
pub struct TimelineReplica {
    video_id: VideoId,
    last_seen_order: OrderKey,
    annotations: BTreeMap<OrderKey, Annotation>,
}

impl TimelineReplica {
    pub fn new(video_id: impl Into<VideoId>) -> Self {
        Self::resume_from(video_id, 0)
    }

    /// Start from a resume order held over from a previous connection.
    pub fn resume_from(video_id: impl Into<VideoId>, resume_order: OrderKey) -> Self {
        Self {
            video_id: video_id.into(),
            last_seen_order: resume_order.max(0),
            annotations: BTreeMap::new(),
        }
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// The order key to send as `resume_order` on the next connect.
    pub fn resume_order(&self) -> OrderKey {
        self.last_seen_order
    }

    /// Apply one pushed event.
    pub fn apply(&mut self, event: &TimelineEvent) -> Result<ReplicaUpdate, GapDetected> {
        let Some(annotation) = event.annotation() else {
            return Ok(ReplicaUpdate::Presence);
        };
        let key = annotation.order_key;

        if key > self.last_seen_order {
            let expected = self.last_seen_order + 1;
            if key != expected {
                return Err(GapDetected {
                    expected,
                    received: key,
                });
            }
            self.last_seen_order = key;
            self.annotations.insert(key, annotation.clone());
            return Ok(ReplicaUpdate::Appended);
        }

        match self.annotations.get_mut(&key) {
            Some(existing) if existing.revision >= annotation.revision => {
                Ok(ReplicaUpdate::Duplicate)
            }
            Some(existing) => {
                *existing = annotation.clone();
                Ok(ReplicaUpdate::Updated)
            }
            // Known to the server before this replica was created.
            None => {
                self.annotations.insert(key, annotation.clone());
                Ok(ReplicaUpdate::Updated)
            }
        }
    }

    pub fn get(&self, order_key: OrderKey) -> Option<&Annotation> {
        self.annotations.get(&order_key)
    }

    /// All known annotations, tombstones included, in order-key order.
    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.annotations.values()
    }

    /// Non-deleted annotations in order-key order.
    pub fn visible(&self) -> impl Iterator<Item = &Annotation> {
        self.annotations.values().filter(|a| !a.is_deleted())
    }

    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
