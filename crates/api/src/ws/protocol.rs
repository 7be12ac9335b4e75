//! JSON frames exchanged on a live timeline socket.
//!
//! Timeline events are sent as-is (`{"type":"annotation.created",...}`);
//! everything else the server says is a [`ServerFrame`].

use serde::{Deserialize, Serialize};

use cuepoint_core::annotation::Annotation;
use cuepoint_core::error::CoreError;
use cuepoint_core::session::LeaveReason;
use cuepoint_core::types::{AnnotationId, OrderKey, SessionId, VideoId};

use crate::error::client_message;

/// Requests a client may send on an open session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "annotation.submit")]
    Submit {
        #[serde(default)]
        request_id: Option<String>,
        timestamp_ms: i64,
        body: String,
        #[serde(default)]
        parent_id: Option<AnnotationId>,
    },

    #[serde(rename = "annotation.edit")]
    Edit {
        #[serde(default)]
        request_id: Option<String>,
        annotation_id: AnnotationId,
        body: String,
    },

    #[serde(rename = "annotation.delete")]
    Delete {
        #[serde(default)]
        request_id: Option<String>,
        annotation_id: AnnotationId,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(default)]
        request_id: Option<String>,
        cursor_ms: i64,
    },

    /// Advance the session's last seen order key.
    #[serde(rename = "ack")]
    Ack {
        #[serde(default)]
        request_id: Option<String>,
        order_key: OrderKey,
    },

    #[serde(rename = "disconnect")]
    Disconnect,
}

impl ClientFrame {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Submit { request_id, .. }
            | Self::Edit { request_id, .. }
            | Self::Delete { request_id, .. }
            | Self::Heartbeat { request_id, .. }
            | Self::Ack { request_id, .. } => request_id.as_deref(),
            Self::Disconnect => None,
        }
    }
}

/// Control frames from the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// First frame on every socket.
    #[serde(rename = "session.opened")]
    SessionOpened {
        session_id: SessionId,
        video_id: VideoId,
        resume_order: OrderKey,
        heartbeat_timeout_secs: u64,
    },

    /// Catch-up is done; live events follow.
    #[serde(rename = "catch_up.complete")]
    CatchUpComplete { through_order: OrderKey },

    /// A request succeeded. Mutations carry the stored record; the matching
    /// timeline event still arrives through the live stream.
    #[serde(rename = "ack")]
    Ack {
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        annotation: Option<Annotation>,
    },

    #[serde(rename = "error")]
    Error {
        request_id: Option<String>,
        code: &'static str,
        message: String,
        retryable: bool,
    },

    /// Last frame before the server closes the socket.
    #[serde(rename = "session.closed")]
    SessionClosed {
        reason: LeaveReason,
        reconnect: bool,
    },
}

impl ServerFrame {
    pub fn error(request_id: Option<String>, err: &CoreError) -> Self {
        Self::Error {
            request_id,
            code: err.code(),
            message: client_message(err),
            retryable: err.is_retryable(),
        }
    }

    /// Frame for text that is not a valid [`ClientFrame`].
    pub fn malformed(detail: impl std::fmt::Display) -> Self {
        Self::Error {
            request_id: None,
            code: "BAD_REQUEST",
            message: format!("Malformed frame: {detail}"),
            retryable: false,
        }
    }

    pub fn closed(reason: LeaveReason) -> Self {
        Self::SessionClosed {
            reason,
            reconnect: reason.should_reconnect(),
        }
    }
}

/// WebSocket close code for a session ending.
///
/// 1000 for a normal leave, 1001 for shutdown, 4000-range application codes
/// otherwise so clients can tell a forced reconnect apart.
pub fn close_code(reason: LeaveReason) -> u16 {
    match reason {
        LeaveReason::Left => 1000,
        LeaveReason::Shutdown => 1001,
        LeaveReason::TimedOut => 4000,
        LeaveReason::Overflow => 4001,
        LeaveReason::CatchUpFailed => 4002,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn submit_frame_parses_with_optional_fields() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "annotation.submit",
            "timestamp_ms": 5000,
            "body": "Too dark here",
        }))
        .unwrap();
        assert_matches!(
            frame,
            ClientFrame::Submit { request_id: None, timestamp_ms: 5000, parent_id: None, .. }
        );
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let result = serde_json::from_value::<ClientFrame>(json!({ "type": "annotation.pin" }));
        assert!(result.is_err());
    }

    #[test]
    fn error_frame_carries_code_and_request_id() {
        let frame = ServerFrame::error(
            Some("r-1".into()),
            &CoreError::Forbidden("Only the author may edit".into()),
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "FORBIDDEN");
        assert_eq!(value["request_id"], "r-1");
        assert_eq!(value["retryable"], false);
    }

    #[test]
    fn closed_frame_tells_client_whether_to_reconnect() {
        let value = serde_json::to_value(ServerFrame::closed(LeaveReason::Overflow)).unwrap();
        assert_eq!(value["type"], "session.closed");
        assert_eq!(value["reason"], "overflow");
        assert_eq!(value["reconnect"], true);
        assert_eq!(close_code(LeaveReason::Overflow), 4001);
    }
}
