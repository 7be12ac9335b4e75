//! Session records and presence constants.
//!
//! A session is one live connection of one identity to one video's
//! timeline. Sessions are ephemeral: they are never persisted and do not
//! survive a disconnect. A reconnect creates a new session whose
//! `last_seen_order` comes from the client's resume token.

use serde::{Deserialize, Serialize};

use crate::types::{IdentityId, OrderKey, SessionId, Timestamp, VideoId};

/// Seconds without a heartbeat after which a session is considered gone.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Presence snapshot of one live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub video_id: VideoId,
    pub identity: IdentityId,
    pub display_name: Option<String>,
    pub connected_at: Timestamp,
    /// Highest annotation order key the client holds: the larger of what it
    /// acknowledged and what its transport has taken for delivery.
    pub last_seen_order: OrderKey,
    /// Last reported playback position.
    pub cursor_ms: i64,
    pub last_heartbeat_at: Timestamp,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Explicit disconnect from the client.
    Left,
    /// No heartbeat within the timeout.
    TimedOut,
    /// The outbound queue overflowed with annotation events.
    Overflow,
    /// Catch-up could not be completed (e.g. storage unavailable).
    CatchUpFailed,
    /// The server is shutting down.
    Shutdown,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::TimedOut => "timed_out",
            Self::Overflow => "overflow",
            Self::CatchUpFailed => "catch_up_failed",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the client is expected to reconnect and reconcile.
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, Self::Left)
    }
}
