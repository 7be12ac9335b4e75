//! Live session registry.
//!
//! One task owns every [`Session`] record and its outbox; all other tasks
//! talk to it through [`SessionRegistry`], a cloneable handle. Liveness is
//! tracked on the runtime clock (so tests can pause time) and sessions that
//! stop heartbeating are removed by [`SessionRegistry::reap`], which the
//! background reaper calls on an interval. Transport close events are not
//! trusted for this.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use cuepoint_core::config::TimelineConfig;
use cuepoint_core::error::CoreError;
use cuepoint_core::identity::Identity;
use cuepoint_core::session::{LeaveReason, Session};
use cuepoint_core::timeline::TimelineEvent;
use cuepoint_core::types::{OrderKey, SessionId, VideoId};

use crate::hub::SyncHub;
use crate::outbox::SessionOutbox;

/// Commands queued to the registry task before callers wait.
const COMMAND_QUEUE_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, CoreError>>;

enum RegistryCommand {
    Join {
        video_id: VideoId,
        identity: Identity,
        resume_order: OrderKey,
        reply: Reply<(Session, Arc<SessionOutbox>)>,
    },
    Heartbeat {
        session_id: SessionId,
        cursor_ms: i64,
        reply: Reply<Session>,
    },
    Acknowledge {
        session_id: SessionId,
        order_key: OrderKey,
        reply: Reply<Session>,
    },
    Leave {
        session_id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Get {
        session_id: SessionId,
        reply: Reply<Session>,
    },
    Active {
        video_id: VideoId,
        reply: oneshot::Sender<Vec<Session>>,
    },
    Reap {
        reply: oneshot::Sender<Vec<(Session, LeaveReason)>>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the registry task.
#[derive(Clone)]
pub struct SessionRegistry {
    tx: mpsc::Sender<RegistryCommand>,
}

impl SessionRegistry {
    /// Start the registry task.
    pub fn spawn(hub: Arc<SyncHub>, config: &TimelineConfig) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let task = RegistryTask {
            hub,
            heartbeat_timeout: config.heartbeat_timeout,
            queue_capacity: config.session_queue_capacity,
            sessions: HashMap::new(),
        };
        tokio::spawn(task.run(rx));
        Self { tx }
    }

    /// Create a session and subscribe its outbox to the hub in catch-up mode.
    ///
    /// `resume_order` comes from the client; it seeds `last_seen_order`.
    pub async fn join(
        &self,
        video_id: &str,
        identity: Identity,
        resume_order: OrderKey,
    ) -> Result<(Session, Arc<SessionOutbox>), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Join {
                video_id: video_id.to_string(),
                identity,
                resume_order,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Refresh liveness and cursor. `NotFound` once the session is gone.
    pub async fn heartbeat(&self, session_id: SessionId, cursor_ms: i64) -> Result<Session, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Heartbeat {
                session_id,
                cursor_ms,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Record that the client holds everything up to `order_key`.
    pub async fn acknowledge(
        &self,
        session_id: SessionId,
        order_key: OrderKey,
    ) -> Result<Session, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Acknowledge {
                session_id,
                order_key,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub async fn leave(&self, session_id: SessionId) -> Result<bool, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Leave { session_id, reply }, rx)
            .await
    }

    pub async fn get(&self, session_id: SessionId) -> Result<Session, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Get { session_id, reply }, rx)
            .await?
    }

    /// Presence snapshot for a video, oldest connection first.
    pub async fn active_sessions(&self, video_id: &str) -> Result<Vec<Session>, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Active {
                video_id: video_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Remove sessions past the heartbeat timeout or whose outbox closed.
    pub async fn reap(&self) -> Result<Vec<(Session, LeaveReason)>, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Reap { reply }, rx).await
    }

    /// Close every session and stop the registry task.
    pub async fn shutdown(&self) -> Result<usize, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Shutdown { reply }, rx).await
    }

    async fn request<T>(
        &self,
        command: RegistryCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, CoreError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CoreError::Internal("session registry stopped".to_string()))?;
        rx.await
            .map_err(|_| CoreError::Internal("session registry dropped the request".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

struct SessionEntry {
    session: Session,
    outbox: Arc<SessionOutbox>,
    last_beat: Instant,
}

impl SessionEntry {
    /// Fold what the session's worker has taken from the outbox into
    /// `last_seen_order`.
    fn sync_delivered(&mut self) -> &Session {
        let delivered = self.outbox.delivered_through();
        self.session.last_seen_order = self.session.last_seen_order.max(delivered);
        &self.session
    }
}

struct RegistryTask {
    hub: Arc<SyncHub>,
    heartbeat_timeout: Duration,
    queue_capacity: usize,
    sessions: HashMap<SessionId, SessionEntry>,
}

impl RegistryTask {
    async fn run(mut self, mut rx: mpsc::Receiver<RegistryCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                RegistryCommand::Join {
                    video_id,
                    identity,
                    resume_order,
                    reply,
                } => {
                    let _ = reply.send(Ok(self.join(video_id, identity, resume_order)));
                }
                RegistryCommand::Heartbeat {
                    session_id,
                    cursor_ms,
                    reply,
                } => {
                    let _ = reply.send(self.heartbeat(session_id, cursor_ms));
                }
                RegistryCommand::Acknowledge {
                    session_id,
                    order_key,
                    reply,
                } => {
                    let _ = reply.send(self.acknowledge(session_id, order_key));
                }
                RegistryCommand::Leave { session_id, reply } => {
                    let removed = self.remove(session_id, LeaveReason::Left).is_some();
                    let _ = reply.send(removed);
                }
                RegistryCommand::Get { session_id, reply } => {
                    let _ = reply.send(self.live_entry(session_id).map(|e| e.session.clone()));
                }
                RegistryCommand::Active { video_id, reply } => {
                    let mut active: Vec<Session> = self
                        .sessions
                        .values_mut()
                        .filter(|e| e.session.video_id == video_id && !e.outbox.is_closed())
                        .map(|e| e.sync_delivered().clone())
                        .collect();
                    active.sort_by_key(|s| s.connected_at);
                    let _ = reply.send(active);
                }
                RegistryCommand::Reap { reply } => {
                    let _ = reply.send(self.reap());
                }
                RegistryCommand::Shutdown { reply } => {
                    let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
                    let count = ids.len();
                    for session_id in ids {
                        self.remove(session_id, LeaveReason::Shutdown);
                    }
                    tracing::info!(count, "Session registry shut down");
                    let _ = reply.send(count);
                    break;
                }
            }
        }
    }

    fn join(
        &mut self,
        video_id: VideoId,
        identity: Identity,
        resume_order: OrderKey,
    ) -> (Session, Arc<SessionOutbox>) {
        let now = Utc::now();
        let session = Session {
            session_id: uuid::Uuid::new_v4(),
            video_id,
            identity: identity.id,
            display_name: identity.display_name,
            connected_at: now,
            last_seen_order: resume_order.max(0),
            cursor_ms: 0,
            last_heartbeat_at: now,
        };
        let outbox = Arc::new(SessionOutbox::new(session.session_id, self.queue_capacity));

        self.hub.attach(&session.video_id, Arc::clone(&outbox));
        self.hub.publish_presence(
            &session.video_id,
            TimelineEvent::PresenceJoined {
                session_id: session.session_id,
                identity: session.identity.clone(),
                display_name: session.display_name.clone(),
                cursor_ms: session.cursor_ms,
                at: now,
            },
        );

        tracing::info!(
            video_id = %session.video_id,
            session_id = %session.session_id,
            identity = %session.identity,
            resume_order = session.last_seen_order,
            "Session joined"
        );

        self.sessions.insert(
            session.session_id,
            SessionEntry {
                session: session.clone(),
                outbox: Arc::clone(&outbox),
                last_beat: Instant::now(),
            },
        );
        (session, outbox)
    }

    fn heartbeat(&mut self, session_id: SessionId, cursor_ms: i64) -> Result<Session, CoreError> {
        let entry = self.live_entry_mut(session_id)?;
        let now = Utc::now();
        entry.last_beat = Instant::now();
        entry.session.last_heartbeat_at = now;

        let moved = entry.session.cursor_ms != cursor_ms;
        entry.session.cursor_ms = cursor_ms;
        let session = entry.session.clone();

        if moved {
            self.hub.publish_presence(
                &session.video_id,
                TimelineEvent::PresenceCursorMoved {
                    session_id,
                    identity: session.identity.clone(),
                    cursor_ms,
                    at: now,
                },
            );
        }
        Ok(session)
    }

    fn acknowledge(&mut self, session_id: SessionId, order_key: OrderKey) -> Result<Session, CoreError> {
        let entry = self.live_entry_mut(session_id)?;
        entry.session.last_seen_order = entry.session.last_seen_order.max(order_key);
        Ok(entry.session.clone())
    }

    fn reap(&mut self) -> Vec<(Session, LeaveReason)> {
        let timeout = self.heartbeat_timeout;
        let doomed: Vec<(SessionId, LeaveReason)> = self
            .sessions
            .iter()
            .filter_map(|(id, entry)| {
                if let Some(reason) = entry.outbox.closed_reason() {
                    Some((*id, reason))
                } else if entry.last_beat.elapsed() > timeout {
                    Some((*id, LeaveReason::TimedOut))
                } else {
                    None
                }
            })
            .collect();

        doomed
            .into_iter()
            .filter_map(|(id, reason)| self.remove(id, reason).map(|s| (s, reason)))
            .collect()
    }

    /// A session whose outbox has closed is treated as gone: it is removed
    /// on the spot and reported as `NotFound`.
    fn live_entry_mut(&mut self, session_id: SessionId) -> Result<&mut SessionEntry, CoreError> {
        let closed = match self.sessions.get(&session_id) {
            None => return Err(CoreError::not_found("Session", session_id)),
            Some(entry) => entry.outbox.closed_reason(),
        };
        if let Some(reason) = closed {
            self.remove(session_id, reason);
            return Err(CoreError::not_found("Session", session_id));
        }
        let entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CoreError::not_found("Session", session_id))?;
        entry.sync_delivered();
        Ok(entry)
    }

    fn live_entry(&mut self, session_id: SessionId) -> Result<&SessionEntry, CoreError> {
        self.live_entry_mut(session_id).map(|entry| &*entry)
    }

    fn remove(&mut self, session_id: SessionId, reason: LeaveReason) -> Option<Session> {
        let mut entry = self.sessions.remove(&session_id)?;
        entry.sync_delivered();
        let session = entry.session;

        self.hub.detach(&session.video_id, session_id);
        entry.outbox.close(reason);
        self.hub.publish_presence(
            &session.video_id,
            TimelineEvent::PresenceLeft {
                session_id,
                identity: session.identity.clone(),
                reason,
                at: Utc::now(),
            },
        );

        match reason {
            LeaveReason::Left => {
                tracing::info!(video_id = %session.video_id, %session_id, "Session left")
            }
            other => tracing::info!(
                video_id = %session.video_id,
                %session_id,
                reason = other.as_str(),
                "Session reaped"
            ),
        }
        Some(session)
    }
}
