//! Per-video publish/subscribe broker.
//!
//! Each video with subscribers gets one hub task that owns the video's
//! subscriber table. Publishing sends a message to that task and returns
//! immediately, so the annotation writer is never blocked by fan-out. The
//! task pushes into each session's [`SessionOutbox`] without waiting; the
//! session's own worker drains it.
//!
//! A subscriber starts in catch-up mode: annotation events are buffered
//! while the reconciliation task streams stored records. The catch-up task
//! then calls [`SyncHub::hand_off`] until the buffer is empty, queueing each
//! batch it gets back itself, and only then is the subscriber switched to
//! direct delivery.
//!
//! A hub task exits once its last subscriber is gone and its queue is
//! empty. Only [`SyncHub::attach`] starts a task; every other command for a
//! video without one is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use cuepoint_core::session::LeaveReason;
use cuepoint_core::timeline::{AnnotationChange, ChangeListener, TimelineEvent};
use cuepoint_core::types::{SessionId, VideoId};
use tokio::sync::{mpsc, oneshot};

use crate::outbox::{PushOutcome, SessionOutbox};

type VideoMap = Arc<Mutex<HashMap<VideoId, mpsc::UnboundedSender<HubCommand>>>>;

enum HubCommand {
    Attach {
        outbox: Arc<SessionOutbox>,
    },
    HandOff {
        session_id: SessionId,
        reply: oneshot::Sender<Handoff>,
    },
    Detach {
        session_id: SessionId,
    },
    Annotation(TimelineEvent),
    Presence(TimelineEvent),
    CloseAll {
        reason: LeaveReason,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Answer to [`SyncHub::hand_off`].
#[derive(Debug, Clone, PartialEq)]
pub enum Handoff {
    /// The buffer was empty; the subscriber now receives events directly.
    Live,
    /// Events buffered since the last call. The subscriber stays in
    /// catch-up mode until a call finds the buffer empty.
    Replay(Vec<TimelineEvent>),
    /// The session is no longer subscribed.
    Detached,
}

/// Fan-out broker shared by the store (as its change listener) and the
/// session registry.
#[derive(Default)]
pub struct SyncHub {
    videos: VideoMap,
}

impl SyncHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a session's outbox in catch-up mode.
    pub fn attach(&self, video_id: &str, outbox: Arc<SessionOutbox>) {
        self.send(video_id, HubCommand::Attach { outbox });
    }

    /// Take the events buffered for a catching-up session, or switch it to
    /// live delivery if there are none.
    pub async fn hand_off(&self, video_id: &str, session_id: SessionId) -> Handoff {
        let (reply, rx) = oneshot::channel();
        self.send(video_id, HubCommand::HandOff { session_id, reply });
        rx.await.unwrap_or(Handoff::Detached)
    }

    pub fn detach(&self, video_id: &str, session_id: SessionId) {
        self.send(video_id, HubCommand::Detach { session_id });
    }

    /// Fan an annotation event out to every subscriber of its video.
    pub fn publish_annotation(&self, event: TimelineEvent) {
        let Some(annotation) = event.annotation() else {
            return;
        };
        let video_id = annotation.video_id.clone();
        self.send(&video_id, HubCommand::Annotation(event));
    }

    /// Fan a presence event out to every subscriber of the video. Best effort.
    pub fn publish_presence(&self, video_id: &str, event: TimelineEvent) {
        self.send(video_id, HubCommand::Presence(event));
    }

    /// Close every subscriber's outbox on every video.
    pub fn close_all(&self, reason: LeaveReason) {
        let videos = self.videos.lock().unwrap_or_else(PoisonError::into_inner);
        for sender in videos.values() {
            let _ = sender.send(HubCommand::CloseAll { reason });
        }
        tracing::info!(videos = videos.len(), reason = reason.as_str(), "Closed all hub subscribers");
    }

    /// Number of sessions subscribed to a video.
    pub async fn subscriber_count(&self, video_id: &str) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(video_id, HubCommand::Count { reply });
        rx.await.unwrap_or(0)
    }

    /// Number of videos with a running hub task.
    pub fn video_count(&self) -> usize {
        self.videos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Every send happens under the map lock, which is what lets an idle
    /// task retire without losing a command.
    fn send(&self, video_id: &str, command: HubCommand) {
        let mut videos = self.videos.lock().unwrap_or_else(PoisonError::into_inner);
        let command = match videos.get(video_id) {
            Some(sender) => match sender.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    tracing::warn!(video_id = %video_id, "Hub task gone");
                    videos.remove(video_id);
                    returned
                }
            },
            None => command,
        };

        if let HubCommand::Attach { .. } = command {
            let sender = spawn_video_task(video_id, Arc::clone(&self.videos));
            let _ = sender.send(command);
            videos.insert(video_id.to_string(), sender);
        }
    }
}

impl ChangeListener for SyncHub {
    fn annotation_changed(&self, change: AnnotationChange) {
        self.publish_annotation(change.into());
    }
}

// ---------------------------------------------------------------------------
// Per-video task
// ---------------------------------------------------------------------------

enum Phase {
    /// Annotation events are held until the catch-up stream finishes.
    CatchingUp { buffer: Vec<TimelineEvent> },
    Live,
}

struct Subscriber {
    outbox: Arc<SessionOutbox>,
    phase: Phase,
}

fn spawn_video_task(video_id: &str, videos: VideoMap) -> mpsc::UnboundedSender<HubCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = VideoHub {
        video_id: video_id.to_string(),
        videos,
        subscribers: HashMap::new(),
    };
    tokio::spawn(task.run(rx));
    tracing::debug!(video_id = %video_id, "Started hub task");
    tx
}

struct VideoHub {
    video_id: VideoId,
    videos: VideoMap,
    subscribers: HashMap<SessionId, Subscriber>,
}

impl VideoHub {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
            while self.subscribers.is_empty() {
                match self.retire(&mut rx) {
                    Some(pending) => self.handle(pending),
                    None => {
                        tracing::debug!(video_id = %self.video_id, "Hub task stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Remove this task's map entry unless a command is already queued, in
    /// which case that command is returned instead.
    fn retire(&self, rx: &mut mpsc::UnboundedReceiver<HubCommand>) -> Option<HubCommand> {
        let mut videos = self.videos.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(pending) = rx.try_recv() {
            return Some(pending);
        }
        // The entry is ours: it is only replaced after this receiver is gone.
        videos.remove(&self.video_id);
        None
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Attach { outbox } => {
                let session_id = outbox.session_id();
                self.subscribers.insert(
                    session_id,
                    Subscriber {
                        outbox,
                        phase: Phase::CatchingUp { buffer: Vec::new() },
                    },
                );
                tracing::debug!(video_id = %self.video_id, %session_id, "Subscriber attached");
            }
            HubCommand::HandOff { session_id, reply } => {
                let _ = reply.send(self.hand_off(session_id));
            }
            HubCommand::Detach { session_id } => {
                if self.subscribers.remove(&session_id).is_some() {
                    tracing::debug!(video_id = %self.video_id, %session_id, "Subscriber detached");
                }
            }
            HubCommand::Annotation(event) => self.fan_out_annotation(event),
            HubCommand::Presence(event) => self.fan_out_presence(event),
            HubCommand::CloseAll { reason } => {
                for (_, subscriber) in self.subscribers.drain() {
                    subscriber.outbox.close(reason);
                }
            }
            HubCommand::Count { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn hand_off(&mut self, session_id: SessionId) -> Handoff {
        let Some(subscriber) = self.subscribers.get_mut(&session_id) else {
            return Handoff::Detached;
        };
        match &mut subscriber.phase {
            Phase::CatchingUp { buffer } if !buffer.is_empty() => {
                Handoff::Replay(std::mem::take(buffer))
            }
            phase => {
                *phase = Phase::Live;
                tracing::debug!(video_id = %self.video_id, %session_id, "Subscriber live");
                Handoff::Live
            }
        }
    }

    fn fan_out_annotation(&mut self, event: TimelineEvent) {
        let mut overflowed = Vec::new();
        for (session_id, subscriber) in self.subscribers.iter_mut() {
            match &mut subscriber.phase {
                Phase::CatchingUp { buffer } => {
                    if buffer.len() >= subscriber.outbox.capacity() {
                        tracing::warn!(
                            video_id = %self.video_id,
                            %session_id,
                            "Catch-up buffer overflowed, disconnecting session"
                        );
                        subscriber.outbox.close(LeaveReason::Overflow);
                        overflowed.push(*session_id);
                    } else {
                        buffer.push(event.clone());
                    }
                }
                Phase::Live => {
                    if !accepted(subscriber.outbox.try_push_annotation(event.clone())) {
                        overflowed.push(*session_id);
                    }
                }
            }
        }
        for session_id in overflowed {
            self.subscribers.remove(&session_id);
        }
    }

    fn fan_out_presence(&mut self, event: TimelineEvent) {
        let mut closed = Vec::new();
        for (session_id, subscriber) in &self.subscribers {
            if subscriber.outbox.try_push_presence(event.clone()) == PushOutcome::Closed {
                closed.push(*session_id);
            }
        }
        for session_id in closed {
            self.subscribers.remove(&session_id);
        }
    }
}

fn accepted(outcome: PushOutcome) -> bool {
    matches!(outcome, PushOutcome::Queued | PushOutcome::QueuedAfterEviction)
}
