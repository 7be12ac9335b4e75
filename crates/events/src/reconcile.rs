//! Catch-up on connect, then handoff to live delivery.
//!
//! The session is attached to the hub (buffering) before the store is read,
//! so every commit is either part of the listing, in the hub buffer, or both.
//! After the listing and the catch-up marker, the buffer is replayed minus
//! what the listing already delivered, compared by `(order_key, revision)`.
//! Every one of those items waits for outbox space; only once the hub
//! reports an empty buffer does the session take direct, non-waiting pushes.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;

use cuepoint_core::annotation::Annotation;
use cuepoint_core::error::CoreError;
use cuepoint_core::session::LeaveReason;
use cuepoint_core::timeline::TimelineEvent;
use cuepoint_core::types::{OrderKey, SessionId, VideoId};
use cuepoint_db::AnnotationStore;

use crate::hub::{Handoff, SyncHub};
use crate::outbox::{Delivery, SessionOutbox};

/// What the catch-up stream delivered to one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatchUpSummary {
    through_order: OrderKey,
    revisions: HashMap<OrderKey, i64>,
}

impl CatchUpSummary {
    pub fn new(resume_order: OrderKey) -> Self {
        Self {
            through_order: resume_order.max(0),
            revisions: HashMap::new(),
        }
    }

    /// Note a record shipped during catch-up.
    pub fn record(&mut self, annotation: &Annotation) {
        self.through_order = self.through_order.max(annotation.order_key);
        self.revisions
            .insert(annotation.order_key, annotation.revision);
    }

    /// Highest order key the client holds once catch-up is queued.
    pub fn through_order(&self) -> OrderKey {
        self.through_order
    }

    /// Number of records shipped.
    pub fn delivered(&self) -> usize {
        self.revisions.len()
    }

    /// Whether a buffered hub event still has to be sent after catch-up.
    ///
    /// Presence events always pass. Annotation events pass when they are
    /// beyond the catch-up range or newer than the revision catch-up shipped.
    pub fn should_replay(&self, event: &TimelineEvent) -> bool {
        let Some(annotation) = event.annotation() else {
            return true;
        };
        if annotation.order_key > self.through_order {
            return true;
        }
        match self.revisions.get(&annotation.order_key) {
            Some(&shipped) => annotation.revision > shipped,
            None => true,
        }
    }
}

/// Why a catch-up did not reach the live handoff.
#[derive(Debug, thiserror::Error)]
pub enum CatchUpError {
    #[error("catch-up read failed: {0}")]
    Store(#[from] CoreError),

    #[error("session outbox closed during catch-up ({})", .0.as_str())]
    Closed(LeaveReason),

    #[error("session detached from hub before going live")]
    Detached,
}

/// Stream everything after `resume_order` into the outbox, then go live.
///
/// The session must already be attached to the hub.
pub async fn run_catch_up(
    store: &AnnotationStore,
    hub: &SyncHub,
    outbox: &SessionOutbox,
    video_id: &str,
    resume_order: OrderKey,
) -> Result<CatchUpSummary, CatchUpError> {
    let mut summary = CatchUpSummary::new(resume_order);
    let mut records = store.list_since(video_id, resume_order);

    while let Some(record) = records.next().await {
        let annotation = record?;
        summary.record(&annotation);
        queue(outbox, Delivery::Event(TimelineEvent::from_record(annotation))).await?;
    }

    queue(
        outbox,
        Delivery::CatchUpComplete {
            through_order: summary.through_order(),
        },
    )
    .await?;

    let mut replayed = 0usize;
    loop {
        match hub.hand_off(video_id, outbox.session_id()).await {
            Handoff::Live => break,
            Handoff::Detached => return Err(CatchUpError::Detached),
            Handoff::Replay(events) => {
                for event in events.into_iter().filter(|e| summary.should_replay(e)) {
                    queue(outbox, Delivery::Event(event)).await?;
                    replayed += 1;
                }
            }
        }
    }

    if replayed > 0 {
        tracing::debug!(video_id = %video_id, replayed, "Replayed events buffered during catch-up");
    }
    Ok(summary)
}

async fn queue(outbox: &SessionOutbox, delivery: Delivery) -> Result<(), CatchUpError> {
    outbox
        .push_catch_up(delivery)
        .await
        .map_err(CatchUpError::Closed)
}

/// Run [`run_catch_up`] on its own task.
///
/// The outbox is bounded, so catch-up must not run on the task that drains
/// it. A storage failure closes the session with
/// [`LeaveReason::CatchUpFailed`]; the client reconnects later with the same
/// resume order.
pub fn spawn_catch_up(
    store: Arc<AnnotationStore>,
    hub: Arc<SyncHub>,
    outbox: Arc<SessionOutbox>,
    video_id: VideoId,
    resume_order: OrderKey,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let session_id: SessionId = outbox.session_id();
        match run_catch_up(&store, &hub, &outbox, &video_id, resume_order).await {
            Ok(summary) => {
                tracing::debug!(
                    video_id = %video_id,
                    %session_id,
                    resume_order,
                    through_order = summary.through_order(),
                    delivered = summary.delivered(),
                    "Catch-up complete"
                );
            }
            Err(CatchUpError::Store(e)) => {
                tracing::error!(
                    video_id = %video_id,
                    %session_id,
                    error = %e,
                    "Catch-up failed, closing session"
                );
                hub.detach(&video_id, session_id);
                outbox.close(LeaveReason::CatchUpFailed);
            }
            Err(e) => {
                tracing::debug!(video_id = %video_id, %session_id, error = %e, "Catch-up abandoned");
                hub.detach(&video_id, session_id);
            }
        }
    })
}
