//! Bounded per-session delivery queue.
//!
//! The hub pushes into a session's outbox without ever waiting. When the
//! queue is full:
//!
//! 1. an incoming presence event is dropped;
//! 2. an incoming annotation event evicts the oldest queued presence event;
//! 3. if no presence event is left to evict, the outbox closes with
//!    [`LeaveReason::Overflow`]. The client reconnects and reconciles, which
//!    is preferable to silently losing an annotation.
//!
//! Catch-up is the one producer allowed to wait for space: it runs on its own
//! task and the session's worker drains concurrently.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use cuepoint_core::session::LeaveReason;
use cuepoint_core::timeline::TimelineEvent;
use cuepoint_core::types::{OrderKey, SessionId};
use tokio::sync::Notify;

/// One item handed to a session's worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(TimelineEvent),
    /// Catch-up finished; everything up to `through_order` has been queued.
    CatchUpComplete { through_order: OrderKey },
}

impl Delivery {
    fn is_presence(&self) -> bool {
        matches!(self, Self::Event(event) if event.is_presence())
    }

    /// Order key the client holds once this item is applied.
    fn order_key(&self) -> Option<OrderKey> {
        match self {
            Self::Event(event) => event.order_key(),
            Self::CatchUpComplete { through_order } => Some(*through_order),
        }
    }
}

/// Outcome of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest presence event.
    QueuedAfterEviction,
    /// Presence event discarded because the queue was full.
    Dropped,
    /// The outbox is closed; nothing was queued.
    Closed,
    /// The push overflowed the queue and closed the outbox.
    Overflowed,
}

#[derive(Debug)]
struct OutboxState {
    queue: VecDeque<Delivery>,
    closed: Option<LeaveReason>,
    delivered_through: OrderKey,
}

/// Bounded queue between the hub and one session's worker.
#[derive(Debug)]
pub struct SessionOutbox {
    session_id: SessionId,
    capacity: usize,
    state: Mutex<OutboxState>,
    available: Notify,
    space: Notify,
}

impl SessionOutbox {
    pub fn new(session_id: SessionId, capacity: usize) -> Self {
        Self {
            session_id,
            capacity: capacity.max(1),
            state: Mutex::new(OutboxState {
                queue: VecDeque::with_capacity(capacity.max(1)),
                closed: None,
                delivered_through: 0,
            }),
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest annotation order key handed to the session's worker so far.
    ///
    /// Edits of older annotations never lower it.
    pub fn delivered_through(&self) -> OrderKey {
        self.lock().delivered_through
    }

    /// Why the outbox was closed, if it was.
    pub fn closed_reason(&self) -> Option<LeaveReason> {
        self.lock().closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed_reason().is_some()
    }

    /// Queue a presence event, dropping it if the queue is full.
    pub fn try_push_presence(&self, event: TimelineEvent) -> PushOutcome {
        let mut state = self.lock();
        if state.closed.is_some() {
            return PushOutcome::Closed;
        }
        if state.queue.len() >= self.capacity {
            tracing::debug!(session_id = %self.session_id, "Outbox full, presence event dropped");
            return PushOutcome::Dropped;
        }
        state.queue.push_back(Delivery::Event(event));
        drop(state);
        self.available.notify_one();
        PushOutcome::Queued
    }

    /// Queue an annotation event without waiting. Evicts the oldest presence
    /// event if full, and closes the outbox if there is none.
    pub fn try_push_annotation(&self, event: TimelineEvent) -> PushOutcome {
        let mut state = self.lock();
        if state.closed.is_some() {
            return PushOutcome::Closed;
        }

        let mut outcome = PushOutcome::Queued;
        if state.queue.len() >= self.capacity {
            match state.queue.iter().position(Delivery::is_presence) {
                Some(index) => {
                    state.queue.remove(index);
                    outcome = PushOutcome::QueuedAfterEviction;
                    tracing::debug!(
                        session_id = %self.session_id,
                        "Outbox full, evicted oldest presence event"
                    );
                }
                None => {
                    state.closed = Some(LeaveReason::Overflow);
                    drop(state);
                    tracing::warn!(
                        session_id = %self.session_id,
                        capacity = self.capacity,
                        "Outbox overflowed with annotation events, disconnecting session"
                    );
                    self.wake_all();
                    return PushOutcome::Overflowed;
                }
            }
        }

        state.queue.push_back(Delivery::Event(event));
        drop(state);
        self.available.notify_one();
        outcome
    }

    /// Queue a catch-up item, waiting for space if the queue is full.
    ///
    /// Returns the close reason if the outbox closes while waiting.
    pub async fn push_catch_up(&self, delivery: Delivery) -> Result<(), LeaveReason> {
        let mut delivery = Some(delivery);
        loop {
            let space = self.space.notified();
            {
                let mut state = self.lock();
                if let Some(reason) = state.closed {
                    return Err(reason);
                }
                if state.queue.len() < self.capacity {
                    if let Some(item) = delivery.take() {
                        state.queue.push_back(item);
                    }
                    drop(state);
                    self.available.notify_one();
                    return Ok(());
                }
            }
            space.await;
        }
    }

    /// Take the next item, waiting if the queue is empty.
    ///
    /// Items queued before the outbox closed are still handed out; `None`
    /// means closed and drained.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            let available = self.available.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    if let Some(order_key) = item.order_key() {
                        state.delivered_through = state.delivered_through.max(order_key);
                    }
                    drop(state);
                    self.space.notify_one();
                    return Some(item);
                }
                if state.closed.is_some() {
                    return None;
                }
            }
            available.await;
        }
    }

    /// Close the outbox. The first reason wins.
    pub fn close(&self, reason: LeaveReason) {
        {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
        }
        self.wake_all();
    }

    fn wake_all(&self) {
        self.available.notify_waiters();
        self.space.notify_waiters();
        // A waiter between `notified()` and `.await` still gets the permit.
        self.available.notify_one();
        self.space.notify_one();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cuepoint_core::annotation::{Annotation, AnnotationStatus};
    use std::sync::Arc;
    use std::time::Duration;

    fn presence(cursor_ms: i64) -> TimelineEvent {
        TimelineEvent::PresenceCursorMoved {
            session_id: uuid::Uuid::new_v4(),
            identity: "alice".to_string(),
            cursor_ms,
            at: Utc::now(),
        }
    }

    fn created(order_key: OrderKey) -> TimelineEvent {
        let now = Utc::now();
        TimelineEvent::from_record(Annotation {
            id: uuid::Uuid::now_v7(),
            video_id: "v1".to_string(),
            order_key,
            author_id: "alice".to_string(),
            timestamp_ms: 0,
            body: "note".to_string(),
            parent_id: None,
            status: AnnotationStatus::Active,
            revision: 1,
            position_unverified: false,
            created_at: now,
            updated_at: now,
        })
    }

    fn outbox(capacity: usize) -> SessionOutbox {
        SessionOutbox::new(uuid::Uuid::new_v4(), capacity)
    }

    #[tokio::test]
    async fn items_come_out_in_push_order() {
        let outbox = outbox(4);
        outbox.try_push_annotation(created(1));
        outbox.try_push_presence(presence(10));
        outbox.try_push_annotation(created(2));

        assert_eq!(next_key(&outbox).await, Some(1));
        assert!(matches!(outbox.recv().await, Some(Delivery::Event(e)) if e.is_presence()));
        assert_eq!(next_key(&outbox).await, Some(2));
    }

    async fn next_key(outbox: &SessionOutbox) -> Option<OrderKey> {
        match outbox.recv().await? {
            Delivery::Event(event) => event.order_key(),
            Delivery::CatchUpComplete { .. } => None,
        }
    }

    #[tokio::test]
    async fn full_queue_drops_incoming_presence() {
        let outbox = outbox(2);
        outbox.try_push_annotation(created(1));
        outbox.try_push_annotation(created(2));

        assert_eq!(outbox.try_push_presence(presence(5)), PushOutcome::Dropped);
        assert_eq!(outbox.len(), 2);
        assert!(!outbox.is_closed());
    }

    #[tokio::test]
    async fn annotation_evicts_oldest_presence() {
        let outbox = outbox(3);
        outbox.try_push_presence(presence(1));
        outbox.try_push_annotation(created(1));
        outbox.try_push_presence(presence(2));

        assert_eq!(
            outbox.try_push_annotation(created(2)),
            PushOutcome::QueuedAfterEviction
        );

        assert_eq!(next_key(&outbox).await, Some(1));
        match outbox.recv().await {
            Some(Delivery::Event(TimelineEvent::PresenceCursorMoved { cursor_ms, .. })) => {
                assert_eq!(cursor_ms, 2)
            }
            other => panic!("expected the newer presence event, got {other:?}"),
        }
        assert_eq!(next_key(&outbox).await, Some(2));
    }

    #[tokio::test]
    async fn annotation_overflow_closes_outbox() {
        let outbox = outbox(2);
        outbox.try_push_annotation(created(1));
        outbox.try_push_annotation(created(2));

        assert_eq!(
            outbox.try_push_annotation(created(3)),
            PushOutcome::Overflowed
        );
        assert_eq!(outbox.closed_reason(), Some(LeaveReason::Overflow));
        assert_eq!(outbox.try_push_annotation(created(4)), PushOutcome::Closed);

        // Already-queued items still drain, then the stream ends.
        assert_eq!(next_key(&outbox).await, Some(1));
        assert_eq!(next_key(&outbox).await, Some(2));
        assert!(outbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn delivered_through_follows_recv_not_push() {
        let outbox = outbox(4);
        outbox.try_push_annotation(created(3));
        outbox.try_push_presence(presence(1));
        outbox.try_push_annotation(created(2));
        assert_eq!(outbox.delivered_through(), 0);

        outbox.recv().await;
        assert_eq!(outbox.delivered_through(), 3);
        outbox.recv().await;
        outbox.recv().await;
        assert_eq!(outbox.delivered_through(), 3);

        outbox
            .push_catch_up(Delivery::CatchUpComplete { through_order: 8 })
            .await
            .unwrap();
        outbox.recv().await;
        assert_eq!(outbox.delivered_through(), 8);
    }

    #[tokio::test]
    async fn first_close_reason_wins() {
        let outbox = outbox(1);
        outbox.close(LeaveReason::TimedOut);
        outbox.close(LeaveReason::Left);
        assert_eq!(outbox.closed_reason(), Some(LeaveReason::TimedOut));
    }

    #[tokio::test]
    async fn catch_up_waits_for_space() {
        let outbox = Arc::new(outbox(1));
        outbox.try_push_annotation(created(1));

        let producer = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move { outbox.push_catch_up(Delivery::Event(created(2))).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(next_key(&outbox).await, Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(next_key(&outbox).await, Some(2));
    }

    #[tokio::test]
    async fn close_releases_waiting_catch_up() {
        let outbox = Arc::new(outbox(1));
        outbox.try_push_annotation(created(1));

        let producer = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move { outbox.push_catch_up(Delivery::Event(created(2))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.close(LeaveReason::Shutdown);

        assert_eq!(producer.await.unwrap(), Err(LeaveReason::Shutdown));
    }

    #[tokio::test]
    async fn recv_wakes_on_close() {
        let outbox = Arc::new(outbox(1));
        let consumer = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move { outbox.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.close(LeaveReason::Left);
        assert!(consumer.await.unwrap().is_none());
    }
}
