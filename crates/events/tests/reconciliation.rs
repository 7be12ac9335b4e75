//! Catch-up and live handoff when annotations land during reconnection.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use cuepoint_core::annotation::{Annotation, NewAnnotation};
use cuepoint_core::config::TimelineConfig;
use cuepoint_core::error::CoreError;
use cuepoint_core::timeline::{ReplicaUpdate, TimelineEvent, TimelineReplica};
use cuepoint_core::types::{AnnotationId, OrderKey};
use cuepoint_db::{AnnotationBackend, InMemoryBackend};

use cuepoint_events::Delivery;

use common::{
    drain_annotations, keys, next_annotation, next_delivery, service_with, until_caught_up,
};

#[derive(Clone, Copy, PartialEq)]
enum Hold {
    /// Hold the listing before reading the store.
    BeforeRead,
    /// Read the store, then hold before returning the page.
    AfterRead,
}

/// In-memory backend whose `list_since` can be held open by the test.
struct GatedBackend {
    inner: InMemoryBackend,
    armed: AtomicBool,
    hold: Hold,
    reached: Notify,
    gate: Semaphore,
}

impl GatedBackend {
    fn new(hold: Hold) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            armed: AtomicBool::new(false),
            hold,
            reached: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    async fn wait_at_gate(&self) {
        self.reached.notify_one();
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
    }

    fn release(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl AnnotationBackend for GatedBackend {
    async fn insert(&self, annotation: &Annotation) -> Result<(), CoreError> {
        self.inner.insert(annotation).await
    }

    async fn update(&self, annotation: &Annotation) -> Result<(), CoreError> {
        self.inner.update(annotation).await
    }

    async fn find_by_id(&self, id: AnnotationId) -> Result<Option<Annotation>, CoreError> {
        self.inner.find_by_id(id).await
    }

    async fn max_order_key(&self, video_id: &str) -> Result<OrderKey, CoreError> {
        self.inner.max_order_key(video_id).await
    }

    async fn list_since(
        &self,
        video_id: &str,
        after: OrderKey,
        limit: usize,
    ) -> Result<Vec<Annotation>, CoreError> {
        let armed = self.armed.load(Ordering::SeqCst);
        if armed && self.hold == Hold::BeforeRead {
            self.wait_at_gate().await;
        }
        let page = self.inner.list_since(video_id, after, limit).await?;
        if armed && self.hold == Hold::AfterRead {
            self.wait_at_gate().await;
        }
        Ok(page)
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Submit A, start a reconnect, submit B while catch-up is in flight, and
/// check the reconnecting client sees A then B exactly once.
async fn reconnect_during_submit(hold: Hold) {
    let backend = Arc::new(GatedBackend::new(hold));
    let service = service_with(backend.clone(), TimelineConfig::default());

    let writer = service.connect("v1", "token-alice", None).await.unwrap();
    until_caught_up(&writer.outbox).await;

    let a = service
        .submit_annotation(writer.session.session_id, 1000, "A", None)
        .await
        .unwrap();
    assert_eq!(a.order_key, 1);

    backend.armed.store(true, Ordering::SeqCst);
    let reached = backend.reached.notified();
    let reader = service.connect("v1", "token-bob", Some(0)).await.unwrap();
    reached.await;

    let b = service
        .submit_annotation(writer.session.session_id, 2000, "B", None)
        .await
        .unwrap();
    assert_eq!(b.order_key, 2);

    backend.release();

    let (caught_up, through_order) = until_caught_up(&reader.outbox).await;
    let mut delivered = caught_up;
    delivered.extend(drain_annotations(&reader.outbox).await);

    assert_eq!(keys(&delivered), vec![1, 2], "through_order = {through_order}");

    let mut replica = TimelineReplica::new("v1");
    for event in &delivered {
        assert_eq!(replica.apply(event).unwrap(), ReplicaUpdate::Appended);
    }
    assert_eq!(replica.resume_order(), 2);
    assert_eq!(replica.get(1).unwrap().body, "A");
    assert_eq!(replica.get(2).unwrap().body, "B");

    // The live writer saw both as they happened.
    let live: Vec<TimelineEvent> = vec![
        next_annotation(&writer.outbox).await.unwrap(),
        next_annotation(&writer.outbox).await.unwrap(),
    ];
    assert_eq!(keys(&live), vec![1, 2]);
}

#[tokio::test]
async fn submit_during_catch_up_read_is_replayed_from_buffer() {
    reconnect_during_submit(Hold::AfterRead).await;
}

#[tokio::test]
async fn submit_before_catch_up_read_is_not_duplicated() {
    reconnect_during_submit(Hold::BeforeRead).await;
}

#[tokio::test]
async fn resume_order_skips_what_the_client_has() {
    let service = common::service();
    let writer = service.connect("v1", "token-alice", None).await.unwrap();
    for i in 0..5 {
        service
            .submit_annotation(writer.session.session_id, i * 1000, &format!("n{i}"), None)
            .await
            .unwrap();
    }

    let reader = service.connect("v1", "token-bob", Some(3)).await.unwrap();
    assert_eq!(reader.session.last_seen_order, 3);
    let (caught_up, through_order) = until_caught_up(&reader.outbox).await;
    assert_eq!(keys(&caught_up), vec![4, 5]);
    assert_eq!(through_order, 5);

    let mut replica = TimelineReplica::resume_from("v1", 3);
    for event in &caught_up {
        replica.apply(event).unwrap();
    }
    assert_eq!(replica.resume_order(), 5);
}

#[tokio::test]
async fn edits_during_catch_up_arrive_once_with_latest_revision() {
    let backend = Arc::new(GatedBackend::new(Hold::AfterRead));
    let service = service_with(backend.clone(), TimelineConfig::default());
    let writer = service.connect("v1", "token-alice", None).await.unwrap();
    let a = service
        .submit_annotation(writer.session.session_id, 0, "draft", None)
        .await
        .unwrap();

    backend.armed.store(true, Ordering::SeqCst);
    let reached = backend.reached.notified();
    let reader = service.connect("v1", "token-bob", None).await.unwrap();
    reached.await;

    service
        .edit_annotation(writer.session.session_id, a.id, "final")
        .await
        .unwrap();
    backend.release();

    let (mut delivered, _) = until_caught_up(&reader.outbox).await;
    delivered.extend(drain_annotations(&reader.outbox).await);

    let mut replica = TimelineReplica::new("v1");
    for event in &delivered {
        replica.apply(event).unwrap();
    }
    let held = replica.get(1).unwrap();
    assert_eq!(held.body, "final");
    assert_eq!(held.revision, 2);
    assert!(delivered.len() <= 2);
}

fn note(body: &str) -> NewAnnotation {
    NewAnnotation {
        video_id: "v1".to_string(),
        author_id: "alice".to_string(),
        timestamp_ms: 1000,
        body: body.to_string(),
        parent_id: None,
        position_unverified: false,
    }
}

#[tokio::test]
async fn history_larger_than_queue_reaches_a_slow_reader() {
    let config = TimelineConfig {
        session_queue_capacity: 4,
        ..Default::default()
    };
    let service = service_with(Arc::new(InMemoryBackend::new()), config);
    for i in 1..=8 {
        service.store().append(note(&format!("n{i}"))).await.unwrap();
    }

    let reader = service.connect("v1", "token-bob", None).await.unwrap();
    // Commits racing the catch-up land in the listing, the buffer, or both.
    for i in 9..=10 {
        service.store().append(note(&format!("n{i}"))).await.unwrap();
    }

    let mut before_marker = Vec::new();
    let mut after_marker = Vec::new();
    let mut marker = None;
    while marker.is_none() || before_marker.len() + after_marker.len() < 10 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        match next_delivery(&reader.outbox, Duration::from_secs(2)).await {
            Some(Delivery::Event(event)) if event.is_presence() => {}
            Some(Delivery::Event(event)) if marker.is_none() => before_marker.push(event),
            Some(Delivery::Event(event)) => after_marker.push(event),
            Some(Delivery::CatchUpComplete { through_order }) => marker = Some(through_order),
            None => panic!(
                "reader stalled: closed = {:?}",
                reader.outbox.closed_reason()
            ),
        }
    }

    let through_order = marker.unwrap();
    assert!(through_order >= 8);
    let caught_up = keys(&before_marker);
    assert_eq!(caught_up, (1..=through_order).collect::<Vec<_>>());
    let replayed = keys(&after_marker);
    assert_eq!(replayed, (through_order + 1..=10).collect::<Vec<_>>());

    assert!(!reader.outbox.is_closed());
    assert!(service.heartbeat(reader.session.session_id, 0).await.is_ok());
}
