//! Shared helpers for the events integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cuepoint_core::config::TimelineConfig;
use cuepoint_core::error::CoreError;
use cuepoint_core::identity::{Identity, IdentityVerifier};
use cuepoint_core::timeline::TimelineEvent;
use cuepoint_core::types::OrderKey;
use cuepoint_core::video::{InMemoryVideoDirectory, VideoDescriptor};
use cuepoint_db::{AnnotationBackend, InMemoryBackend};
use cuepoint_events::{Delivery, FeedbackService, SessionOutbox};

/// Accepts `token-<id>` and yields identity `<id>`.
pub struct PrefixVerifier;

impl IdentityVerifier for PrefixVerifier {
    fn verify(&self, token: &str) -> Result<Identity, CoreError> {
        token
            .strip_prefix("token-")
            .filter(|id| !id.is_empty())
            .map(|id| Identity {
                id: id.to_string(),
                display_name: Some(id.to_uppercase()),
            })
            .ok_or_else(|| CoreError::Unauthorized("invalid token".to_string()))
    }
}

pub fn directory() -> Arc<InMemoryVideoDirectory> {
    let directory = Arc::new(InMemoryVideoDirectory::new());
    directory
        .register(VideoDescriptor {
            video_id: "v1".to_string(),
            url: "https://media.example.com/v1.mp4".to_string(),
            duration_ms: Some(120_000),
            frame_rate: Some(25.0),
        })
        .unwrap();
    directory
        .register(VideoDescriptor {
            video_id: "unprobed".to_string(),
            url: "https://media.example.com/unprobed.mp4".to_string(),
            duration_ms: None,
            frame_rate: None,
        })
        .unwrap();
    directory
}

pub fn service_with(backend: Arc<dyn AnnotationBackend>, config: TimelineConfig) -> FeedbackService {
    FeedbackService::new(backend, Arc::new(PrefixVerifier), directory(), config)
}

pub fn service() -> FeedbackService {
    service_with(Arc::new(InMemoryBackend::new()), TimelineConfig::default())
}

/// Next delivery, or `None` if nothing arrives within `wait`.
pub async fn next_delivery(outbox: &SessionOutbox, wait: Duration) -> Option<Delivery> {
    tokio::time::timeout(wait, outbox.recv()).await.ok().flatten()
}

/// Skip presence until the next annotation event or catch-up marker.
pub async fn next_timeline_item(outbox: &SessionOutbox) -> Option<Delivery> {
    loop {
        match next_delivery(outbox, Duration::from_secs(2)).await? {
            Delivery::Event(event) if event.is_presence() => continue,
            other => return Some(other),
        }
    }
}

/// Next annotation event, skipping presence and catch-up markers.
pub async fn next_annotation(outbox: &SessionOutbox) -> Option<TimelineEvent> {
    loop {
        match next_timeline_item(outbox).await? {
            Delivery::Event(event) => return Some(event),
            Delivery::CatchUpComplete { .. } => continue,
        }
    }
}

/// Wait for the catch-up marker, returning the annotation events before it.
pub async fn until_caught_up(outbox: &SessionOutbox) -> (Vec<TimelineEvent>, OrderKey) {
    let mut events = Vec::new();
    loop {
        match next_timeline_item(outbox).await {
            Some(Delivery::Event(event)) => events.push(event),
            Some(Delivery::CatchUpComplete { through_order }) => return (events, through_order),
            None => panic!("outbox ended before catch-up completed"),
        }
    }
}

/// Every annotation event that arrives before the outbox goes quiet.
pub async fn drain_annotations(outbox: &SessionOutbox) -> Vec<TimelineEvent> {
    let mut events = Vec::new();
    while let Some(delivery) = next_delivery(outbox, Duration::from_millis(200)).await {
        if let Delivery::Event(event) = delivery {
            if !event.is_presence() {
                events.push(event);
            }
        }
    }
    events
}

pub fn keys(events: &[TimelineEvent]) -> Vec<OrderKey> {
    events.iter().filter_map(TimelineEvent::order_key).collect()
}
