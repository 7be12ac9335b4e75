//! Process-local annotation backend.
//!
//! Mirrors the PostgreSQL table's constraints (primary key on
//! `(video_id, order_key)`, unique `id`, parent foreign key) so the store
//! behaves the same on both. Used by tests and when no database is configured.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use cuepoint_core::annotation::Annotation;
use cuepoint_core::error::CoreError;
use cuepoint_core::types::{AnnotationId, OrderKey, VideoId};
use tokio::sync::RwLock;

use crate::backend::AnnotationBackend;

#[derive(Default)]
struct MemoryState {
    videos: HashMap<VideoId, BTreeMap<OrderKey, Annotation>>,
    /// Secondary index: annotation id -> (video, order key).
    index: HashMap<AnnotationId, (VideoId, OrderKey)>,
}

/// In-memory [`AnnotationBackend`].
#[derive(Default)]
pub struct InMemoryBackend {
    state: RwLock<MemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored records across all videos.
    pub async fn len(&self) -> usize {
        self.state.read().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AnnotationBackend for InMemoryBackend {
    async fn insert(&self, annotation: &Annotation) -> Result<(), CoreError> {
        let mut state = self.state.write().await;

        if state.index.contains_key(&annotation.id) {
            return Err(CoreError::Conflict(format!(
                "annotation {} already exists",
                annotation.id
            )));
        }
        if let Some(parent) = annotation.parent_id {
            if !state.index.contains_key(&parent) {
                return Err(CoreError::Conflict(
                    "referenced parent annotation no longer exists".to_string(),
                ));
            }
        }

        let rows = state.videos.entry(annotation.video_id.clone()).or_default();
        if rows.contains_key(&annotation.order_key) {
            return Err(CoreError::Conflict(format!(
                "order key {} already assigned in video {}",
                annotation.order_key, annotation.video_id
            )));
        }
        rows.insert(annotation.order_key, annotation.clone());
        state.index.insert(
            annotation.id,
            (annotation.video_id.clone(), annotation.order_key),
        );
        Ok(())
    }

    async fn update(&self, annotation: &Annotation) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        let (video_id, order_key) = state
            .index
            .get(&annotation.id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Annotation", annotation.id))?;

        let stored = state
            .videos
            .get_mut(&video_id)
            .and_then(|rows| rows.get_mut(&order_key))
            .ok_or_else(|| CoreError::Internal("annotation index out of sync".to_string()))?;

        stored.body = annotation.body.clone();
        stored.status = annotation.status;
        stored.revision = annotation.revision;
        stored.updated_at = annotation.updated_at;
        Ok(())
    }

    async fn find_by_id(&self, id: AnnotationId) -> Result<Option<Annotation>, CoreError> {
        let state = self.state.read().await;
        Ok(state.index.get(&id).and_then(|(video_id, order_key)| {
            state
                .videos
                .get(video_id)
                .and_then(|rows| rows.get(order_key))
                .cloned()
        }))
    }

    async fn max_order_key(&self, video_id: &str) -> Result<OrderKey, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .videos
            .get(video_id)
            .and_then(|rows| rows.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn list_since(
        &self,
        video_id: &str,
        after: OrderKey,
        limit: usize,
    ) -> Result<Vec<Annotation>, CoreError> {
        let state = self.state.read().await;
        let Some(rows) = state.videos.get(video_id) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range((after.saturating_add(1))..)
            .take(limit)
            .map(|(_, annotation)| annotation.clone())
            .collect())
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
