//! Transport-agnostic entry points for collaborators.
//!
//! [`FeedbackService`] wires the annotation store, hub and session registry
//! together and exposes the session-scoped operations a transport needs:
//! connect, submit/edit/delete, heartbeat, acknowledge, disconnect, plus the
//! read-only presence, listing and export queries.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cuepoint_core::annotation::{Annotation, NewAnnotation};
use cuepoint_core::config::TimelineConfig;
use cuepoint_core::error::CoreError;
use cuepoint_core::export::{build_report, ExportReport, ReportOptions};
use cuepoint_core::identity::{Identity, IdentityVerifier};
use cuepoint_core::session::{LeaveReason, Session};
use cuepoint_core::types::{AnnotationId, OrderKey, SessionId};
use cuepoint_core::video::{VideoDescriptor, VideoDirectory};
use cuepoint_db::{AnnotationBackend, AnnotationStore};

use crate::hub::SyncHub;
use crate::outbox::SessionOutbox;
use crate::reconcile::spawn_catch_up;
use crate::registry::SessionRegistry;

/// A freshly opened session and the queue its worker must drain.
#[derive(Debug)]
pub struct Connection {
    pub session: Session,
    pub outbox: Arc<SessionOutbox>,
}

pub struct FeedbackService {
    store: Arc<AnnotationStore>,
    hub: Arc<SyncHub>,
    registry: SessionRegistry,
    identity: Arc<dyn IdentityVerifier>,
    videos: Arc<dyn VideoDirectory>,
    config: TimelineConfig,
}

impl FeedbackService {
    /// Build the engine on top of a storage backend. Spawns the registry task,
    /// so this must run inside a Tokio runtime.
    pub fn new(
        backend: Arc<dyn AnnotationBackend>,
        identity: Arc<dyn IdentityVerifier>,
        videos: Arc<dyn VideoDirectory>,
        config: TimelineConfig,
    ) -> Self {
        let hub = Arc::new(SyncHub::new());
        let store = Arc::new(AnnotationStore::new(backend, &config).with_listener(hub.clone()));
        let registry = SessionRegistry::spawn(Arc::clone(&hub), &config);
        Self {
            store,
            hub,
            registry,
            identity,
            videos,
            config,
        }
    }

    pub fn store(&self) -> &Arc<AnnotationStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.hub
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    /// Verify an identity token with the external provider.
    pub fn authenticate(&self, token: &str) -> Result<Identity, CoreError> {
        self.identity.verify(token)
    }

    pub fn describe_video(&self, video_id: &str) -> Result<VideoDescriptor, CoreError> {
        self.videos
            .describe(video_id)
            .ok_or_else(|| CoreError::not_found("Video", video_id))
    }

    /// Open a session: verify the token, register the session and start
    /// catch-up from `resume_order` (0 when the client has nothing).
    pub async fn connect(
        &self,
        video_id: &str,
        token: &str,
        resume_order: Option<OrderKey>,
    ) -> Result<Connection, CoreError> {
        let identity = self.authenticate(token)?;
        self.connect_as(video_id, identity, resume_order).await
    }

    /// [`connect`](Self::connect) for an identity the transport already
    /// verified.
    pub async fn connect_as(
        &self,
        video_id: &str,
        identity: Identity,
        resume_order: Option<OrderKey>,
    ) -> Result<Connection, CoreError> {
        self.describe_video(video_id)?;
        let resume_order = resume_order.unwrap_or(0);
        if resume_order < 0 {
            return Err(CoreError::Validation(format!(
                "resume_order must be >= 0, got {resume_order}"
            )));
        }

        let (session, outbox) = self.registry.join(video_id, identity, resume_order).await?;
        spawn_catch_up(
            Arc::clone(&self.store),
            Arc::clone(&self.hub),
            Arc::clone(&outbox),
            session.video_id.clone(),
            resume_order,
        );
        Ok(Connection { session, outbox })
    }

    pub async fn submit_annotation(
        &self,
        session_id: SessionId,
        timestamp_ms: i64,
        body: &str,
        parent_id: Option<AnnotationId>,
    ) -> Result<Annotation, CoreError> {
        let session = self.registry.get(session_id).await?;
        let video = self.describe_video(&session.video_id)?;
        let position_unverified = video.check_position(timestamp_ms)?;

        self.store
            .append(NewAnnotation {
                video_id: session.video_id,
                author_id: session.identity,
                timestamp_ms,
                body: body.to_string(),
                parent_id,
                position_unverified,
            })
            .await
    }

    pub async fn edit_annotation(
        &self,
        session_id: SessionId,
        annotation_id: AnnotationId,
        body: &str,
    ) -> Result<Annotation, CoreError> {
        let session = self.registry.get(session_id).await?;
        self.require_in_video(annotation_id, &session.video_id).await?;
        self.store.edit(annotation_id, &session.identity, body).await
    }

    pub async fn delete_annotation(
        &self,
        session_id: SessionId,
        annotation_id: AnnotationId,
    ) -> Result<Annotation, CoreError> {
        let session = self.registry.get(session_id).await?;
        self.require_in_video(annotation_id, &session.video_id).await?;
        self.store.delete(annotation_id, &session.identity).await
    }

    pub async fn heartbeat(&self, session_id: SessionId, cursor_ms: i64) -> Result<Session, CoreError> {
        if cursor_ms < 0 {
            return Err(CoreError::Validation(format!(
                "cursor_ms must be >= 0, got {cursor_ms}"
            )));
        }
        self.registry.heartbeat(session_id, cursor_ms).await
    }

    pub async fn acknowledge(
        &self,
        session_id: SessionId,
        order_key: OrderKey,
    ) -> Result<Session, CoreError> {
        self.registry.acknowledge(session_id, order_key).await
    }

    /// End a session. Disconnecting an unknown session is not an error.
    pub async fn disconnect(&self, session_id: SessionId) -> Result<(), CoreError> {
        self.registry.leave(session_id).await?;
        Ok(())
    }

    pub async fn active_sessions(&self, video_id: &str) -> Result<Vec<Session>, CoreError> {
        self.describe_video(video_id)?;
        self.registry.active_sessions(video_id).await
    }

    /// One page of annotations after `after`, for request/response readers.
    pub async fn list_since(
        &self,
        video_id: &str,
        after: OrderKey,
        limit: usize,
    ) -> Result<Vec<Annotation>, CoreError> {
        self.describe_video(video_id)?;
        self.store.list_since_page(video_id, after, limit).await
    }

    /// Structured review report from a point-in-time snapshot.
    pub async fn export_report(&self, video_id: &str) -> Result<ExportReport, CoreError> {
        let video = self.describe_video(video_id)?;
        let snapshot = self.store.snapshot(video_id).await?;
        let options = ReportOptions {
            bucket_ms: self.config.report_bucket_ms,
            frame_rate: video.frame_rate,
        };
        Ok(build_report(video_id, &snapshot, &options, Utc::now()))
    }

    /// Start the heartbeat reaper.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(crate::reaper::run(
            self.registry.clone(),
            self.config.reap_interval,
            cancel,
        ))
    }

    /// Close every session so clients reconnect elsewhere.
    pub async fn shutdown(&self) {
        match self.registry.shutdown().await {
            Ok(count) => tracing::info!(sessions = count, "Feedback service shut down"),
            Err(e) => tracing::warn!(error = %e, "Session registry already stopped"),
        }
        self.hub.close_all(LeaveReason::Shutdown);
    }

    async fn require_in_video(
        &self,
        annotation_id: AnnotationId,
        video_id: &str,
    ) -> Result<Annotation, CoreError> {
        match self.store.find_by_id(annotation_id).await? {
            Some(annotation) if annotation.video_id == video_id => Ok(annotation),
            _ => Err(CoreError::not_found("Annotation", annotation_id)),
        }
    }
}
