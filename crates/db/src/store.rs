//! The annotation store: single writer path for timeline annotations.
//!
//! Every mutation for a video is funnelled through that video's writer task,
//! which owns the video's order counter. Different videos have independent
//! writers and proceed in parallel. The writer notifies the registered
//! [`ChangeListener`] after each commit, before taking the next command, so
//! listeners observe changes in order-key order per video.
//!
//! A writer that sees no command for [`WRITER_IDLE_TIMEOUT`] removes itself;
//! the next mutation for its video starts a fresh one, which reloads the
//! counter from the backend.
//!
//! Every backend call is bounded by the configured store timeout; a backend
//! that does not answer in time yields [`CoreError::StorageUnavailable`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::sync::{mpsc, oneshot};

use cuepoint_core::annotation::{
    normalize_body, validate_timestamp, Annotation, AnnotationStatus, NewAnnotation,
    INITIAL_REVISION,
};
use cuepoint_core::config::TimelineConfig;
use cuepoint_core::error::CoreError;
use cuepoint_core::timeline::{AnnotationChange, ChangeKind, ChangeListener};
use cuepoint_core::types::{AnnotationId, OrderKey, VideoId};

use crate::backend::AnnotationBackend;

/// Records fetched per backend round-trip by [`AnnotationStore::list_since`].
pub const LIST_PAGE_SIZE: usize = 200;

/// Pending commands a single video writer will queue before `append` waits.
const WRITER_QUEUE_CAPACITY: usize = 1024;

/// How long a video writer waits for a command before it stops.
pub const WRITER_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Live writers by video. A caller holds a clone of the `Arc` from lookup
/// until its command is queued, so a writer seeing the map's reference as
/// the only one knows no command is on its way.
type WriterMap = Arc<Mutex<HashMap<VideoId, Arc<mpsc::Sender<WriteCommand>>>>>;

/// Lazy, finite stream of annotations in ascending order-key order.
pub type AnnotationStream = BoxStream<'static, Result<Annotation, CoreError>>;

/// Front door to annotation persistence.
pub struct AnnotationStore {
    backend: Arc<dyn AnnotationBackend>,
    listener: Option<Arc<dyn ChangeListener>>,
    writers: WriterMap,
    timeout: Duration,
    max_body_chars: usize,
}

impl AnnotationStore {
    pub fn new(backend: Arc<dyn AnnotationBackend>, config: &TimelineConfig) -> Self {
        Self {
            backend,
            listener: None,
            writers: WriterMap::default(),
            timeout: config.store_timeout,
            max_body_chars: config.max_body_chars,
        }
    }

    /// Register the listener notified after every committed mutation.
    pub fn with_listener(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn max_body_chars(&self) -> usize {
        self.max_body_chars
    }

    /// Validate and persist a new annotation, assigning the video's next
    /// order key.
    ///
    /// Concurrent appends to the same video are ordered by arrival at the
    /// video's writer.
    pub async fn append(&self, new: NewAnnotation) -> Result<Annotation, CoreError> {
        if new.video_id.is_empty() {
            return Err(CoreError::Validation("video_id is required".to_string()));
        }
        if new.author_id.is_empty() {
            return Err(CoreError::Validation("author_id is required".to_string()));
        }
        validate_timestamp(new.timestamp_ms)?;
        let body = normalize_body(&new.body, self.max_body_chars)?;

        let video_id = new.video_id.clone();
        let new = NewAnnotation { body, ..new };
        self.dispatch(&video_id, |reply| WriteCommand::Append { new, reply })
            .await
    }

    /// Replace the body of an annotation. Only its author may edit it.
    pub async fn edit(
        &self,
        id: AnnotationId,
        editor: &str,
        body: &str,
    ) -> Result<Annotation, CoreError> {
        let body = normalize_body(body, self.max_body_chars)?;
        let current = self.require(id).await?;
        let editor = editor.to_string();
        self.dispatch(&current.video_id, |reply| WriteCommand::Edit {
            id,
            editor,
            body,
            reply,
        })
        .await
    }

    /// Tombstone an annotation. Only its author may delete it.
    ///
    /// Deleting an already-deleted annotation succeeds and returns the
    /// tombstone unchanged, without notifying the listener again.
    pub async fn delete(&self, id: AnnotationId, actor: &str) -> Result<Annotation, CoreError> {
        let current = self.require(id).await?;
        let actor = actor.to_string();
        self.dispatch(&current.video_id, |reply| WriteCommand::Delete { id, actor, reply })
            .await
    }

    pub async fn find_by_id(&self, id: AnnotationId) -> Result<Option<Annotation>, CoreError> {
        bounded(self.timeout, "find_by_id", self.backend.find_by_id(id)).await
    }

    /// Every annotation of the video with `order_key > after`, tombstones
    /// included, ascending.
    ///
    /// The stream pages through the backend lazily. Re-issuing the call with
    /// the same `after` yields the same sequence on an unchanged store.
    pub fn list_since(&self, video_id: &str, after: OrderKey) -> AnnotationStream {
        let cursor = PageCursor {
            backend: Arc::clone(&self.backend),
            timeout: self.timeout,
            video_id: video_id.to_string(),
            after: after.max(0),
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            if let Some(next) = cursor.buffer.pop_front() {
                return Some((Ok(next), cursor));
            }
            if cursor.exhausted {
                return None;
            }
            match cursor.fetch_page().await {
                Ok(()) => {
                    let next = cursor.buffer.pop_front()?;
                    Some((Ok(next), cursor))
                }
                Err(e) => {
                    cursor.exhausted = true;
                    Some((Err(e), cursor))
                }
            }
        })
        .boxed()
    }

    /// One bounded page of [`list_since`](Self::list_since).
    pub async fn list_since_page(
        &self,
        video_id: &str,
        after: OrderKey,
        limit: usize,
    ) -> Result<Vec<Annotation>, CoreError> {
        bounded(
            self.timeout,
            "list_since",
            self.backend.list_since(video_id, after.max(0), limit),
        )
        .await
    }

    /// All annotations of a video, tombstones included, in order-key order.
    pub async fn snapshot(&self, video_id: &str) -> Result<Vec<Annotation>, CoreError> {
        self.list_since(video_id, 0).try_collect().await
    }

    pub async fn health_check(&self) -> Result<(), CoreError> {
        bounded(self.timeout, "health_check", self.backend.health_check()).await
    }

    /// Number of videos with a running writer.
    pub fn active_writers(&self) -> usize {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn require(&self, id: AnnotationId) -> Result<Annotation, CoreError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Annotation", id))
    }

    /// Send a command to the video's writer and wait for its reply.
    async fn dispatch<F>(&self, video_id: &str, build: F) -> Result<Annotation, CoreError>
    where
        F: FnOnce(oneshot::Sender<Result<Annotation, CoreError>>) -> WriteCommand,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut command = build(reply_tx);

        // A writer only refuses a command if its task panicked; retry once on
        // a fresh one.
        for _ in 0..2 {
            let sender = self.writer_for(video_id);
            let sent = sender.send(command).await;
            match sent {
                Ok(()) => {
                    drop(sender);
                    return reply_rx.await.unwrap_or_else(|_| {
                        Err(CoreError::Internal(format!(
                            "writer for video {video_id} stopped before replying"
                        )))
                    });
                }
                Err(mpsc::error::SendError(returned)) => {
                    tracing::warn!(video_id = %video_id, "Annotation writer gone, restarting");
                    let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
                    if writers
                        .get(video_id)
                        .is_some_and(|current| current.same_channel(&sender))
                    {
                        writers.remove(video_id);
                    }
                    command = returned;
                }
            }
        }

        Err(CoreError::Internal(format!(
            "writer for video {video_id} is unavailable"
        )))
    }

    fn writer_for(&self, video_id: &str) -> Arc<mpsc::Sender<WriteCommand>> {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = writers.get(video_id) {
            if !sender.is_closed() {
                return Arc::clone(sender);
            }
        }

        let (tx, rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
        let writer = VideoWriter {
            video_id: video_id.to_string(),
            backend: Arc::clone(&self.backend),
            listener: self.listener.clone(),
            writers: Arc::clone(&self.writers),
            timeout: self.timeout,
            next_key: None,
        };
        tokio::spawn(writer.run(rx));
        tracing::debug!(video_id = %video_id, "Started annotation writer");

        let tx = Arc::new(tx);
        writers.insert(video_id.to_string(), Arc::clone(&tx));
        tx
    }
}

// ---------------------------------------------------------------------------
// Per-video writer
// ---------------------------------------------------------------------------

type Reply = oneshot::Sender<Result<Annotation, CoreError>>;

enum WriteCommand {
    Append {
        new: NewAnnotation,
        reply: Reply,
    },
    Edit {
        id: AnnotationId,
        editor: String,
        body: String,
        reply: Reply,
    },
    Delete {
        id: AnnotationId,
        actor: String,
        reply: Reply,
    },
}

/// What an idle writer found when it tried to stop.
enum Idle {
    Stopped,
    /// A caller is between lookup and send.
    Busy,
    Pending(WriteCommand),
}

/// Owns one video's order counter. Runs until it has been idle for
/// [`WRITER_IDLE_TIMEOUT`].
struct VideoWriter {
    video_id: VideoId,
    backend: Arc<dyn AnnotationBackend>,
    listener: Option<Arc<dyn ChangeListener>>,
    writers: WriterMap,
    timeout: Duration,
    /// Next key to assign; `None` until loaded from the backend, and reset
    /// after any failed insert so the counter never runs ahead of storage.
    next_key: Option<OrderKey>,
}

impl VideoWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<WriteCommand>) {
        loop {
            let command = match tokio::time::timeout(WRITER_IDLE_TIMEOUT, rx.recv()).await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(_) => match self.stop_if_idle(&mut rx) {
                    Idle::Stopped => break,
                    Idle::Busy => continue,
                    Idle::Pending(command) => command,
                },
            };
            self.handle(command).await;
        }
        tracing::debug!(video_id = %self.video_id, "Annotation writer stopped");
    }

    fn stop_if_idle(&self, rx: &mut mpsc::Receiver<WriteCommand>) -> Idle {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(command) = rx.try_recv() {
            return Idle::Pending(command);
        }
        // The entry is ours: it is only replaced once this receiver is gone.
        match writers.get(&self.video_id) {
            Some(sender) if Arc::strong_count(sender) > 1 => Idle::Busy,
            _ => {
                writers.remove(&self.video_id);
                Idle::Stopped
            }
        }
    }

    async fn handle(&mut self, command: WriteCommand) {
        match command {
            WriteCommand::Append { new, reply } => {
                let result = self.append(new).await;
                let _ = reply.send(result);
            }
            WriteCommand::Edit {
                id,
                editor,
                body,
                reply,
            } => {
                let result = self.edit(id, &editor, body).await;
                let _ = reply.send(result);
            }
            WriteCommand::Delete { id, actor, reply } => {
                let result = self.delete(id, &actor).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn append(&mut self, new: NewAnnotation) -> Result<Annotation, CoreError> {
        if let Some(parent_id) = new.parent_id {
            let parent = self.load(parent_id).await?.ok_or_else(|| {
                CoreError::Validation(format!("parent annotation {parent_id} does not exist"))
            })?;
            if parent.video_id != self.video_id {
                return Err(CoreError::Validation(format!(
                    "parent annotation {parent_id} belongs to a different video"
                )));
            }
            if parent.is_deleted() {
                return Err(CoreError::Validation(format!(
                    "parent annotation {parent_id} has been deleted"
                )));
            }
        }

        let order_key = match self.next_key {
            Some(key) => key,
            None => {
                let max = bounded(
                    self.timeout,
                    "max_order_key",
                    self.backend.max_order_key(&self.video_id),
                )
                .await?;
                max + 1
            }
        };

        let now = Utc::now();
        let annotation = Annotation {
            id: uuid::Uuid::now_v7(),
            video_id: self.video_id.clone(),
            order_key,
            author_id: new.author_id,
            timestamp_ms: new.timestamp_ms,
            body: new.body,
            parent_id: new.parent_id,
            status: AnnotationStatus::Active,
            revision: INITIAL_REVISION,
            position_unverified: new.position_unverified,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = bounded(self.timeout, "insert", self.backend.insert(&annotation)).await {
            self.next_key = None;
            return Err(e);
        }
        self.next_key = Some(order_key + 1);

        tracing::debug!(
            video_id = %self.video_id,
            order_key,
            annotation_id = %annotation.id,
            "Annotation appended"
        );
        self.notify(ChangeKind::Created, &annotation);
        Ok(annotation)
    }

    async fn edit(
        &mut self,
        id: AnnotationId,
        editor: &str,
        body: String,
    ) -> Result<Annotation, CoreError> {
        let mut annotation = self.require(id).await?;
        if annotation.author_id != editor {
            return Err(CoreError::Forbidden(
                "Only the author can edit this annotation".to_string(),
            ));
        }
        if annotation.is_deleted() {
            return Err(CoreError::Validation(
                "Cannot edit a deleted annotation".to_string(),
            ));
        }

        annotation.body = body;
        annotation.status = AnnotationStatus::Edited;
        annotation.revision += 1;
        annotation.updated_at = Utc::now();
        bounded(self.timeout, "update", self.backend.update(&annotation)).await?;

        tracing::debug!(
            video_id = %self.video_id,
            order_key = annotation.order_key,
            revision = annotation.revision,
            "Annotation edited"
        );
        self.notify(ChangeKind::Edited, &annotation);
        Ok(annotation)
    }

    async fn delete(&mut self, id: AnnotationId, actor: &str) -> Result<Annotation, CoreError> {
        let mut annotation = self.require(id).await?;
        if annotation.author_id != actor {
            return Err(CoreError::Forbidden(
                "Only the author can delete this annotation".to_string(),
            ));
        }
        if annotation.is_deleted() {
            return Ok(annotation);
        }

        annotation.status = AnnotationStatus::Deleted;
        annotation.revision += 1;
        annotation.updated_at = Utc::now();
        bounded(self.timeout, "update", self.backend.update(&annotation)).await?;

        tracing::debug!(
            video_id = %self.video_id,
            order_key = annotation.order_key,
            "Annotation deleted"
        );
        self.notify(ChangeKind::Deleted, &annotation);
        Ok(annotation)
    }

    async fn load(&self, id: AnnotationId) -> Result<Option<Annotation>, CoreError> {
        bounded(self.timeout, "find_by_id", self.backend.find_by_id(id)).await
    }

    async fn require(&self, id: AnnotationId) -> Result<Annotation, CoreError> {
        self.load(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Annotation", id))
    }

    fn notify(&self, kind: ChangeKind, annotation: &Annotation) {
        if let Some(listener) = &self.listener {
            listener.annotation_changed(AnnotationChange {
                kind,
                annotation: annotation.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

struct PageCursor {
    backend: Arc<dyn AnnotationBackend>,
    timeout: Duration,
    video_id: VideoId,
    after: OrderKey,
    buffer: VecDeque<Annotation>,
    exhausted: bool,
}

impl PageCursor {
    async fn fetch_page(&mut self) -> Result<(), CoreError> {
        let page = bounded(
            self.timeout,
            "list_since",
            self.backend
                .list_since(&self.video_id, self.after, LIST_PAGE_SIZE),
        )
        .await?;

        if page.len() < LIST_PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = last.order_key;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

/// Run a backend call under the store timeout.
async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, CoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = limit.as_millis() as u64,
                "Storage backend call timed out"
            );
            Err(CoreError::StorageUnavailable(format!(
                "{operation} did not complete within {}ms",
                limit.as_millis()
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
