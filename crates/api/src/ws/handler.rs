use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use cuepoint_core::error::CoreError;
use cuepoint_core::identity::Identity;
use cuepoint_core::session::LeaveReason;
use cuepoint_core::types::{OrderKey, SessionId, VideoId};
use cuepoint_events::{Connection, Delivery, FeedbackService, SessionOutbox};

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::ws::protocol::{close_code, ClientFrame, ServerFrame};

/// Replies queued ahead of the sender task.
const REPLY_BUFFER: usize = 64;

/// How long teardown waits for the sender to flush its final frames.
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct LiveParams {
    /// Identity token. Browsers cannot set headers on a WebSocket handshake,
    /// so the query parameter takes precedence over `Authorization`.
    pub token: Option<String>,
    /// Highest order key the client already holds.
    pub resume_order: Option<OrderKey>,
}

/// GET /api/v1/videos/{video_id}/live
///
/// Verify the token and the video, then upgrade. Failures are plain HTTP
/// errors so clients see them before the socket opens.
pub async fn live_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(video_id): Path<VideoId>,
    Query(params): Query<LiveParams>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let token = params
        .token
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| AppError::Core(CoreError::Unauthorized("Missing identity token".into())))?;

    let identity = state.service.authenticate(&token)?;
    state.service.describe_video(&video_id)?;

    let resume_order = params.resume_order.unwrap_or(0);
    if resume_order < 0 {
        return Err(AppError::BadRequest(format!(
            "resume_order must be >= 0, got {resume_order}"
        )));
    }

    let service = Arc::clone(&state.service);
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, service, video_id, identity, resume_order))
        .into_response())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Run one session after the upgrade.
///
///   1. Open the session (starts catch-up into its outbox).
///   2. Spawn the sender task: it drains the outbox and request replies into
///      the socket, and closes the socket once the outbox closes.
///   3. Process inbound frames on the current task.
///   4. Disconnect the session and let the sender flush.
async fn handle_socket(
    socket: WebSocket,
    service: Arc<FeedbackService>,
    video_id: VideoId,
    identity: Identity,
    resume_order: OrderKey,
) {
    let (mut sink, mut stream) = socket.split();

    let Connection { session, outbox } =
        match service.connect_as(&video_id, identity, Some(resume_order)).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(video_id = %video_id, error = %e, "Session open failed");
                let _ = send_frame(&mut sink, &ServerFrame::error(None, &e)).await;
                let _ = sink.send(close_message(LeaveReason::CatchUpFailed)).await;
                return;
            }
        };
    let session_id = session.session_id;

    let opened = ServerFrame::SessionOpened {
        session_id,
        video_id: session.video_id.clone(),
        resume_order,
        heartbeat_timeout_secs: service.config().heartbeat_timeout.as_secs(),
    };
    if send_frame(&mut sink, &opened).await.is_err() {
        let _ = service.disconnect(session_id).await;
        return;
    }

    let (reply_tx, reply_rx) = mpsc::channel::<ServerFrame>(REPLY_BUFFER);
    let mut send_task = tokio::spawn(run_sender(sink, Arc::clone(&outbox), reply_rx, session_id));
    let mut sender_done = false;

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = &mut send_task, if !sender_done => {
                sender_done = true;
                break;
            }
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = reply_tx.send(ServerFrame::malformed(e)).await;
                        continue;
                    }
                };
                if matches!(frame, ClientFrame::Disconnect) {
                    break;
                }
                if let Some(reply) = dispatch(&service, session_id, frame).await {
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Binary(_))) => {
                let _ = reply_tx
                    .send(ServerFrame::malformed("binary frames are not supported"))
                    .await;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(session_id = %session_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    if let Err(e) = service.disconnect(session_id).await {
        tracing::warn!(session_id = %session_id, error = %e, "Disconnect failed");
        outbox.close(LeaveReason::Left);
    }
    drop(reply_tx);

    if !sender_done && tokio::time::timeout(SENDER_DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
    tracing::info!(session_id = %session_id, video_id = %video_id, "WebSocket session finished");
}

/// Execute one client request and build its reply, if any.
async fn dispatch(
    service: &FeedbackService,
    session_id: SessionId,
    frame: ClientFrame,
) -> Option<ServerFrame> {
    let request_id = frame.request_id().map(str::to_string);
    let result = match frame {
        ClientFrame::Submit {
            timestamp_ms,
            body,
            parent_id,
            ..
        } => service
            .submit_annotation(session_id, timestamp_ms, &body, parent_id)
            .await
            .map(Some),
        ClientFrame::Edit {
            annotation_id,
            body,
            ..
        } => service
            .edit_annotation(session_id, annotation_id, &body)
            .await
            .map(Some),
        ClientFrame::Delete { annotation_id, .. } => service
            .delete_annotation(session_id, annotation_id)
            .await
            .map(Some),
        ClientFrame::Heartbeat { cursor_ms, .. } => {
            match service.heartbeat(session_id, cursor_ms).await {
                // Heartbeats are only answered when the client asks to correlate.
                Ok(_) if request_id.is_none() => return None,
                other => other.map(|_| None),
            }
        }
        ClientFrame::Ack { order_key, .. } => match service.acknowledge(session_id, order_key).await {
            Ok(_) if request_id.is_none() => return None,
            other => other.map(|_| None),
        },
        ClientFrame::Disconnect => return None,
    };

    Some(match result {
        Ok(annotation) => ServerFrame::Ack {
            request_id,
            annotation,
        },
        Err(e) => {
            tracing::debug!(session_id = %session_id, code = e.code(), error = %e, "Request rejected");
            ServerFrame::error(request_id, &e)
        }
    })
}

/// Drain the session outbox and request replies into the socket.
async fn run_sender(
    mut sink: SplitSink<WebSocket, Message>,
    outbox: Arc<SessionOutbox>,
    mut replies: mpsc::Receiver<ServerFrame>,
    session_id: SessionId,
) {
    loop {
        let sent = tokio::select! {
            delivery = outbox.recv() => match delivery {
                Some(Delivery::Event(event)) => send_frame(&mut sink, &event).await,
                Some(Delivery::CatchUpComplete { through_order }) => {
                    send_frame(&mut sink, &ServerFrame::CatchUpComplete { through_order }).await
                }
                None => break,
            },
            Some(reply) = replies.recv() => send_frame(&mut sink, &reply).await,
        };
        if sent.is_err() {
            tracing::debug!(session_id = %session_id, "WebSocket sink closed");
            outbox.close(LeaveReason::Left);
            return;
        }
    }

    // Flush replies already queued, e.g. the error for a rejected request.
    while let Ok(reply) = replies.try_recv() {
        if send_frame(&mut sink, &reply).await.is_err() {
            return;
        }
    }

    let reason = outbox.closed_reason().unwrap_or(LeaveReason::Left);
    if reason != LeaveReason::Left {
        tracing::info!(session_id = %session_id, reason = reason.as_str(), "Closing session socket");
    }
    let _ = send_frame(&mut sink, &ServerFrame::closed(reason)).await;
    let _ = sink.send(close_message(reason)).await;
}

async fn send_frame<T: Serialize>(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &T,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize frame");
            Ok(())
        }
    }
}

fn close_message(reason: LeaveReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code(reason),
        reason: reason.as_str().into(),
    }))
}
