// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! WebSocket router, per-connection loop and meeting control endpoints.
use crate::error::AppError;
use crate::meeting::{generate_unique_code, Meeting};
use crate::membership::MeetingHandle;
use crate::relay::{relay_chat, relay_signal};
use crate::validation;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use huddle_common::{new_session_id, ClientMessage, ServerEvent, SessionId, SignalKind};
use metrics::{counter, gauge};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, warn};

/// Create the router: WebSocket endpoint plus the meeting control API
/// consumed by the UI layer.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/{meeting_code}", get(ws_handler))
        .route("/api/meetings", post(create_meeting))
        .route("/api/meetings/{meeting_code}", get(meeting_info))
        .route("/api/meetings/{meeting_code}/end", post(end_meeting))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CreateMeetingRequest {
    #[serde(rename = "createdBy")]
    pub created_by: String,
    pub title: Option<String>,
}

/// Create a meeting with a generated code.
async fn create_meeting(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateMeetingRequest>,
) -> Result<impl IntoResponse, AppError> {
    let created_by = validation::validate_display_name(&req.created_by)?;
    let code = generate_unique_code(
        state.meeting_store.as_ref(),
        state.settings.meeting_code_length,
    )
    .await?;

    let meeting = Meeting::new(code.clone(), created_by, req.title.clone());
    let created_at = meeting.created_at;
    state.meeting_store.insert(meeting).await?;

    counter!("meeting.created").increment(1);
    Ok(Json(serde_json::json!({
        "meetingCode": code,
        "createdBy": req.created_by,
        "title": req.title,
        "createdAt": created_at,
    })))
}

/// Joinability check for the lobby page.
async fn meeting_info(
    State(state): State<Arc<AppState>>,
    Path(meeting_code): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let code = validation::validate_meeting_code(&meeting_code)?;
    let meeting = state
        .meeting_store
        .get_by_code(&code)
        .await?
        .ok_or(AppError::MeetingNotFound)?;

    Ok(Json(serde_json::json!({
        "meetingCode": meeting.code,
        "createdBy": meeting.created_by,
        "title": meeting.title,
        "joinable": meeting.is_active(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct EndMeetingQuery {
    pub requester: String,
}

/// End a meeting (creator only). On success a `meeting-ended` control
/// event is broadcast to every subscriber.
async fn end_meeting(
    State(state): State<Arc<AppState>>,
    Path(meeting_code): Path<String>,
    Query(query): Query<EndMeetingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let code = validation::validate_meeting_code(&meeting_code)?;
    let requester = validation::validate_display_name(&query.requester)?;

    let handle = state.meetings.get_or_spawn(&code);
    let ended = handle.end(requester.clone()).await?;
    if !ended {
        return Err(AppError::Unauthorized(format!(
            "{requester} is not the creator of {code}"
        )));
    }

    state.meetings.remove(&code);
    Ok(Json(serde_json::json!({ "status": "ended" })))
}

/// Handler for WebSocket connections
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(meeting_code): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let code = validation::validate_meeting_code(&meeting_code)?;

    counter!("ws.connections").increment(1);
    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, code)))
}

async fn send_event(out_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> bool {
    out_tx.send(event).await.is_ok()
}

async fn send_app_error(out_tx: &mpsc::Sender<ServerEvent>, err: &AppError) -> bool {
    send_event(
        out_tx,
        ServerEvent::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
        },
    )
    .await
}

/// Forward broadcast events to one connection. Signaling frames
/// addressed to another session are dropped here (scoped delivery);
/// everything else is meeting-wide.
fn spawn_forwarder(
    mut events_rx: broadcast::Receiver<ServerEvent>,
    out_tx: mpsc::Sender<ServerEvent>,
    session_id: SessionId,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    if let Some(target) = event.target_session() {
                        if target != &session_id {
                            continue;
                        }
                    }
                    if out_tx.send(event).await.is_err() {
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session = %session_id, skipped, "subscriber lagged");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[allow(clippy::too_many_lines)]
async fn handle_connection(socket: WebSocket, state: Arc<AppState>, meeting_code: String) {
    let session_id = new_session_id();
    let (mut sink, mut stream) = socket.split();

    gauge!("ws.active").increment(1.0);

    // Outbound pump: serialize events onto the socket
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(64);
    let send_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    error!(%err, "failed to serialize event");
                    continue;
                },
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // First frame: tell the client its session id
    let _ = send_event(
        &out_tx,
        ServerEvent::Welcome {
            session_id: session_id.clone(),
        },
    )
    .await;

    let handle: MeetingHandle = state.meetings.get_or_spawn(&meeting_code);
    let mut joined = false;
    let mut forward_task: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let msg = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg) => msg,
            Err(err) => {
                // Malformed or unknown message type: reply on the error
                // channel and keep the connection open.
                debug!(session = %session_id, %err, "malformed client message");
                counter!("ws.malformed_messages").increment(1);
                send_app_error(&out_tx, &AppError::Validation(err.to_string())).await;
                continue;
            },
        };

        match msg {
            ClientMessage::Join { participant_name } => {
                let name = match validation::validate_display_name(&participant_name) {
                    Ok(name) => name,
                    Err(err) => {
                        send_app_error(&out_tx, &err.into()).await;
                        continue;
                    },
                };

                // Subscribe before joining so the own join event is seen
                let events_rx = handle.subscribe();
                match handle.join(session_id.clone(), name.clone()).await {
                    Ok(_roster) => {
                        if let Err(err) = state.registry.bind(&session_id, &meeting_code, &name)
                        {
                            send_app_error(&out_tx, &err).await;
                            continue;
                        }
                        joined = true;
                        if forward_task.is_none() {
                            forward_task = Some(spawn_forwarder(
                                events_rx,
                                out_tx.clone(),
                                session_id.clone(),
                            ));
                        }
                    },
                    Err(err) => {
                        send_app_error(&out_tx, &err).await;
                    },
                }
            },
            ClientMessage::Leave => {
                if joined {
                    if let Err(err) = handle.leave(session_id.clone()).await {
                        send_app_error(&out_tx, &err).await;
                    }
                    state.registry.unbind(&session_id);
                    joined = false;
                }
            },
            ClientMessage::Offer {
                target_session_id,
                payload,
            } => {
                if !joined {
                    send_app_error(
                        &out_tx,
                        &AppError::Validation("join before signaling".to_string()),
                    )
                    .await;
                    continue;
                }
                relay_signal(
                    &handle,
                    &session_id,
                    SignalKind::Offer,
                    target_session_id,
                    payload,
                );
            },
            ClientMessage::Answer {
                target_session_id,
                payload,
            } => {
                if !joined {
                    send_app_error(
                        &out_tx,
                        &AppError::Validation("join before signaling".to_string()),
                    )
                    .await;
                    continue;
                }
                relay_signal(
                    &handle,
                    &session_id,
                    SignalKind::Answer,
                    target_session_id,
                    payload,
                );
            },
            ClientMessage::IceCandidate {
                target_session_id,
                payload,
            } => {
                if !joined {
                    send_app_error(
                        &out_tx,
                        &AppError::Validation("join before signaling".to_string()),
                    )
                    .await;
                    continue;
                }
                relay_signal(
                    &handle,
                    &session_id,
                    SignalKind::IceCandidate,
                    target_session_id,
                    payload,
                );
            },
            ClientMessage::MediaState {
                is_muted,
                camera_enabled,
            } => {
                if let Err(err) = handle
                    .set_media_state(session_id.clone(), is_muted, camera_enabled)
                    .await
                {
                    send_app_error(&out_tx, &err).await;
                }
            },
            ClientMessage::Chat { message } => {
                let Some(entry) = state.registry.lookup(&session_id) else {
                    send_app_error(
                        &out_tx,
                        &AppError::Validation("join before chatting".to_string()),
                    )
                    .await;
                    continue;
                };
                if let Err(err) = relay_chat(
                    &handle,
                    &entry.display_name,
                    &message,
                    state.settings.max_chat_length,
                ) {
                    send_app_error(&out_tx, &err).await;
                }
            },
        }
    }

    // Cleanup: a dropped socket is an implicit leave
    if joined {
        if let Err(err) = handle.leave(session_id.clone()).await {
            warn!(session = %session_id, %err, "leave on disconnect failed");
        }
        state.registry.unbind(&session_id);
    }

    if let Some(task) = forward_task {
        task.abort();
    }
    send_task.abort();

    counter!("ws.disconnections").increment(1);
    gauge!("ws.active").decrement(1.0);
    debug!(session = %session_id, meeting = %meeting_code, "connection closed");
}
