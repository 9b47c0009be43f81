use crate::error::{AppError, ErrorDetail, ExamError};
use crate::events::{self, EventEnvelope};
use crate::models::{ExamMode, TestSummary};
use crate::session::{ExamSession, SessionConfig, SessionSnapshot};
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use validator::Validate;

const USER_HEADER: &str = "x-user-id";
const ADMIN_HEADER: &str = "x-admin-token";

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn user_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn validation_error(errors: validator::ValidationErrors, req_id: &str) -> AppError {
    let details = errors
        .field_errors()
        .iter()
        .flat_map(|(field, list)| {
            list.iter().map(move |e| ErrorDetail {
                field: field.to_string(),
                issue: e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string()),
            })
        })
        .collect();
    AppError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "invalid request", req_id)
        .with_details(details)
}

fn owned_session(
    state: &AppState,
    headers: &HeaderMap,
    handle: &str,
    req_id: &str,
) -> Result<Arc<ExamSession>, AppError> {
    let user_id = user_id_from_headers(headers)
        .ok_or_else(|| AppError::from_exam(&ExamError::Unauthorized, req_id))?;
    state
        .registry
        .get_owned(handle, &user_id)
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "session not found", req_id))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionPayload {
    #[validate(length(min = 1, max = 128, message = "testId must be 1..128 characters"))]
    pub test_id: String,
    pub mode: ExamMode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub handle_id: String,
    pub snapshot: SessionSnapshot,
}

pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionPayload>,
) -> Result<(StatusCode, Json<CreatedSession>), AppError> {
    let req_id = request_id_from_headers(&headers);
    payload.validate().map_err(|e| validation_error(e, &req_id))?;

    let session = ExamSession::with_store(
        SessionConfig {
            mode: payload.mode,
            test_id: payload.test_id,
            user_id: user_id_from_headers(&headers).unwrap_or_default(),
        },
        state.store.clone(),
        state.settings.engine.clone(),
    );
    session.initialize().await;
    if let Some(err) = session.error() {
        session.unmount();
        return Err(AppError::from_exam(&err, req_id));
    }

    let handle_id = state.registry.insert(session.clone());
    info!(
        handle_id = %handle_id,
        session_id = ?session.session_id(),
        "exam session registered"
    );
    Ok((
        StatusCode::CREATED,
        Json(CreatedSession {
            handle_id,
            snapshot: session.snapshot(),
        }),
    ))
}

pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(handle): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let session = owned_session(&state, &headers, &handle, &req_id)?;
    Ok(Json(session.snapshot()))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    #[validate(length(min = 1, message = "optionId must not be empty"))]
    pub option_id: String,
}

pub async fn select_answer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(handle): Path<String>,
    Json(payload): Json<AnswerPayload>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let req_id = request_id_from_headers(&headers);
    payload.validate().map_err(|e| validation_error(e, &req_id))?;
    let session = owned_session(&state, &headers, &handle, &req_id)?;
    session.select_answer(&payload.option_id);
    Ok(Json(session.snapshot()))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigateAction {
    Next,
    Previous,
    Goto,
}

#[derive(Debug, Deserialize)]
pub struct NavigatePayload {
    pub action: NavigateAction,
    pub index: Option<i64>,
}

pub async fn navigate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(handle): Path<String>,
    Json(payload): Json<NavigatePayload>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let session = owned_session(&state, &headers, &handle, &req_id)?;
    match (payload.action, payload.index) {
        (NavigateAction::Next, _) => session.go_to_next(),
        (NavigateAction::Previous, _) => session.go_to_previous(),
        (NavigateAction::Goto, Some(index)) => session.go_to_question(index),
        (NavigateAction::Goto, None) => {
            return Err(AppError::new(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "goto requires an index",
                req_id,
            ));
        }
    }
    Ok(Json(session.snapshot()))
}

pub async fn toggle_mark(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(handle): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let session = owned_session(&state, &headers, &handle, &req_id)?;
    session.toggle_mark_for_review();
    Ok(Json(session.snapshot()))
}

pub async fn submit_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(handle): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let session = owned_session(&state, &headers, &handle, &req_id)?;
    session.submit_exam().await;
    Ok(Json(session.snapshot()))
}

pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(handle): Path<String>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    owned_session(&state, &headers, &handle, &req_id)?;
    state.registry.remove(&handle);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_tests(State(state): State<AppState>) -> Json<Vec<TestSummary>> {
    Json(state.db.published_tests().await)
}

fn ensure_admin(headers: &HeaderMap, state: &AppState) -> Result<(), AppError> {
    let presented = headers.get(ADMIN_HEADER).and_then(|h| h.to_str().ok());
    match (state.settings.admin_token.as_deref(), presented) {
        (Some(expected), Some(given)) if expected == given => Ok(()),
        _ => Err(AppError::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "admin token invalid",
            request_id_from_headers(headers),
        )),
    }
}

async fn change_publication(
    state: &AppState,
    headers: &HeaderMap,
    test_id: &str,
    published: bool,
) -> Result<Json<serde_json::Value>, AppError> {
    ensure_admin(headers, state)?;
    if !state.set_published(test_id, published).await {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "test not found",
            request_id_from_headers(headers),
        ));
    }
    Ok(Json(serde_json::json!({ "published": published })))
}

pub async fn publish_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    change_publication(&state, &headers, &id, true).await
}

pub async fn unpublish_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    change_publication(&state, &headers, &id, false).await
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(handle): Path<String>,
) -> Result<Response, AppError> {
    let req_id = request_id_from_headers(&headers);
    let session = state
        .registry
        .get(&handle)
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "session not found", req_id))?;
    Ok(ws.on_upgrade(move |socket| ws_session(socket, session, handle)))
}

async fn ws_session(stream: WebSocket, session: Arc<ExamSession>, handle: String) {
    let mut receiver = session.subscribe();
    let hello = serde_json::to_value(session.snapshot())
        .map(|payload| EventEnvelope::now(events::EVENT_SNAPSHOT, session.session_id(), payload));
    let (mut sender_ws, mut receiver_ws) = stream.split();

    let lagging = handle.clone();
    let send_task = tokio::spawn(async move {
        if let Ok(text) = hello.and_then(|env| serde_json::to_string(&env)) {
            if sender_ws.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        loop {
            match receiver.recv().await {
                Ok(msg) => {
                    let Ok(text) = serde_json::to_string(&msg) else { continue; };
                    if sender_ws.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(handle = %lagging, skipped, "ws subscriber lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    while let Some(Ok(message)) = receiver_ws.next().await {
        if let Message::Close(_) = message {
            break;
        }
    }

    send_task.abort();
    info!("ws disconnected for session {}", handle);
}
