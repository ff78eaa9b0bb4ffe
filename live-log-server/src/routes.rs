use crate::registry::{KillError, ProcessView, Registry};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::pin::Pin;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/processes", get(list_processes).post(create_process))
        .route("/processes/{id}", get(get_process).delete(delete_process))
        .route("/processes/{id}/live_log", get(live_log));

    Router::new()
        .route("/api/health", get(health))
        .nest("/api/v1", api)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("no process {id}")})),
    )
}

async fn list_processes(State(state): State<AppState>) -> Json<Vec<ProcessView>> {
    Json(state.registry.list().await)
}

#[derive(Deserialize)]
struct CreateProcessRequest {
    cmd: String,
}

async fn create_process(
    State(state): State<AppState>,
    Json(req): Json<CreateProcessRequest>,
) -> Result<(StatusCode, Json<ProcessView>), ApiError> {
    match state.registry.spawn(&req.cmd).await {
        Ok(view) => Ok((StatusCode::CREATED, Json(view))),
        Err(e) => {
            tracing::warn!(cmd = %req.cmd, error = %e, "create process failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            ))
        }
    }
}

async fn get_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProcessView>, ApiError> {
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

/// Stream the process output as plain text: everything logged so far, then
/// new lines as they appear. The body ends when the process does.
async fn live_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let sub = state
        .registry
        .subscribe(&id)
        .await
        .ok_or_else(|| not_found(&id))?;

    let live: Pin<Box<dyn Stream<Item = String> + Send>> = match sub.live {
        Some(rx) => Box::pin(live_lines(id.clone(), rx)),
        None => Box::pin(tokio_stream::empty()),
    };

    let lines = tokio_stream::iter(sub.backlog)
        .chain(live)
        .map(|line| Ok::<_, Infallible>(format!("{line}\n")));

    tracing::debug!(uuid = %id, "live log subscriber attached");
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(lines),
    )
        .into_response())
}

/// Lines broadcast after subscription. Lines dropped because this
/// subscriber fell behind are skipped; the stream ends with the sender.
fn live_lines(
    uuid: String,
    rx: broadcast::Receiver<String>,
) -> impl Stream<Item = String> + Send {
    BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(line) => Some(line),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(uuid = %uuid, skipped, "live log subscriber lagged");
            None
        }
    })
}

async fn delete_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .kill(&id)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|e| kill_error(&id, e))
}

fn kill_error(id: &str, e: KillError) -> ApiError {
    match e {
        KillError::NotFound => not_found(id),
        KillError::Kill { .. } => {
            tracing::warn!(uuid = id, error = %e, "delete process failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}
