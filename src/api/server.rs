use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use opencv::core::Vector;
use opencv::imgcodecs;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::services::ServeDir;

use crate::alert::{AlertBus, IncidentRecord};
use crate::pipeline::{Pipeline, PipelineStatus, StartError};
use crate::storage::{window_start, IncidentStore};

const DEFAULT_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub store: IncidentStore,
    pub bus: AlertBus,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, store: IncidentStore, bus: AlertBus) -> Self {
        Self { pipeline, store, bus }
    }
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

/// `days=N` keeps incidents from the last N days; absent or 0 keeps all.
#[derive(Deserialize)]
struct WindowQuery {
    days: Option<u32>,
}

impl WindowQuery {
    fn since(&self) -> Option<String> {
        window_start(self.days.unwrap_or(0), chrono::Local::now())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct StopResponse {
    was_running: bool,
    status: PipelineStatus,
}

pub fn router(state: AppState, incidents_dir: PathBuf) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/start", post(start_handler))
        .route("/api/stop", post(stop_handler))
        .route("/api/incidents", get(incidents_handler))
        .route("/api/incidents/{label}", get(label_incidents_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/stats/{name}", get(person_stats_handler))
        .route("/api/ws", get(ws_handler))
        .route("/api/cameras/{id}/latest.jpg", get(latest_frame_handler))
        .nest_service("/incidents", ServeDir::new(incidents_dir))
        .with_state(state)
}

pub async fn start_server(state: AppState, incidents_dir: PathBuf, port: u16) -> Result<(), std::io::Error> {
    let app = router(state, incidents_dir);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

fn error(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.status())
}

async fn start_handler(State(state): State<AppState>) -> Response {
    let pipeline = Arc::clone(&state.pipeline);
    let result = tokio::task::spawn_blocking(move || pipeline.start()).await;

    match result {
        Ok(Ok(())) => Json(state.pipeline.status()).into_response(),
        Ok(Err(e @ StartError::AlreadyRunning)) => error(StatusCode::CONFLICT, e),
        Ok(Err(e @ StartError::EmptyRegistry)) => error(StatusCode::UNPROCESSABLE_ENTITY, e),
        Ok(Err(e @ (StartError::EngineUnavailable | StartError::EngineRebuild(_)))) => {
            error(StatusCode::SERVICE_UNAVAILABLE, e)
        }
        Ok(Err(e)) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn stop_handler(State(state): State<AppState>) -> Response {
    let pipeline = Arc::clone(&state.pipeline);
    match tokio::task::spawn_blocking(move || pipeline.stop()).await {
        Ok(was_running) => Json(StopResponse {
            was_running,
            status: state.pipeline.status(),
        })
        .into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn incidents_handler(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.store.recent(query.limit.unwrap_or(DEFAULT_LIMIT)))
}

async fn label_incidents_handler(
    State(state): State<AppState>,
    Path(label): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.store.for_label(&label, query.limit.unwrap_or(DEFAULT_LIMIT)))
}

async fn stats_handler(State(state): State<AppState>, Query(window): Query<WindowQuery>) -> impl IntoResponse {
    Json(state.store.stats(window.since().as_deref()))
}

async fn person_stats_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(window): Query<WindowQuery>,
) -> impl IntoResponse {
    Json(state.store.person_history(&name, window.since().as_deref()))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    // subscribe before the upgrade completes so nothing fired after the
    // handshake is missed
    let rx = state.bus.subscribe();
    ws.on_upgrade(move |socket| forward_alerts(socket, rx))
}

/// Push every incident to one websocket client until either side goes away.
async fn forward_alerts(mut socket: WebSocket, mut rx: broadcast::Receiver<IncidentRecord>) {
    tracing::debug!("alert subscriber connected");
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            alert = rx.recv() => match alert {
                Ok(record) => {
                    let text = match serde_json::to_string(&record) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to serialise incident");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "alert subscriber fell behind, dropping alerts");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("alert subscriber disconnected");
}

async fn latest_frame_handler(State(state): State<AppState>, Path(id): Path<usize>) -> Response {
    let frame = match state.pipeline.state().latest.get(id) {
        Some(f) => f,
        None => return (StatusCode::NOT_FOUND, "no frame for camera").into_response(),
    };

    let mut buf = Vector::<u8>::new();
    match imgcodecs::imencode(".jpg", &frame, &mut buf, &Vector::<i32>::new()) {
        Ok(true) => ([(header::CONTENT_TYPE, "image/jpeg")], buf.to_vec()).into_response(),
        Ok(false) => (StatusCode::INTERNAL_SERVER_ERROR, "encode failed").into_response(),
        Err(e) => {
            tracing::warn!(camera = id, error = %e, "failed to encode latest frame");
            (StatusCode::INTERNAL_SERVER_ERROR, "encode failed").into_response()
        }
    }
}
