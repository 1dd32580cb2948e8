//! toolhive HTTP 入口
//!
//! 启动: cargo run --bin toolhive-web --features web
//! - POST /api/chat            一轮对话，返回 TurnResponse
//! - POST /api/chat/stream     一轮对话，NDJSON 逐行推送 TurnEvent
//! - GET  /api/health          最近一次健康快照
//! - GET  /api/history/:id     对话历史
//! - POST /api/session/clear   清空对话

#![cfg(feature = "web")]

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use toolhive::config::{load_config, AppConfig};
use toolhive::core::{
    AgentError, AgentRuntime, HealthSnapshot, RuntimeBuilder, ShutdownManager, TurnRequest,
    TurnResponse,
};
use toolhive::memory::Message;

struct AppState {
    runtime: AgentRuntime,
}

type ApiError = (StatusCode, String);

fn api_error(err: AgentError) -> ApiError {
    let status = match err {
        AgentError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        AgentError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolhive::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let bind = cfg.web.bind.clone();
    let port = cfg.web.port;

    let runtime = RuntimeBuilder::new(cfg).build();
    runtime.start_background();

    let manager = Arc::new(ShutdownManager::new());
    let coordinator = runtime.shutdown_coordinator(Arc::clone(&manager));
    let state = Arc::new(AppState { runtime });

    let app = Router::new()
        .route("/api/chat", post(api_chat))
        .route("/api/chat/stream", post(api_chat_stream))
        .route("/api/health", get(api_health))
        .route("/api/history/:id", get(api_history))
        .route("/api/session/clear", post(api_session_clear))
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("toolhive web: http://{}", addr);

    manager.install_signal_handlers();
    let signal = Arc::clone(&manager);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait().await })
        .await?;

    coordinator.run().await;
    Ok(())
}

fn with_web_source(mut req: TurnRequest) -> TurnRequest {
    if req.source.is_none() {
        req.source = Some("web".to_string());
    }
    req
}

async fn api_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    let response = state
        .runtime
        .orchestrator
        .handle_turn(with_web_source(req))
        .await
        .map_err(api_error)?;
    Ok(Json(response))
}

/// 第一行是 conversation_id，之后每行一个 TurnEvent；本轮结束后流关闭
async fn api_chat_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TurnRequest>,
) -> Result<Response, ApiError> {
    if req.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message is required".to_string()));
    }
    let mut req = with_web_source(req);
    let conversation_id = req
        .conversation_id
        .take()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.conversation_id = Some(conversation_id.clone());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::clone(&state.runtime.orchestrator);
    tokio::spawn(async move {
        if let Err(e) = orchestrator.handle_turn_stream(req, event_tx).await {
            tracing::warn!("stream turn rejected: {}", e);
        }
    });

    let first_line = format!(
        "{}\n",
        serde_json::json!({
            "type": "conversation_id",
            "conversation_id": conversation_id
        })
    );
    let stream = stream::try_unfold(
        (event_rx, Some(first_line)),
        |(mut event_rx, first_line)| async move {
            if let Some(line) = first_line {
                return Ok::<_, Infallible>(Some((Bytes::from(line), (event_rx, None))));
            }
            match event_rx.recv().await {
                Some(ev) => {
                    let line = serde_json::to_string(&ev).unwrap_or_else(|e| {
                        serde_json::json!({"type": "encode_error", "message": e.to_string()})
                            .to_string()
                    });
                    Ok(Some((Bytes::from(line + "\n"), (event_rx, None))))
                }
                None => Ok(None),
            }
        },
    );

    let mut res = Response::new(Body::from_stream(stream));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson; charset=utf-8"),
    );
    Ok(res)
}

async fn api_health(State(state): State<Arc<AppState>>) -> Json<HealthSnapshot> {
    let snapshot = state.runtime.orchestrator.health();
    Json(HealthSnapshot::clone(&snapshot))
}

async fn api_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    state
        .runtime
        .orchestrator
        .history(&id)
        .await
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("conversation '{}' not found", id)))
}

#[derive(Debug, Deserialize)]
struct ClearSessionRequest {
    conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClearSessionResponse {
    cleared: bool,
}

async fn api_session_clear(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClearSessionRequest>,
) -> Json<ClearSessionResponse> {
    let cleared = match req.conversation_id.filter(|s| !s.is_empty()) {
        Some(id) => state.runtime.orchestrator.clear(&id).await,
        None => false,
    };
    Json(ClearSessionResponse { cleared })
}
