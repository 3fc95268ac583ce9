//! HTTP and WebSocket query surface.
//!
//! Thin read-only collaborators over storage and the live broadcast
//! channel: REST endpoints under `/v1`, a websocket log stream, and the
//! Prometheus render endpoint.

use crate::metrics::WS_DROPPED_FRAMES_TOTAL;
use crate::stats::IndexerStats;
use crate::storage::{LogRecord, Storage};
use alloy_primitives::B256;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use eyre::{Result, WrapErr};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

const DEFAULT_QUERY_LIMIT: usize = 100;
const LAGGING_THRESHOLD: u64 = 128;
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct ApiState {
    pub storage: Arc<Storage>,
    pub stats: Arc<IndexerStats>,
    pub live: broadcast::Sender<LogRecord>,
    pub prometheus: PrometheusHandle,
}

/// Full REST + WS router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/health", get(handle_health))
        .route("/v1/status", get(handle_status))
        .route("/v1/logs", get(handle_logs))
        .route("/v1/logs/{index}", get(handle_log_by_index))
        .route("/v1/ws", get(handle_ws))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Metrics-only router for the dedicated metrics listener.
pub fn metrics_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Serve a router until the stop signal fires.
pub async fn serve(addr: SocketAddr, app: Router, mut stop_rx: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*stop_rx.borrow() {
                if stop_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .wrap_err("http server failed")
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(err: eyre::Report) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("query failed: {err}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": self.status.as_u16(),
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthStatus {
    status: &'static str,
    timestamp: i64,
    last_block_indexed: u64,
    total_indexed: u64,
    head_lag: u64,
}

async fn handle_health(State(state): State<Arc<ApiState>>) -> Json<HealthStatus> {
    let snapshot = state.stats.snapshot();
    Json(HealthStatus {
        status: health_status(snapshot.head_lag),
        timestamp: unix_seconds(),
        last_block_indexed: snapshot.last_block_number,
        total_indexed: snapshot.total_indexed,
        head_lag: snapshot.head_lag,
    })
}

async fn handle_status(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.stats.snapshot()).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    start_index: Option<u64>,
    end_index: Option<u64>,
    block_number: Option<u64>,
    tx_hash: Option<String>,
    limit: Option<usize>,
}

async fn handle_logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);

    let logs = if let Some(block_number) = query.block_number {
        state
            .storage
            .logs_by_block(block_number)
            .map_err(ApiError::internal)?
    } else if let Some(tx_hash) = &query.tx_hash {
        let tx_hash: B256 = tx_hash
            .parse()
            .map_err(|_| ApiError::bad_request("invalid txHash"))?;
        state
            .storage
            .logs_by_tx(tx_hash)
            .map_err(ApiError::internal)?
    } else {
        let start = match (query.start_index, query.end_index) {
            // No explicit bounds: serve the newest records.
            (None, None) => {
                let total = state.storage.total_count().map_err(ApiError::internal)?;
                latest_start(total, limit)
            }
            (start, _) => start.unwrap_or(0),
        };
        state
            .storage
            .range_logs(start, query.end_index, limit)
            .map_err(ApiError::internal)?
    };

    Ok(Json(logs))
}

async fn handle_log_by_index(
    State(state): State<Arc<ApiState>>,
    Path(index): Path<u64>,
) -> Result<Json<LogRecord>, ApiError> {
    state
        .storage
        .get_log(index)
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("log {index} not found")))
}

async fn handle_ws(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut live_rx = state.live.subscribe();

    let welcome = json!({"type": "welcome", "message": "connected to live log stream"});
    if send_json(&mut sender, &welcome).await.is_err() {
        return;
    }

    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            result = live_rx.recv() => match result {
                Ok(log) => {
                    let frame = json!({"type": "log", "data": log});
                    if send_json(&mut sender, &frame).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Slow consumer: drop and keep going, never block ingest.
                    counter!(WS_DROPPED_FRAMES_TOTAL).increment(missed);
                    debug!(missed, "websocket subscriber lagged, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = ping.tick() => {
                if send_json(&mut sender, &json!({"type": "ping"})).await.is_err() {
                    return;
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return,
                }
            }
        }
    }
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    value: &serde_json::Value,
) -> Result<(), ()> {
    sender
        .send(Message::Text(value.to_string().into()))
        .await
        .map_err(|_| ())
}

async fn handle_metrics(State(state): State<Arc<ApiState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

fn health_status(head_lag: u64) -> &'static str {
    if head_lag > LAGGING_THRESHOLD {
        "lagging"
    } else {
        "healthy"
    }
}

/// First index of the newest `limit` records.
fn latest_start(total: u64, limit: usize) -> u64 {
    if limit == 0 {
        return total;
    }
    total.saturating_sub(limit as u64)
}

fn unix_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
