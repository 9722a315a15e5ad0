// ============================================================================
// HTTP & WEBSOCKET SERVER
// ============================================================================
// HTTP and WebSocket surface over the ingestion pipeline.
//
// | Method | Path                    | Body / params            |
// |--------|-------------------------|--------------------------|
// | GET    | `/`                     |                          |
// | GET    | `/metrics/health`       |                          |
// | POST   | `/metrics/ingest`       | `MetricPoint`            |
// | POST   | `/metrics/ingest/batch` | `[MetricPoint]`          |
// | POST   | `/metrics/query`        | `MetricQuery`            |
// | GET    | `/metrics/services`     |                          |
// | GET    | `/metrics/alerts`       | `?limit=N`               |
// | GET    | `/metrics/prometheus`   |                          |
// | GET    | `/ws/metrics`           | WebSocket upgrade        |
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::error::{PulseError, PulseResult, TransportError, TransportResult, ValidationError};
use crate::hub::EventSink;
use crate::pipeline::IngestPipeline;
use crate::types::{MetricPoint, MetricQuery, StreamEvent, Timestamp};

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Error returned by a handler, rendered as `{"detail": ...}`
#[derive(Debug)]
pub enum ApiError {
    Unprocessable(String),
    Internal(String),
}

impl From<PulseError> for ApiError {
    fn from(e: PulseError) -> Self {
        match e {
            PulseError::Validation(v) => ApiError::Unprocessable(v.to_string()),
            other => {
                error!(target: "pulse::server", category = other.category(), error = %other, "Request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        PulseError::from(ValidationError::malformed(rejection.body_text())).into()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        PulseError::from(ValidationError::malformed(rejection.body_text())).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Unprocessable(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            ApiError::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<IngestPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self { pipeline }
    }
}

/// Build the application router
pub fn router(pipeline: Arc<IngestPipeline>, cors_permissive: bool) -> Router {
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/metrics/health", get(health_handler))
        .route("/metrics/ingest", post(ingest_handler))
        .route("/metrics/ingest/batch", post(ingest_batch_handler))
        .route("/metrics/query", post(query_handler))
        .route("/metrics/services", get(services_handler))
        .route("/metrics/alerts", get(alerts_handler))
        .route("/metrics/prometheus", get(prometheus_handler))
        .route("/ws/metrics", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(pipeline));

    if cors_permissive {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Serve until `token` is cancelled. Open streams are closed through the hub.
pub async fn serve(
    listener: TcpListener,
    pipeline: Arc<IngestPipeline>,
    cors_permissive: bool,
    token: CancellationToken,
) -> PulseResult<()> {
    let hub = Arc::clone(pipeline.hub());
    let app = router(pipeline, cors_permissive);

    info!(target: "pulse::server", addr = ?listener.local_addr().ok(), "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            hub.shutdown();
        })
        .await?;

    info!(target: "pulse::server", "HTTP server stopped");
    Ok(())
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

async fn index_handler() -> impl IntoResponse {
    Json(json!({
        "message": "Telemetry Dashboard API",
        "status": "running",
        "version": crate::ENGINE_VERSION,
    }))
}

async fn health_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let services = state.pipeline.list_services().await?;
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": Timestamp::now(),
        "services_count": services.len(),
        "subscribers": state.pipeline.hub().subscriber_count(),
    })))
}

async fn ingest_handler(
    State(state): State<AppState>,
    payload: Result<Json<MetricPoint>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(point) = payload.inspect_err(|_| state.pipeline.metrics().points_rejected.inc())?;
    let outcome = state.pipeline.ingest(point).await?;

    let mut body = json!({ "status": "success" });
    if let Some(alert) = outcome.alert {
        body["alert"] = json!(alert);
    }
    Ok(Json(body))
}

async fn ingest_batch_handler(
    State(state): State<AppState>,
    payload: Result<Json<Vec<MetricPoint>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(points) = payload?;
    let ingested = points.len();
    let alerts = state.pipeline.ingest_batch(points).await?;
    Ok(Json(json!({
        "status": "success",
        "ingested": ingested,
        "alerts": alerts,
    })))
}

async fn query_handler(
    State(state): State<AppState>,
    payload: Result<Json<MetricQuery>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(query) = payload?;
    let data = state.pipeline.query(&query).await?;
    Ok(Json(json!({ "data": data })))
}

async fn services_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let services = state.pipeline.services().await?;
    Ok(Json(json!({ "services": services })))
}

#[derive(Debug, Deserialize)]
struct AlertParams {
    limit: Option<usize>,
}

async fn alerts_handler(
    State(state): State<AppState>,
    params: Result<Query<AlertParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = params?;
    let alerts = state.pipeline.recent_alerts(params.limit);
    Ok(Json(json!({ "alerts": alerts })))
}

async fn prometheus_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let text = state
        .pipeline
        .metrics()
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], text))
}

// ----------------------------------------------------------------------------
// Streaming
// ----------------------------------------------------------------------------

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_metrics(socket, state.pipeline))
}

/// Writes JSON-encoded events to the sending half of a socket
struct WsSink {
    subscriber: String,
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl EventSink for WsSink {
    async fn send(&mut self, event: &StreamEvent) -> TransportResult<()> {
        let text = serde_json::to_string(event).map_err(|e| TransportError::Protocol {
            message: e.to_string(),
        })?;
        self.sender
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed {
                subscriber: self.subscriber.clone(),
                message: e.to_string(),
            })
    }
}

async fn stream_metrics(socket: WebSocket, pipeline: Arc<IngestPipeline>) {
    let mut subscription = match pipeline.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(target: "pulse::server", error = %e, "Could not open subscription");
            return;
        }
    };
    let id = subscription.id();
    let (sender, mut receiver) = socket.split();
    let mut sink = WsSink {
        subscriber: id.to_string(),
        sender,
    };
    debug!(target: "pulse::server", subscriber = %id, "Stream client connected");

    // Inbound frames are ignored; the read side only detects close.
    let client_gone = async {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        result = subscription.pump(&mut sink) => {
            if let Err(e) = result {
                debug!(target: "pulse::server", subscriber = %id, reason = %e, "Stream ended");
            }
        }
        _ = client_gone => {
            debug!(target: "pulse::server", subscriber = %id, "Stream client closed");
        }
    }

    subscription.unsubscribe();
    let _ = sink.sender.close().await;
}
