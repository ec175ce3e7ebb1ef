//! Admission gateway: the inbound HTTP surface for webhooks, the REST
//! command set, broker OAuth callbacks, and health/metrics (C6).
//!
//! The admission pipeline runs in declared order for every request:
//! IP extraction, ban check, API-key validation (route handlers),
//! traffic recording with the final status. Strike accounting and
//! escalation live in `admission`.

pub mod admission;
pub mod rest;
pub mod webhook;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::config::AdmissionConfig;
use crate::db::{self, WebhookServerConfig};
use crate::error::{CoreError, CoreResult};
use crate::events::Event;
use crate::services::Services;

#[derive(Clone)]
pub struct GatewayState {
    pub services: Arc<Services>,
    pub admission: AdmissionConfig,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(services: Arc<Services>, admission: AdmissionConfig) -> Self {
        Self {
            services,
            admission,
            started_at: Instant::now(),
        }
    }
}

/// Build the full admission router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/webhook/{webhook_id}", post(webhook::handle))
        .route("/strategy/webhook/{webhook_id}", post(webhook::handle))
        .route("/api/v1/{*op}", post(rest::dispatch))
        .route("/{broker_id}/callback", get(oauth_callback))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admission::pipeline,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown signal arrives; in-flight requests drain.
pub async fn serve(
    state: GatewayState,
    cfg: &WebhookServerConfig,
    mut shutdown: mpsc::Receiver<()>,
) -> CoreResult<()> {
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .map_err(|e| CoreError::internal(format!("invalid webhook bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CoreError::internal(format!("bind {addr}: {e}")))?;
    tracing::info!(%addr, "admission gateway listening");
    crate::metrics::UP.set(1.0);

    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
        tracing::info!("admission gateway draining");
    })
    .await
    .map_err(|e| CoreError::internal(format!("gateway server: {e}")))?;
    Ok(())
}

/// Uniform `{"status": "success", ...}` envelope.
pub fn success(mut data: Value) -> Json<Value> {
    if let Value::Object(ref mut map) = data {
        map.insert("status".into(), Value::String("success".into()));
        return Json(data);
    }
    Json(json!({ "status": "success", "data": data }))
}

/// Uniform error envelope with the structured code the UI maps to toasts.
pub fn error_response(err: &CoreError) -> Response {
    let status = match err {
        CoreError::PayloadInvalid(_) => StatusCode::BAD_REQUEST,
        CoreError::NotAuthenticated => StatusCode::FORBIDDEN,
        CoreError::Banned { .. } => StatusCode::FORBIDDEN,
        CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        CoreError::NoActiveBroker | CoreError::AlreadyInitialized => StatusCode::BAD_REQUEST,
        CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CoreError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        CoreError::SchemaOutOfDate | CoreError::VaultUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut body = json!({
        "status": "error",
        "code": err.code(),
        "message": err.to_string(),
    });
    if let CoreError::RateLimited { retry_after_secs } = err {
        body["retry_after"] = json!(retry_after_secs);
    }
    (status, Json(body)).into_response()
}

async fn health() -> &'static str {
    "OK"
}

/// Liveness plus a few queue counts, the operator's quick glance.
async fn status(State(state): State<GatewayState>) -> Response {
    let pool = state.services.pool();
    let strategies = db::list_strategies(pool).await.map(|s| s.len()).unwrap_or(0);
    let analyzer = state.services.analyzer_on().await.unwrap_or(false);
    let schema = db::schema_version(pool).await.unwrap_or(0);
    success(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "strategies": strategies,
        "analyzer_mode": analyzer,
        "schema_version": schema,
    }))
    .into_response()
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

#[derive(Deserialize)]
struct OauthParams {
    code: String,
    #[serde(default)]
    state: Option<String>,
}

/// Broker OAuth redirect target: `GET /{broker_id}/callback?code=...`.
/// Accepted for every configured broker; the UI completes login with the
/// received code through the normal `broker_login` command.
async fn oauth_callback(
    State(state): State<GatewayState>,
    Path(broker_id): Path<String>,
    Query(params): Query<OauthParams>,
) -> Response {
    tracing::info!(broker_id = %broker_id, "oauth callback received");
    state.services.events().publish(Event::OauthCallback {
        broker_id,
        code: params.code,
        state: params.state,
    });
    (
        StatusCode::OK,
        "Authentication received. You can return to the app.",
    )
        .into_response()
}
