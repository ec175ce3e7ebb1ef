//! Admission pipeline: ban enforcement, API-key validation, strike
//! accounting, and traffic recording.
//!
//! The ban check strictly precedes any business work; a banned IP receives
//! 403 without reaching a handler. Every request leaves exactly one
//! TrafficRecord carrying its final status.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use super::GatewayState;
use crate::db;
use crate::error::{BanKind, CoreError};
use crate::metrics;

/// Strike reasons, also used as metric labels.
pub const REASON_INVALID_KEY: &str = "invalid api key";
pub const REASON_SUSPICIOUS_404: &str = "unknown webhook id";
pub const REASON_MALFORMED: &str = "malformed payload";

/// Every nth traffic insert triggers a retention prune.
const PRUNE_EVERY: u64 = 512;
static TRAFFIC_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Client IP for this request. Falls back to "unknown" when the listener
/// did not attach connection info (should not happen in production).
pub fn client_ip(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn route_class(path: &str) -> &'static str {
    if path.starts_with("/api/v1/") {
        "api"
    } else if path.starts_with("/webhook/") || path.starts_with("/strategy/webhook/") {
        "webhook"
    } else if path.ends_with("/callback") {
        "oauth"
    } else {
        "system"
    }
}

/// The middleware wrapping every route: ban check in, traffic record out.
pub async fn pipeline(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let ip = client_ip(&req);
    let path = req.uri().path().to_string();
    let method = req.method().to_string();

    let response = match active_ban(&state, &ip).await {
        Some(kind) => {
            tracing::warn!(%ip, %path, kind = %kind, "banned ip rejected");
            super::error_response(&CoreError::Banned { kind })
        }
        None => next.run(req).await,
    };

    let status = response.status().as_u16() as i64;
    let latency_ms = started.elapsed().as_millis() as i64;
    if let Err(e) =
        db::insert_traffic_log(state.services.pool(), &ip, &path, &method, status, latency_ms)
            .await
    {
        tracing::warn!(error = %e, "failed to record traffic");
    }
    metrics::record_request(
        route_class(&path),
        status as u16,
        started.elapsed().as_secs_f64(),
    );

    if TRAFFIC_COUNTER.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == 0 {
        let cutoff = Utc::now() - chrono::Duration::days(state.admission.log_retention_days);
        if let Err(e) = db::prune_admission_logs(state.services.pool(), cutoff).await {
            tracing::warn!(error = %e, "failed to prune admission logs");
        }
    }

    response
}

/// Active ban for `ip`, if any. Expired temporary bans do not block (the
/// strike count persists on the row).
async fn active_ban(state: &GatewayState, ip: &str) -> Option<BanKind> {
    match db::get_ban(state.services.pool(), ip).await {
        Ok(Some(ban)) if ban.is_active(Utc::now()) => BanKind::parse(&ban.kind),
        Ok(_) => None,
        Err(e) => {
            tracing::error!(error = %e, "ban lookup failed; request refused");
            // Fail closed: an unreadable ban table must not admit traffic.
            Some(BanKind::Temporary)
        }
    }
}

/// Record one strike and escalate at the threshold. Webhook flooding
/// additionally earns a temporary cool-off ban; invalid-key offences must
/// keep reaching the validator so the count can hit the permanent
/// threshold.
pub async fn record_strike(state: &GatewayState, ip: &str, reason: &'static str) {
    metrics::record_strike(reason);
    let temp_ban = reason == REASON_SUSPICIOUS_404;
    match db::record_strike(
        state.services.pool(),
        ip,
        reason,
        Utc::now(),
        temp_ban,
        &state.admission,
    )
    .await
    {
        Ok(outcome) => {
            tracing::warn!(%ip, reason, strikes = outcome.strike_count, "admission strike");
            if outcome.escalated {
                metrics::record_escalation(reason);
                tracing::warn!(%ip, "ip escalated to permanent ban");
            }
        }
        Err(e) => tracing::error!(%ip, error = %e, "failed to record strike"),
    }
}

/// Validate the body `apikey` field. A missing or wrong key is a strike;
/// the error response is produced by the caller.
pub async fn require_api_key(
    state: &GatewayState,
    ip: &str,
    apikey: Option<&str>,
) -> Result<(), Response> {
    let Some(key) = apikey else {
        record_strike(state, ip, REASON_INVALID_KEY).await;
        return Err(super::error_response(&CoreError::PayloadInvalid(
            "missing apikey".into(),
        )));
    };
    match state.services.identity().verify_api_key(key).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            record_strike(state, ip, REASON_INVALID_KEY).await;
            Err(super::error_response(&CoreError::NotAuthenticated))
        }
        Err(e) => Err(super::error_response(&e)),
    }
}

/// 404 shaped like the uniform envelope.
pub fn not_found(message: &str) -> Response {
    (
        axum::http::StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({
            "status": "error",
            "code": "NOT_FOUND",
            "message": message,
        })),
    )
        .into_response()
}
