//! Dynamic webhook ingress: `POST /webhook/{webhook_id}`.
//!
//! The path parameter resolves to exactly one strategy; an unknown id is a
//! suspicious 404 and strikes the caller. The unguessable webhook id is the
//! admission credential for this surface; an `apikey` field, when the
//! payload carries one, is additionally validated. TradingView and
//! Chartink-style JSON bodies are accepted.

use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::admission::{self, REASON_MALFORMED, REASON_SUSPICIOUS_404};
use super::GatewayState;
use crate::autologout::REGULATORY_TZ;
use crate::db;
use crate::error::CoreError;
use crate::events::Event;
use crate::types::{OrderIntent, OrderSide, PriceType, ProductType};

const MAX_BODY_BYTES: usize = 64 * 1024;

/// TradingView / Chartink alert payload.
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    apikey: Option<String>,
    /// BUY or SELL.
    action: String,
    #[serde(default)]
    quantity: Option<i64>,
    /// Target absolute position for smart orders.
    #[serde(default)]
    position_size: Option<i64>,
    /// Per-leg override for mapped strategies.
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
}

struct Leg {
    symbol: String,
    exchange: String,
    quantity: i64,
    product: ProductType,
}

pub async fn handle(
    State(state): State<GatewayState>,
    Path(webhook_id): Path<String>,
    req: Request,
) -> Response {
    let ip = admission::client_ip(&req);

    let bytes = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            admission::record_strike(&state, &ip, REASON_MALFORMED).await;
            return super::error_response(&CoreError::PayloadInvalid("body too large".into()));
        }
    };
    let payload: WebhookPayload = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(e) => {
            admission::record_strike(&state, &ip, REASON_MALFORMED).await;
            return super::error_response(&CoreError::PayloadInvalid(format!(
                "malformed webhook body: {e}"
            )));
        }
    };

    let strategy = match db::get_strategy_by_webhook(state.services.pool(), &webhook_id).await {
        Ok(Some(strategy)) => strategy,
        Ok(None) => {
            admission::record_strike(&state, &ip, REASON_SUSPICIOUS_404).await;
            return admission::not_found("unknown webhook id");
        }
        Err(e) => return super::error_response(&e),
    };

    if let Some(apikey) = payload.apikey.as_deref() {
        if let Err(response) = admission::require_api_key(&state, &ip, Some(apikey)).await {
            return response;
        }
    }

    if !strategy.enabled {
        return (
            axum::http::StatusCode::FORBIDDEN,
            axum::Json(json!({
                "status": "error",
                "code": "STRATEGY_DISABLED",
                "message": format!("strategy '{}' is disabled", strategy.name),
            })),
        )
            .into_response();
    }

    let local_time = Utc::now().with_timezone(&REGULATORY_TZ).time();
    if !strategy.in_trading_window(local_time) {
        return (
            axum::http::StatusCode::FORBIDDEN,
            axum::Json(json!({
                "status": "error",
                "code": "OUTSIDE_TRADING_WINDOW",
                "message": format!("strategy '{}' is outside its trading window", strategy.name),
            })),
        )
            .into_response();
    }

    let side = match OrderSide::parse(&payload.action) {
        Ok(side) => side,
        Err(e) => {
            admission::record_strike(&state, &ip, REASON_MALFORMED).await;
            return super::error_response(&e);
        }
    };

    let legs = match build_legs(&state, &strategy, &payload).await {
        Ok(legs) => legs,
        Err(e) => return super::error_response(&e),
    };

    let mut orders = Vec::with_capacity(legs.len());
    for leg in &legs {
        let result = match payload.position_size {
            Some(target) => {
                let target = match side {
                    OrderSide::Buy => target,
                    OrderSide::Sell => -target,
                };
                state
                    .services
                    .place_smart_order(
                        &leg.symbol,
                        &leg.exchange,
                        leg.product,
                        target,
                        Some(strategy.id),
                    )
                    .await
                    .map(|order| order.map(|o| o.order_id))
            }
            None => {
                let intent = OrderIntent {
                    symbol: leg.symbol.clone(),
                    exchange: leg.exchange.clone(),
                    side,
                    quantity: payload.quantity.unwrap_or(leg.quantity),
                    product: leg.product,
                    price_type: PriceType::Market,
                    price: 0.0,
                    trigger_price: 0.0,
                    strategy: Some(strategy.name.clone()),
                };
                state
                    .services
                    .place_order_for(&intent, Some(strategy.id))
                    .await
                    .map(|o| Some(o.order_id))
            }
        };
        match result {
            Ok(order_id) => orders.push(json!({
                "symbol": leg.symbol,
                "order_id": order_id,
            })),
            Err(e) => return super::error_response(&e),
        }
    }

    state.services.events().publish(Event::WebhookAlert {
        strategy: strategy.name.clone(),
        message: format!("{} signal on {} leg(s)", side, legs.len()),
    });

    super::success(json!({ "orders": orders })).into_response()
}

/// Resolve the legs a signal fans out to: the strategy's symbol mappings
/// when it has any (optionally narrowed by a payload override), otherwise
/// the strategy's own default symbol.
async fn build_legs(
    state: &GatewayState,
    strategy: &db::Strategy,
    payload: &WebhookPayload,
) -> Result<Vec<Leg>, CoreError> {
    let mappings = db::list_symbol_mappings(state.services.pool(), strategy.id).await?;
    if mappings.is_empty() {
        return Ok(vec![Leg {
            symbol: payload
                .symbol
                .clone()
                .unwrap_or_else(|| strategy.symbol.clone()),
            exchange: payload
                .exchange
                .clone()
                .unwrap_or_else(|| strategy.exchange.clone()),
            quantity: strategy.quantity,
            product: ProductType::parse(&strategy.product)?,
        }]);
    }

    let selected: Vec<&db::SymbolMapping> = match &payload.symbol {
        Some(symbol) => mappings
            .iter()
            .filter(|m| m.symbol.eq_ignore_ascii_case(symbol))
            .collect(),
        None => mappings.iter().collect(),
    };
    if selected.is_empty() {
        return Err(CoreError::PayloadInvalid(format!(
            "symbol '{}' is not mapped to strategy '{}'",
            payload.symbol.as_deref().unwrap_or(""),
            strategy.name
        )));
    }
    selected
        .into_iter()
        .map(|m| {
            Ok(Leg {
                symbol: m.symbol.clone(),
                exchange: m.exchange.clone(),
                quantity: m.quantity,
                product: ProductType::parse(&m.product)?,
            })
        })
        .collect()
}
