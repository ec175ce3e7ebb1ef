//! REST command set: `POST /api/v1/{op}` with an `apikey`-first JSON body.
//!
//! One dispatcher owns body parsing, API-key validation, and strike
//! accounting; the match below maps each operation onto the services
//! facade. Responses use the uniform success/error envelope.

use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use super::admission::{self, REASON_MALFORMED};
use super::GatewayState;
use crate::brokers::OrderModify;
use crate::error::{CoreError, CoreResult};
use crate::services::options::{GreeksRequest, OptionKind, OptionOrderRequest};
use crate::types::{OrderIntent, OrderSide, PriceType, ProductType};

const MAX_BODY_BYTES: usize = 256 * 1024;

pub async fn dispatch(
    State(state): State<GatewayState>,
    Path(op): Path<String>,
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
    let body: Value = match serde_json::from_slice(&bytes) {
        Ok(body) => body,
        Err(e) => {
            admission::record_strike(&state, &ip, REASON_MALFORMED).await;
            return super::error_response(&CoreError::PayloadInvalid(format!(
                "malformed request body: {e}"
            )));
        }
    };

    let apikey = body.get("apikey").and_then(Value::as_str).map(String::from);
    if let Err(response) = admission::require_api_key(&state, &ip, apikey.as_deref()).await {
        return response;
    }

    match route(&state, op.trim_matches('/'), body).await {
        Ok(data) => super::success(data).into_response(),
        Err(e) => {
            if matches!(e, CoreError::PayloadInvalid(_)) {
                admission::record_strike(&state, &ip, REASON_MALFORMED).await;
            }
            super::error_response(&e)
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: Value) -> CoreResult<T> {
    serde_json::from_value(body).map_err(|e| CoreError::PayloadInvalid(e.to_string()))
}

#[derive(Deserialize)]
struct PlaceOrderRequest {
    symbol: String,
    exchange: String,
    action: String,
    quantity: i64,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    pricetype: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    trigger_price: Option<f64>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    splitsize: Option<i64>,
}

impl PlaceOrderRequest {
    fn into_intent(self) -> CoreResult<OrderIntent> {
        Ok(OrderIntent {
            side: OrderSide::parse(&self.action)?,
            product: match self.product.as_deref() {
                Some(p) => ProductType::parse(p)?,
                None => ProductType::Mis,
            },
            price_type: match self.pricetype.as_deref() {
                Some(p) => PriceType::parse(p)?,
                None => PriceType::Market,
            },
            symbol: self.symbol,
            exchange: self.exchange,
            quantity: self.quantity,
            price: self.price.unwrap_or(0.0),
            trigger_price: self.trigger_price.unwrap_or(0.0),
            strategy: self.strategy,
        })
    }
}

#[derive(Deserialize)]
struct SmartOrderRequest {
    symbol: String,
    exchange: String,
    #[serde(default)]
    product: Option<String>,
    position_size: i64,
}

#[derive(Deserialize)]
struct ModifyOrderRequest {
    orderid: String,
    #[serde(flatten)]
    modify: OrderModify,
}

#[derive(Deserialize)]
struct OrderIdRequest {
    orderid: String,
}

#[derive(Deserialize)]
struct SymbolRequest {
    symbol: String,
    exchange: String,
}

#[derive(Deserialize)]
struct PositionRequest {
    symbol: String,
    exchange: String,
    #[serde(default)]
    product: Option<String>,
}

#[derive(Deserialize)]
struct ClosePositionRequest {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    product: Option<String>,
}

#[derive(Deserialize)]
struct QuotesRequest {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    symbols: Vec<SymbolRequest>,
}

#[derive(Deserialize)]
struct HistoryRequest {
    symbol: String,
    exchange: String,
    interval: String,
    /// Epoch milliseconds, inclusive.
    from: i64,
    to: i64,
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct ExpiryRequest {
    symbol: String,
    exchange: String,
}

#[derive(Deserialize)]
struct ChainRequest {
    symbol: String,
    exchange: String,
    #[serde(default)]
    expiry: Option<NaiveDate>,
}

#[derive(Deserialize)]
struct SyntheticFutureRequest {
    symbol: String,
    exchange: String,
    expiry: NaiveDate,
}

#[derive(Deserialize)]
struct OptionSymbolRequest {
    symbol: String,
    expiry: NaiveDate,
    strike: f64,
    optiontype: OptionKind,
}

#[derive(Deserialize)]
struct MultiLegRequest {
    legs: Vec<OptionOrderRequest>,
}

#[derive(Deserialize)]
struct AnalyzerToggleRequest {
    mode: bool,
}

#[derive(Deserialize)]
struct BasketRequest {
    orders: Vec<PlaceOrderRequest>,
}

async fn route(state: &GatewayState, op: &str, body: Value) -> CoreResult<Value> {
    let services = &state.services;
    match op {
        "placeorder" => {
            let req: PlaceOrderRequest = parse(body)?;
            let order = services.place_order(&req.into_intent()?).await?;
            Ok(json!({ "orderid": order.order_id, "order_status": order.status }))
        }
        "placesmartorder" => {
            let req: SmartOrderRequest = parse(body)?;
            let product = match req.product.as_deref() {
                Some(p) => ProductType::parse(p)?,
                None => ProductType::Mis,
            };
            let order = services
                .place_smart_order(&req.symbol, &req.exchange, product, req.position_size, None)
                .await?;
            Ok(json!({ "orderid": order.map(|o| o.order_id) }))
        }
        "modifyorder" => {
            let req: ModifyOrderRequest = parse(body)?;
            let order = services.modify_order(&req.orderid, &req.modify).await?;
            Ok(json!({ "orderid": order.order_id }))
        }
        "cancelorder" => {
            let req: OrderIdRequest = parse(body)?;
            services.cancel_order(&req.orderid).await?;
            Ok(json!({ "orderid": req.orderid }))
        }
        "cancelallorder" => {
            let cancelled = services.cancel_all_orders().await?;
            Ok(json!({ "cancelled": cancelled }))
        }
        "closeposition" => {
            let req: ClosePositionRequest = parse(body)?;
            let filter = match (req.symbol, req.exchange) {
                (Some(symbol), Some(exchange)) => {
                    let product = match req.product.as_deref() {
                        Some(p) => ProductType::parse(p)?,
                        None => ProductType::Mis,
                    };
                    Some((symbol, exchange, product))
                }
                _ => None,
            };
            let closed = services.close_positions(filter).await?;
            Ok(json!({
                "closed": closed.iter().map(|o| o.order_id.clone()).collect::<Vec<_>>()
            }))
        }
        "orderbook" => Ok(json!({ "orders": services.order_book().await? })),
        "tradebook" => Ok(json!({ "trades": services.trade_book().await? })),
        "positionbook" => Ok(json!({ "positions": services.position_book().await? })),
        "holdings" => Ok(json!({ "holdings": services.holdings().await? })),
        "funds" => Ok(json!({ "funds": services.funds().await? })),
        "quotes" => {
            let req: QuotesRequest = parse(body)?;
            let pairs: Vec<(String, String)> = if req.symbols.is_empty() {
                match (req.exchange, req.symbol) {
                    (Some(exchange), Some(symbol)) => vec![(exchange, symbol)],
                    _ => {
                        return Err(CoreError::PayloadInvalid(
                            "symbol/exchange or symbols[] required".into(),
                        ))
                    }
                }
            } else {
                req.symbols
                    .into_iter()
                    .map(|s| (s.exchange, s.symbol))
                    .collect()
            };
            Ok(json!({ "quotes": services.quotes(&pairs).await? }))
        }
        "depth" => {
            let req: SymbolRequest = parse(body)?;
            Ok(json!({ "depth": services.market_depth(&req.exchange, &req.symbol).await? }))
        }
        "history" => {
            let req: HistoryRequest = parse(body)?;
            let bars = services
                .history(&req.exchange, &req.symbol, &req.interval, req.from, req.to)
                .await?;
            Ok(json!({ "bars": bars }))
        }
        "intervals" => Ok(json!({ "intervals": services.intervals() })),
        "search" => {
            let req: SearchRequest = parse(body)?;
            let hits = services
                .search_symbols(&req.query, req.limit.unwrap_or(50))
                .await?;
            Ok(json!({ "results": hits }))
        }
        "symbol" => {
            let req: SymbolRequest = parse(body)?;
            Ok(json!({ "symbol": services.symbol_info(&req.exchange, &req.symbol)? }))
        }
        "instruments" => {
            let count = services.refresh_master().await?;
            Ok(json!({ "instruments": count }))
        }
        "expiry" => {
            let req: ExpiryRequest = parse(body)?;
            let expiries = services.option_expiries(&req.exchange, &req.symbol).await?;
            Ok(json!({ "expiry": expiries }))
        }
        "optionchain" => {
            let req: ChainRequest = parse(body)?;
            let chain = services
                .option_chain(&req.exchange, &req.symbol, req.expiry)
                .await?;
            Ok(json!({ "chain": chain }))
        }
        "syntheticfuture" => {
            let req: SyntheticFutureRequest = parse(body)?;
            let synthetic = services
                .synthetic_future(&req.exchange, &req.symbol, req.expiry)
                .await?;
            Ok(json!({ "synthetic": synthetic }))
        }
        "optiongreeks" => {
            let req: GreeksRequest = parse(body)?;
            Ok(json!({ "greeks": services.option_greeks(&req).await? }))
        }
        "optionsymbol" => {
            let req: OptionSymbolRequest = parse(body)?;
            let symbol = crate::services::options::option_symbol(
                &req.symbol,
                req.expiry,
                req.strike,
                req.optiontype,
            );
            Ok(json!({ "symbol": symbol }))
        }
        "optionsorder" => {
            let req: OptionOrderRequest = parse(body)?;
            let order = services.options_order(&req).await?;
            Ok(json!({ "orderid": order.order_id }))
        }
        "optionsmultiorder" => {
            let req: MultiLegRequest = parse(body)?;
            let legs = services.options_multi_order(&req.legs).await?;
            Ok(json!({ "legs": legs }))
        }
        "analyzer" => {
            Ok(json!({
                "analyzer_mode": services.analyzer_on().await?,
                "logs": services.analyzer_logs(50).await?,
            }))
        }
        "analyzer/toggle" => {
            let req: AnalyzerToggleRequest = parse(body)?;
            let mode = services.set_analyzer_mode(req.mode).await?;
            Ok(json!({ "analyzer_mode": mode }))
        }
        "margin" => {
            let req: BasketRequest = parse(body)?;
            let intents = req
                .orders
                .into_iter()
                .map(PlaceOrderRequest::into_intent)
                .collect::<CoreResult<Vec<_>>>()?;
            Ok(json!({ "margin": services.margin_estimate(&intents).await? }))
        }
        "basketorder" => {
            let req: BasketRequest = parse(body)?;
            let intents = req
                .orders
                .into_iter()
                .map(PlaceOrderRequest::into_intent)
                .collect::<CoreResult<Vec<_>>>()?;
            Ok(json!({ "results": services.basket_order(&intents).await? }))
        }
        "splitorder" => {
            let req: PlaceOrderRequest = parse(body)?;
            let split_size = req.splitsize.ok_or_else(|| {
                CoreError::PayloadInvalid("splitsize is required".into())
            })?;
            let intent = req.into_intent()?;
            Ok(json!({ "results": services.split_order(&intent, split_size).await? }))
        }
        "orderstatus" => {
            let req: OrderIdRequest = parse(body)?;
            let order = services.order_status(&req.orderid).await?;
            Ok(json!({ "order": order }))
        }
        "openposition" => {
            let req: PositionRequest = parse(body)?;
            let product = match req.product.as_deref() {
                Some(p) => ProductType::parse(p)?,
                None => ProductType::Mis,
            };
            let quantity = services
                .open_position(&req.symbol, &req.exchange, product)
                .await?;
            Ok(json!({ "quantity": quantity }))
        }
        other => Err(CoreError::PayloadInvalid(format!(
            "unknown operation '{other}'"
        ))),
    }
}
