//! Uniform trading model shared by the services layer, broker adapters,
//! the admission gateway, and the IPC surface.
//!
//! Broker adapters normalize their upstream payloads into these types; no
//! broker-specific shape crosses the services boundary.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Parse the TradingView/Chartink action field (case-insensitive).
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(CoreError::PayloadInvalid(format!(
                "unknown action '{other}'"
            ))),
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product / margin segment of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductType {
    /// Intraday (margin intraday squareoff).
    Mis,
    /// Delivery (cash and carry).
    Cnc,
    /// Overnight F&O.
    Nrml,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Mis => "MIS",
            ProductType::Cnc => "CNC",
            ProductType::Nrml => "NRML",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.to_ascii_uppercase().as_str() {
            "MIS" => Ok(ProductType::Mis),
            "CNC" => Ok(ProductType::Cnc),
            "NRML" => Ok(ProductType::Nrml),
            other => Err(CoreError::PayloadInvalid(format!(
                "unknown product '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price type of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    /// Stop-loss limit.
    #[serde(rename = "SL")]
    StopLoss,
    /// Stop-loss market.
    #[serde(rename = "SL-M")]
    StopLossMarket,
}

impl PriceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceType::Market => "MARKET",
            PriceType::Limit => "LIMIT",
            PriceType::StopLoss => "SL",
            PriceType::StopLossMarket => "SL-M",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.to_ascii_uppercase().as_str() {
            "MARKET" => Ok(PriceType::Market),
            "LIMIT" => Ok(PriceType::Limit),
            "SL" => Ok(PriceType::StopLoss),
            "SL-M" | "SLM" => Ok(PriceType::StopLossMarket),
            other => Err(CoreError::PayloadInvalid(format!(
                "unknown price type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for PriceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an order as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Complete,
    Rejected,
    Cancelled,
    TriggerPending,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Complete => "complete",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::TriggerPending => "trigger_pending",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-specified order request handed to a broker adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub exchange: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub product: ProductType,
    pub price_type: PriceType,
    /// Limit price; ignored for market orders.
    #[serde(default)]
    pub price: f64,
    /// Trigger price for SL / SL-M orders.
    #[serde(default)]
    pub trigger_price: f64,
    /// Originating strategy name, when dispatched from a webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

/// An order as it appears in the order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub exchange: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub product: ProductType,
    pub price_type: PriceType,
    pub price: f64,
    pub trigger_price: f64,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

/// A fill from the trade book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub exchange: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: f64,
    pub product: ProductType,
    pub timestamp: DateTime<Utc>,
}

/// An open position. `quantity` is signed: positive long, negative short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: String,
    pub product: ProductType,
    pub quantity: i64,
    pub average_price: f64,
    pub last_price: f64,
    pub pnl: f64,
}

/// A demat holding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub average_price: f64,
    pub last_price: f64,
    pub pnl: f64,
}

/// Account funds and margin snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Funds {
    pub available_cash: f64,
    pub collateral: f64,
    pub used_margin: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

/// A level-1 quote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub exchange: String,
    pub last_price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub prev_close: f64,
    pub volume: i64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

/// One side level of the order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: i64,
    pub orders: i64,
}

/// Five-level market depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Depth {
    pub symbol: String,
    pub exchange: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub last_price: f64,
    pub total_buy_quantity: i64,
    pub total_sell_quantity: i64,
}

/// One OHLCV bar of the analytical store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalBar {
    /// Bar open time, epoch milliseconds UTC.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// One row of the symbol master.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instrument {
    pub exchange: String,
    pub symbol: String,
    /// Broker-native instrument token.
    pub token: String,
    pub name: String,
    /// EQ, FUT, CE, PE, INDEX...
    pub instrument_type: String,
    pub lot_size: i64,
    pub tick_size: f64,
    pub expiry: Option<NaiveDate>,
    pub strike: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_parse_accepts_any_case() {
        assert_eq!(OrderSide::parse("buy").unwrap(), OrderSide::Buy);
        assert_eq!(OrderSide::parse("SELL").unwrap(), OrderSide::Sell);
        assert!(OrderSide::parse("HOLD").is_err());
    }

    #[test]
    fn test_price_type_aliases() {
        assert_eq!(PriceType::parse("SL-M").unwrap(), PriceType::StopLossMarket);
        assert_eq!(PriceType::parse("slm").unwrap(), PriceType::StopLossMarket);
    }

    #[test]
    fn test_order_intent_round_trips_through_json() {
        let intent = OrderIntent {
            symbol: "RELIANCE".into(),
            exchange: "NSE".into(),
            side: OrderSide::Buy,
            quantity: 1,
            product: ProductType::Mis,
            price_type: PriceType::Market,
            price: 0.0,
            trigger_price: 0.0,
            strategy: None,
        };
        let json = serde_json::to_string(&intent).unwrap();
        let back: OrderIntent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.symbol, "RELIANCE");
        assert_eq!(back.side, OrderSide::Buy);
    }
}
