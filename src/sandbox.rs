//! Sandbox: a fully simulated broker account backed by local state.
//!
//! Orders execute against an internal mark-price table, positions and funds
//! are tracked in the sandbox tables, and the account can be reset to its
//! starting capital on demand or on a schedule. Analyzer mode and the paper
//! broker adapter both execute through this engine; no upstream is involved.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::db::{self, DbPool, SandboxOrder, SandboxTrade};
use crate::error::{CoreError, CoreResult};
use crate::types::{
    Depth, DepthLevel, Funds, Holding, Order, OrderIntent, OrderSide, OrderStatus, Position,
    PriceType, ProductType, Quote, Trade,
};

/// Mark price used for symbols nobody has quoted yet.
const DEFAULT_MARK_PRICE: f64 = 100.0;

/// Margin fraction blocked per product.
pub fn margin_factor(product: ProductType) -> f64 {
    match product {
        ProductType::Mis => 0.2,
        ProductType::Nrml => 0.25,
        ProductType::Cnc => 1.0,
    }
}

pub struct SandboxEngine {
    pool: DbPool,
    starting_capital: f64,
    /// Days between scheduled resets; 0 disables the schedule.
    reset_interval_days: i64,
    marks: RwLock<HashMap<(String, String), f64>>,
}

impl SandboxEngine {
    pub fn new(pool: DbPool, starting_capital: f64) -> Self {
        Self::with_reset_interval(pool, starting_capital, 0)
    }

    pub fn with_reset_interval(
        pool: DbPool,
        starting_capital: f64,
        reset_interval_days: i64,
    ) -> Self {
        Self {
            pool,
            starting_capital,
            reset_interval_days,
            marks: RwLock::new(HashMap::new()),
        }
    }

    /// Create the funds row on first use and honor the periodic reset
    /// schedule: once the configured interval has elapsed since the last
    /// reset, the account starts over at its configured capital.
    pub async fn ensure_initialized(&self) -> CoreResult<()> {
        match db::get_sandbox_funds(&self.pool).await? {
            None => db::reset_sandbox(&self.pool, self.starting_capital).await?,
            Some(funds) if self.reset_interval_days > 0 => {
                let due = funds.last_reset_at
                    + chrono::Duration::days(self.reset_interval_days);
                if Utc::now() >= due {
                    tracing::info!("sandbox scheduled reset due");
                    db::reset_sandbox(&self.pool, self.starting_capital).await?;
                }
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Wipe positions, orders, and trades and restore starting capital.
    pub async fn reset(&self) -> CoreResult<()> {
        db::reset_sandbox(&self.pool, self.starting_capital).await?;
        tracing::info!(capital = self.starting_capital, "sandbox reset");
        Ok(())
    }

    /// Current mark for a symbol; defaults until a tick or test sets one.
    pub fn mark_price(&self, exchange: &str, symbol: &str) -> f64 {
        self.marks
            .read()
            .get(&(exchange.to_uppercase(), symbol.to_uppercase()))
            .copied()
            .unwrap_or(DEFAULT_MARK_PRICE)
    }

    pub fn set_mark_price(&self, exchange: &str, symbol: &str, price: f64) {
        self.marks
            .write()
            .insert((exchange.to_uppercase(), symbol.to_uppercase()), price);
    }

    /// Execute an order intent against the simulated account.
    ///
    /// Market orders fill at the mark; marketable limit orders fill at
    /// their limit price; resting limit orders stay open; stop orders wait
    /// as trigger-pending. An order the account cannot margin is recorded
    /// as rejected, mirroring what an upstream broker would return.
    pub async fn place_order(&self, intent: &OrderIntent) -> CoreResult<Order> {
        self.ensure_initialized().await?;
        if intent.quantity <= 0 {
            return Err(CoreError::PayloadInvalid(
                "quantity must be positive".into(),
            ));
        }

        let mark = self.mark_price(&intent.exchange, &intent.symbol);
        let order_id = format!("SB-{}", Uuid::new_v4().simple());
        let (status, exec_price) = match intent.price_type {
            PriceType::Market => (OrderStatus::Complete, mark),
            PriceType::Limit => {
                let marketable = match intent.side {
                    OrderSide::Buy => intent.price >= mark,
                    OrderSide::Sell => intent.price <= mark,
                };
                if marketable {
                    (OrderStatus::Complete, intent.price)
                } else {
                    (OrderStatus::Open, intent.price)
                }
            }
            PriceType::StopLoss | PriceType::StopLossMarket => {
                (OrderStatus::TriggerPending, intent.price)
            }
        };

        let mut status = status;
        if status == OrderStatus::Complete {
            let required = exec_price * intent.quantity as f64 * margin_factor(intent.product);
            let funds = db::get_sandbox_funds(&self.pool)
                .await?
                .ok_or_else(|| CoreError::internal("sandbox funds row missing"))?;
            if intent.side == OrderSide::Buy && funds.available_cash < required {
                status = OrderStatus::Rejected;
            }
        }

        let filled = if status == OrderStatus::Complete {
            intent.quantity
        } else {
            0
        };
        let row = SandboxOrder {
            order_id: order_id.clone(),
            symbol: intent.symbol.clone(),
            exchange: intent.exchange.clone(),
            side: intent.side.as_str().to_string(),
            quantity: intent.quantity,
            filled_quantity: filled,
            product: intent.product.as_str().to_string(),
            price_type: intent.price_type.as_str().to_string(),
            price: intent.price,
            trigger_price: intent.trigger_price,
            status: status.as_str().to_string(),
            strategy: intent.strategy.clone(),
            created_at: Utc::now(),
        };
        db::insert_sandbox_order(&self.pool, &row).await?;

        if status == OrderStatus::Complete {
            self.settle_fill(&order_id, intent, exec_price).await?;
        }

        order_from_row(&row)
    }

    /// Record the trade and apply position / funds deltas for one fill.
    async fn settle_fill(
        &self,
        order_id: &str,
        intent: &OrderIntent,
        price: f64,
    ) -> CoreResult<()> {
        let trade = SandboxTrade {
            trade_id: format!("ST-{}", Uuid::new_v4().simple()),
            order_id: order_id.to_string(),
            symbol: intent.symbol.clone(),
            exchange: intent.exchange.clone(),
            side: intent.side.as_str().to_string(),
            quantity: intent.quantity,
            price,
            product: intent.product.as_str().to_string(),
            created_at: Utc::now(),
        };
        db::insert_sandbox_trade(&self.pool, &trade).await?;

        let existing = db::get_sandbox_position(
            &self.pool,
            &intent.symbol,
            &intent.exchange,
            intent.product.as_str(),
        )
        .await?;
        let old_qty = existing.as_ref().map(|p| p.quantity).unwrap_or(0);
        let old_avg = existing.as_ref().map(|p| p.average_price).unwrap_or(0.0);

        let signed = match intent.side {
            OrderSide::Buy => intent.quantity,
            OrderSide::Sell => -intent.quantity,
        };
        let new_qty = old_qty + signed;

        // Realized pnl accrues on the closed portion only.
        let mut realized_delta = 0.0;
        let new_avg = if old_qty == 0 || old_qty.signum() == signed.signum() {
            let total = old_qty.abs() + signed.abs();
            (old_avg * old_qty.abs() as f64 + price * signed.abs() as f64) / total as f64
        } else {
            let closed = signed.abs().min(old_qty.abs());
            realized_delta = (price - old_avg) * closed as f64 * old_qty.signum() as f64;
            if new_qty == 0 || new_qty.signum() == old_qty.signum() {
                old_avg
            } else {
                price
            }
        };

        db::upsert_sandbox_position(
            &self.pool,
            &intent.symbol,
            &intent.exchange,
            intent.product.as_str(),
            new_qty,
            new_avg,
        )
        .await?;

        let funds = db::get_sandbox_funds(&self.pool)
            .await?
            .ok_or_else(|| CoreError::internal("sandbox funds row missing"))?;
        let old_margin = old_qty.abs() as f64 * old_avg * margin_factor(intent.product);
        let new_margin = new_qty.abs() as f64 * new_avg * margin_factor(intent.product);
        let margin_delta = new_margin - old_margin;
        db::update_sandbox_funds(
            &self.pool,
            funds.available_cash - margin_delta + realized_delta,
            (funds.used_margin + margin_delta).max(0.0),
            funds.realized_pnl + realized_delta,
        )
        .await?;
        Ok(())
    }

    /// Modify an open order's price/quantity/trigger.
    pub async fn modify_order(
        &self,
        order_id: &str,
        quantity: Option<i64>,
        price: Option<f64>,
        trigger_price: Option<f64>,
    ) -> CoreResult<Order> {
        let row = db::get_sandbox_order(&self.pool, order_id)
            .await?
            .ok_or_else(|| CoreError::Upstream {
                code: "ORDER_NOT_FOUND".into(),
                message: format!("order {order_id} not found"),
            })?;
        if row.status != "open" && row.status != "trigger_pending" {
            return Err(CoreError::Upstream {
                code: "ORDER_NOT_OPEN".into(),
                message: format!("order {order_id} is {}", row.status),
            });
        }
        let mut updated = row.clone();
        if let Some(q) = quantity {
            updated.quantity = q;
        }
        if let Some(p) = price {
            updated.price = p;
        }
        if let Some(t) = trigger_price {
            updated.trigger_price = t;
        }
        // Rewrite in place: delete + insert keeps one code path for rows.
        sqlx_replace_order(&self.pool, &updated).await?;
        order_from_row(&updated)
    }

    /// Cancel one open order.
    pub async fn cancel_order(&self, order_id: &str) -> CoreResult<()> {
        let row = db::get_sandbox_order(&self.pool, order_id)
            .await?
            .ok_or_else(|| CoreError::Upstream {
                code: "ORDER_NOT_FOUND".into(),
                message: format!("order {order_id} not found"),
            })?;
        if row.status != "open" && row.status != "trigger_pending" {
            return Err(CoreError::Upstream {
                code: "ORDER_NOT_OPEN".into(),
                message: format!("order {order_id} is {}", row.status),
            });
        }
        db::update_sandbox_order_status(&self.pool, order_id, "cancelled", row.filled_quantity)
            .await?;
        Ok(())
    }

    /// Cancel every open order; returns the cancelled ids.
    pub async fn cancel_all_orders(&self) -> CoreResult<Vec<String>> {
        let open = db::list_open_sandbox_orders(&self.pool).await?;
        let mut cancelled = Vec::with_capacity(open.len());
        for order in open {
            db::update_sandbox_order_status(
                &self.pool,
                &order.order_id,
                "cancelled",
                order.filled_quantity,
            )
            .await?;
            cancelled.push(order.order_id);
        }
        Ok(cancelled)
    }

    /// Flatten one position with a compensating market order.
    pub async fn close_position(
        &self,
        symbol: &str,
        exchange: &str,
        product: ProductType,
    ) -> CoreResult<Option<Order>> {
        let position =
            db::get_sandbox_position(&self.pool, symbol, exchange, product.as_str()).await?;
        let Some(position) = position else {
            return Ok(None);
        };
        if position.quantity == 0 {
            return Ok(None);
        }
        let intent = OrderIntent {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            side: if position.quantity > 0 {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            quantity: position.quantity.abs(),
            product,
            price_type: PriceType::Market,
            price: 0.0,
            trigger_price: 0.0,
            strategy: None,
        };
        Ok(Some(self.place_order(&intent).await?))
    }

    pub async fn order_book(&self) -> CoreResult<Vec<Order>> {
        db::list_sandbox_orders(&self.pool)
            .await?
            .iter()
            .map(order_from_row)
            .collect()
    }

    pub async fn order_status(&self, order_id: &str) -> CoreResult<Option<Order>> {
        match db::get_sandbox_order(&self.pool, order_id).await? {
            Some(row) => Ok(Some(order_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn trade_book(&self) -> CoreResult<Vec<Trade>> {
        db::list_sandbox_trades(&self.pool)
            .await?
            .iter()
            .map(trade_from_row)
            .collect()
    }

    pub async fn positions(&self) -> CoreResult<Vec<Position>> {
        let rows = db::list_sandbox_positions(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let mark = self.mark_price(&row.exchange, &row.symbol);
                Ok(Position {
                    symbol: row.symbol.clone(),
                    exchange: row.exchange.clone(),
                    product: ProductType::parse(&row.product)?,
                    quantity: row.quantity,
                    average_price: row.average_price,
                    last_price: mark,
                    pnl: (mark - row.average_price) * row.quantity as f64,
                })
            })
            .collect()
    }

    pub async fn holdings(&self) -> CoreResult<Vec<Holding>> {
        let rows = db::list_sandbox_holdings(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mark = self.mark_price(&row.exchange, &row.symbol);
                Holding {
                    pnl: (mark - row.average_price) * row.quantity as f64,
                    symbol: row.symbol,
                    exchange: row.exchange,
                    quantity: row.quantity,
                    average_price: row.average_price,
                    last_price: mark,
                }
            })
            .collect())
    }

    pub async fn funds(&self) -> CoreResult<Funds> {
        self.ensure_initialized().await?;
        let row = db::get_sandbox_funds(&self.pool)
            .await?
            .ok_or_else(|| CoreError::internal("sandbox funds row missing"))?;
        let positions = self.positions().await?;
        let unrealized: f64 = positions.iter().map(|p| p.pnl).sum();
        Ok(Funds {
            available_cash: row.available_cash,
            collateral: 0.0,
            used_margin: row.used_margin,
            realized_pnl: row.realized_pnl,
            unrealized_pnl: unrealized,
        })
    }

    /// Daily mark-to-market pnl of the simulated account.
    pub async fn daily_pnl(&self) -> CoreResult<f64> {
        let funds = self.funds().await?;
        Ok(funds.realized_pnl + funds.unrealized_pnl)
    }

    pub fn quote(&self, exchange: &str, symbol: &str) -> Quote {
        let mark = self.mark_price(exchange, symbol);
        Quote {
            symbol: symbol.to_uppercase(),
            exchange: exchange.to_uppercase(),
            last_price: mark,
            open: mark,
            high: mark,
            low: mark,
            prev_close: mark,
            volume: 0,
            bid: mark - 0.05,
            ask: mark + 0.05,
            timestamp: Utc::now(),
        }
    }

    /// Synthetic five-level depth around the mark.
    pub fn depth(&self, exchange: &str, symbol: &str) -> Depth {
        let mark = self.mark_price(exchange, symbol);
        let level = |offset: f64, qty: i64| DepthLevel {
            price: mark + offset,
            quantity: qty,
            orders: 1,
        };
        Depth {
            symbol: symbol.to_uppercase(),
            exchange: exchange.to_uppercase(),
            bids: (1..=5).map(|i| level(-0.05 * i as f64, 100 * i)).collect(),
            asks: (1..=5).map(|i| level(0.05 * i as f64, 100 * i)).collect(),
            last_price: mark,
            total_buy_quantity: 1500,
            total_sell_quantity: 1500,
        }
    }
}

/// Replace a sandbox order row wholesale (used by modify).
async fn sqlx_replace_order(pool: &DbPool, order: &SandboxOrder) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE sandbox_orders
        SET quantity = ?, price = ?, trigger_price = ?
        WHERE order_id = ?
        "#,
    )
    .bind(order.quantity)
    .bind(order.price)
    .bind(order.trigger_price)
    .bind(&order.order_id)
    .execute(pool)
    .await
    .map_err(CoreError::from)?;
    Ok(())
}

fn order_from_row(row: &SandboxOrder) -> CoreResult<Order> {
    Ok(Order {
        order_id: row.order_id.clone(),
        symbol: row.symbol.clone(),
        exchange: row.exchange.clone(),
        side: OrderSide::parse(&row.side)?,
        quantity: row.quantity,
        filled_quantity: row.filled_quantity,
        product: ProductType::parse(&row.product)?,
        price_type: PriceType::parse(&row.price_type)?,
        price: row.price,
        trigger_price: row.trigger_price,
        status: parse_status(&row.status),
        timestamp: row.created_at,
    })
}

fn trade_from_row(row: &SandboxTrade) -> CoreResult<Trade> {
    Ok(Trade {
        trade_id: row.trade_id.clone(),
        order_id: row.order_id.clone(),
        symbol: row.symbol.clone(),
        exchange: row.exchange.clone(),
        side: OrderSide::parse(&row.side)?,
        quantity: row.quantity,
        price: row.price,
        product: ProductType::parse(&row.product)?,
        timestamp: row.created_at,
    })
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "open" => OrderStatus::Open,
        "complete" => OrderStatus::Complete,
        "rejected" => OrderStatus::Rejected,
        "cancelled" => OrderStatus::Cancelled,
        "trigger_pending" => OrderStatus::TriggerPending,
        _ => OrderStatus::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> SandboxEngine {
        let pool = db::create_test_pool().await;
        let engine = SandboxEngine::new(pool, 1_000_000.0);
        engine.ensure_initialized().await.unwrap();
        engine
    }

    fn market_buy(symbol: &str, qty: i64) -> OrderIntent {
        OrderIntent {
            symbol: symbol.into(),
            exchange: "NSE".into(),
            side: OrderSide::Buy,
            quantity: qty,
            product: ProductType::Mis,
            price_type: PriceType::Market,
            price: 0.0,
            trigger_price: 0.0,
            strategy: None,
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_and_builds_position() {
        let engine = engine().await;
        engine.set_mark_price("NSE", "TCS", 4000.0);

        let order = engine.place_order(&market_buy("TCS", 10)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Complete);
        assert_eq!(order.filled_quantity, 10);

        let positions = engine.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 10);
        assert_eq!(positions[0].average_price, 4000.0);

        let trades = engine.trade_book().await.unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[tokio::test]
    async fn test_sell_realizes_pnl() {
        let engine = engine().await;
        engine.set_mark_price("NSE", "TCS", 4000.0);
        engine.place_order(&market_buy("TCS", 10)).await.unwrap();

        engine.set_mark_price("NSE", "TCS", 4100.0);
        let mut sell = market_buy("TCS", 10);
        sell.side = OrderSide::Sell;
        engine.place_order(&sell).await.unwrap();

        assert!(engine.positions().await.unwrap().is_empty());
        let funds = engine.funds().await.unwrap();
        assert!((funds.realized_pnl - 1000.0).abs() < 1e-6);
        assert!((funds.used_margin).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_unaffordable_buy_is_rejected() {
        let pool = db::create_test_pool().await;
        let engine = SandboxEngine::new(pool, 100.0);
        engine.ensure_initialized().await.unwrap();
        engine.set_mark_price("NSE", "TCS", 4000.0);

        let order = engine.place_order(&market_buy("TCS", 100)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(engine.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resting_limit_then_cancel_all() {
        let engine = engine().await;
        engine.set_mark_price("NSE", "TCS", 4000.0);

        let mut intent = market_buy("TCS", 5);
        intent.price_type = PriceType::Limit;
        intent.price = 3900.0; // below mark: rests
        let order = engine.place_order(&intent).await.unwrap();
        assert_eq!(order.status, OrderStatus::Open);

        let cancelled = engine.cancel_all_orders().await.unwrap();
        assert_eq!(cancelled, vec![order.order_id.clone()]);
        let status = engine.order_status(&order.order_id).await.unwrap().unwrap();
        assert_eq!(status.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_close_position_flattens() {
        let engine = engine().await;
        engine.set_mark_price("NSE", "INFY", 1500.0);
        engine.place_order(&market_buy("INFY", 8)).await.unwrap();

        let close = engine
            .close_position("INFY", "NSE", ProductType::Mis)
            .await
            .unwrap();
        assert!(close.is_some());
        assert!(engine.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_reset_fires_after_interval() {
        let pool = db::create_test_pool().await;
        let engine = SandboxEngine::with_reset_interval(pool.clone(), 500_000.0, 1);
        engine.ensure_initialized().await.unwrap();
        engine.set_mark_price("NSE", "TCS", 100.0);
        engine.place_order(&market_buy("TCS", 10)).await.unwrap();

        // Age the account past the interval.
        sqlx::query("UPDATE sandbox_funds SET last_reset_at = ? WHERE id = 1")
            .bind(Utc::now() - chrono::Duration::days(2))
            .execute(&pool)
            .await
            .unwrap();

        engine.ensure_initialized().await.unwrap();
        assert!(engine.order_book().await.unwrap().is_empty());
        assert_eq!(engine.funds().await.unwrap().available_cash, 500_000.0);
    }

    #[tokio::test]
    async fn test_reset_restores_starting_capital() {
        let engine = engine().await;
        engine.set_mark_price("NSE", "TCS", 4000.0);
        engine.place_order(&market_buy("TCS", 10)).await.unwrap();

        engine.reset().await.unwrap();
        let funds = engine.funds().await.unwrap();
        assert_eq!(funds.available_cash, 1_000_000.0);
        assert!(engine.order_book().await.unwrap().is_empty());
    }
}
