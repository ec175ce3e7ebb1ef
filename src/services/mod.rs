//! Services layer: the single business-logic facade over broker adapters
//! (C7). The admission gateway and the local IPC surface call these
//! operations identically; nothing else reaches an adapter.
//!
//! Every operation resolves the active broker (failing `NoActiveBroker`),
//! delegates through the capability set under a bounded deadline, and
//! normalizes into the uniform model. With analyzer mode on, order-path
//! commands bypass the adapter entirely: the sandbox engine simulates the
//! execution and an AnalyzerLog row records the decision.
//!
//! Retry policy: one automatic retry with jitter, only for `Timeout` on
//! idempotent reads. Writes are at-most-once; the operator re-issues.

pub mod options;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analytics::OhlcvStore;
use crate::brokers::{self, BrokerAdapter, BrokerRegistry, OrderModify};
use crate::config::BrokerConfig;
use crate::custodian::{ActiveSession, SessionCustodian};
use crate::db::{self, DbPool, LatencySummary, NewStrategy, Strategy, SymbolMapping};
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::identity::IdentityManager;
use crate::metrics;
use crate::sandbox::{margin_factor, SandboxEngine};
use crate::symbols::SymbolIndex;
use crate::types::{
    Depth, Funds, Holding, HistoricalBar, Instrument, Order, OrderIntent, OrderSide, OrderStatus,
    Position, PriceType, ProductType, Quote, Trade,
};

/// Bar intervals the history surface accepts.
pub const SUPPORTED_INTERVALS: &[&str] = &["1m", "3m", "5m", "10m", "15m", "30m", "1h", "1d"];

/// Per-leg outcome of a basket or split order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegResult {
    pub symbol: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Services {
    pool: DbPool,
    custodian: Arc<SessionCustodian>,
    identity: Arc<IdentityManager>,
    brokers: Arc<BrokerRegistry>,
    sandbox: Arc<SandboxEngine>,
    symbols: Arc<SymbolIndex>,
    history: Arc<OhlcvStore>,
    events: EventBus,
    cfg: BrokerConfig,
}

impl Services {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: DbPool,
        custodian: Arc<SessionCustodian>,
        identity: Arc<IdentityManager>,
        brokers: Arc<BrokerRegistry>,
        sandbox: Arc<SandboxEngine>,
        symbols: Arc<SymbolIndex>,
        history: Arc<OhlcvStore>,
        events: EventBus,
        cfg: BrokerConfig,
    ) -> Self {
        Self {
            pool,
            custodian,
            identity,
            brokers,
            sandbox,
            symbols,
            history,
            events,
            cfg,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.identity
    }

    pub fn custodian(&self) -> &Arc<SessionCustodian> {
        &self.custodian
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn symbols(&self) -> &Arc<SymbolIndex> {
        &self.symbols
    }

    pub fn sandbox(&self) -> &Arc<SandboxEngine> {
        &self.sandbox
    }

    pub fn broker_ids(&self) -> Vec<String> {
        self.brokers.ids()
    }

    fn rpc_deadline(&self) -> Duration {
        Duration::from_secs(self.cfg.rpc_timeout_secs)
    }

    pub async fn analyzer_on(&self) -> CoreResult<bool> {
        Ok(db::get_settings(&self.pool).await?.analyzer_mode)
    }

    /// Resolve the active broker adapter + decrypted session.
    async fn active(&self) -> CoreResult<(Arc<dyn BrokerAdapter>, ActiveSession)> {
        let session = self
            .custodian
            .load_active_session()
            .await?
            .ok_or(CoreError::NoActiveBroker)?;
        let adapter = self
            .brokers
            .get(&session.broker_id)
            .map_err(|_| CoreError::internal(format!("no adapter for '{}'", session.broker_id)))?;
        Ok((adapter, session))
    }

    async fn record_op(&self, op: &str, broker_id: Option<&str>, started: Instant, ok: bool) {
        let elapsed = started.elapsed();
        if let Err(e) =
            db::insert_latency_log(&self.pool, op, elapsed.as_millis() as i64, broker_id, ok).await
        {
            tracing::warn!(op, error = %e, "failed to record latency");
        }
        metrics::record_broker_call(op, ok, elapsed.as_secs_f64());
    }

    /// One retry with jitter, only on deadline overrun of an idempotent read.
    async fn read_with_retry<T, F, Fut>(&self, make_call: F) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let deadline = self.rpc_deadline();
        match brokers::with_deadline(deadline, make_call()).await {
            Err(e) if e.is_timeout() => {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(50..250));
                tracing::debug!(?jitter, "read timed out, retrying once");
                tokio::time::sleep(jitter).await;
                brokers::with_deadline(deadline, make_call()).await
            }
            other => other,
        }
    }

    // ---- broker session lifecycle ----

    /// Authenticate with a broker using the stored credential (plus an
    /// OAuth code when the broker uses redirect auth) and custody the
    /// issued tokens.
    pub async fn broker_login(&self, broker_id: &str, auth_code: Option<String>) -> CoreResult<()> {
        let user_id = self.identity.require_user()?;
        let mut credentials = self
            .custodian
            .load_credential(broker_id)
            .await?
            .ok_or_else(|| {
                CoreError::PayloadInvalid(format!("no credential stored for '{broker_id}'"))
            })?;
        credentials.auth_code = auth_code;

        let adapter = self.brokers.get(broker_id)?;
        let started = Instant::now();
        let result =
            brokers::with_deadline(self.rpc_deadline(), adapter.authenticate(&credentials)).await;
        self.record_op("authenticate", Some(broker_id), started, result.is_ok())
            .await;
        let tokens = result?;

        self.custodian
            .save_session(
                broker_id,
                &tokens.auth_token,
                tokens.feed_token.as_deref(),
                user_id,
            )
            .await?;
        db::set_default_broker(&self.pool, Some(broker_id)).await?;
        tracing::info!(broker_id, "broker login complete");
        Ok(())
    }

    /// Revoke the active session locally, then upstream best-effort.
    pub async fn broker_logout(&self) -> CoreResult<()> {
        let Some(session) = self.custodian.load_active_session().await? else {
            return Ok(());
        };
        self.custodian.revoke().await?;
        if let Ok(adapter) = self.brokers.get(&session.broker_id) {
            let deadline = Duration::from_secs(self.cfg.revoke_timeout_secs);
            if let Err(e) =
                brokers::with_deadline(deadline, adapter.logout(&session.auth_token)).await
            {
                tracing::warn!(broker_id = %session.broker_id, error = %e, "upstream logout failed");
            }
        }
        Ok(())
    }

    // ---- order path ----

    pub async fn place_order(&self, intent: &OrderIntent) -> CoreResult<Order> {
        self.place_order_for(intent, None).await
    }

    /// Place an order, attributing it to a strategy when dispatched from a
    /// webhook.
    pub async fn place_order_for(
        &self,
        intent: &OrderIntent,
        strategy_id: Option<i64>,
    ) -> CoreResult<Order> {
        let order = if self.analyzer_on().await? {
            self.simulate_order("placeorder", intent, strategy_id).await?
        } else {
            let (adapter, session) = self.active().await?;
            let started = Instant::now();
            let result = brokers::with_deadline(
                self.rpc_deadline(),
                adapter.place_order(&session.auth_token, intent),
            )
            .await;
            self.record_op("placeorder", Some(&session.broker_id), started, result.is_ok())
                .await;
            result?
        };
        self.events.publish(Event::OrderEvent {
            symbol: order.symbol.clone(),
            action: order.side,
            order_id: order.order_id.clone(),
            batch_order: None,
            is_last_order: None,
        });
        Ok(order)
    }

    /// Execute against the sandbox and write the analyzer audit row.
    async fn simulate_order(
        &self,
        op: &str,
        intent: &OrderIntent,
        strategy_id: Option<i64>,
    ) -> CoreResult<Order> {
        let started = Instant::now();
        let order = self.sandbox.place_order(intent).await?;
        let payload = serde_json::to_string(intent)
            .map_err(|e| CoreError::internal(format!("serialize intent: {e}")))?;
        let decision = format!(
            "{op}: {} {} x{} -> {} ({})",
            intent.side, intent.symbol, intent.quantity, order.order_id, order.status
        );
        db::insert_analyzer_log(&self.pool, strategy_id, &payload, &decision).await?;
        self.record_op(op, None, started, true).await;
        Ok(order)
    }

    /// Smart order: `position_size` is the desired absolute signed position
    /// for (symbol, product); the compensating delta order is issued.
    /// Positions in other products are ignored.
    pub async fn place_smart_order(
        &self,
        symbol: &str,
        exchange: &str,
        product: ProductType,
        position_size: i64,
        strategy_id: Option<i64>,
    ) -> CoreResult<Option<Order>> {
        let current = self.open_position(symbol, exchange, product).await?;
        let delta = position_size - current;
        if delta == 0 {
            tracing::debug!(symbol, position_size, "smart order already at target");
            return Ok(None);
        }
        let intent = OrderIntent {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            side: if delta > 0 {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            quantity: delta.abs(),
            product,
            price_type: PriceType::Market,
            price: 0.0,
            trigger_price: 0.0,
            strategy: None,
        };
        Ok(Some(self.place_order_for(&intent, strategy_id).await?))
    }

    pub async fn modify_order(&self, order_id: &str, modify: &OrderModify) -> CoreResult<Order> {
        if self.analyzer_on().await? {
            let started = Instant::now();
            let order = self
                .sandbox
                .modify_order(order_id, modify.quantity, modify.price, modify.trigger_price)
                .await?;
            self.record_op("modifyorder", None, started, true).await;
            return Ok(order);
        }
        let (adapter, session) = self.active().await?;
        let started = Instant::now();
        let result = brokers::with_deadline(
            self.rpc_deadline(),
            adapter.modify_order(&session.auth_token, order_id, modify),
        )
        .await;
        self.record_op("modifyorder", Some(&session.broker_id), started, result.is_ok())
            .await;
        result
    }

    pub async fn cancel_order(&self, order_id: &str) -> CoreResult<()> {
        if self.analyzer_on().await? {
            let started = Instant::now();
            let result = self.sandbox.cancel_order(order_id).await;
            self.record_op("cancelorder", None, started, result.is_ok()).await;
            return result;
        }
        let (adapter, session) = self.active().await?;
        let started = Instant::now();
        let result = brokers::with_deadline(
            self.rpc_deadline(),
            adapter.cancel_order(&session.auth_token, order_id),
        )
        .await;
        self.record_op("cancelorder", Some(&session.broker_id), started, result.is_ok())
            .await;
        result
    }

    /// Cancel every open order; returns the cancelled ids.
    pub async fn cancel_all_orders(&self) -> CoreResult<Vec<String>> {
        if self.analyzer_on().await? {
            return self.sandbox.cancel_all_orders().await;
        }
        let (adapter, session) = self.active().await?;
        let book = {
            let adapter = Arc::clone(&adapter);
            let token = session.auth_token.clone();
            self.read_with_retry(|| {
                let adapter = Arc::clone(&adapter);
                let token = token.clone();
                async move { adapter.get_order_book(&token).await }
            })
            .await?
        };
        let mut cancelled = Vec::new();
        for order in book {
            if matches!(order.status, OrderStatus::Open | OrderStatus::TriggerPending) {
                let started = Instant::now();
                let result = brokers::with_deadline(
                    self.rpc_deadline(),
                    adapter.cancel_order(&session.auth_token, &order.order_id),
                )
                .await;
                self.record_op("cancelorder", Some(&session.broker_id), started, result.is_ok())
                    .await;
                result?;
                cancelled.push(order.order_id);
            }
        }
        Ok(cancelled)
    }

    /// Flatten positions with compensating market orders. With a filter,
    /// only the matching position is closed.
    pub async fn close_positions(
        &self,
        filter: Option<(String, String, ProductType)>,
    ) -> CoreResult<Vec<Order>> {
        let positions = self.position_book().await?;
        let mut closed = Vec::new();
        for position in positions {
            if position.quantity == 0 {
                continue;
            }
            if let Some((symbol, exchange, product)) = &filter {
                if !position.symbol.eq_ignore_ascii_case(symbol)
                    || !position.exchange.eq_ignore_ascii_case(exchange)
                    || position.product != *product
                {
                    continue;
                }
            }
            let intent = OrderIntent {
                symbol: position.symbol.clone(),
                exchange: position.exchange.clone(),
                side: if position.quantity > 0 {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                },
                quantity: position.quantity.abs(),
                product: position.product,
                price_type: PriceType::Market,
                price: 0.0,
                trigger_price: 0.0,
                strategy: None,
            };
            closed.push(self.place_order_for(&intent, None).await?);
        }
        Ok(closed)
    }

    /// Place a list of orders, emitting batch-tagged order events.
    pub async fn basket_order(&self, intents: &[OrderIntent]) -> CoreResult<Vec<LegResult>> {
        if intents.is_empty() {
            return Err(CoreError::PayloadInvalid("empty basket".into()));
        }
        let mut legs = Vec::with_capacity(intents.len());
        let last = intents.len() - 1;
        for (i, intent) in intents.iter().enumerate() {
            let result = self.place_order_quiet(intent).await;
            match &result {
                Ok(order) => self.events.publish(Event::OrderEvent {
                    symbol: order.symbol.clone(),
                    action: order.side,
                    order_id: order.order_id.clone(),
                    batch_order: Some(true),
                    is_last_order: Some(i == last),
                }),
                Err(e) => {
                    tracing::warn!(symbol = %intent.symbol, error = %e, "basket leg failed")
                }
            }
            legs.push(LegResult {
                symbol: intent.symbol.clone(),
                success: result.is_ok(),
                order_id: result.as_ref().ok().map(|o| o.order_id.clone()),
                error: result.err().map(|e| e.to_string()),
            });
        }
        Ok(legs)
    }

    /// Split a large order into market-order chunks of at most
    /// `split_size`, preserving basket event semantics.
    pub async fn split_order(
        &self,
        intent: &OrderIntent,
        split_size: i64,
    ) -> CoreResult<Vec<LegResult>> {
        if split_size <= 0 {
            return Err(CoreError::PayloadInvalid("split size must be positive".into()));
        }
        let mut remaining = intent.quantity;
        let mut chunks = Vec::new();
        while remaining > 0 {
            let qty = remaining.min(split_size);
            let mut chunk = intent.clone();
            chunk.quantity = qty;
            chunks.push(chunk);
            remaining -= qty;
        }
        self.basket_order(&chunks).await
    }

    /// Place without the per-order event (basket paths emit their own).
    async fn place_order_quiet(&self, intent: &OrderIntent) -> CoreResult<Order> {
        if self.analyzer_on().await? {
            return self.simulate_order("placeorder", intent, None).await;
        }
        let (adapter, session) = self.active().await?;
        let started = Instant::now();
        let result = brokers::with_deadline(
            self.rpc_deadline(),
            adapter.place_order(&session.auth_token, intent),
        )
        .await;
        self.record_op("placeorder", Some(&session.broker_id), started, result.is_ok())
            .await;
        result
    }

    // ---- books and account data ----

    pub async fn order_book(&self) -> CoreResult<Vec<Order>> {
        if self.analyzer_on().await? {
            return self.sandbox.order_book().await;
        }
        let (adapter, session) = self.active().await?;
        let started = Instant::now();
        let token = session.auth_token.clone();
        let result = self
            .read_with_retry(|| {
                let adapter = Arc::clone(&adapter);
                let token = token.clone();
                async move { adapter.get_order_book(&token).await }
            })
            .await;
        self.record_op("orderbook", Some(&session.broker_id), started, result.is_ok())
            .await;
        result
    }

    pub async fn order_status(&self, order_id: &str) -> CoreResult<Order> {
        if self.analyzer_on().await? {
            return self
                .sandbox
                .order_status(order_id)
                .await?
                .ok_or_else(|| CoreError::Upstream {
                    code: "ORDER_NOT_FOUND".into(),
                    message: format!("order {order_id} not found"),
                });
        }
        let book = self.order_book().await?;
        book.into_iter()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| CoreError::Upstream {
                code: "ORDER_NOT_FOUND".into(),
                message: format!("order {order_id} not found"),
            })
    }

    pub async fn trade_book(&self) -> CoreResult<Vec<Trade>> {
        if self.analyzer_on().await? {
            return self.sandbox.trade_book().await;
        }
        let (adapter, session) = self.active().await?;
        let started = Instant::now();
        let token = session.auth_token.clone();
        let result = self
            .read_with_retry(|| {
                let adapter = Arc::clone(&adapter);
                let token = token.clone();
                async move { adapter.get_trade_book(&token).await }
            })
            .await;
        self.record_op("tradebook", Some(&session.broker_id), started, result.is_ok())
            .await;
        result
    }

    pub async fn position_book(&self) -> CoreResult<Vec<Position>> {
        if self.analyzer_on().await? {
            return self.sandbox.positions().await;
        }
        let (adapter, session) = self.active().await?;
        let started = Instant::now();
        let token = session.auth_token.clone();
        let result = self
            .read_with_retry(|| {
                let adapter = Arc::clone(&adapter);
                let token = token.clone();
                async move { adapter.get_positions(&token).await }
            })
            .await;
        self.record_op("positionbook", Some(&session.broker_id), started, result.is_ok())
            .await;
        result
    }

    /// Net signed quantity for one (symbol, exchange, product).
    pub async fn open_position(
        &self,
        symbol: &str,
        exchange: &str,
        product: ProductType,
    ) -> CoreResult<i64> {
        let positions = self.position_book().await?;
        Ok(positions
            .iter()
            .filter(|p| {
                p.symbol.eq_ignore_ascii_case(symbol)
                    && p.exchange.eq_ignore_ascii_case(exchange)
                    && p.product == product
            })
            .map(|p| p.quantity)
            .sum())
    }

    pub async fn holdings(&self) -> CoreResult<Vec<Holding>> {
        if self.analyzer_on().await? {
            return self.sandbox.holdings().await;
        }
        let (adapter, session) = self.active().await?;
        let started = Instant::now();
        let token = session.auth_token.clone();
        let result = self
            .read_with_retry(|| {
                let adapter = Arc::clone(&adapter);
                let token = token.clone();
                async move { adapter.get_holdings(&token).await }
            })
            .await;
        self.record_op("holdings", Some(&session.broker_id), started, result.is_ok())
            .await;
        result
    }

    pub async fn funds(&self) -> CoreResult<Funds> {
        if self.analyzer_on().await? {
            return self.sandbox.funds().await;
        }
        let (adapter, session) = self.active().await?;
        let started = Instant::now();
        let token = session.auth_token.clone();
        let result = self
            .read_with_retry(|| {
                let adapter = Arc::clone(&adapter);
                let token = token.clone();
                async move { adapter.get_funds(&token).await }
            })
            .await;
        self.record_op("funds", Some(&session.broker_id), started, result.is_ok())
            .await;
        result
    }

    // ---- market data ----

    /// Open the active broker's market stream with the feed token and
    /// forward ticks onto the event bus until the stream closes.
    pub async fn start_market_stream(&self) -> CoreResult<()> {
        let (adapter, session) = self.active().await?;
        let feed_token = session.feed_token.clone().ok_or_else(|| {
            CoreError::PayloadInvalid("active session has no feed token".into())
        })?;
        let broker_id = session.broker_id.clone();

        let mut stream = match brokers::with_deadline(
            self.rpc_deadline(),
            adapter.open_market_stream(&feed_token),
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.events.publish(Event::WebsocketError {
                    broker_id,
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let events = self.events.clone();
        events.publish(Event::WebsocketConnected {
            broker_id: broker_id.clone(),
        });
        tokio::spawn(async move {
            while let Some(quote) = stream.recv().await {
                events.publish(Event::MarketTick {
                    symbol: quote.symbol,
                    exchange: quote.exchange,
                    last_price: quote.last_price,
                    timestamp: quote.timestamp,
                });
            }
            events.publish(Event::WebsocketDisconnected { broker_id });
        });
        Ok(())
    }

    pub async fn quotes(&self, symbols: &[(String, String)]) -> CoreResult<Vec<Quote>> {
        if symbols.is_empty() {
            return Err(CoreError::PayloadInvalid("no symbols requested".into()));
        }
        if self.analyzer_on().await? {
            return Ok(symbols
                .iter()
                .map(|(exchange, symbol)| self.sandbox.quote(exchange, symbol))
                .collect());
        }
        let (adapter, session) = self.active().await?;
        let started = Instant::now();
        let token = session.auth_token.clone();
        let wanted = symbols.to_vec();
        let result = self
            .read_with_retry(|| {
                let adapter = Arc::clone(&adapter);
                let token = token.clone();
                let wanted = wanted.clone();
                async move { adapter.get_quotes(&token, &wanted).await }
            })
            .await;
        self.record_op("quotes", Some(&session.broker_id), started, result.is_ok())
            .await;
        result
    }

    pub async fn quote(&self, exchange: &str, symbol: &str) -> CoreResult<Quote> {
        let quotes = self
            .quotes(&[(exchange.to_string(), symbol.to_string())])
            .await?;
        quotes.into_iter().next().ok_or_else(|| CoreError::Upstream {
            code: "NO_QUOTE".into(),
            message: format!("no quote for {exchange}:{symbol}"),
        })
    }

    pub async fn market_depth(&self, exchange: &str, symbol: &str) -> CoreResult<Depth> {
        if self.analyzer_on().await? {
            return Ok(self.sandbox.depth(exchange, symbol));
        }
        let (adapter, session) = self.active().await?;
        let started = Instant::now();
        let token = session.auth_token.clone();
        let exchange = exchange.to_string();
        let symbol = symbol.to_string();
        let result = self
            .read_with_retry(|| {
                let adapter = Arc::clone(&adapter);
                let token = token.clone();
                let exchange = exchange.clone();
                let symbol = symbol.clone();
                async move { adapter.get_market_depth(&token, &exchange, &symbol).await }
            })
            .await;
        self.record_op("depth", Some(&session.broker_id), started, result.is_ok())
            .await;
        result
    }

    /// Margin required to carry a basket of intents, priced off live quotes
    /// (limit price when one is set).
    pub async fn margin_estimate(&self, intents: &[OrderIntent]) -> CoreResult<f64> {
        if intents.is_empty() {
            return Ok(0.0);
        }
        let pairs: Vec<(String, String)> = intents
            .iter()
            .map(|i| (i.exchange.clone(), i.symbol.clone()))
            .collect();
        let quotes = self.quotes(&pairs).await?;
        let mut total = 0.0;
        for intent in intents {
            let price = if intent.price > 0.0 {
                intent.price
            } else {
                quotes
                    .iter()
                    .find(|q| q.symbol.eq_ignore_ascii_case(&intent.symbol))
                    .map(|q| q.last_price)
                    .unwrap_or(0.0)
            };
            total += price * intent.quantity as f64 * margin_factor(intent.product);
        }
        Ok(total)
    }

    // ---- history ----

    pub fn intervals(&self) -> Vec<String> {
        SUPPORTED_INTERVALS.iter().map(|s| s.to_string()).collect()
    }

    pub async fn history(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
        from: i64,
        to: i64,
    ) -> CoreResult<Vec<HistoricalBar>> {
        if !SUPPORTED_INTERVALS.contains(&interval) {
            return Err(CoreError::PayloadInvalid(format!(
                "unsupported interval '{interval}'"
            )));
        }
        self.history
            .query_bars(exchange, symbol, interval, from, to)
            .await
    }

    /// Ingestion side of the analytical store (stream consumers, imports).
    pub async fn ingest_history(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
        bars: Vec<HistoricalBar>,
    ) -> CoreResult<usize> {
        if !SUPPORTED_INTERVALS.contains(&interval) {
            return Err(CoreError::PayloadInvalid(format!(
                "unsupported interval '{interval}'"
            )));
        }
        self.history
            .append_bars(exchange, symbol, interval, bars)
            .await
    }

    // ---- symbol master ----

    /// Download the master contract from the active broker, persist it, and
    /// rebuild the in-memory index.
    pub async fn refresh_master(&self) -> CoreResult<usize> {
        let (adapter, session) = self.active().await?;
        let deadline = Duration::from_secs(self.cfg.master_timeout_secs);
        let started = Instant::now();
        let result = brokers::with_deadline(deadline, adapter.download_master_contract()).await;
        self.record_op("instruments", Some(&session.broker_id), started, result.is_ok())
            .await;
        let instruments = result?;
        if !instruments.is_empty() {
            db::replace_symbol_master(&self.pool, &instruments).await?;
        }
        self.symbols.load_from_db(&self.pool).await
    }

    pub async fn search_symbols(&self, query: &str, limit: i64) -> CoreResult<Vec<Instrument>> {
        db::search_symbols(&self.pool, query, limit.clamp(1, 200)).await
    }

    pub fn symbol_info(&self, exchange: &str, symbol: &str) -> CoreResult<Instrument> {
        self.symbols.lookup(exchange, symbol).ok_or_else(|| {
            CoreError::PayloadInvalid(format!("unknown symbol {exchange}:{symbol}"))
        })
    }

    // ---- analyzer / sandbox ----

    /// Toggle analyzer mode. Switching on makes sure the sandbox account
    /// exists; tokens and live sessions are untouched either way.
    pub async fn set_analyzer_mode(&self, enabled: bool) -> CoreResult<bool> {
        if enabled {
            self.sandbox.ensure_initialized().await?;
        }
        db::set_analyzer_mode(&self.pool, enabled).await?;
        tracing::info!(enabled, "analyzer mode toggled");
        Ok(enabled)
    }

    pub async fn analyzer_logs(&self, limit: i64) -> CoreResult<Vec<db::AnalyzerLog>> {
        db::recent_analyzer_logs(&self.pool, limit.clamp(1, 500)).await
    }

    pub async fn sandbox_reset(&self) -> CoreResult<()> {
        self.sandbox.reset().await
    }

    // ---- strategies ----

    pub async fn create_strategy(&self, new: &NewStrategy) -> CoreResult<Strategy> {
        ProductType::parse(&new.product)?;
        if new.quantity <= 0 {
            return Err(CoreError::PayloadInvalid("quantity must be positive".into()));
        }
        let webhook_id = Uuid::new_v4().to_string();
        let id = db::insert_strategy(&self.pool, new, &webhook_id).await?;
        db::get_strategy(&self.pool, id)
            .await?
            .ok_or_else(|| CoreError::internal("strategy vanished after insert"))
    }

    pub async fn list_strategies(&self) -> CoreResult<Vec<Strategy>> {
        db::list_strategies(&self.pool).await
    }

    pub async fn set_strategy_enabled(&self, id: i64, enabled: bool) -> CoreResult<()> {
        if !db::set_strategy_enabled(&self.pool, id, enabled).await? {
            return Err(CoreError::PayloadInvalid(format!("unknown strategy {id}")));
        }
        Ok(())
    }

    pub async fn delete_strategy(&self, id: i64) -> CoreResult<()> {
        if !db::soft_delete_strategy(&self.pool, id).await? {
            return Err(CoreError::PayloadInvalid(format!("unknown strategy {id}")));
        }
        Ok(())
    }

    pub async fn add_symbol_mapping(
        &self,
        strategy_id: i64,
        symbol: &str,
        exchange: &str,
        quantity: i64,
        product: &str,
    ) -> CoreResult<i64> {
        ProductType::parse(product)?;
        if db::get_strategy(&self.pool, strategy_id).await?.is_none() {
            return Err(CoreError::PayloadInvalid(format!(
                "unknown strategy {strategy_id}"
            )));
        }
        db::insert_symbol_mapping(&self.pool, strategy_id, symbol, exchange, quantity, product)
            .await
    }

    pub async fn symbol_mappings(&self, strategy_id: i64) -> CoreResult<Vec<SymbolMapping>> {
        db::list_symbol_mappings(&self.pool, strategy_id).await
    }

    // ---- observability ----

    pub async fn latency_stats(
        &self,
        op: Option<&str>,
        window_hours: i64,
    ) -> CoreResult<LatencySummary> {
        let since = Utc::now() - chrono::Duration::hours(window_hours.clamp(1, 24 * 30));
        db::latency_summary(&self.pool, op, since).await
    }

    pub async fn recent_traffic(&self, limit: i64) -> CoreResult<Vec<db::TrafficLog>> {
        db::recent_traffic(&self.pool, limit.clamp(1, 500)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::paper::PaperBroker;
    use crate::vault::{MasterSecrets, SecretVault};

    pub(crate) async fn test_services() -> Services {
        let pool = db::create_test_pool().await;
        let vault = Arc::new(SecretVault::from_secrets(MasterSecrets::generate()));
        let custodian = Arc::new(SessionCustodian::new(pool.clone(), vault.clone()));
        let identity = Arc::new(IdentityManager::new(pool.clone(), vault));
        let sandbox = Arc::new(SandboxEngine::new(pool.clone(), 1_000_000.0));
        let mut registry = BrokerRegistry::new();
        registry.register(Arc::new(PaperBroker::new(Arc::clone(&sandbox))));
        let dir = tempfile::tempdir().unwrap();
        Services::new(
            pool,
            custodian,
            identity,
            Arc::new(registry),
            sandbox,
            Arc::new(SymbolIndex::new()),
            Arc::new(OhlcvStore::new(dir.into_path())),
            EventBus::new(),
            crate::config::Config::default().broker,
        )
    }

    async fn login_and_connect(services: &Services) {
        services.identity().setup("alice", "password1").await.unwrap();
        services.identity().login("alice", "password1").await.unwrap();
        services
            .custodian()
            .save_credential("paper", "KEY", None, None)
            .await
            .unwrap();
        services.broker_login("paper", None).await.unwrap();
    }

    fn intent(symbol: &str, qty: i64) -> OrderIntent {
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
    async fn test_no_active_broker_without_login() {
        let services = test_services().await;
        assert!(matches!(
            services.order_book().await,
            Err(CoreError::NoActiveBroker)
        ));
        assert!(matches!(
            services.place_order(&intent("TCS", 1)).await,
            Err(CoreError::NoActiveBroker)
        ));
    }

    #[tokio::test]
    async fn test_order_flow_with_paper_broker() {
        let services = test_services().await;
        login_and_connect(&services).await;

        let order = services.place_order(&intent("TCS", 5)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Complete);
        assert_eq!(services.order_book().await.unwrap().len(), 1);
        assert_eq!(
            services
                .open_position("TCS", "NSE", ProductType::Mis)
                .await
                .unwrap(),
            5
        );
        // A latency record was written for the operation.
        let stats = services.latency_stats(Some("placeorder"), 1).await.unwrap();
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn test_smart_order_issues_delta() {
        let services = test_services().await;
        login_and_connect(&services).await;

        services.place_order(&intent("TCS", 5)).await.unwrap();
        let order = services
            .place_smart_order("TCS", "NSE", ProductType::Mis, 2, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.quantity, 3);
        assert_eq!(
            services
                .open_position("TCS", "NSE", ProductType::Mis)
                .await
                .unwrap(),
            2
        );

        // Already at target: no order.
        assert!(services
            .place_smart_order("TCS", "NSE", ProductType::Mis, 2, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_analyzer_mode_bypasses_adapter_and_logs() {
        let services = test_services().await;
        // No broker session at all: analyzer mode must still work.
        services.set_analyzer_mode(true).await.unwrap();

        let order = services.place_order(&intent("TCS", 10)).await.unwrap();
        assert!(order.order_id.starts_with("SB-"));

        let logs = services.analyzer_logs(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].decision.contains("placeorder"));

        // Session custody untouched.
        assert!(services.custodian().load_active_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_basket_emits_batch_events() {
        let services = test_services().await;
        login_and_connect(&services).await;
        let mut rx = services.events().subscribe();

        let legs = services
            .basket_order(&[intent("TCS", 1), intent("INFY", 2)])
            .await
            .unwrap();
        assert_eq!(legs.len(), 2);
        assert!(legs.iter().all(|l| l.success));

        let mut last_flags = Vec::new();
        for _ in 0..2 {
            if let Event::OrderEvent {
                batch_order,
                is_last_order,
                ..
            } = rx.recv().await.unwrap()
            {
                last_flags.push((batch_order, is_last_order));
            }
        }
        assert_eq!(
            last_flags,
            vec![(Some(true), Some(false)), (Some(true), Some(true))]
        );
    }

    #[tokio::test]
    async fn test_split_order_chunks() {
        let services = test_services().await;
        login_and_connect(&services).await;
        let legs = services.split_order(&intent("TCS", 25), 10).await.unwrap();
        assert_eq!(legs.len(), 3);
        assert_eq!(
            services
                .open_position("TCS", "NSE", ProductType::Mis)
                .await
                .unwrap(),
            25
        );
    }

    #[tokio::test]
    async fn test_market_stream_emits_connected_event() {
        let services = test_services().await;
        login_and_connect(&services).await;
        let mut rx = services.events().subscribe();

        services.start_market_stream().await.unwrap();
        match rx.recv().await.unwrap() {
            Event::WebsocketConnected { broker_id } => assert_eq!(broker_id, "paper"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_rejects_unknown_interval() {
        let services = test_services().await;
        assert!(matches!(
            services.history("NSE", "TCS", "7m", 0, 10).await,
            Err(CoreError::PayloadInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_strategy_crud() {
        let services = test_services().await;
        let strategy = services
            .create_strategy(&NewStrategy {
                name: "breakout".into(),
                exchange: "NSE".into(),
                symbol: "RELIANCE".into(),
                product: "MIS".into(),
                quantity: 1,
                platform: None,
                trade_window_start: None,
                trade_window_end: None,
            })
            .await
            .unwrap();
        assert!(!strategy.webhook_id.is_empty());

        services.set_strategy_enabled(strategy.id, false).await.unwrap();
        assert!(!services.list_strategies().await.unwrap()[0].enabled);

        services.delete_strategy(strategy.id).await.unwrap();
        assert!(services.list_strategies().await.unwrap().is_empty());
    }
}
