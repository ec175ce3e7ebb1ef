//! Broker adapter capability set and registry.
//!
//! The services layer talks to brokers exclusively through [`BrokerAdapter`]
//! and never sees an upstream payload shape. One implementation exists per
//! supported broker; the active broker is resolved by id from the session
//! custodian. Every call is asynchronous, cancellable (dropping the future
//! aborts the call) and wrapped in a bounded deadline by the caller.

pub mod paper;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CoreError, CoreResult};
use crate::types::{
    Depth, Funds, Holding, Instrument, Order, OrderIntent, Position, PriceType, Quote, Trade,
};

/// Decrypted credential material handed to `authenticate`.
#[derive(Debug, Clone)]
pub struct AuthCredentials {
    pub api_key: String,
    pub api_secret: Option<String>,
    pub client_id: Option<String>,
    /// OAuth authorization code for redirect-based brokers.
    pub auth_code: Option<String>,
}

/// Tokens issued by a successful broker login.
#[derive(Debug, Clone)]
pub struct AuthTokens {
    pub auth_token: String,
    /// Secondary credential for the market-data stream, when the broker
    /// issues one.
    pub feed_token: Option<String>,
}

/// Mutable fields of an open order.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct OrderModify {
    pub quantity: Option<i64>,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    #[serde(alias = "pricetype")]
    pub price_type: Option<PriceType>,
}

/// Live quote stream handle. The stream closes when the broker connection
/// drops or the receiver is dropped.
pub type TickStream = mpsc::Receiver<Quote>;

/// The closed capability set every broker adapter implements.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn id(&self) -> &str;

    async fn authenticate(&self, credentials: &AuthCredentials) -> CoreResult<AuthTokens>;

    /// Invalidate the auth token upstream. Best-effort; callers bound it
    /// with a short deadline and do not retry.
    async fn logout(&self, auth_token: &str) -> CoreResult<()>;

    async fn place_order(&self, auth_token: &str, intent: &OrderIntent) -> CoreResult<Order>;

    async fn modify_order(
        &self,
        auth_token: &str,
        order_id: &str,
        modify: &OrderModify,
    ) -> CoreResult<Order>;

    async fn cancel_order(&self, auth_token: &str, order_id: &str) -> CoreResult<()>;

    async fn get_order_book(&self, auth_token: &str) -> CoreResult<Vec<Order>>;

    async fn get_trade_book(&self, auth_token: &str) -> CoreResult<Vec<Trade>>;

    async fn get_positions(&self, auth_token: &str) -> CoreResult<Vec<Position>>;

    async fn get_holdings(&self, auth_token: &str) -> CoreResult<Vec<Holding>>;

    async fn get_funds(&self, auth_token: &str) -> CoreResult<Funds>;

    /// Batch quote fetch; `symbols` are (exchange, symbol) pairs.
    async fn get_quotes(
        &self,
        auth_token: &str,
        symbols: &[(String, String)],
    ) -> CoreResult<Vec<Quote>>;

    async fn get_market_depth(
        &self,
        auth_token: &str,
        exchange: &str,
        symbol: &str,
    ) -> CoreResult<Depth>;

    /// Full instrument master for this broker.
    async fn download_master_contract(&self) -> CoreResult<Vec<Instrument>>;

    /// Open the market-data stream with the feed token.
    async fn open_market_stream(&self, feed_token: &str) -> CoreResult<TickStream>;
}

/// Adapters keyed by broker id. Built once at startup, read-only after.
pub struct BrokerRegistry {
    adapters: HashMap<String, Arc<dyn BrokerAdapter>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn BrokerAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, broker_id: &str) -> CoreResult<Arc<dyn BrokerAdapter>> {
        self.adapters
            .get(broker_id)
            .cloned()
            .ok_or_else(|| CoreError::PayloadInvalid(format!("unsupported broker '{broker_id}'")))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for BrokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Bound an outbound broker call by a deadline; overruns surface as
/// [`CoreError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_resolves_by_id() {
        let pool = crate::db::create_test_pool().await;
        let engine = Arc::new(crate::sandbox::SandboxEngine::new(pool, 1_000_000.0));
        let mut registry = BrokerRegistry::new();
        registry.register(Arc::new(paper::PaperBroker::new(engine)));

        assert!(registry.get("paper").is_ok());
        assert!(matches!(
            registry.get("unknown"),
            Err(CoreError::PayloadInvalid(_))
        ));
        assert_eq!(registry.ids(), vec!["paper".to_string()]);
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let result: CoreResult<()> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CoreError::Timeout(_))));
    }
}
