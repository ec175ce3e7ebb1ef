//! Paper broker: the capability set served entirely by the sandbox engine.
//!
//! Used for offline operation and by the test suite. Tokens are opaque
//! random strings with no upstream meaning; the "exchange" is the sandbox
//! mark-price table.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::brokers::{AuthCredentials, AuthTokens, BrokerAdapter, OrderModify, TickStream};
use crate::error::{CoreError, CoreResult};
use crate::sandbox::SandboxEngine;
use crate::types::{
    Depth, Funds, Holding, Instrument, Order, OrderIntent, Position, Quote, Trade,
};

pub const PAPER_BROKER_ID: &str = "paper";

pub struct PaperBroker {
    engine: Arc<SandboxEngine>,
}

impl PaperBroker {
    pub fn new(engine: Arc<SandboxEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn id(&self) -> &str {
        PAPER_BROKER_ID
    }

    async fn authenticate(&self, credentials: &AuthCredentials) -> CoreResult<AuthTokens> {
        if credentials.api_key.is_empty() {
            return Err(CoreError::Upstream {
                code: "INVALID_KEY".into(),
                message: "api key must not be empty".into(),
            });
        }
        self.engine.ensure_initialized().await?;
        Ok(AuthTokens {
            auth_token: format!("paper-auth-{}", Uuid::new_v4().simple()),
            feed_token: Some(format!("paper-feed-{}", Uuid::new_v4().simple())),
        })
    }

    async fn logout(&self, _auth_token: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn place_order(&self, _auth_token: &str, intent: &OrderIntent) -> CoreResult<Order> {
        self.engine.place_order(intent).await
    }

    async fn modify_order(
        &self,
        _auth_token: &str,
        order_id: &str,
        modify: &OrderModify,
    ) -> CoreResult<Order> {
        self.engine
            .modify_order(order_id, modify.quantity, modify.price, modify.trigger_price)
            .await
    }

    async fn cancel_order(&self, _auth_token: &str, order_id: &str) -> CoreResult<()> {
        self.engine.cancel_order(order_id).await
    }

    async fn get_order_book(&self, _auth_token: &str) -> CoreResult<Vec<Order>> {
        self.engine.order_book().await
    }

    async fn get_trade_book(&self, _auth_token: &str) -> CoreResult<Vec<Trade>> {
        self.engine.trade_book().await
    }

    async fn get_positions(&self, _auth_token: &str) -> CoreResult<Vec<Position>> {
        self.engine.positions().await
    }

    async fn get_holdings(&self, _auth_token: &str) -> CoreResult<Vec<Holding>> {
        self.engine.holdings().await
    }

    async fn get_funds(&self, _auth_token: &str) -> CoreResult<Funds> {
        self.engine.funds().await
    }

    async fn get_quotes(
        &self,
        _auth_token: &str,
        symbols: &[(String, String)],
    ) -> CoreResult<Vec<Quote>> {
        Ok(symbols
            .iter()
            .map(|(exchange, symbol)| self.engine.quote(exchange, symbol))
            .collect())
    }

    async fn get_market_depth(
        &self,
        _auth_token: &str,
        exchange: &str,
        symbol: &str,
    ) -> CoreResult<Depth> {
        Ok(self.engine.depth(exchange, symbol))
    }

    async fn download_master_contract(&self) -> CoreResult<Vec<Instrument>> {
        // The paper broker trades whatever master is already loaded; it has
        // no upstream contract file of its own.
        Ok(Vec::new())
    }

    async fn open_market_stream(&self, _feed_token: &str) -> CoreResult<TickStream> {
        // No live feed; hold the sender open so the stream stays connected
        // but silent until the subscriber hangs up.
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            tx.closed().await;
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSide, PriceType, ProductType};

    async fn broker() -> PaperBroker {
        let pool = crate::db::create_test_pool().await;
        let engine = Arc::new(SandboxEngine::new(pool, 1_000_000.0));
        PaperBroker::new(engine)
    }

    #[tokio::test]
    async fn test_authenticate_issues_distinct_tokens() {
        let broker = broker().await;
        let creds = AuthCredentials {
            api_key: "key".into(),
            api_secret: None,
            client_id: None,
            auth_code: None,
        };
        let a = broker.authenticate(&creds).await.unwrap();
        let b = broker.authenticate(&creds).await.unwrap();
        assert_ne!(a.auth_token, b.auth_token);
        assert!(a.feed_token.is_some());
    }

    #[tokio::test]
    async fn test_empty_api_key_rejected() {
        let broker = broker().await;
        let creds = AuthCredentials {
            api_key: "".into(),
            api_secret: None,
            client_id: None,
            auth_code: None,
        };
        assert!(matches!(
            broker.authenticate(&creds).await,
            Err(CoreError::Upstream { .. })
        ));
    }

    #[tokio::test]
    async fn test_order_round_trip_through_capability_set() {
        let broker = broker().await;
        let intent = OrderIntent {
            symbol: "TCS".into(),
            exchange: "NSE".into(),
            side: OrderSide::Buy,
            quantity: 1,
            product: ProductType::Mis,
            price_type: PriceType::Market,
            price: 0.0,
            trigger_price: 0.0,
            strategy: None,
        };
        let order = broker.place_order("t", &intent).await.unwrap();
        let book = broker.get_order_book("t").await.unwrap();
        assert!(book.iter().any(|o| o.order_id == order.order_id));
        assert_eq!(broker.get_positions("t").await.unwrap().len(), 1);
    }
}
