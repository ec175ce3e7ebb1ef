//! IPC server implementation: thin delegation from the RPC trait onto the
//! services facade, plus the event subscription forwarder.

use std::sync::Arc;

use chrono::NaiveDate;
use jsonrpsee::core::SubscriptionResult;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use jsonrpsee::{PendingSubscriptionSink, SubscriptionMessage};
use serde_json::Value;
use tokio::sync::broadcast;

use super::{to_rpc_error, DeskRpcServer, SettingsInfo};
use crate::autologout::RescheduleHandle;
use crate::brokers::OrderModify;
use crate::db::{
    self, AnalyzerLog, AutoLogoutConfig, IpBan, LatencySummary, NewStrategy, Strategy,
    SymbolMapping, TrafficLog, WebhookServerConfig,
};
use crate::error::{CoreError, CoreResult};
use crate::identity::SessionState;
use crate::services::options::{Greeks, GreeksRequest, OptionChainRow, OptionOrderRequest,
    SyntheticFuture};
use crate::services::{LegResult, Services};
use crate::types::{
    Depth, Funds, Holding, HistoricalBar, Instrument, Order, OrderIntent, Position, ProductType,
    Quote, Trade,
};

pub struct DeskRpcImpl {
    services: Arc<Services>,
    reschedule: RescheduleHandle,
}

impl DeskRpcImpl {
    pub fn new(services: Arc<Services>, reschedule: RescheduleHandle) -> Self {
        Self {
            services,
            reschedule,
        }
    }
}

/// Bind the IPC server (loopback) and start serving.
pub async fn serve(
    bind_addr: &str,
    services: Arc<Services>,
    reschedule: RescheduleHandle,
) -> CoreResult<ServerHandle> {
    let server = Server::builder()
        .build(bind_addr)
        .await
        .map_err(|e| CoreError::internal(format!("bind ipc {bind_addr}: {e}")))?;
    let addr = server
        .local_addr()
        .map_err(|e| CoreError::internal(format!("ipc local addr: {e}")))?;
    let handle = server.start(DeskRpcImpl::new(services, reschedule).into_rpc());
    tracing::info!(%addr, "ipc surface listening");
    Ok(handle)
}

fn rpc<T>(result: CoreResult<T>) -> Result<T, ErrorObjectOwned> {
    result.map_err(to_rpc_error)
}

fn parse_product(product: &str) -> Result<ProductType, ErrorObjectOwned> {
    ProductType::parse(product).map_err(to_rpc_error)
}

#[jsonrpsee::core::async_trait]
impl DeskRpcServer for DeskRpcImpl {
    async fn setup(
        &self,
        username: String,
        password: String,
    ) -> Result<SessionState, ErrorObjectOwned> {
        rpc(self.services.identity().setup(&username, &password).await)?;
        rpc(self.services.identity().check_session().await)
    }

    async fn login(
        &self,
        username: String,
        password: String,
    ) -> Result<SessionState, ErrorObjectOwned> {
        rpc(self.services.identity().login(&username, &password).await)
    }

    async fn logout(&self) -> Result<(), ErrorObjectOwned> {
        self.services.identity().logout();
        Ok(())
    }

    async fn check_session(&self) -> Result<SessionState, ErrorObjectOwned> {
        rpc(self.services.identity().check_session().await)
    }

    async fn regenerate_api_key(&self) -> Result<String, ErrorObjectOwned> {
        rpc(self.services.identity().regenerate_api_key().await)
    }

    async fn reveal_api_key(&self) -> Result<Option<String>, ErrorObjectOwned> {
        rpc(self.services.identity().reveal_api_key().await)
    }

    async fn brokers(&self) -> Result<Vec<String>, ErrorObjectOwned> {
        Ok(self.services.broker_ids())
    }

    async fn save_broker_credential(
        &self,
        broker_id: String,
        api_key: String,
        api_secret: Option<String>,
        client_id: Option<String>,
    ) -> Result<(), ErrorObjectOwned> {
        rpc(self.services.identity().require_user().map(|_| ()))?;
        rpc(self
            .services
            .custodian()
            .save_credential(
                &broker_id,
                &api_key,
                api_secret.as_deref(),
                client_id.as_deref(),
            )
            .await)
    }

    async fn delete_broker_credential(&self, broker_id: String)
        -> Result<bool, ErrorObjectOwned> {
        rpc(self.services.identity().require_user().map(|_| ()))?;
        rpc(self.services.custodian().delete_credential(&broker_id).await)
    }

    async fn list_broker_credentials(&self) -> Result<Vec<String>, ErrorObjectOwned> {
        rpc(self.services.custodian().list_credential_brokers().await)
    }

    async fn broker_login(
        &self,
        broker_id: String,
        auth_code: Option<String>,
    ) -> Result<(), ErrorObjectOwned> {
        rpc(self.services.broker_login(&broker_id, auth_code).await)
    }

    async fn broker_logout(&self) -> Result<(), ErrorObjectOwned> {
        rpc(self.services.broker_logout().await)
    }

    async fn active_broker(&self) -> Result<Option<String>, ErrorObjectOwned> {
        rpc(self.services.custodian().active_broker().await)
    }

    async fn get_settings(&self) -> Result<SettingsInfo, ErrorObjectOwned> {
        let settings = rpc(db::get_settings(self.services.pool()).await)?;
        Ok(SettingsInfo {
            default_broker: settings.default_broker.clone(),
            analyzer_mode: settings.analyzer_mode,
            ui_prefs: serde_json::from_str(&settings.ui_prefs)
                .unwrap_or(Value::Object(Default::default())),
            auto_logout: settings.auto_logout(),
            webhook: settings.webhook_server(),
        })
    }

    async fn update_auto_logout(&self, cfg: AutoLogoutConfig) -> Result<(), ErrorObjectOwned> {
        rpc(db::update_auto_logout(self.services.pool(), &cfg).await)?;
        self.reschedule.reschedule();
        Ok(())
    }

    async fn update_webhook_server(
        &self,
        cfg: WebhookServerConfig,
    ) -> Result<(), ErrorObjectOwned> {
        rpc(db::update_webhook_server(self.services.pool(), &cfg).await)?;
        tracing::info!("webhook server settings updated; applied on next start");
        Ok(())
    }

    async fn set_ui_prefs(&self, prefs: Value) -> Result<(), ErrorObjectOwned> {
        let text = prefs.to_string();
        rpc(db::set_ui_prefs(self.services.pool(), &text).await)
    }

    async fn reschedule_auto_logout(&self) -> Result<(), ErrorObjectOwned> {
        self.reschedule.reschedule();
        Ok(())
    }

    async fn create_strategy(&self, new: NewStrategy) -> Result<Strategy, ErrorObjectOwned> {
        rpc(self.services.create_strategy(&new).await)
    }

    async fn list_strategies(&self) -> Result<Vec<Strategy>, ErrorObjectOwned> {
        rpc(self.services.list_strategies().await)
    }

    async fn set_strategy_enabled(&self, id: i64, enabled: bool)
        -> Result<(), ErrorObjectOwned> {
        rpc(self.services.set_strategy_enabled(id, enabled).await)
    }

    async fn delete_strategy(&self, id: i64) -> Result<(), ErrorObjectOwned> {
        rpc(self.services.delete_strategy(id).await)
    }

    async fn add_symbol_mapping(
        &self,
        strategy_id: i64,
        symbol: String,
        exchange: String,
        quantity: i64,
        product: String,
    ) -> Result<i64, ErrorObjectOwned> {
        rpc(self
            .services
            .add_symbol_mapping(strategy_id, &symbol, &exchange, quantity, &product)
            .await)
    }

    async fn list_symbol_mappings(
        &self,
        strategy_id: i64,
    ) -> Result<Vec<SymbolMapping>, ErrorObjectOwned> {
        rpc(self.services.symbol_mappings(strategy_id).await)
    }

    async fn place_order(&self, intent: OrderIntent) -> Result<Order, ErrorObjectOwned> {
        rpc(self.services.place_order(&intent).await)
    }

    async fn place_smart_order(
        &self,
        symbol: String,
        exchange: String,
        product: String,
        position_size: i64,
    ) -> Result<Option<Order>, ErrorObjectOwned> {
        let product = parse_product(&product)?;
        rpc(self
            .services
            .place_smart_order(&symbol, &exchange, product, position_size, None)
            .await)
    }

    async fn modify_order(
        &self,
        order_id: String,
        modify: OrderModify,
    ) -> Result<Order, ErrorObjectOwned> {
        rpc(self.services.modify_order(&order_id, &modify).await)
    }

    async fn cancel_order(&self, order_id: String) -> Result<(), ErrorObjectOwned> {
        rpc(self.services.cancel_order(&order_id).await)
    }

    async fn cancel_all_orders(&self) -> Result<Vec<String>, ErrorObjectOwned> {
        rpc(self.services.cancel_all_orders().await)
    }

    async fn close_positions(
        &self,
        symbol: Option<String>,
        exchange: Option<String>,
        product: Option<String>,
    ) -> Result<Vec<Order>, ErrorObjectOwned> {
        let filter = match (symbol, exchange) {
            (Some(symbol), Some(exchange)) => {
                let product = parse_product(product.as_deref().unwrap_or("MIS"))?;
                Some((symbol, exchange, product))
            }
            _ => None,
        };
        rpc(self.services.close_positions(filter).await)
    }

    async fn basket_order(
        &self,
        intents: Vec<OrderIntent>,
    ) -> Result<Vec<LegResult>, ErrorObjectOwned> {
        rpc(self.services.basket_order(&intents).await)
    }

    async fn split_order(
        &self,
        intent: OrderIntent,
        split_size: i64,
    ) -> Result<Vec<LegResult>, ErrorObjectOwned> {
        rpc(self.services.split_order(&intent, split_size).await)
    }

    async fn order_book(&self) -> Result<Vec<Order>, ErrorObjectOwned> {
        rpc(self.services.order_book().await)
    }

    async fn trade_book(&self) -> Result<Vec<Trade>, ErrorObjectOwned> {
        rpc(self.services.trade_book().await)
    }

    async fn position_book(&self) -> Result<Vec<Position>, ErrorObjectOwned> {
        rpc(self.services.position_book().await)
    }

    async fn holdings(&self) -> Result<Vec<Holding>, ErrorObjectOwned> {
        rpc(self.services.holdings().await)
    }

    async fn funds(&self) -> Result<Funds, ErrorObjectOwned> {
        rpc(self.services.funds().await)
    }

    async fn order_status(&self, order_id: String) -> Result<Order, ErrorObjectOwned> {
        rpc(self.services.order_status(&order_id).await)
    }

    async fn open_position(
        &self,
        symbol: String,
        exchange: String,
        product: String,
    ) -> Result<i64, ErrorObjectOwned> {
        let product = parse_product(&product)?;
        rpc(self.services.open_position(&symbol, &exchange, product).await)
    }

    async fn quotes(
        &self,
        symbols: Vec<(String, String)>,
    ) -> Result<Vec<Quote>, ErrorObjectOwned> {
        rpc(self.services.quotes(&symbols).await)
    }

    async fn depth(&self, exchange: String, symbol: String) -> Result<Depth, ErrorObjectOwned> {
        rpc(self.services.market_depth(&exchange, &symbol).await)
    }

    async fn history(
        &self,
        exchange: String,
        symbol: String,
        interval: String,
        from: i64,
        to: i64,
    ) -> Result<Vec<HistoricalBar>, ErrorObjectOwned> {
        rpc(self
            .services
            .history(&exchange, &symbol, &interval, from, to)
            .await)
    }

    async fn intervals(&self) -> Result<Vec<String>, ErrorObjectOwned> {
        Ok(self.services.intervals())
    }

    async fn search_symbols(
        &self,
        query: String,
        limit: Option<i64>,
    ) -> Result<Vec<Instrument>, ErrorObjectOwned> {
        rpc(self.services.search_symbols(&query, limit.unwrap_or(50)).await)
    }

    async fn symbol_info(
        &self,
        exchange: String,
        symbol: String,
    ) -> Result<Instrument, ErrorObjectOwned> {
        rpc(self.services.symbol_info(&exchange, &symbol))
    }

    async fn refresh_master(&self) -> Result<usize, ErrorObjectOwned> {
        rpc(self.services.refresh_master().await)
    }

    async fn start_market_stream(&self) -> Result<(), ErrorObjectOwned> {
        rpc(self.services.start_market_stream().await)
    }

    async fn option_expiries(
        &self,
        exchange: String,
        underlying: String,
    ) -> Result<Vec<NaiveDate>, ErrorObjectOwned> {
        rpc(self.services.option_expiries(&exchange, &underlying).await)
    }

    async fn option_chain(
        &self,
        exchange: String,
        underlying: String,
        expiry: Option<NaiveDate>,
    ) -> Result<Vec<OptionChainRow>, ErrorObjectOwned> {
        rpc(self.services.option_chain(&exchange, &underlying, expiry).await)
    }

    async fn option_greeks(&self, req: GreeksRequest) -> Result<Greeks, ErrorObjectOwned> {
        rpc(self.services.option_greeks(&req).await)
    }

    async fn synthetic_future(
        &self,
        exchange: String,
        underlying: String,
        expiry: NaiveDate,
    ) -> Result<SyntheticFuture, ErrorObjectOwned> {
        rpc(self
            .services
            .synthetic_future(&exchange, &underlying, expiry)
            .await)
    }

    async fn options_order(&self, req: OptionOrderRequest) -> Result<Order, ErrorObjectOwned> {
        rpc(self.services.options_order(&req).await)
    }

    async fn options_multi_order(
        &self,
        legs: Vec<OptionOrderRequest>,
    ) -> Result<Vec<LegResult>, ErrorObjectOwned> {
        rpc(self.services.options_multi_order(&legs).await)
    }

    async fn set_analyzer_mode(&self, enabled: bool) -> Result<bool, ErrorObjectOwned> {
        rpc(self.services.set_analyzer_mode(enabled).await)
    }

    async fn analyzer_status(&self) -> Result<bool, ErrorObjectOwned> {
        rpc(self.services.analyzer_on().await)
    }

    async fn analyzer_logs(&self, limit: Option<i64>)
        -> Result<Vec<AnalyzerLog>, ErrorObjectOwned> {
        rpc(self.services.analyzer_logs(limit.unwrap_or(50)).await)
    }

    async fn sandbox_reset(&self) -> Result<(), ErrorObjectOwned> {
        rpc(self.services.sandbox_reset().await)
    }

    async fn latency_stats(
        &self,
        op: Option<String>,
        window_hours: Option<i64>,
    ) -> Result<LatencySummary, ErrorObjectOwned> {
        rpc(self
            .services
            .latency_stats(op.as_deref(), window_hours.unwrap_or(24))
            .await)
    }

    async fn recent_traffic(&self, limit: Option<i64>)
        -> Result<Vec<TrafficLog>, ErrorObjectOwned> {
        rpc(self.services.recent_traffic(limit.unwrap_or(100)).await)
    }

    async fn list_bans(&self) -> Result<Vec<IpBan>, ErrorObjectOwned> {
        rpc(db::list_bans(self.services.pool()).await)
    }

    async fn remove_ban(&self, ip: String) -> Result<bool, ErrorObjectOwned> {
        rpc(self.services.identity().require_user().map(|_| ()))?;
        rpc(db::remove_ban(self.services.pool(), &ip).await)
    }

    async fn subscribe_events(&self, pending: PendingSubscriptionSink) -> SubscriptionResult {
        let mut rx = self.services.events().subscribe();
        let sink = pending.accept().await?;

        // Forward from the broadcast bus until the client hangs up.
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match SubscriptionMessage::from_json(&event) {
                        Ok(msg) => {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }
}
