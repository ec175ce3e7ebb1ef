//! JSON-RPC API definition for the daemon <-> UI channel (C8).
//!
//! The daemon implements the server side; the UI holds the client. Every
//! capability is a command here; server-pushed events arrive through the
//! `subscribeEvents` subscription. The listener binds loopback only.

pub mod server;

use chrono::NaiveDate;
use jsonrpsee::core::SubscriptionResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::brokers::OrderModify;
use crate::db::{
    AnalyzerLog, AutoLogoutConfig, IpBan, LatencySummary, NewStrategy, Strategy, SymbolMapping,
    TrafficLog, WebhookServerConfig,
};
use crate::error::CoreError;
use crate::events::Event;
use crate::identity::SessionState;
use crate::services::options::{Greeks, GreeksRequest, OptionChainRow, OptionOrderRequest,
    SyntheticFuture};
use crate::services::LegResult;
use crate::types::{
    Depth, Funds, Holding, HistoricalBar, Instrument, Order, OrderIntent, Position, Quote, Trade,
};

/// JSON-RPC error codes carried alongside the structured core code.
pub mod error_codes {
    pub const PAYLOAD_INVALID: i32 = -32001;
    pub const NOT_AUTHENTICATED: i32 = -32002;
    pub const NO_ACTIVE_BROKER: i32 = -32003;
    pub const RATE_LIMITED: i32 = -32004;
    pub const UPSTREAM: i32 = -32005;
    pub const TIMEOUT: i32 = -32006;
    pub const VAULT: i32 = -32007;
    pub const INTERNAL: i32 = -32000;
}

/// Map a core error onto the wire, keeping the structured code in `data`.
pub fn to_rpc_error(err: CoreError) -> ErrorObjectOwned {
    let code = match &err {
        CoreError::PayloadInvalid(_) | CoreError::AlreadyInitialized => {
            error_codes::PAYLOAD_INVALID
        }
        CoreError::NotAuthenticated => error_codes::NOT_AUTHENTICATED,
        CoreError::NoActiveBroker | CoreError::SessionCorrupted => error_codes::NO_ACTIVE_BROKER,
        CoreError::RateLimited { .. } | CoreError::Banned { .. } => error_codes::RATE_LIMITED,
        CoreError::Upstream { .. } => error_codes::UPSTREAM,
        CoreError::Timeout(_) => error_codes::TIMEOUT,
        CoreError::VaultUnavailable(_)
        | CoreError::CryptoFailure(_)
        | CoreError::AuthTagMismatch => error_codes::VAULT,
        _ => error_codes::INTERNAL,
    };
    ErrorObjectOwned::owned(code, err.to_string(), Some(err.code()))
}

/// Settings snapshot for the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsInfo {
    pub default_broker: Option<String>,
    pub analyzer_mode: bool,
    pub ui_prefs: Value,
    pub auto_logout: AutoLogoutConfig,
    pub webhook: WebhookServerConfig,
}

#[rpc(server, namespace = "desk")]
pub trait DeskRpc {
    // ---- identity ----

    /// Create the local user (one-shot).
    #[method(name = "setup")]
    async fn setup(&self, username: String, password: String)
        -> Result<SessionState, ErrorObjectOwned>;

    #[method(name = "login")]
    async fn login(&self, username: String, password: String)
        -> Result<SessionState, ErrorObjectOwned>;

    #[method(name = "logout")]
    async fn logout(&self) -> Result<(), ErrorObjectOwned>;

    /// Current identity state, side-effect free.
    #[method(name = "checkSession")]
    async fn check_session(&self) -> Result<SessionState, ErrorObjectOwned>;

    /// Rotate the admission API key; the cleartext is returned once.
    #[method(name = "regenerateApiKey")]
    async fn regenerate_api_key(&self) -> Result<String, ErrorObjectOwned>;

    #[method(name = "revealApiKey")]
    async fn reveal_api_key(&self) -> Result<Option<String>, ErrorObjectOwned>;

    // ---- brokers ----

    /// Supported broker ids.
    #[method(name = "brokers")]
    async fn brokers(&self) -> Result<Vec<String>, ErrorObjectOwned>;

    #[method(name = "saveBrokerCredential")]
    async fn save_broker_credential(
        &self,
        broker_id: String,
        api_key: String,
        api_secret: Option<String>,
        client_id: Option<String>,
    ) -> Result<(), ErrorObjectOwned>;

    #[method(name = "deleteBrokerCredential")]
    async fn delete_broker_credential(&self, broker_id: String)
        -> Result<bool, ErrorObjectOwned>;

    #[method(name = "listBrokerCredentials")]
    async fn list_broker_credentials(&self) -> Result<Vec<String>, ErrorObjectOwned>;

    /// Authenticate upstream and custody the issued tokens. For
    /// redirect-auth brokers the UI passes the code received via the
    /// `oauth_callback` event.
    #[method(name = "brokerLogin")]
    async fn broker_login(
        &self,
        broker_id: String,
        auth_code: Option<String>,
    ) -> Result<(), ErrorObjectOwned>;

    #[method(name = "brokerLogout")]
    async fn broker_logout(&self) -> Result<(), ErrorObjectOwned>;

    #[method(name = "activeBroker")]
    async fn active_broker(&self) -> Result<Option<String>, ErrorObjectOwned>;

    // ---- settings ----

    #[method(name = "getSettings")]
    async fn get_settings(&self) -> Result<SettingsInfo, ErrorObjectOwned>;

    /// Persist the auto-logout schedule and wake the scheduler.
    #[method(name = "updateAutoLogout")]
    async fn update_auto_logout(&self, cfg: AutoLogoutConfig) -> Result<(), ErrorObjectOwned>;

    /// Persist webhook-server settings (applied on next gateway start).
    #[method(name = "updateWebhookServer")]
    async fn update_webhook_server(
        &self,
        cfg: WebhookServerConfig,
    ) -> Result<(), ErrorObjectOwned>;

    #[method(name = "setUiPrefs")]
    async fn set_ui_prefs(&self, prefs: Value) -> Result<(), ErrorObjectOwned>;

    /// Force the scheduler to recompute its next target now.
    #[method(name = "rescheduleAutoLogout")]
    async fn reschedule_auto_logout(&self) -> Result<(), ErrorObjectOwned>;

    // ---- strategies ----

    #[method(name = "createStrategy")]
    async fn create_strategy(&self, new: NewStrategy) -> Result<Strategy, ErrorObjectOwned>;

    #[method(name = "listStrategies")]
    async fn list_strategies(&self) -> Result<Vec<Strategy>, ErrorObjectOwned>;

    #[method(name = "setStrategyEnabled")]
    async fn set_strategy_enabled(&self, id: i64, enabled: bool)
        -> Result<(), ErrorObjectOwned>;

    #[method(name = "deleteStrategy")]
    async fn delete_strategy(&self, id: i64) -> Result<(), ErrorObjectOwned>;

    #[method(name = "addSymbolMapping")]
    async fn add_symbol_mapping(
        &self,
        strategy_id: i64,
        symbol: String,
        exchange: String,
        quantity: i64,
        product: String,
    ) -> Result<i64, ErrorObjectOwned>;

    #[method(name = "listSymbolMappings")]
    async fn list_symbol_mappings(
        &self,
        strategy_id: i64,
    ) -> Result<Vec<SymbolMapping>, ErrorObjectOwned>;

    // ---- trading ----

    #[method(name = "placeOrder")]
    async fn place_order(&self, intent: OrderIntent) -> Result<Order, ErrorObjectOwned>;

    #[method(name = "placeSmartOrder")]
    async fn place_smart_order(
        &self,
        symbol: String,
        exchange: String,
        product: String,
        position_size: i64,
    ) -> Result<Option<Order>, ErrorObjectOwned>;

    #[method(name = "modifyOrder")]
    async fn modify_order(
        &self,
        order_id: String,
        modify: OrderModify,
    ) -> Result<Order, ErrorObjectOwned>;

    #[method(name = "cancelOrder")]
    async fn cancel_order(&self, order_id: String) -> Result<(), ErrorObjectOwned>;

    #[method(name = "cancelAllOrders")]
    async fn cancel_all_orders(&self) -> Result<Vec<String>, ErrorObjectOwned>;

    #[method(name = "closePositions")]
    async fn close_positions(
        &self,
        symbol: Option<String>,
        exchange: Option<String>,
        product: Option<String>,
    ) -> Result<Vec<Order>, ErrorObjectOwned>;

    #[method(name = "basketOrder")]
    async fn basket_order(
        &self,
        intents: Vec<OrderIntent>,
    ) -> Result<Vec<LegResult>, ErrorObjectOwned>;

    #[method(name = "splitOrder")]
    async fn split_order(
        &self,
        intent: OrderIntent,
        split_size: i64,
    ) -> Result<Vec<LegResult>, ErrorObjectOwned>;

    #[method(name = "orderBook")]
    async fn order_book(&self) -> Result<Vec<Order>, ErrorObjectOwned>;

    #[method(name = "tradeBook")]
    async fn trade_book(&self) -> Result<Vec<Trade>, ErrorObjectOwned>;

    #[method(name = "positionBook")]
    async fn position_book(&self) -> Result<Vec<Position>, ErrorObjectOwned>;

    #[method(name = "holdings")]
    async fn holdings(&self) -> Result<Vec<Holding>, ErrorObjectOwned>;

    #[method(name = "funds")]
    async fn funds(&self) -> Result<Funds, ErrorObjectOwned>;

    #[method(name = "orderStatus")]
    async fn order_status(&self, order_id: String) -> Result<Order, ErrorObjectOwned>;

    #[method(name = "openPosition")]
    async fn open_position(
        &self,
        symbol: String,
        exchange: String,
        product: String,
    ) -> Result<i64, ErrorObjectOwned>;

    // ---- market data ----

    #[method(name = "quotes")]
    async fn quotes(
        &self,
        symbols: Vec<(String, String)>,
    ) -> Result<Vec<Quote>, ErrorObjectOwned>;

    #[method(name = "depth")]
    async fn depth(&self, exchange: String, symbol: String) -> Result<Depth, ErrorObjectOwned>;

    #[method(name = "history")]
    async fn history(
        &self,
        exchange: String,
        symbol: String,
        interval: String,
        from: i64,
        to: i64,
    ) -> Result<Vec<HistoricalBar>, ErrorObjectOwned>;

    #[method(name = "intervals")]
    async fn intervals(&self) -> Result<Vec<String>, ErrorObjectOwned>;

    #[method(name = "searchSymbols")]
    async fn search_symbols(
        &self,
        query: String,
        limit: Option<i64>,
    ) -> Result<Vec<Instrument>, ErrorObjectOwned>;

    #[method(name = "symbolInfo")]
    async fn symbol_info(
        &self,
        exchange: String,
        symbol: String,
    ) -> Result<Instrument, ErrorObjectOwned>;

    /// Refresh the symbol master from the active broker.
    #[method(name = "refreshMaster")]
    async fn refresh_master(&self) -> Result<usize, ErrorObjectOwned>;

    /// Open the market-data stream; ticks arrive as `market_tick` events.
    #[method(name = "startMarketStream")]
    async fn start_market_stream(&self) -> Result<(), ErrorObjectOwned>;

    // ---- options ----

    #[method(name = "optionExpiries")]
    async fn option_expiries(
        &self,
        exchange: String,
        underlying: String,
    ) -> Result<Vec<NaiveDate>, ErrorObjectOwned>;

    #[method(name = "optionChain")]
    async fn option_chain(
        &self,
        exchange: String,
        underlying: String,
        expiry: Option<NaiveDate>,
    ) -> Result<Vec<OptionChainRow>, ErrorObjectOwned>;

    #[method(name = "optionGreeks")]
    async fn option_greeks(&self, req: GreeksRequest) -> Result<Greeks, ErrorObjectOwned>;

    #[method(name = "syntheticFuture")]
    async fn synthetic_future(
        &self,
        exchange: String,
        underlying: String,
        expiry: NaiveDate,
    ) -> Result<SyntheticFuture, ErrorObjectOwned>;

    #[method(name = "optionsOrder")]
    async fn options_order(&self, req: OptionOrderRequest) -> Result<Order, ErrorObjectOwned>;

    #[method(name = "optionsMultiOrder")]
    async fn options_multi_order(
        &self,
        legs: Vec<OptionOrderRequest>,
    ) -> Result<Vec<LegResult>, ErrorObjectOwned>;

    // ---- analyzer / sandbox ----

    #[method(name = "setAnalyzerMode")]
    async fn set_analyzer_mode(&self, enabled: bool) -> Result<bool, ErrorObjectOwned>;

    #[method(name = "analyzerStatus")]
    async fn analyzer_status(&self) -> Result<bool, ErrorObjectOwned>;

    #[method(name = "analyzerLogs")]
    async fn analyzer_logs(&self, limit: Option<i64>)
        -> Result<Vec<AnalyzerLog>, ErrorObjectOwned>;

    #[method(name = "sandboxReset")]
    async fn sandbox_reset(&self) -> Result<(), ErrorObjectOwned>;

    // ---- observability / admission ----

    #[method(name = "latencyStats")]
    async fn latency_stats(
        &self,
        op: Option<String>,
        window_hours: Option<i64>,
    ) -> Result<LatencySummary, ErrorObjectOwned>;

    #[method(name = "recentTraffic")]
    async fn recent_traffic(&self, limit: Option<i64>)
        -> Result<Vec<TrafficLog>, ErrorObjectOwned>;

    #[method(name = "listBans")]
    async fn list_bans(&self) -> Result<Vec<IpBan>, ErrorObjectOwned>;

    #[method(name = "removeBan")]
    async fn remove_ban(&self, ip: String) -> Result<bool, ErrorObjectOwned>;

    // ---- events ----

    /// Server-pushed event stream (auto-logout ladder, order events,
    /// webhook alerts, websocket state, oauth callbacks, ticks).
    #[subscription(name = "subscribeEvents", unsubscribe = "unsubscribeEvents", item = Event)]
    async fn subscribe_events(&self) -> SubscriptionResult;
}
