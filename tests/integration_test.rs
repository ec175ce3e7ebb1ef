//! End-to-end scenarios for the backend core: identity, token custody,
//! webhook dispatch, admission strikes, and analyzer mode, all against a
//! real (temporary) data directory with the file-backed secret store and
//! the in-process admission router.
//!
//! Run with: cargo test --test integration_test -- --nocapture

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use tradedesk_core::brokers::paper::PaperBroker;
use tradedesk_core::brokers::BrokerRegistry;
use tradedesk_core::config::Config;
use tradedesk_core::custodian::SessionCustodian;
use tradedesk_core::db::{self, DbPool};
use tradedesk_core::error::CoreError;
use tradedesk_core::events::EventBus;
use tradedesk_core::gateway::{self, GatewayState};
use tradedesk_core::identity::IdentityManager;
use tradedesk_core::sandbox::SandboxEngine;
use tradedesk_core::services::Services;
use tradedesk_core::symbols::SymbolIndex;
use tradedesk_core::types::{OrderSide, ProductType};
use tradedesk_core::vault::{FileStore, SecretVault};
use tradedesk_core::{analytics, ipc};

mod helpers {
    use super::*;

    pub struct TestStack {
        pub services: Arc<Services>,
        pub router: Router,
        pub pool: DbPool,
    }

    /// Build the full stack against `data_dir`, the same wiring as the
    /// daemon's main. Building twice against one directory simulates a
    /// process restart (vault re-opens from the secret file).
    pub async fn build_stack(data_dir: &Path) -> TestStack {
        let store = FileStore::new(data_dir.join("secrets.json"));
        let vault = Arc::new(SecretVault::open(&store).expect("vault"));

        let pool = db::create_pool(&data_dir.join("tradedesk.db"), 5)
            .await
            .expect("pool");
        db::run_migrations(&pool).await.expect("migrations");

        let events = EventBus::new();
        let custodian = Arc::new(SessionCustodian::new(pool.clone(), Arc::clone(&vault)));
        let identity = Arc::new(IdentityManager::new(pool.clone(), vault));
        let sandbox = Arc::new(SandboxEngine::new(pool.clone(), 1_000_000.0));

        let mut registry = BrokerRegistry::new();
        registry.register(Arc::new(PaperBroker::new(Arc::clone(&sandbox))));

        let services = Arc::new(Services::new(
            pool.clone(),
            custodian,
            identity,
            Arc::new(registry),
            sandbox,
            Arc::new(SymbolIndex::new()),
            Arc::new(analytics::OhlcvStore::new(data_dir.join("history"))),
            events,
            Config::default().broker,
        ));

        let state = GatewayState::new(Arc::clone(&services), Config::default().admission);
        TestStack {
            router: gateway::router(state),
            services,
            pool,
        }
    }

    /// POST a JSON body as `ip` through the in-process router.
    pub async fn post_json(router: &Router, path: &str, body: Value, ip: &str) -> Response {
        let mut request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let addr: SocketAddr = format!("{ip}:40000").parse().expect("addr");
        request.extensions_mut().insert(ConnectInfo(addr));
        router.clone().oneshot(request).await.expect("response")
    }

    pub async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }

    /// Setup, login, store a paper credential, and open the broker
    /// session: the state most trading scenarios start from.
    pub async fn operator_online(services: &Arc<Services>) {
        services
            .identity()
            .setup("alice", "password1")
            .await
            .expect("setup");
        services
            .identity()
            .login("alice", "password1")
            .await
            .expect("login");
        services
            .custodian()
            .save_credential("paper", "PAPER_KEY", None, None)
            .await
            .expect("credential");
        services.broker_login("paper", None).await.expect("broker login");
    }
}

// ============================================================================
// Scenario 1: setup -> login -> rate limit
// ============================================================================

#[tokio::test]
async fn test_setup_login_and_rate_limit() {
    let dir = tempfile::tempdir().unwrap();
    let stack = helpers::build_stack(dir.path()).await;
    let identity = stack.services.identity();

    identity.setup("alice", "password1").await.unwrap();
    assert!(matches!(
        identity.setup("mallory", "password2").await,
        Err(CoreError::AlreadyInitialized)
    ));

    assert!(identity.login("alice", "password1").await.is_ok());
    identity.logout();

    assert!(matches!(
        identity.login("alice", "wrong-password").await,
        Err(CoreError::NotAuthenticated)
    ));
    for _ in 0..4 {
        let _ = identity.login("alice", "wrong-password").await;
    }
    assert!(matches!(
        identity.login("alice", "password1").await,
        Err(CoreError::RateLimited { .. })
    ));
}

// ============================================================================
// Scenario 2: broker token round-trip across a restart, then corruption
// ============================================================================

#[tokio::test]
async fn test_token_round_trip_survives_restart_and_detects_tamper() {
    let dir = tempfile::tempdir().unwrap();

    {
        let stack = helpers::build_stack(dir.path()).await;
        helpers::operator_online(&stack.services).await;
        let user_id = stack.services.identity().require_user().unwrap();
        stack
            .services
            .custodian()
            .save_session("fyers", "TOKEN_A", Some("FEED_B"), user_id)
            .await
            .unwrap();
    }

    // "Restart": a fresh stack over the same data dir re-opens the vault.
    let stack = helpers::build_stack(dir.path()).await;
    let session = stack
        .services
        .custodian()
        .load_active_session()
        .await
        .unwrap()
        .expect("session survives restart");
    assert_eq!(session.broker_id, "fyers");
    assert_eq!(session.auth_token, "TOKEN_A");
    assert_eq!(session.feed_token.as_deref(), Some("FEED_B"));

    // Corrupt one ciphertext byte directly in the store.
    let row = db::get_broker_session(&stack.pool).await.unwrap().unwrap();
    let mut cipher = row.auth_token.unwrap();
    cipher[0] ^= 0x01;
    sqlx::query("UPDATE broker_sessions SET auth_token = ? WHERE id = 1")
        .bind(&cipher)
        .execute(&stack.pool)
        .await
        .unwrap();

    assert!(matches!(
        stack.services.custodian().load_active_session().await,
        Err(CoreError::SessionCorrupted)
    ));
    // The damaged row was cleared; commands needing a session now fail.
    assert!(stack
        .services
        .custodian()
        .load_active_session()
        .await
        .unwrap()
        .is_none());
}

// ============================================================================
// Scenario 3 (tail): a revoked session blocks trading commands
// ============================================================================

#[tokio::test]
async fn test_revoked_session_blocks_orders() {
    let dir = tempfile::tempdir().unwrap();
    let stack = helpers::build_stack(dir.path()).await;
    helpers::operator_online(&stack.services).await;

    assert!(stack.services.order_book().await.is_ok());

    stack.services.broker_logout().await.unwrap();
    assert!(matches!(
        stack.services.order_book().await,
        Err(CoreError::NoActiveBroker)
    ));
    // Revocation is idempotent.
    stack.services.broker_logout().await.unwrap();
}

// ============================================================================
// Scenario 4: webhook dispatch
// ============================================================================

#[tokio::test]
async fn test_webhook_dispatch_places_order() {
    let dir = tempfile::tempdir().unwrap();
    let stack = helpers::build_stack(dir.path()).await;
    helpers::operator_online(&stack.services).await;

    let strategy = stack
        .services
        .create_strategy(&db::NewStrategy {
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

    let response = helpers::post_json(
        &stack.router,
        &format!("/webhook/{}", strategy.webhook_id),
        json!({ "action": "BUY" }),
        "10.1.1.1",
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = helpers::body_json(response).await;
    assert_eq!(body["status"], "success");

    let book = stack.services.order_book().await.unwrap();
    assert_eq!(book.len(), 1);
    assert_eq!(book[0].symbol, "RELIANCE");
    assert_eq!(book[0].side, OrderSide::Buy);
    assert_eq!(book[0].quantity, 1);
    assert_eq!(book[0].product, ProductType::Mis);

    // A TrafficRecord exists for the admitted request.
    let traffic = db::recent_traffic(&stack.pool, 10).await.unwrap();
    assert!(traffic
        .iter()
        .any(|t| t.client_ip == "10.1.1.1" && t.status == 200));
    // And exactly one LatencyRecord for the dispatched operation.
    let stats = stack
        .services
        .latency_stats(Some("placeorder"), 1)
        .await
        .unwrap();
    assert_eq!(stats.count, 1);
}

#[tokio::test]
async fn test_unknown_webhook_is_suspicious_404() {
    let dir = tempfile::tempdir().unwrap();
    let stack = helpers::build_stack(dir.path()).await;

    let response = helpers::post_json(
        &stack.router,
        "/webhook/not-a-real-id",
        json!({ "action": "BUY" }),
        "10.2.2.2",
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let ban = db::get_ban(&stack.pool, "10.2.2.2").await.unwrap().unwrap();
    assert_eq!(ban.strike_count, 1);
    assert_eq!(ban.kind, "temporary");
}

#[tokio::test]
async fn test_disabled_strategy_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let stack = helpers::build_stack(dir.path()).await;
    helpers::operator_online(&stack.services).await;

    let strategy = stack
        .services
        .create_strategy(&db::NewStrategy {
            name: "paused".into(),
            exchange: "NSE".into(),
            symbol: "TCS".into(),
            product: "MIS".into(),
            quantity: 1,
            platform: None,
            trade_window_start: None,
            trade_window_end: None,
        })
        .await
        .unwrap();
    stack
        .services
        .set_strategy_enabled(strategy.id, false)
        .await
        .unwrap();

    let response = helpers::post_json(
        &stack.router,
        &format!("/webhook/{}", strategy.webhook_id),
        json!({ "action": "SELL" }),
        "10.3.3.3",
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(stack.services.order_book().await.unwrap().is_empty());
}

// ============================================================================
// Scenario 5: invalid-key strikes escalate to a permanent ban
// ============================================================================

#[tokio::test]
async fn test_invalid_api_key_escalates_to_permanent_ban() {
    let dir = tempfile::tempdir().unwrap();
    let stack = helpers::build_stack(dir.path()).await;
    helpers::operator_online(&stack.services).await;
    stack.services.identity().regenerate_api_key().await.unwrap();

    for _ in 0..5 {
        let response = helpers::post_json(
            &stack.router,
            "/api/v1/funds",
            json!({ "apikey": "wrong-key" }),
            "10.9.9.9",
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    // The fifth offence escalated; even a valid-looking request is now
    // refused before any business logic.
    let response = helpers::post_json(
        &stack.router,
        "/api/v1/funds",
        json!({ "apikey": "wrong-key" }),
        "10.9.9.9",
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = helpers::body_json(response).await;
    assert_eq!(body["code"], "BANNED");

    let ban = db::get_ban(&stack.pool, "10.9.9.9").await.unwrap().unwrap();
    assert_eq!(ban.kind, "permanent");
    assert_eq!(ban.strike_count, 5);

    // Traffic was recorded for every attempt, banned ones included.
    let traffic = db::recent_traffic(&stack.pool, 20).await.unwrap();
    assert!(traffic.iter().filter(|t| t.client_ip == "10.9.9.9").count() >= 6);

    // Another IP with the real key is unaffected.
    let key = stack
        .services
        .identity()
        .reveal_api_key()
        .await
        .unwrap()
        .unwrap();
    let response = helpers::post_json(
        &stack.router,
        "/api/v1/funds",
        json!({ "apikey": key }),
        "10.8.8.8",
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Scenario 6: analyzer mode
// ============================================================================

#[tokio::test]
async fn test_analyzer_mode_simulates_without_touching_custody() {
    let dir = tempfile::tempdir().unwrap();
    let stack = helpers::build_stack(dir.path()).await;
    helpers::operator_online(&stack.services).await;
    let key = {
        stack.services.identity().regenerate_api_key().await.unwrap()
    };

    let session_before = db::get_broker_session(&stack.pool).await.unwrap().unwrap();

    let response = helpers::post_json(
        &stack.router,
        "/api/v1/analyzer/toggle",
        json!({ "apikey": key, "mode": true }),
        "10.4.4.4",
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = helpers::post_json(
        &stack.router,
        "/api/v1/placeorder",
        json!({
            "apikey": key,
            "symbol": "TCS",
            "exchange": "NSE",
            "action": "BUY",
            "quantity": 10,
        }),
        "10.4.4.4",
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = helpers::body_json(response).await;
    let order_id = body["orderid"].as_str().unwrap().to_string();
    assert!(order_id.starts_with("SB-"), "synthetic order id: {order_id}");

    // Audit row written; session custody untouched byte for byte.
    assert_eq!(db::count_analyzer_logs(&stack.pool).await.unwrap(), 1);
    let session_after = db::get_broker_session(&stack.pool).await.unwrap().unwrap();
    assert_eq!(session_before.auth_token, session_after.auth_token);
    assert_eq!(
        session_before.auth_token_nonce,
        session_after.auth_token_nonce
    );
}

// ============================================================================
// Migration discipline and IPC wiring
// ============================================================================

#[tokio::test]
async fn test_migration_chain_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let stack = helpers::build_stack(dir.path()).await;

    let version = db::schema_version(&stack.pool).await.unwrap();
    db::run_migrations(&stack.pool).await.unwrap();
    db::run_migrations(&stack.pool).await.unwrap();
    assert_eq!(db::schema_version(&stack.pool).await.unwrap(), version);

    // The separate-nonce schema is in effect: both nonce columns exist and
    // are independently populated on save.
    helpers::operator_online(&stack.services).await;
    let user_id = stack.services.identity().require_user().unwrap();
    stack
        .services
        .custodian()
        .save_session("paper", "A", Some("B"), user_id)
        .await
        .unwrap();
    let row = db::get_broker_session(&stack.pool).await.unwrap().unwrap();
    assert_ne!(row.auth_token_nonce, row.feed_token_nonce);
}

#[tokio::test]
async fn test_ipc_surface_binds_on_loopback() {
    let dir = tempfile::tempdir().unwrap();
    let stack = helpers::build_stack(dir.path()).await;

    let (scheduler, reschedule) = tradedesk_core::autologout::AutoLogoutScheduler::new(
        stack.pool.clone(),
        Arc::clone(stack.services.custodian()),
        Arc::new(BrokerRegistry::new()),
        EventBus::new(),
        std::time::Duration::from_secs(5),
    );
    drop(scheduler);

    let handle = ipc::server::serve("127.0.0.1:0", Arc::clone(&stack.services), reschedule)
        .await
        .expect("ipc serve");
    let _ = handle.stop();
    handle.stopped().await;
}
