use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use tokio::sync::mpsc;

use tradedesk_core::autologout::AutoLogoutScheduler;
use tradedesk_core::brokers::paper::PaperBroker;
use tradedesk_core::brokers::BrokerRegistry;
use tradedesk_core::config::Config;
use tradedesk_core::custodian::SessionCustodian;
use tradedesk_core::events::EventBus;
use tradedesk_core::gateway::{self, GatewayState};
use tradedesk_core::identity::IdentityManager;
use tradedesk_core::sandbox::SandboxEngine;
use tradedesk_core::services::Services;
use tradedesk_core::symbols::SymbolIndex;
use tradedesk_core::vault::{FileStore, KeyringStore, SecretStore, SecretVault};
use tradedesk_core::{analytics, db, ipc};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting TradeDesk backend core");

    let config = Config::load()?;
    std::fs::create_dir_all(&config.data_dir)
        .wrap_err_with(|| format!("Failed to create data dir {:?}", config.data_dir))?;

    // One keychain prompt unlocks field encryption and password hashing.
    let vault = open_vault(&config).wrap_err("Failed to open the secret vault")?;
    tracing::info!("Secret vault unlocked");

    let pool = db::create_pool(&config.database.primary_path, config.database.max_connections)
        .await
        .wrap_err("Failed to open primary store")?;
    // Nothing touches the store until the migration chain completes.
    db::run_migrations(&pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    tracing::info!(
        version = db::schema_version(&pool).await?,
        "Database migrations complete"
    );

    let events = EventBus::new();
    let custodian = Arc::new(SessionCustodian::new(pool.clone(), Arc::clone(&vault)));
    let identity = Arc::new(IdentityManager::new(pool.clone(), Arc::clone(&vault)));
    let sandbox = Arc::new(SandboxEngine::with_reset_interval(
        pool.clone(),
        config.sandbox.starting_capital,
        config.sandbox.reset_interval_days,
    ));

    let mut registry = BrokerRegistry::new();
    registry.register(Arc::new(PaperBroker::new(Arc::clone(&sandbox))));
    let registry = Arc::new(registry);

    let symbols = Arc::new(SymbolIndex::new());
    match symbols.load_from_db(&pool).await {
        Ok(count) => tracing::info!(instruments = count, "Symbol index loaded"),
        Err(e) => tracing::warn!(error = %e, "Symbol index empty until next master refresh"),
    }

    let history = Arc::new(analytics::OhlcvStore::new(
        config.database.analytics_dir.clone(),
    ));

    let services = Arc::new(Services::new(
        pool.clone(),
        Arc::clone(&custodian),
        identity,
        Arc::clone(&registry),
        sandbox,
        symbols,
        history,
        events.clone(),
        config.broker.clone(),
    ));

    let (scheduler, reschedule) = AutoLogoutScheduler::new(
        pool.clone(),
        custodian,
        registry,
        events.clone(),
        Duration::from_secs(config.broker.revoke_timeout_secs),
    );

    // Create shutdown channels
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = mpsc::channel::<()>(1);

    // Setup signal handlers
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
        let _ = shutdown_tx2.send(()).await;
    });

    // Local IPC surface
    let ipc_handle = ipc::server::serve(&config.ipc.bind_addr, Arc::clone(&services), reschedule)
        .await
        .wrap_err("Failed to start IPC surface")?;

    // Admission gateway, when the operator has enabled it
    let webhook_cfg = db::get_settings(&pool).await?.webhook_server();
    let gateway_task = if webhook_cfg.enabled {
        let state = GatewayState::new(Arc::clone(&services), config.admission.clone());
        Some(tokio::spawn(async move {
            gateway::serve(state, &webhook_cfg, shutdown_rx2).await
        }))
    } else {
        tracing::info!("Webhook server disabled in settings");
        None
    };

    tracing::info!("Subsystems started");

    // The scheduler returns when the shutdown signal arrives.
    if let Err(e) = scheduler.run(shutdown_rx).await {
        tracing::error!(error = %e, "Auto-logout scheduler error");
    }

    // Drain the gateway and stop the IPC server.
    if let Some(task) = gateway_task {
        match tokio::time::timeout(Duration::from_secs(10), task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "Gateway error during shutdown"),
            Ok(Err(e)) => tracing::error!(error = %e, "Gateway task panicked"),
            Err(_) => tracing::warn!("Gateway did not drain within the deadline"),
        }
    }
    let _ = ipc_handle.stop();
    ipc_handle.stopped().await;

    tracing::info!("TradeDesk backend core stopped");
    Ok(())
}

fn open_vault(config: &Config) -> eyre::Result<Arc<SecretVault>> {
    let store: Box<dyn SecretStore> = if config.headless_secret_file {
        Box::new(FileStore::new(config.secret_file_path()))
    } else {
        Box::new(KeyringStore::new())
    };
    Ok(Arc::new(SecretVault::open(store.as_ref())?))
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tradedesk_core=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
