//! Process-level bootstrap configuration.
//!
//! Loaded once at startup from environment variables (`.env` supported).
//! Operator-tunable runtime settings (auto-logout schedule, webhook server)
//! live in the `settings` row of the primary store instead; see `db`.

use eyre::{eyre, Result, WrapErr};
use std::env;
use std::path::{Path, PathBuf};

/// Main configuration for the backend core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application data directory: primary store, analytical store, secret
    /// file fallback, rolling logs.
    pub data_dir: PathBuf,
    pub database: DatabaseConfig,
    pub ipc: IpcConfig,
    pub admission: AdmissionConfig,
    pub broker: BrokerConfig,
    pub sandbox: SandboxConfig,
    /// Use the 0600-file secret store instead of the OS keychain
    /// (headless hosts without a keychain daemon).
    pub headless_secret_file: bool,
}

/// Primary / analytical store locations.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub primary_path: PathBuf,
    pub analytics_dir: PathBuf,
    pub max_connections: u32,
}

/// Local IPC (daemon <-> UI) listener.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Loopback only; the IPC surface is never network-visible.
    pub bind_addr: String,
}

/// Admission-policy tunables. The strike thresholds are deliberately
/// configuration, not constants; the defaults below are the documented
/// policy and can be overridden per deployment.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Strikes within the window that escalate an IP to a permanent ban.
    pub strike_threshold: i64,
    /// Sliding strike window, seconds.
    pub strike_window_secs: i64,
    /// Temporary ban duration, seconds.
    pub temp_ban_secs: i64,
    /// Traffic/latency log retention, days.
    pub log_retention_days: i64,
}

/// Outbound broker call deadlines.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// RPC-style calls (orders, books, quotes), seconds.
    pub rpc_timeout_secs: u64,
    /// Master-contract downloads, seconds.
    pub master_timeout_secs: u64,
    /// Best-effort upstream revocation during auto-logout, seconds.
    pub revoke_timeout_secs: u64,
}

/// Simulated-account engine settings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub starting_capital: f64,
    /// Days between automatic account resets; 0 disables the schedule.
    pub reset_interval_days: i64,
}

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_IPC_BIND: &str = "127.0.0.1:8765";

fn default_max_connections() -> u32 {
    5
}

fn default_strike_threshold() -> i64 {
    5
}

fn default_strike_window_secs() -> i64 {
    600
}

fn default_temp_ban_secs() -> i64 {
    300
}

fn default_log_retention_days() -> i64 {
    30
}

fn default_rpc_timeout_secs() -> u64 {
    15
}

fn default_master_timeout_secs() -> u64 {
    30
}

fn default_revoke_timeout_secs() -> u64 {
    5
}

fn default_starting_capital() -> f64 {
    10_000_000.0
}

fn default_reset_interval_days() -> i64 {
    7
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration: `.env` file if present, then environment.
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path.
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {path}"))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let data_dir =
            PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string()));

        let database = DatabaseConfig {
            primary_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("tradedesk.db")),
            analytics_dir: env::var("ANALYTICS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("history")),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", default_max_connections()),
        };

        let ipc = IpcConfig {
            bind_addr: env::var("IPC_BIND").unwrap_or_else(|_| DEFAULT_IPC_BIND.to_string()),
        };

        let admission = AdmissionConfig {
            strike_threshold: env_parse("ADMISSION_STRIKE_THRESHOLD", default_strike_threshold()),
            strike_window_secs: env_parse(
                "ADMISSION_STRIKE_WINDOW_SECS",
                default_strike_window_secs(),
            ),
            temp_ban_secs: env_parse("ADMISSION_TEMP_BAN_SECS", default_temp_ban_secs()),
            log_retention_days: env_parse(
                "ADMISSION_LOG_RETENTION_DAYS",
                default_log_retention_days(),
            ),
        };

        let broker = BrokerConfig {
            rpc_timeout_secs: env_parse("BROKER_RPC_TIMEOUT_SECS", default_rpc_timeout_secs()),
            master_timeout_secs: env_parse(
                "BROKER_MASTER_TIMEOUT_SECS",
                default_master_timeout_secs(),
            ),
            revoke_timeout_secs: env_parse(
                "BROKER_REVOKE_TIMEOUT_SECS",
                default_revoke_timeout_secs(),
            ),
        };

        let sandbox = SandboxConfig {
            starting_capital: env_parse("SANDBOX_STARTING_CAPITAL", default_starting_capital()),
            reset_interval_days: env_parse(
                "SANDBOX_RESET_INTERVAL_DAYS",
                default_reset_interval_days(),
            ),
        };

        let headless_secret_file = env_parse("HEADLESS_SECRET_FILE", false);

        let config = Config {
            data_dir,
            database,
            ipc,
            admission,
            broker,
            sandbox,
            headless_secret_file,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.admission.strike_threshold < 1 {
            return Err(eyre!("admission.strike_threshold must be at least 1"));
        }
        if self.admission.strike_window_secs < 1 {
            return Err(eyre!("admission.strike_window_secs must be positive"));
        }
        if self.admission.temp_ban_secs < 1 {
            return Err(eyre!("admission.temp_ban_secs must be positive"));
        }
        if self.broker.rpc_timeout_secs == 0 || self.broker.master_timeout_secs == 0 {
            return Err(eyre!("broker timeouts must be positive"));
        }
        if self.ipc.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(eyre!("IPC_BIND must be a valid socket address"));
        }
        if !self.sandbox.starting_capital.is_finite() || self.sandbox.starting_capital <= 0.0 {
            return Err(eyre!("sandbox.starting_capital must be positive"));
        }
        if self.sandbox.reset_interval_days < 0 {
            return Err(eyre!("sandbox.reset_interval_days must not be negative"));
        }
        Ok(())
    }

    /// Path of the file-backed secret store (headless fallback).
    pub fn secret_file_path(&self) -> PathBuf {
        self.data_dir.join("master-secrets.json")
    }
}

impl Default for Config {
    /// Defaults used by tests and first-run bootstrap.
    fn default() -> Self {
        let data_dir = PathBuf::from(DEFAULT_DATA_DIR);
        Config {
            database: DatabaseConfig {
                primary_path: data_dir.join("tradedesk.db"),
                analytics_dir: data_dir.join("history"),
                max_connections: default_max_connections(),
            },
            data_dir,
            ipc: IpcConfig {
                bind_addr: DEFAULT_IPC_BIND.to_string(),
            },
            admission: AdmissionConfig {
                strike_threshold: default_strike_threshold(),
                strike_window_secs: default_strike_window_secs(),
                temp_ban_secs: default_temp_ban_secs(),
                log_retention_days: default_log_retention_days(),
            },
            broker: BrokerConfig {
                rpc_timeout_secs: default_rpc_timeout_secs(),
                master_timeout_secs: default_master_timeout_secs(),
                revoke_timeout_secs: default_revoke_timeout_secs(),
            },
            sandbox: SandboxConfig {
                starting_capital: default_starting_capital(),
                reset_interval_days: default_reset_interval_days(),
            },
            headless_secret_file: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_default_strike_policy() {
        assert_eq!(default_strike_threshold(), 5);
        assert_eq!(default_strike_window_secs(), 600);
        assert_eq!(default_temp_ban_secs(), 300);
    }

    #[test]
    fn test_default_broker_deadlines() {
        assert_eq!(default_rpc_timeout_secs(), 15);
        assert_eq!(default_master_timeout_secs(), 30);
        assert_eq!(default_revoke_timeout_secs(), 5);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = Config::default();
        config.admission.strike_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_ipc_bind_rejected() {
        let mut config = Config::default();
        config.ipc.bind_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }
}
