//! Row types for the primary store.
//!
//! Encrypted fields appear as `(ciphertext, nonce)` column pairs; nothing in
//! this module touches key material. Insert shapes are separate `New*`
//! structs so inserts cannot accidentally carry generated columns.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::BanKind;

/// The local operator account. Zero rows = setup state, one row = login
/// state; the application never creates a second row.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    /// Argon2 hash of the admission API key (for validation).
    pub api_key_hash: Option<String>,
    /// Encrypted copy of the API key (for display in the UI).
    pub api_key: Option<Vec<u8>>,
    pub api_key_nonce: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// Per-broker API credential. At most one row per broker id.
#[derive(Debug, Clone, FromRow)]
pub struct BrokerCredential {
    pub broker_id: String,
    pub api_key: Vec<u8>,
    pub api_key_nonce: Vec<u8>,
    pub api_secret: Option<Vec<u8>>,
    pub api_secret_nonce: Option<Vec<u8>>,
    pub client_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// The single active broker session (row id fixed at 1).
/// Auth and feed tokens are encrypted under independent nonces.
#[derive(Debug, Clone, FromRow)]
pub struct BrokerSession {
    pub id: i64,
    pub broker_id: String,
    pub auth_token: Option<Vec<u8>>,
    pub auth_token_nonce: Option<Vec<u8>>,
    pub feed_token: Option<Vec<u8>>,
    pub feed_token_nonce: Option<Vec<u8>>,
    pub user_id: i64,
    pub authenticated_at: DateTime<Utc>,
}

/// A persistent alerting target addressed by its webhook id.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub webhook_id: String,
    pub exchange: String,
    pub symbol: String,
    pub product: String,
    pub quantity: i64,
    pub enabled: bool,
    pub platform: String,
    /// "HH:MM" local trading-window bounds; both unset = always active.
    pub trade_window_start: Option<String>,
    pub trade_window_end: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Strategy {
    /// Whether `at` (time of day in the regulatory zone) falls inside the
    /// strategy's trading window. Windows crossing midnight are supported.
    pub fn in_trading_window(&self, at: NaiveTime) -> bool {
        let (start, end) = match (&self.trade_window_start, &self.trade_window_end) {
            (Some(s), Some(e)) => {
                let parse = |v: &str| NaiveTime::parse_from_str(v, "%H:%M").ok();
                match (parse(s), parse(e)) {
                    (Some(s), Some(e)) => (s, e),
                    _ => return true,
                }
            }
            _ => return true,
        };
        if start <= end {
            at >= start && at <= end
        } else {
            at >= start || at <= end
        }
    }
}

/// For creating new strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStrategy {
    pub name: String,
    pub exchange: String,
    pub symbol: String,
    pub product: String,
    pub quantity: i64,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub trade_window_start: Option<String>,
    #[serde(default)]
    pub trade_window_end: Option<String>,
}

/// Per-leg override for multi-symbol strategies.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SymbolMapping {
    pub id: i64,
    pub strategy_id: i64,
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub product: String,
}

/// The single settings row (id fixed at 1).
#[derive(Debug, Clone, FromRow)]
pub struct Settings {
    pub id: i64,
    pub default_broker: Option<String>,
    pub analyzer_mode: bool,
    pub ui_prefs: String,
    pub auto_logout_enabled: bool,
    pub auto_logout_hour: i64,
    pub auto_logout_minute: i64,
    pub auto_logout_warnings: String,
    pub webhook_enabled: bool,
    pub webhook_host: String,
    pub webhook_port: i64,
    pub webhook_public_url: Option<String>,
    pub webhook_hmac_secret: Option<String>,
}

/// Auto-logout schedule, decoded from the settings row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoLogoutConfig {
    pub enabled: bool,
    pub hour: u32,
    pub minute: u32,
    /// Warning lead-times in minutes, descending.
    pub warning_leads: Vec<u32>,
}

/// Webhook/REST server settings, decoded from the settings row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub public_url: Option<String>,
    pub hmac_secret: Option<String>,
}

impl Settings {
    pub fn auto_logout(&self) -> AutoLogoutConfig {
        let mut warning_leads: Vec<u32> = self
            .auto_logout_warnings
            .split(',')
            .filter_map(|v| v.trim().parse().ok())
            .collect();
        warning_leads.sort_unstable_by(|a, b| b.cmp(a));
        AutoLogoutConfig {
            enabled: self.auto_logout_enabled,
            hour: self.auto_logout_hour.clamp(0, 23) as u32,
            minute: self.auto_logout_minute.clamp(0, 59) as u32,
            warning_leads,
        }
    }

    pub fn webhook_server(&self) -> WebhookServerConfig {
        WebhookServerConfig {
            enabled: self.webhook_enabled,
            host: self.webhook_host.clone(),
            port: self.webhook_port.clamp(1, 65535) as u16,
            public_url: self.webhook_public_url.clone(),
            hmac_secret: self.webhook_hmac_secret.clone(),
        }
    }
}

/// One admitted (or rejected) request.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TrafficLog {
    pub id: i64,
    pub client_ip: String,
    pub path: String,
    pub method: String,
    pub status: i64,
    pub latency_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// One timed logical operation.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LatencyLog {
    pub id: i64,
    pub op: String,
    pub rtt_ms: i64,
    pub broker_id: Option<String>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// Percentile and SLA-tier summary over a latency window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
    pub count: i64,
    pub p50_ms: i64,
    pub p90_ms: i64,
    pub p95_ms: i64,
    pub p99_ms: i64,
    /// Operations completing within 100 ms.
    pub within_100ms: i64,
    /// Operations completing within 150 ms.
    pub within_150ms: i64,
    /// Operations completing within 200 ms.
    pub within_200ms: i64,
}

/// Strike/ban record keyed by IP. The row persists after a temporary ban
/// expires so strike counts accumulate across offences.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IpBan {
    pub ip: String,
    pub kind: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub strike_count: i64,
    pub window_start: DateTime<Utc>,
    pub reason: String,
    pub updated_at: DateTime<Utc>,
}

impl IpBan {
    /// Whether the ban blocks admission at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match BanKind::parse(&self.kind) {
            Some(BanKind::Permanent) => true,
            Some(BanKind::Temporary) => self.expires_at.is_some_and(|t| t > now),
            None => false,
        }
    }
}

/// Outcome of recording one admission strike.
#[derive(Debug, Clone, Copy)]
pub struct StrikeOutcome {
    pub strike_count: i64,
    /// True exactly when this strike escalated the IP to a permanent ban.
    pub escalated: bool,
}

/// Simulated-execution audit row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AnalyzerLog {
    pub id: i64,
    pub strategy_id: Option<i64>,
    pub payload: String,
    pub decision: String,
    pub created_at: DateTime<Utc>,
}

/// Sandbox account funds (row id fixed at 1).
#[derive(Debug, Clone, FromRow)]
pub struct SandboxFunds {
    pub id: i64,
    pub starting_capital: f64,
    pub available_cash: f64,
    pub used_margin: f64,
    pub realized_pnl: f64,
    pub last_reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SandboxPosition {
    pub symbol: String,
    pub exchange: String,
    pub product: String,
    pub quantity: i64,
    pub average_price: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SandboxHolding {
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub average_price: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SandboxOrder {
    pub order_id: String,
    pub symbol: String,
    pub exchange: String,
    pub side: String,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub product: String,
    pub price_type: String,
    pub price: f64,
    pub trigger_price: f64,
    pub status: String,
    pub strategy: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SandboxTrade {
    pub trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub exchange: String,
    pub side: String,
    pub quantity: i64,
    pub price: f64,
    pub product: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn strategy(start: Option<&str>, end: Option<&str>) -> Strategy {
        Strategy {
            id: 1,
            name: "s".into(),
            webhook_id: "w".into(),
            exchange: "NSE".into(),
            symbol: "RELIANCE".into(),
            product: "MIS".into(),
            quantity: 1,
            enabled: true,
            platform: "tradingview".into(),
            trade_window_start: start.map(String::from),
            trade_window_end: end.map(String::from),
            deleted_at: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_no_window_always_active() {
        let s = strategy(None, None);
        assert!(s.in_trading_window(NaiveTime::from_hms_opt(2, 0, 0).unwrap()));
    }

    #[test]
    fn test_window_bounds() {
        let s = strategy(Some("09:15"), Some("15:30"));
        assert!(s.in_trading_window(NaiveTime::from_hms_opt(9, 15, 0).unwrap()));
        assert!(s.in_trading_window(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        assert!(!s.in_trading_window(NaiveTime::from_hms_opt(16, 0, 0).unwrap()));
    }

    #[test]
    fn test_window_across_midnight() {
        let s = strategy(Some("21:00"), Some("05:00"));
        assert!(s.in_trading_window(NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
        assert!(s.in_trading_window(NaiveTime::from_hms_opt(3, 0, 0).unwrap()));
        assert!(!s.in_trading_window(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn test_auto_logout_decoding_sorts_leads() {
        let settings = Settings {
            id: 1,
            default_broker: None,
            analyzer_mode: false,
            ui_prefs: "{}".into(),
            auto_logout_enabled: true,
            auto_logout_hour: 3,
            auto_logout_minute: 0,
            auto_logout_warnings: "5,30,1,15".into(),
            webhook_enabled: false,
            webhook_host: "127.0.0.1".into(),
            webhook_port: 5000,
            webhook_public_url: None,
            webhook_hmac_secret: None,
        };
        let cfg = settings.auto_logout();
        assert_eq!(cfg.warning_leads, vec![30, 15, 5, 1]);
        assert_eq!((cfg.hour, cfg.minute), (3, 0));
    }

    #[test]
    fn test_temporary_ban_activity() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ban = IpBan {
            ip: "10.0.0.1".into(),
            kind: "temporary".into(),
            expires_at: Some(now + chrono::Duration::minutes(5)),
            strike_count: 3,
            window_start: now,
            reason: "invalid api key".into(),
            updated_at: now,
        };
        assert!(ban.is_active(now));
        assert!(!ban.is_active(now + chrono::Duration::minutes(6)));
    }
}
