//! Primary store access: pool creation, migrations, and one query function
//! per operation. Every statement is parameterized; no SQL is built from
//! caller-supplied strings.
//!
//! The store is embedded SQLite with WAL journaling: readers run
//! concurrently, writers serialize on the connection pool. Migrations are a
//! forward-only chain applied before any other component touches the store.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::AdmissionConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::Instrument;

pub mod models;

pub use models::*;

pub type DbPool = SqlitePool;

/// Open (creating if missing) the primary store with WAL journaling.
pub async fn create_pool(path: &Path, max_connections: u32) -> CoreResult<DbPool> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(opts)
        .await
        .map_err(|e| CoreError::internal(format!("failed to open primary store: {e}")))
}

/// Apply pending migrations (the files in `migrations/`). Each runs in its
/// own transaction; re-running the chain is a no-op for applied versions.
pub async fn run_migrations(pool: &DbPool) -> CoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Highest applied schema version (0 on a store that predates migrations).
pub async fn schema_version(pool: &DbPool) -> CoreResult<i64> {
    let row: (i64,) =
        sqlx::query_as(r#"SELECT COALESCE(MAX(version), 0) FROM _sqlx_migrations"#)
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

// ============ Local user ============

/// Insert the local user. Caller must have checked none exists.
pub async fn insert_user(pool: &DbPool, username: &str, password_hash: &str) -> CoreResult<i64> {
    let result = sqlx::query(
        r#"INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?)"#,
    )
    .bind(username)
    .bind(password_hash)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// The local user, if setup has completed.
pub async fn get_user(pool: &DbPool) -> CoreResult<Option<User>> {
    let row = sqlx::query_as::<_, User>(r#"SELECT * FROM users LIMIT 1"#)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn count_users(pool: &DbPool) -> CoreResult<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM users"#)
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Store the admission API key: Argon2 hash for validation plus an
/// encrypted copy (own nonce) for display.
pub async fn set_user_api_key(
    pool: &DbPool,
    user_id: i64,
    api_key_hash: &str,
    api_key: &[u8],
    api_key_nonce: &[u8],
) -> CoreResult<()> {
    sqlx::query(
        r#"UPDATE users SET api_key_hash = ?, api_key = ?, api_key_nonce = ? WHERE id = ?"#,
    )
    .bind(api_key_hash)
    .bind(api_key)
    .bind(api_key_nonce)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Broker credentials ============

pub async fn upsert_broker_credential(
    pool: &DbPool,
    broker_id: &str,
    api_key: &[u8],
    api_key_nonce: &[u8],
    api_secret: Option<&[u8]>,
    api_secret_nonce: Option<&[u8]>,
    client_id: Option<&str>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO broker_credentials
            (broker_id, api_key, api_key_nonce, api_secret, api_secret_nonce, client_id, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (broker_id) DO UPDATE SET
            api_key = excluded.api_key,
            api_key_nonce = excluded.api_key_nonce,
            api_secret = excluded.api_secret,
            api_secret_nonce = excluded.api_secret_nonce,
            client_id = excluded.client_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(broker_id)
    .bind(api_key)
    .bind(api_key_nonce)
    .bind(api_secret)
    .bind(api_secret_nonce)
    .bind(client_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_broker_credential(
    pool: &DbPool,
    broker_id: &str,
) -> CoreResult<Option<BrokerCredential>> {
    let row = sqlx::query_as::<_, BrokerCredential>(
        r#"SELECT * FROM broker_credentials WHERE broker_id = ?"#,
    )
    .bind(broker_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn delete_broker_credential(pool: &DbPool, broker_id: &str) -> CoreResult<bool> {
    let result = sqlx::query(r#"DELETE FROM broker_credentials WHERE broker_id = ?"#)
        .bind(broker_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Broker ids with stored credentials (cleartext-free listing for the UI).
pub async fn list_broker_credential_ids(pool: &DbPool) -> CoreResult<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as(r#"SELECT broker_id FROM broker_credentials ORDER BY broker_id"#)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

// ============ Broker session (single active row) ============

#[allow(clippy::too_many_arguments)]
pub async fn upsert_broker_session(
    pool: &DbPool,
    broker_id: &str,
    auth_token: &[u8],
    auth_token_nonce: &[u8],
    feed_token: Option<&[u8]>,
    feed_token_nonce: Option<&[u8]>,
    user_id: i64,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO broker_sessions
            (id, broker_id, auth_token, auth_token_nonce, feed_token, feed_token_nonce,
             user_id, authenticated_at)
        VALUES (1, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            broker_id = excluded.broker_id,
            auth_token = excluded.auth_token,
            auth_token_nonce = excluded.auth_token_nonce,
            feed_token = excluded.feed_token,
            feed_token_nonce = excluded.feed_token_nonce,
            user_id = excluded.user_id,
            authenticated_at = excluded.authenticated_at
        "#,
    )
    .bind(broker_id)
    .bind(auth_token)
    .bind(auth_token_nonce)
    .bind(feed_token)
    .bind(feed_token_nonce)
    .bind(user_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_broker_session(pool: &DbPool) -> CoreResult<Option<BrokerSession>> {
    let row = sqlx::query_as::<_, BrokerSession>(r#"SELECT * FROM broker_sessions WHERE id = 1"#)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Delete the active session row. Idempotent.
pub async fn clear_broker_session(pool: &DbPool) -> CoreResult<bool> {
    let result = sqlx::query(r#"DELETE FROM broker_sessions WHERE id = 1"#)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ============ Strategies ============

pub async fn insert_strategy(
    pool: &DbPool,
    new: &NewStrategy,
    webhook_id: &str,
) -> CoreResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO strategies
            (name, webhook_id, exchange, symbol, product, quantity, platform,
             trade_window_start, trade_window_end, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&new.name)
    .bind(webhook_id)
    .bind(&new.exchange)
    .bind(&new.symbol)
    .bind(&new.product)
    .bind(new.quantity)
    .bind(new.platform.as_deref().unwrap_or("tradingview"))
    .bind(&new.trade_window_start)
    .bind(&new.trade_window_end)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn get_strategy(pool: &DbPool, id: i64) -> CoreResult<Option<Strategy>> {
    let row = sqlx::query_as::<_, Strategy>(
        r#"SELECT * FROM strategies WHERE id = ? AND deleted_at IS NULL"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Look up a strategy by its externally-visible webhook id.
pub async fn get_strategy_by_webhook(
    pool: &DbPool,
    webhook_id: &str,
) -> CoreResult<Option<Strategy>> {
    let row = sqlx::query_as::<_, Strategy>(
        r#"SELECT * FROM strategies WHERE webhook_id = ? AND deleted_at IS NULL"#,
    )
    .bind(webhook_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_strategies(pool: &DbPool) -> CoreResult<Vec<Strategy>> {
    let rows = sqlx::query_as::<_, Strategy>(
        r#"SELECT * FROM strategies WHERE deleted_at IS NULL ORDER BY id"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn set_strategy_enabled(pool: &DbPool, id: i64, enabled: bool) -> CoreResult<bool> {
    let result =
        sqlx::query(r#"UPDATE strategies SET enabled = ? WHERE id = ? AND deleted_at IS NULL"#)
            .bind(enabled)
            .bind(id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

/// Soft delete: the row survives for audit, the webhook id stops resolving.
pub async fn soft_delete_strategy(pool: &DbPool, id: i64) -> CoreResult<bool> {
    let result =
        sqlx::query(r#"UPDATE strategies SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL"#)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn insert_symbol_mapping(
    pool: &DbPool,
    strategy_id: i64,
    symbol: &str,
    exchange: &str,
    quantity: i64,
    product: &str,
) -> CoreResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO strategy_symbol_mappings (strategy_id, symbol, exchange, quantity, product)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(strategy_id)
    .bind(symbol)
    .bind(exchange)
    .bind(quantity)
    .bind(product)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn list_symbol_mappings(
    pool: &DbPool,
    strategy_id: i64,
) -> CoreResult<Vec<SymbolMapping>> {
    let rows = sqlx::query_as::<_, SymbolMapping>(
        r#"SELECT * FROM strategy_symbol_mappings WHERE strategy_id = ? ORDER BY id"#,
    )
    .bind(strategy_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn delete_symbol_mappings(pool: &DbPool, strategy_id: i64) -> CoreResult<()> {
    sqlx::query(r#"DELETE FROM strategy_symbol_mappings WHERE strategy_id = ?"#)
        .bind(strategy_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Symbol master ============

/// Replace the whole symbol master in one transaction (master refresh).
pub async fn replace_symbol_master(pool: &DbPool, instruments: &[Instrument]) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(r#"DELETE FROM symbol_master"#)
        .execute(&mut *tx)
        .await?;
    for inst in instruments {
        sqlx::query(
            r#"
            INSERT INTO symbol_master
                (exchange, symbol, token, name, instrument_type, lot_size, tick_size, expiry, strike)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (exchange, symbol) DO UPDATE SET
                token = excluded.token,
                name = excluded.name,
                instrument_type = excluded.instrument_type,
                lot_size = excluded.lot_size,
                tick_size = excluded.tick_size,
                expiry = excluded.expiry,
                strike = excluded.strike
            "#,
        )
        .bind(&inst.exchange)
        .bind(&inst.symbol)
        .bind(&inst.token)
        .bind(&inst.name)
        .bind(&inst.instrument_type)
        .bind(inst.lot_size)
        .bind(inst.tick_size)
        .bind(inst.expiry)
        .bind(inst.strike)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn all_symbols(pool: &DbPool) -> CoreResult<Vec<Instrument>> {
    let rows = sqlx::query_as::<_, Instrument>(r#"SELECT * FROM symbol_master"#)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn count_symbols(pool: &DbPool) -> CoreResult<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM symbol_master"#)
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Prefix/substring search over symbol and name.
pub async fn search_symbols(pool: &DbPool, query: &str, limit: i64) -> CoreResult<Vec<Instrument>> {
    let pattern = format!("%{}%", query.to_uppercase());
    let rows = sqlx::query_as::<_, Instrument>(
        r#"
        SELECT * FROM symbol_master
        WHERE symbol LIKE ? OR name LIKE ?
        ORDER BY symbol
        LIMIT ?
        "#,
    )
    .bind(&pattern)
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Option contracts for an underlying, optionally narrowed to one expiry.
pub async fn option_instruments(
    pool: &DbPool,
    exchange: &str,
    underlying: &str,
    expiry: Option<chrono::NaiveDate>,
) -> CoreResult<Vec<Instrument>> {
    let rows = match expiry {
        Some(exp) => {
            sqlx::query_as::<_, Instrument>(
                r#"
                SELECT * FROM symbol_master
                WHERE exchange = ? AND name = ? AND instrument_type IN ('CE', 'PE') AND expiry = ?
                ORDER BY strike
                "#,
            )
            .bind(exchange)
            .bind(underlying)
            .bind(exp)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Instrument>(
                r#"
                SELECT * FROM symbol_master
                WHERE exchange = ? AND name = ? AND instrument_type IN ('CE', 'PE')
                ORDER BY expiry, strike
                "#,
            )
            .bind(exchange)
            .bind(underlying)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

/// Distinct expiry dates for an underlying/instrument type, ascending.
pub async fn list_expiries(
    pool: &DbPool,
    exchange: &str,
    underlying: &str,
    instrument_type: &str,
) -> CoreResult<Vec<chrono::NaiveDate>> {
    let rows: Vec<(chrono::NaiveDate,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT expiry FROM symbol_master
        WHERE exchange = ? AND name = ? AND instrument_type = ? AND expiry IS NOT NULL
        ORDER BY expiry
        "#,
    )
    .bind(exchange)
    .bind(underlying)
    .bind(instrument_type)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

// ============ Settings ============

pub async fn get_settings(pool: &DbPool) -> CoreResult<Settings> {
    let row = sqlx::query_as::<_, Settings>(r#"SELECT * FROM settings WHERE id = 1"#)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn set_default_broker(pool: &DbPool, broker_id: Option<&str>) -> CoreResult<()> {
    sqlx::query(r#"UPDATE settings SET default_broker = ? WHERE id = 1"#)
        .bind(broker_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_analyzer_mode(pool: &DbPool, enabled: bool) -> CoreResult<()> {
    sqlx::query(r#"UPDATE settings SET analyzer_mode = ? WHERE id = 1"#)
        .bind(enabled)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_ui_prefs(pool: &DbPool, prefs_json: &str) -> CoreResult<()> {
    sqlx::query(r#"UPDATE settings SET ui_prefs = ? WHERE id = 1"#)
        .bind(prefs_json)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_auto_logout(pool: &DbPool, cfg: &AutoLogoutConfig) -> CoreResult<()> {
    let warnings = cfg
        .warning_leads
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(",");
    sqlx::query(
        r#"
        UPDATE settings SET
            auto_logout_enabled = ?,
            auto_logout_hour = ?,
            auto_logout_minute = ?,
            auto_logout_warnings = ?
        WHERE id = 1
        "#,
    )
    .bind(cfg.enabled)
    .bind(cfg.hour as i64)
    .bind(cfg.minute as i64)
    .bind(warnings)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_webhook_server(pool: &DbPool, cfg: &WebhookServerConfig) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE settings SET
            webhook_enabled = ?,
            webhook_host = ?,
            webhook_port = ?,
            webhook_public_url = ?,
            webhook_hmac_secret = ?
        WHERE id = 1
        "#,
    )
    .bind(cfg.enabled)
    .bind(&cfg.host)
    .bind(cfg.port as i64)
    .bind(&cfg.public_url)
    .bind(&cfg.hmac_secret)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Traffic / latency ============

pub async fn insert_traffic_log(
    pool: &DbPool,
    client_ip: &str,
    path: &str,
    method: &str,
    status: i64,
    latency_ms: i64,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO traffic_logs (client_ip, path, method, status, latency_ms, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(client_ip)
    .bind(path)
    .bind(method)
    .bind(status)
    .bind(latency_ms)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent_traffic(pool: &DbPool, limit: i64) -> CoreResult<Vec<TrafficLog>> {
    let rows = sqlx::query_as::<_, TrafficLog>(
        r#"SELECT * FROM traffic_logs ORDER BY id DESC LIMIT ?"#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn insert_latency_log(
    pool: &DbPool,
    op: &str,
    rtt_ms: i64,
    broker_id: Option<&str>,
    success: bool,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO latency_logs (op, rtt_ms, broker_id, success, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(op)
    .bind(rtt_ms)
    .bind(broker_id)
    .bind(success)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Percentiles (nearest-rank) and SLA tiers over latency rows since
/// `since`, optionally narrowed to one operation.
pub async fn latency_summary(
    pool: &DbPool,
    op: Option<&str>,
    since: DateTime<Utc>,
) -> CoreResult<LatencySummary> {
    let rtts: Vec<(i64,)> = match op {
        Some(op) => {
            sqlx::query_as(
                r#"SELECT rtt_ms FROM latency_logs WHERE op = ? AND created_at >= ? ORDER BY rtt_ms"#,
            )
            .bind(op)
            .bind(since)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                r#"SELECT rtt_ms FROM latency_logs WHERE created_at >= ? ORDER BY rtt_ms"#,
            )
            .bind(since)
            .fetch_all(pool)
            .await?
        }
    };
    let rtts: Vec<i64> = rtts.into_iter().map(|r| r.0).collect();
    Ok(summarize_latencies(&rtts))
}

/// Nearest-rank percentiles over an ascending-sorted slice.
fn summarize_latencies(sorted_rtts: &[i64]) -> LatencySummary {
    let count = sorted_rtts.len() as i64;
    if count == 0 {
        return LatencySummary::default();
    }
    let pick = |p: f64| {
        let rank = ((p / 100.0) * count as f64).ceil() as usize;
        sorted_rtts[rank.clamp(1, count as usize) - 1]
    };
    LatencySummary {
        count,
        p50_ms: pick(50.0),
        p90_ms: pick(90.0),
        p95_ms: pick(95.0),
        p99_ms: pick(99.0),
        within_100ms: sorted_rtts.iter().filter(|&&v| v <= 100).count() as i64,
        within_150ms: sorted_rtts.iter().filter(|&&v| v <= 150).count() as i64,
        within_200ms: sorted_rtts.iter().filter(|&&v| v <= 200).count() as i64,
    }
}

/// Drop admission logs older than the retention cutoff.
pub async fn prune_admission_logs(pool: &DbPool, cutoff: DateTime<Utc>) -> CoreResult<u64> {
    let traffic = sqlx::query(r#"DELETE FROM traffic_logs WHERE created_at < ?"#)
        .bind(cutoff)
        .execute(pool)
        .await?;
    let latency = sqlx::query(r#"DELETE FROM latency_logs WHERE created_at < ?"#)
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(traffic.rows_affected() + latency.rows_affected())
}

// ============ IP bans / strikes ============

pub async fn get_ban(pool: &DbPool, ip: &str) -> CoreResult<Option<IpBan>> {
    let row = sqlx::query_as::<_, IpBan>(r#"SELECT * FROM ip_bans WHERE ip = ?"#)
        .bind(ip)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_bans(pool: &DbPool) -> CoreResult<Vec<IpBan>> {
    let rows = sqlx::query_as::<_, IpBan>(r#"SELECT * FROM ip_bans ORDER BY updated_at DESC"#)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn remove_ban(pool: &DbPool, ip: &str) -> CoreResult<bool> {
    let result = sqlx::query(r#"DELETE FROM ip_bans WHERE ip = ?"#)
        .bind(ip)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Strike at which a temporary ban is applied (below the permanent
/// threshold). Gives a flooding caller a cool-off before escalation.
const TEMP_BAN_AFTER_STRIKES: i64 = 3;

/// Record one admission strike for `ip` and escalate when the count
/// reaches the configured threshold inside the sliding window.
///
/// `temp_ban` applies a cool-off once [`TEMP_BAN_AFTER_STRIKES`] is
/// reached (webhook flooding). It must stay false for offences that have
/// to keep reaching the validator to hit the permanent threshold, such as
/// invalid API keys.
///
/// The whole operation is an UPSERT keyed by ip plus one conditional
/// UPDATE, so concurrent offences cannot double-count a strike or produce
/// two escalations.
pub async fn record_strike(
    pool: &DbPool,
    ip: &str,
    reason: &str,
    now: DateTime<Utc>,
    temp_ban: bool,
    cfg: &AdmissionConfig,
) -> CoreResult<StrikeOutcome> {
    let window_cutoff = now - chrono::Duration::seconds(cfg.strike_window_secs);

    // Increment within the window, or restart the window with count 1.
    // Permanent bans keep accumulating (count is informational past the
    // threshold) but the kind is never downgraded.
    sqlx::query(
        r#"
        INSERT INTO ip_bans (ip, kind, expires_at, strike_count, window_start, reason, updated_at)
        VALUES (?1, 'temporary', NULL, 1, ?2, ?3, ?2)
        ON CONFLICT (ip) DO UPDATE SET
            strike_count = CASE
                WHEN ip_bans.kind = 'permanent' THEN ip_bans.strike_count + 1
                WHEN ip_bans.window_start < ?4 THEN 1
                ELSE ip_bans.strike_count + 1
            END,
            window_start = CASE
                WHEN ip_bans.kind = 'permanent' THEN ip_bans.window_start
                WHEN ip_bans.window_start < ?4 THEN ?2
                ELSE ip_bans.window_start
            END,
            reason = ?3,
            updated_at = ?2
        "#,
    )
    .bind(ip)
    .bind(now)
    .bind(reason)
    .bind(window_cutoff)
    .execute(pool)
    .await?;

    let row: (i64, String) =
        sqlx::query_as(r#"SELECT strike_count, kind FROM ip_bans WHERE ip = ?"#)
            .bind(ip)
            .fetch_one(pool)
            .await?;
    let (strike_count, kind) = row;

    if kind != "permanent" && strike_count >= cfg.strike_threshold {
        // Exactly one concurrent caller wins this UPDATE; only the winner
        // reports the escalation.
        let escalation = sqlx::query(
            r#"
            UPDATE ip_bans SET kind = 'permanent', expires_at = NULL, updated_at = ?
            WHERE ip = ? AND kind != 'permanent'
            "#,
        )
        .bind(now)
        .bind(ip)
        .execute(pool)
        .await?;
        return Ok(StrikeOutcome {
            strike_count,
            escalated: escalation.rows_affected() > 0,
        });
    }

    if temp_ban && kind != "permanent" && strike_count >= TEMP_BAN_AFTER_STRIKES {
        let expires = now + chrono::Duration::seconds(cfg.temp_ban_secs);
        sqlx::query(r#"UPDATE ip_bans SET expires_at = ?, updated_at = ? WHERE ip = ?"#)
            .bind(expires)
            .bind(now)
            .bind(ip)
            .execute(pool)
            .await?;
    }

    Ok(StrikeOutcome {
        strike_count,
        escalated: false,
    })
}

// ============ Analyzer audit ============

pub async fn insert_analyzer_log(
    pool: &DbPool,
    strategy_id: Option<i64>,
    payload: &str,
    decision: &str,
) -> CoreResult<i64> {
    let result = sqlx::query(
        r#"INSERT INTO analyzer_logs (strategy_id, payload, decision, created_at) VALUES (?, ?, ?, ?)"#,
    )
    .bind(strategy_id)
    .bind(payload)
    .bind(decision)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn recent_analyzer_logs(pool: &DbPool, limit: i64) -> CoreResult<Vec<AnalyzerLog>> {
    let rows = sqlx::query_as::<_, AnalyzerLog>(
        r#"SELECT * FROM analyzer_logs ORDER BY id DESC LIMIT ?"#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_analyzer_logs(pool: &DbPool) -> CoreResult<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM analyzer_logs"#)
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

// ============ Sandbox ============

pub async fn get_sandbox_funds(pool: &DbPool) -> CoreResult<Option<SandboxFunds>> {
    let row = sqlx::query_as::<_, SandboxFunds>(r#"SELECT * FROM sandbox_funds WHERE id = 1"#)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Reset the sandbox to a clean account with `starting_capital`.
pub async fn reset_sandbox(pool: &DbPool, starting_capital: f64) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(r#"DELETE FROM sandbox_trades"#).execute(&mut *tx).await?;
    sqlx::query(r#"DELETE FROM sandbox_orders"#).execute(&mut *tx).await?;
    sqlx::query(r#"DELETE FROM sandbox_positions"#).execute(&mut *tx).await?;
    sqlx::query(r#"DELETE FROM sandbox_holdings"#).execute(&mut *tx).await?;
    sqlx::query(
        r#"
        INSERT INTO sandbox_funds (id, starting_capital, available_cash, used_margin,
                                   realized_pnl, last_reset_at)
        VALUES (1, ?1, ?1, 0, 0, ?2)
        ON CONFLICT (id) DO UPDATE SET
            starting_capital = ?1,
            available_cash = ?1,
            used_margin = 0,
            realized_pnl = 0,
            last_reset_at = ?2
        "#,
    )
    .bind(starting_capital)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn update_sandbox_funds(
    pool: &DbPool,
    available_cash: f64,
    used_margin: f64,
    realized_pnl: f64,
) -> CoreResult<()> {
    sqlx::query(
        r#"UPDATE sandbox_funds SET available_cash = ?, used_margin = ?, realized_pnl = ? WHERE id = 1"#,
    )
    .bind(available_cash)
    .bind(used_margin)
    .bind(realized_pnl)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_sandbox_position(
    pool: &DbPool,
    symbol: &str,
    exchange: &str,
    product: &str,
) -> CoreResult<Option<SandboxPosition>> {
    let row = sqlx::query_as::<_, SandboxPosition>(
        r#"SELECT * FROM sandbox_positions WHERE symbol = ? AND exchange = ? AND product = ?"#,
    )
    .bind(symbol)
    .bind(exchange)
    .bind(product)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_sandbox_positions(pool: &DbPool) -> CoreResult<Vec<SandboxPosition>> {
    let rows = sqlx::query_as::<_, SandboxPosition>(
        r#"SELECT * FROM sandbox_positions ORDER BY symbol"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Set or clear one sandbox position (quantity 0 deletes the row).
pub async fn upsert_sandbox_position(
    pool: &DbPool,
    symbol: &str,
    exchange: &str,
    product: &str,
    quantity: i64,
    average_price: f64,
) -> CoreResult<()> {
    if quantity == 0 {
        sqlx::query(
            r#"DELETE FROM sandbox_positions WHERE symbol = ? AND exchange = ? AND product = ?"#,
        )
        .bind(symbol)
        .bind(exchange)
        .bind(product)
        .execute(pool)
        .await?;
        return Ok(());
    }
    sqlx::query(
        r#"
        INSERT INTO sandbox_positions (symbol, exchange, product, quantity, average_price)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (symbol, exchange, product) DO UPDATE SET
            quantity = excluded.quantity,
            average_price = excluded.average_price
        "#,
    )
    .bind(symbol)
    .bind(exchange)
    .bind(product)
    .bind(quantity)
    .bind(average_price)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_sandbox_holdings(pool: &DbPool) -> CoreResult<Vec<SandboxHolding>> {
    let rows =
        sqlx::query_as::<_, SandboxHolding>(r#"SELECT * FROM sandbox_holdings ORDER BY symbol"#)
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

pub async fn insert_sandbox_order(pool: &DbPool, order: &SandboxOrder) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sandbox_orders
            (order_id, symbol, exchange, side, quantity, filled_quantity, product,
             price_type, price, trigger_price, status, strategy, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&order.order_id)
    .bind(&order.symbol)
    .bind(&order.exchange)
    .bind(&order.side)
    .bind(order.quantity)
    .bind(order.filled_quantity)
    .bind(&order.product)
    .bind(&order.price_type)
    .bind(order.price)
    .bind(order.trigger_price)
    .bind(&order.status)
    .bind(&order.strategy)
    .bind(order.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_sandbox_order(pool: &DbPool, order_id: &str) -> CoreResult<Option<SandboxOrder>> {
    let row = sqlx::query_as::<_, SandboxOrder>(
        r#"SELECT * FROM sandbox_orders WHERE order_id = ?"#,
    )
    .bind(order_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_sandbox_orders(pool: &DbPool) -> CoreResult<Vec<SandboxOrder>> {
    let rows = sqlx::query_as::<_, SandboxOrder>(
        r#"SELECT * FROM sandbox_orders ORDER BY created_at DESC"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_open_sandbox_orders(pool: &DbPool) -> CoreResult<Vec<SandboxOrder>> {
    let rows = sqlx::query_as::<_, SandboxOrder>(
        r#"SELECT * FROM sandbox_orders WHERE status IN ('open', 'trigger_pending') ORDER BY created_at"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn update_sandbox_order_status(
    pool: &DbPool,
    order_id: &str,
    status: &str,
    filled_quantity: i64,
) -> CoreResult<bool> {
    let result = sqlx::query(
        r#"UPDATE sandbox_orders SET status = ?, filled_quantity = ? WHERE order_id = ?"#,
    )
    .bind(status)
    .bind(filled_quantity)
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn insert_sandbox_trade(pool: &DbPool, trade: &SandboxTrade) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sandbox_trades
            (trade_id, order_id, symbol, exchange, side, quantity, price, product, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&trade.trade_id)
    .bind(&trade.order_id)
    .bind(&trade.symbol)
    .bind(&trade.exchange)
    .bind(&trade.side)
    .bind(trade.quantity)
    .bind(trade.price)
    .bind(&trade.product)
    .bind(trade.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_sandbox_trades(pool: &DbPool) -> CoreResult<Vec<SandboxTrade>> {
    let rows = sqlx::query_as::<_, SandboxTrade>(
        r#"SELECT * FROM sandbox_trades ORDER BY created_at DESC"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
pub(crate) async fn create_test_pool() -> DbPool {
    // A single connection keeps the in-memory database alive and shared.
    let opts = SqliteConnectOptions::new()
        .filename(":memory:")
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .expect("in-memory pool");
    run_migrations(&pool).await.expect("migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_migrations_apply_and_report_version() {
        let pool = create_test_pool().await;
        let version = schema_version(&pool).await.unwrap();
        assert!(version >= 4, "expected all migrations applied, got {version}");
        // Re-running the chain is a no-op.
        run_migrations(&pool).await.unwrap();
        assert_eq!(schema_version(&pool).await.unwrap(), version);
    }

    #[tokio::test]
    async fn test_settings_row_seeded_with_defaults() {
        let pool = create_test_pool().await;
        let settings = get_settings(&pool).await.unwrap();
        let logout = settings.auto_logout();
        assert!(logout.enabled);
        assert_eq!((logout.hour, logout.minute), (3, 0));
        assert_eq!(logout.warning_leads, vec![30, 15, 5, 1]);
        let webhook = settings.webhook_server();
        assert!(!webhook.enabled);
        assert_eq!(webhook.port, 5000);
    }

    #[tokio::test]
    async fn test_session_upsert_keeps_single_row() {
        let pool = create_test_pool().await;
        let user_id = insert_user(&pool, "alice", "$argon2id$stub").await.unwrap();

        upsert_broker_session(&pool, "fyers", b"ct-a", b"na", None, None, user_id)
            .await
            .unwrap();
        upsert_broker_session(&pool, "zerodha", b"ct-b", b"nb", Some(b"ct-f"), Some(b"nf"), user_id)
            .await
            .unwrap();

        let session = get_broker_session(&pool).await.unwrap().unwrap();
        assert_eq!(session.broker_id, "zerodha");
        assert_eq!(session.auth_token.as_deref(), Some(&b"ct-b"[..]));
        assert!(clear_broker_session(&pool).await.unwrap());
        assert!(!clear_broker_session(&pool).await.unwrap());
        assert!(get_broker_session(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_strike_escalates_to_permanent_once() {
        let pool = create_test_pool().await;
        let cfg = Config::default().admission;
        let now = Utc::now();

        for i in 1..5 {
            let outcome = record_strike(&pool, "10.0.0.9", "invalid api key", now, false, &cfg)
                .await
                .unwrap();
            assert_eq!(outcome.strike_count, i);
            assert!(!outcome.escalated);
        }
        let fifth = record_strike(&pool, "10.0.0.9", "invalid api key", now, false, &cfg)
            .await
            .unwrap();
        assert_eq!(fifth.strike_count, 5);
        assert!(fifth.escalated);

        // A sixth offence never re-escalates.
        let sixth = record_strike(&pool, "10.0.0.9", "invalid api key", now, false, &cfg)
            .await
            .unwrap();
        assert!(!sixth.escalated);

        let ban = get_ban(&pool, "10.0.0.9").await.unwrap().unwrap();
        assert_eq!(ban.kind, "permanent");
        assert!(ban.is_active(now + chrono::Duration::days(365)));
    }

    #[tokio::test]
    async fn test_strike_window_resets() {
        let pool = create_test_pool().await;
        let cfg = Config::default().admission;
        let start = Utc::now();

        for _ in 0..2 {
            record_strike(&pool, "10.0.0.7", "bad payload", start, false, &cfg)
                .await
                .unwrap();
        }
        // Past the window the count restarts at 1, but the row persists.
        let later = start + chrono::Duration::seconds(cfg.strike_window_secs + 1);
        let outcome = record_strike(&pool, "10.0.0.7", "bad payload", later, false, &cfg)
            .await
            .unwrap();
        assert_eq!(outcome.strike_count, 1);
    }

    #[tokio::test]
    async fn test_temporary_ban_applied_midway() {
        let pool = create_test_pool().await;
        let cfg = Config::default().admission;
        let now = Utc::now();

        for _ in 0..3 {
            record_strike(&pool, "10.0.0.8", "repeated 404", now, true, &cfg)
                .await
                .unwrap();
        }
        let ban = get_ban(&pool, "10.0.0.8").await.unwrap().unwrap();
        assert_eq!(ban.kind, "temporary");
        assert!(ban.is_active(now));
        assert!(!ban.is_active(now + chrono::Duration::seconds(cfg.temp_ban_secs + 1)));
    }

    #[tokio::test]
    async fn test_latency_summary_percentiles() {
        let rtts: Vec<i64> = (1..=100).collect();
        let summary = summarize_latencies(&rtts);
        assert_eq!(summary.count, 100);
        assert_eq!(summary.p50_ms, 50);
        assert_eq!(summary.p90_ms, 90);
        assert_eq!(summary.p95_ms, 95);
        assert_eq!(summary.p99_ms, 99);
        assert_eq!(summary.within_100ms, 100);
    }

    #[tokio::test]
    async fn test_latency_summary_empty() {
        let summary = summarize_latencies(&[]);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.p99_ms, 0);
    }

    #[tokio::test]
    async fn test_strategy_webhook_lookup_ignores_deleted() {
        let pool = create_test_pool().await;
        let new = NewStrategy {
            name: "breakout".into(),
            exchange: "NSE".into(),
            symbol: "RELIANCE".into(),
            product: "MIS".into(),
            quantity: 1,
            platform: None,
            trade_window_start: None,
            trade_window_end: None,
        };
        let id = insert_strategy(&pool, &new, "u1").await.unwrap();
        assert!(get_strategy_by_webhook(&pool, "u1").await.unwrap().is_some());

        assert!(soft_delete_strategy(&pool, id).await.unwrap());
        assert!(get_strategy_by_webhook(&pool, "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_symbol_master_replace_and_search() {
        let pool = create_test_pool().await;
        let instruments = vec![
            Instrument {
                exchange: "NSE".into(),
                symbol: "RELIANCE".into(),
                token: "2885".into(),
                name: "RELIANCE INDUSTRIES".into(),
                instrument_type: "EQ".into(),
                lot_size: 1,
                tick_size: 0.05,
                expiry: None,
                strike: None,
            },
            Instrument {
                exchange: "NSE".into(),
                symbol: "TCS".into(),
                token: "11536".into(),
                name: "TATA CONSULTANCY".into(),
                instrument_type: "EQ".into(),
                lot_size: 1,
                tick_size: 0.05,
                expiry: None,
                strike: None,
            },
        ];
        replace_symbol_master(&pool, &instruments).await.unwrap();
        assert_eq!(count_symbols(&pool).await.unwrap(), 2);

        let hits = search_symbols(&pool, "tata", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].symbol, "TCS");
    }
}
