//! Auto-logout scheduler: regulator-driven daily session expiry (C5).
//!
//! Trading sessions must not straddle the daily boundary, so the scheduler
//! fires at a configured instant in a fixed regulatory time zone (IST),
//! regardless of system locale. A warning ladder gives an operator holding
//! open positions time to react.
//!
//! Planning is pure (`compute_plan`) and always recomputes the next target
//! from the current wall clock; the loop never adds 24 h to the last fire,
//! so clock jumps re-derive the target and a date never fires twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, watch};

use crate::brokers::{self, BrokerRegistry};
use crate::custodian::SessionCustodian;
use crate::db::{self, AutoLogoutConfig, DbPool};
use crate::error::CoreResult;
use crate::events::{Event, EventBus};
use crate::metrics;

/// All expiry math happens in this zone.
pub const REGULATORY_TZ: Tz = chrono_tz::Asia::Kolkata;

/// The computed schedule until the next fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryPlan {
    pub fire_at: DateTime<Utc>,
    /// (lead minutes, instant) pairs still ahead, ascending by instant.
    pub warnings: Vec<(u32, DateTime<Utc>)>,
}

/// Next instant matching (hour, minute) in the regulatory zone, strictly
/// after `now`.
pub fn next_fire(cfg: &AutoLogoutConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let local_date = now.with_timezone(&REGULATORY_TZ).date_naive();
    for day_offset in 0..=2 {
        let date = local_date + chrono::Duration::days(day_offset);
        let Some(naive) = date.and_hms_opt(cfg.hour, cfg.minute, 0) else {
            continue;
        };
        // `earliest` resolves DST gaps deterministically (IST has none,
        // but the math must not assume that).
        if let Some(local) = REGULATORY_TZ.from_local_datetime(&naive).earliest() {
            let candidate = local.with_timezone(&Utc);
            if candidate > now {
                return candidate;
            }
        }
    }
    now + chrono::Duration::days(1)
}

/// Full plan: the fire instant plus the warning instants still ahead.
pub fn compute_plan(cfg: &AutoLogoutConfig, now: DateTime<Utc>) -> ExpiryPlan {
    let fire_at = next_fire(cfg, now);
    let mut warnings: Vec<(u32, DateTime<Utc>)> = cfg
        .warning_leads
        .iter()
        .map(|&lead| (lead, fire_at - chrono::Duration::minutes(lead as i64)))
        .filter(|(_, at)| *at > now)
        .collect();
    warnings.sort_by_key(|(_, at)| *at);
    ExpiryPlan { fire_at, warnings }
}

pub struct AutoLogoutScheduler {
    pool: DbPool,
    custodian: Arc<SessionCustodian>,
    brokers: Arc<BrokerRegistry>,
    events: EventBus,
    reschedule_rx: watch::Receiver<()>,
    revoke_timeout: Duration,
}

/// Forces the scheduler to recompute its plan (settings changed).
#[derive(Clone)]
pub struct RescheduleHandle {
    tx: watch::Sender<()>,
}

impl RescheduleHandle {
    pub fn reschedule(&self) {
        let _ = self.tx.send(());
    }
}

impl AutoLogoutScheduler {
    pub fn new(
        pool: DbPool,
        custodian: Arc<SessionCustodian>,
        brokers: Arc<BrokerRegistry>,
        events: EventBus,
        revoke_timeout: Duration,
    ) -> (Self, RescheduleHandle) {
        let (tx, reschedule_rx) = watch::channel(());
        (
            Self {
                pool,
                custodian,
                brokers,
                events,
                reschedule_rx,
                revoke_timeout,
            },
            RescheduleHandle { tx },
        )
    }

    /// Run until shutdown. Reconfiguration is observed on the next
    /// iteration, immediately after a `reschedule()`.
    pub async fn run(mut self, mut shutdown: mpsc::Receiver<()>) -> CoreResult<()> {
        let mut last_fired_date: Option<NaiveDate> = None;
        // Mark the current reschedule generation as seen.
        self.reschedule_rx.borrow_and_update();

        loop {
            let cfg = db::get_settings(&self.pool).await?.auto_logout();
            if !cfg.enabled {
                tracing::debug!("auto-logout disabled, waiting for reconfiguration");
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    changed = self.reschedule_rx.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            let mut plan = compute_plan(&cfg, Utc::now());
            tracing::info!(
                fire_at = %plan.fire_at.with_timezone(&REGULATORY_TZ),
                warnings = plan.warnings.len(),
                "auto-logout scheduled"
            );

            'plan: loop {
                let now = Utc::now();
                let next_instant = plan
                    .warnings
                    .first()
                    .map(|(_, at)| *at)
                    .unwrap_or(plan.fire_at);
                let sleep_for = (next_instant - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    changed = self.reschedule_rx.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        tracing::debug!("reschedule requested, recomputing plan");
                        break 'plan;
                    }
                    _ = tokio::time::sleep(sleep_for) => {
                        let now = Utc::now();
                        if now < next_instant {
                            // Wall clock moved backwards mid-sleep;
                            // re-derive the whole plan.
                            if plan.fire_at != next_fire(&cfg, now) {
                                break 'plan;
                            }
                            continue 'plan;
                        }
                        if let Some(&(lead, at)) = plan.warnings.first() {
                            if at <= now && now < plan.fire_at {
                                plan.warnings.remove(0);
                                self.emit_warning(lead);
                                continue 'plan;
                            }
                        }
                        // Terminal fire, at most once per regulatory date.
                        let fire_date = plan.fire_at.with_timezone(&REGULATORY_TZ).date_naive();
                        if last_fired_date != Some(fire_date) {
                            last_fired_date = Some(fire_date);
                            self.expire_session().await;
                        }
                        break 'plan;
                    }
                }
            }
        }
    }

    fn emit_warning(&self, minutes_remaining: u32) {
        tracing::info!(minutes_remaining, "auto-logout warning");
        self.events.publish(Event::AutoLogoutWarning {
            minutes_remaining,
            message: format!("Trading session expires in {minutes_remaining} minute(s)"),
        });
    }

    /// The terminal sequence: emit, revoke locally, then best-effort
    /// upstream logout under a bounded deadline with no retry.
    async fn expire_session(&self) {
        let session = match self.custodian.load_active_session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "could not load session at expiry");
                None
            }
        };

        let Some(session) = session else {
            tracing::debug!("auto-logout fired with no active broker session");
            return;
        };

        // Event first: clients observing it may assume session-requiring
        // commands fail from here on.
        self.events.publish(Event::AutoLogout {
            reason: "scheduled daily session expiry".into(),
            timestamp: Utc::now(),
        });
        metrics::record_auto_logout();

        if let Err(e) = self.custodian.revoke().await {
            tracing::error!(error = %e, "local session revocation failed");
        }

        match self.brokers.get(&session.broker_id) {
            Ok(adapter) => {
                let result = brokers::with_deadline(
                    self.revoke_timeout,
                    adapter.logout(&session.auth_token),
                )
                .await;
                if let Err(e) = result {
                    tracing::warn!(
                        broker_id = %session.broker_id,
                        error = %e,
                        "upstream logout failed (best-effort, not retried)"
                    );
                }
            }
            Err(_) => {
                tracing::warn!(broker_id = %session.broker_id, "no adapter for upstream logout");
            }
        }
        tracing::info!(broker_id = %session.broker_id, "auto-logout complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(hour: u32, minute: u32, leads: &[u32]) -> AutoLogoutConfig {
        AutoLogoutConfig {
            enabled: true,
            hour,
            minute,
            warning_leads: leads.to_vec(),
        }
    }

    fn ist(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        REGULATORY_TZ
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_next_fire_is_strictly_after_now() {
        let cfg = cfg(3, 0, &[]);
        // 02:59 IST fires the same day at 03:00.
        assert_eq!(
            next_fire(&cfg, ist(2024, 6, 10, 2, 59)),
            ist(2024, 6, 10, 3, 0)
        );
        // Exactly 03:00 IST rolls to the next day.
        assert_eq!(
            next_fire(&cfg, ist(2024, 6, 10, 3, 0)),
            ist(2024, 6, 11, 3, 0)
        );
        // Late evening fires the following morning.
        assert_eq!(
            next_fire(&cfg, ist(2024, 6, 10, 22, 30)),
            ist(2024, 6, 11, 3, 0)
        );
    }

    #[test]
    fn test_warning_ladder_at_0228() {
        let cfg = cfg(3, 0, &[30, 15, 5, 1]);
        let now = ist(2024, 6, 10, 2, 28);
        let plan = compute_plan(&cfg, now);

        assert_eq!(plan.fire_at, ist(2024, 6, 10, 3, 0));
        let instants: Vec<DateTime<Utc>> = plan.warnings.iter().map(|(_, at)| *at).collect();
        assert_eq!(
            instants,
            vec![
                ist(2024, 6, 10, 2, 30),
                ist(2024, 6, 10, 2, 45),
                ist(2024, 6, 10, 2, 55),
                ist(2024, 6, 10, 2, 59),
            ]
        );
        let leads: Vec<u32> = plan.warnings.iter().map(|(lead, _)| *lead).collect();
        assert_eq!(leads, vec![30, 15, 5, 1]);
    }

    #[test]
    fn test_elapsed_warnings_are_dropped() {
        let cfg = cfg(3, 0, &[30, 15, 5, 1]);
        // At 02:50 the 30- and 15-minute warnings are already behind.
        let plan = compute_plan(&cfg, ist(2024, 6, 10, 2, 50));
        let leads: Vec<u32> = plan.warnings.iter().map(|(lead, _)| *lead).collect();
        assert_eq!(leads, vec![5, 1]);
    }

    #[test]
    fn test_plan_recomputation_is_stable_across_clock_jumps() {
        let cfg = cfg(3, 0, &[]);
        let fire = next_fire(&cfg, ist(2024, 6, 10, 2, 0));
        // A backwards jump re-derives the same target, not target + 24 h.
        assert_eq!(next_fire(&cfg, ist(2024, 6, 10, 1, 0)), fire);
    }

    #[test]
    fn test_fire_time_is_fixed_zone_not_utc() {
        let cfg = cfg(3, 0, &[]);
        let fire = next_fire(&cfg, ist(2024, 6, 10, 2, 0));
        // 03:00 IST is 21:30 UTC the previous day.
        assert_eq!(
            fire,
            Utc.with_ymd_and_hms(2024, 6, 9, 21, 30, 0).unwrap()
        );
    }
}
