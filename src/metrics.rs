//! Prometheus metrics for the backend core.
//!
//! Gathered by the admission gateway's /metrics endpoint.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Gauge, HistogramVec,
};

lazy_static! {
    // Admission metrics
    pub static ref ADMITTED_REQUESTS: CounterVec = register_counter_vec!(
        "tradedesk_admission_requests_total",
        "Inbound requests by route class and final status",
        &["route", "status"]
    ).unwrap();

    pub static ref ADMISSION_STRIKES: CounterVec = register_counter_vec!(
        "tradedesk_admission_strikes_total",
        "Admission strikes recorded, by reason",
        &["reason"]
    ).unwrap();

    pub static ref BANS_ESCALATED: CounterVec = register_counter_vec!(
        "tradedesk_bans_escalated_total",
        "IPs escalated to a permanent ban",
        &["reason"]
    ).unwrap();

    pub static ref REQUEST_LATENCY: HistogramVec = register_histogram_vec!(
        "tradedesk_request_latency_seconds",
        "Admission request latency",
        &["route"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.15, 0.2, 0.5, 1.0, 5.0]
    ).unwrap();

    // Broker metrics
    pub static ref BROKER_CALLS: CounterVec = register_counter_vec!(
        "tradedesk_broker_calls_total",
        "Broker adapter calls by operation and outcome",
        &["op", "status"]
    ).unwrap();

    pub static ref BROKER_CALL_LATENCY: HistogramVec = register_histogram_vec!(
        "tradedesk_broker_call_latency_seconds",
        "Broker adapter call latency by operation",
        &["op"],
        vec![0.01, 0.05, 0.1, 0.15, 0.2, 0.5, 1.0, 5.0, 15.0]
    ).unwrap();

    // Scheduler metrics
    pub static ref AUTO_LOGOUTS: Counter = register_counter!(
        "tradedesk_auto_logouts_total",
        "Scheduled session expiries performed"
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "tradedesk_up",
        "Whether the backend core is up and running"
    ).unwrap();
}

/// Record one admitted (or rejected) request.
pub fn record_request(route: &str, status: u16, latency_secs: f64) {
    ADMITTED_REQUESTS
        .with_label_values(&[route, &status.to_string()])
        .inc();
    REQUEST_LATENCY
        .with_label_values(&[route])
        .observe(latency_secs);
}

/// Record an admission strike.
pub fn record_strike(reason: &str) {
    ADMISSION_STRIKES.with_label_values(&[reason]).inc();
}

/// Record a permanent-ban escalation.
pub fn record_escalation(reason: &str) {
    BANS_ESCALATED.with_label_values(&[reason]).inc();
}

/// Record a broker adapter call.
pub fn record_broker_call(op: &str, success: bool, latency_secs: f64) {
    let status = if success { "success" } else { "failure" };
    BROKER_CALLS.with_label_values(&[op, status]).inc();
    BROKER_CALL_LATENCY
        .with_label_values(&[op])
        .observe(latency_secs);
}

/// Record a scheduled session expiry.
pub fn record_auto_logout() {
    AUTO_LOGOUTS.inc();
}
