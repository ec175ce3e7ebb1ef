//! Secure backend core of the TradeDesk desktop trading client.
//!
//! The crate custodies broker credentials and session tokens under
//! OS-keychain-backed encryption, authenticates the local operator,
//! enforces the regulatory daily session expiry, and admits external
//! signals (webhooks, REST) through a ban-aware pipeline that dispatches
//! into a single services layer over broker adapters.

pub mod analytics;
pub mod autologout;
pub mod brokers;
pub mod config;
pub mod custodian;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod ipc;
pub mod metrics;
pub mod sandbox;
pub mod services;
pub mod symbols;
pub mod types;
pub mod vault;
