//! Error taxonomy for the backend core.
//!
//! Every failure surfaced across a component boundary is one of these kinds.
//! The services layer never swaps a failure for a success; only `Timeout` on
//! an idempotent read is retried (once, with jitter) before propagating.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The OS keychain refused or is unreachable. Not retryable; the
    /// operator must unlock their session.
    #[error("keychain unavailable: {0}")]
    VaultUnavailable(String),

    /// An underlying cryptographic primitive failed.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// Ciphertext failed authentication: damaged bytes or diverged keys.
    /// The plaintext is never returned.
    #[error("authentication tag mismatch")]
    AuthTagMismatch,

    /// Migrations are pending; all non-setup commands are blocked.
    #[error("schema out of date: migrations pending")]
    SchemaOutOfDate,

    /// A local user already exists; `setup` is a one-shot operation.
    #[error("local user already initialized")]
    AlreadyInitialized,

    /// The command requires an authenticated local user.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The command requires an active broker session and none exists.
    #[error("no active broker session")]
    NoActiveBroker,

    /// A stored broker session failed decryption and was cleared.
    #[error("stored broker session corrupted; re-login required")]
    SessionCorrupted,

    /// The upstream broker API returned an error; code and message are
    /// carried verbatim.
    #[error("broker error {code}: {message}")]
    Upstream { code: String, message: String },

    /// Login or admission rate exceeded.
    #[error("rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The caller's IP is blocked. Non-retryable.
    #[error("banned ({kind})")]
    Banned { kind: BanKind },

    /// Malformed webhook or REST body. Counts as an admission strike.
    #[error("invalid payload: {0}")]
    PayloadInvalid(String),

    /// An outbound deadline was exceeded.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Catch-all; logged with a correlation id for support.
    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: Uuid,
        message: String,
    },
}

/// Ban classification shared by the admission layer and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanKind {
    Temporary,
    Permanent,
}

impl BanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BanKind::Temporary => "temporary",
            BanKind::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "temporary" => Some(BanKind::Temporary),
            "permanent" => Some(BanKind::Permanent),
            _ => None,
        }
    }
}

impl std::fmt::Display for BanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CoreError {
    /// Wrap an unexpected failure with a fresh correlation id and log it.
    pub fn internal(message: impl Into<String>) -> Self {
        let correlation_id = Uuid::new_v4();
        let message = message.into();
        tracing::error!(%correlation_id, %message, "internal error");
        CoreError::Internal {
            correlation_id,
            message,
        }
    }

    /// Stable machine-readable code carried on every wire surface.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::VaultUnavailable(_) => "VAULT_UNAVAILABLE",
            CoreError::CryptoFailure(_) => "CRYPTO_FAILURE",
            CoreError::AuthTagMismatch => "AUTH_TAG_MISMATCH",
            CoreError::SchemaOutOfDate => "SCHEMA_OUT_OF_DATE",
            CoreError::AlreadyInitialized => "ALREADY_INITIALIZED",
            CoreError::NotAuthenticated => "NOT_AUTHENTICATED",
            CoreError::NoActiveBroker => "NO_ACTIVE_BROKER",
            CoreError::SessionCorrupted => "SESSION_CORRUPTED",
            CoreError::Upstream { .. } => "UPSTREAM",
            CoreError::RateLimited { .. } => "RATE_LIMITED",
            CoreError::Banned { .. } => "BANNED",
            CoreError::PayloadInvalid(_) => "PAYLOAD_INVALID",
            CoreError::Timeout(_) => "TIMEOUT",
            CoreError::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether a single automatic retry is permitted. Only deadline
    /// overruns qualify, and callers must additionally know the operation
    /// is an idempotent read.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::internal(format!("database error: {e}"))
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        CoreError::internal(format!("migration error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_kind_round_trip() {
        assert_eq!(BanKind::parse("temporary"), Some(BanKind::Temporary));
        assert_eq!(BanKind::parse("permanent"), Some(BanKind::Permanent));
        assert_eq!(BanKind::parse("forever"), None);
        assert_eq!(BanKind::Permanent.as_str(), "permanent");
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(CoreError::NoActiveBroker.code(), "NO_ACTIVE_BROKER");
        assert_eq!(
            CoreError::RateLimited {
                retry_after_secs: 30
            }
            .code(),
            "RATE_LIMITED"
        );
    }

    #[test]
    fn test_internal_carries_correlation_id() {
        let e = CoreError::internal("boom");
        match e {
            CoreError::Internal {
                correlation_id,
                message,
            } => {
                assert!(!correlation_id.is_nil());
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
