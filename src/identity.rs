//! Local-user identity: setup, login, logout, and the admission API key.
//!
//! The state machine is `NotInitialized -> Idle <-> Authenticated`. The
//! in-memory session is never persisted: a restart lands in `Idle` even when
//! a broker token is still valid, and the operator logs in again.
//!
//! Password hashing and verification are CPU-bound and run on the blocking
//! pool; login failures feed a sliding-window rate limit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hex::ToHex;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::db::{self, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::vault::SecretVault;

const MAX_FAILED_LOGINS: usize = 5;
const LOGIN_WINDOW: Duration = Duration::from_secs(60);
const MIN_PASSWORD_LEN: usize = 8;

/// Current identity state, side-effect free to query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// No local user exists; only `setup` is valid.
    NotInitialized,
    /// A user exists but nobody is logged in.
    Idle,
    Authenticated {
        user_id: i64,
        username: String,
        at: DateTime<Utc>,
    },
}

struct ActiveLogin {
    user_id: i64,
    username: String,
    at: DateTime<Utc>,
}

pub struct IdentityManager {
    pool: DbPool,
    vault: Arc<SecretVault>,
    session: Mutex<Option<ActiveLogin>>,
    failed_attempts: Mutex<VecDeque<Instant>>,
}

impl IdentityManager {
    pub fn new(pool: DbPool, vault: Arc<SecretVault>) -> Self {
        Self {
            pool,
            vault,
            session: Mutex::new(None),
            failed_attempts: Mutex::new(VecDeque::new()),
        }
    }

    /// One-shot creation of the local user.
    pub async fn setup(&self, username: &str, password: &str) -> CoreResult<i64> {
        if db::count_users(&self.pool).await? > 0 {
            return Err(CoreError::AlreadyInitialized);
        }
        if username.trim().is_empty() {
            return Err(CoreError::PayloadInvalid("username must not be empty".into()));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(CoreError::PayloadInvalid(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let vault = Arc::clone(&self.vault);
        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || vault.hash_password(&password))
            .await
            .map_err(|e| CoreError::internal(format!("hash task: {e}")))??;

        let user_id = db::insert_user(&self.pool, username.trim(), &hash).await?;
        tracing::info!(username = %username.trim(), "local user created");
        Ok(user_id)
    }

    /// Verify credentials and open the in-memory session.
    pub async fn login(&self, username: &str, password: &str) -> CoreResult<SessionState> {
        self.check_rate_limit()?;

        let user = db::get_user(&self.pool)
            .await?
            .ok_or(CoreError::NotAuthenticated)?;
        if user.username != username {
            self.record_failure();
            return Err(CoreError::NotAuthenticated);
        }

        let vault = Arc::clone(&self.vault);
        let password = password.to_string();
        let hash = user.password_hash.clone();
        let ok = tokio::task::spawn_blocking(move || vault.verify_password(&password, &hash))
            .await
            .map_err(|e| CoreError::internal(format!("verify task: {e}")))??;

        if !ok {
            self.record_failure();
            return Err(CoreError::NotAuthenticated);
        }

        self.failed_attempts.lock().clear();
        let at = Utc::now();
        *self.session.lock() = Some(ActiveLogin {
            user_id: user.id,
            username: user.username.clone(),
            at,
        });
        tracing::info!(username = %user.username, "operator logged in");
        Ok(SessionState::Authenticated {
            user_id: user.id,
            username: user.username,
            at,
        })
    }

    /// Close the in-memory session. Idempotent.
    pub fn logout(&self) {
        if self.session.lock().take().is_some() {
            tracing::info!("operator logged out");
        }
    }

    /// Current state without side effects.
    pub async fn check_session(&self) -> CoreResult<SessionState> {
        if let Some(active) = self.session.lock().as_ref() {
            return Ok(SessionState::Authenticated {
                user_id: active.user_id,
                username: active.username.clone(),
                at: active.at,
            });
        }
        if db::count_users(&self.pool).await? == 0 {
            Ok(SessionState::NotInitialized)
        } else {
            Ok(SessionState::Idle)
        }
    }

    /// User id of the logged-in operator, or `NotAuthenticated`.
    pub fn require_user(&self) -> CoreResult<i64> {
        self.session
            .lock()
            .as_ref()
            .map(|a| a.user_id)
            .ok_or(CoreError::NotAuthenticated)
    }

    pub fn current_user_id(&self) -> Option<i64> {
        self.session.lock().as_ref().map(|a| a.user_id)
    }

    fn check_rate_limit(&self) -> CoreResult<()> {
        let mut attempts = self.failed_attempts.lock();
        let now = Instant::now();
        while let Some(front) = attempts.front() {
            if now.duration_since(*front) > LOGIN_WINDOW {
                attempts.pop_front();
            } else {
                break;
            }
        }
        if attempts.len() >= MAX_FAILED_LOGINS {
            let oldest = attempts.front().expect("non-empty");
            let retry_after = LOGIN_WINDOW
                .checked_sub(now.duration_since(*oldest))
                .unwrap_or_default();
            return Err(CoreError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }
        Ok(())
    }

    fn record_failure(&self) {
        self.failed_attempts.lock().push_back(Instant::now());
    }

    // ---- admission API key ----

    /// Issue a fresh API key for the admission surface. The cleartext is
    /// returned exactly once; the store keeps an Argon2 hash for validation
    /// and an encrypted copy (own nonce) for later display.
    pub async fn regenerate_api_key(&self) -> CoreResult<String> {
        let user_id = self.require_user()?;

        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let key: String = raw.encode_hex();

        let vault = Arc::clone(&self.vault);
        let key_for_hash = key.clone();
        let hash = tokio::task::spawn_blocking(move || vault.hash_password(&key_for_hash))
            .await
            .map_err(|e| CoreError::internal(format!("hash task: {e}")))??;
        let (cipher, nonce) = self.vault.encrypt(key.as_bytes())?;

        db::set_user_api_key(&self.pool, user_id, &hash, &cipher, &nonce).await?;
        tracing::info!("admission api key rotated");
        Ok(key)
    }

    /// Validate an inbound `apikey` field against the stored hash.
    pub async fn verify_api_key(&self, candidate: &str) -> CoreResult<bool> {
        let Some(user) = db::get_user(&self.pool).await? else {
            return Ok(false);
        };
        let Some(hash) = user.api_key_hash else {
            return Ok(false);
        };
        let vault = Arc::clone(&self.vault);
        let candidate = candidate.to_string();
        let ok = tokio::task::spawn_blocking(move || vault.verify_password(&candidate, &hash))
            .await
            .map_err(|e| CoreError::internal(format!("verify task: {e}")))??;
        Ok(ok)
    }

    /// Decrypt the stored API key for display in the UI.
    pub async fn reveal_api_key(&self) -> CoreResult<Option<String>> {
        self.require_user()?;
        let Some(user) = db::get_user(&self.pool).await? else {
            return Ok(None);
        };
        let (Some(cipher), Some(nonce)) = (user.api_key, user.api_key_nonce) else {
            return Ok(None);
        };
        let plaintext = self.vault.decrypt(&cipher, &nonce)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| CoreError::CryptoFailure("api key is not utf-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MasterSecrets;

    async fn manager() -> IdentityManager {
        let pool = db::create_test_pool().await;
        let vault = Arc::new(SecretVault::from_secrets(MasterSecrets::generate()));
        IdentityManager::new(pool, vault)
    }

    #[tokio::test]
    async fn test_setup_then_login_flow() {
        let m = manager().await;
        assert!(matches!(
            m.check_session().await.unwrap(),
            SessionState::NotInitialized
        ));

        m.setup("alice", "password1").await.unwrap();
        assert!(matches!(m.check_session().await.unwrap(), SessionState::Idle));

        let state = m.login("alice", "password1").await.unwrap();
        assert!(matches!(state, SessionState::Authenticated { .. }));
        assert!(m.require_user().is_ok());

        m.logout();
        assert!(matches!(m.check_session().await.unwrap(), SessionState::Idle));
        assert!(matches!(m.require_user(), Err(CoreError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_second_setup_rejected() {
        let m = manager().await;
        m.setup("alice", "password1").await.unwrap();
        assert!(matches!(
            m.setup("bob", "password2").await,
            Err(CoreError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_short_password_rejected() {
        let m = manager().await;
        assert!(matches!(
            m.setup("alice", "short").await,
            Err(CoreError::PayloadInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_password_then_rate_limit() {
        let m = manager().await;
        m.setup("alice", "password1").await.unwrap();

        for _ in 0..5 {
            assert!(matches!(
                m.login("alice", "wrong-pass").await,
                Err(CoreError::NotAuthenticated)
            ));
        }
        // The sixth attempt inside the window is refused before any
        // verification happens.
        assert!(matches!(
            m.login("alice", "password1").await,
            Err(CoreError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let m = manager().await;
        m.setup("alice", "password1").await.unwrap();
        m.login("alice", "password1").await.unwrap();
        m.logout();
        m.logout();
        assert!(matches!(m.check_session().await.unwrap(), SessionState::Idle));
    }

    #[tokio::test]
    async fn test_api_key_lifecycle() {
        let m = manager().await;
        m.setup("alice", "password1").await.unwrap();
        m.login("alice", "password1").await.unwrap();

        let key = m.regenerate_api_key().await.unwrap();
        assert_eq!(key.len(), 64);
        assert!(m.verify_api_key(&key).await.unwrap());
        assert!(!m.verify_api_key("not-the-key").await.unwrap());
        assert_eq!(m.reveal_api_key().await.unwrap(), Some(key.clone()));

        // Rotation invalidates the old key.
        let new_key = m.regenerate_api_key().await.unwrap();
        assert_ne!(key, new_key);
        assert!(!m.verify_api_key(&key).await.unwrap());
        assert!(m.verify_api_key(&new_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_api_key_requires_login() {
        let m = manager().await;
        m.setup("alice", "password1").await.unwrap();
        assert!(matches!(
            m.regenerate_api_key().await,
            Err(CoreError::NotAuthenticated)
        ));
    }
}
