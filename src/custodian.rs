//! Broker-session custodian: encrypted custody of broker tokens and
//! credentials (C4).
//!
//! Single-active-broker model: at most one session row exists, and the
//! custodian serializes every read-modify-write on it behind an exclusive
//! async lock. Auth and feed tokens always draw independent nonces; a
//! decrypt failure clears the row and surfaces `SessionCorrupted`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::brokers::AuthCredentials;
use crate::db::{self, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::vault::SecretVault;

/// Decrypted view of the active broker session.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub broker_id: String,
    pub auth_token: String,
    pub feed_token: Option<String>,
    pub authenticated_at: DateTime<Utc>,
}

pub struct SessionCustodian {
    pool: DbPool,
    vault: Arc<SecretVault>,
    /// Exclusive across every session read-modify-write cycle.
    lock: Mutex<()>,
}

impl SessionCustodian {
    pub fn new(pool: DbPool, vault: Arc<SecretVault>) -> Self {
        Self {
            pool,
            vault,
            lock: Mutex::new(()),
        }
    }

    /// Encrypt and upsert the active session. Each token gets its own
    /// freshly drawn nonce.
    pub async fn save_session(
        &self,
        broker_id: &str,
        auth_token: &str,
        feed_token: Option<&str>,
        user_id: i64,
    ) -> CoreResult<()> {
        let _guard = self.lock.lock().await;

        let (auth_cipher, auth_nonce) = self.vault.encrypt(auth_token.as_bytes())?;
        let feed = match feed_token {
            Some(token) => Some(self.vault.encrypt(token.as_bytes())?),
            None => None,
        };
        let (feed_cipher, feed_nonce) = match &feed {
            Some((c, n)) => (Some(c.as_slice()), Some(n.as_slice())),
            None => (None, None),
        };

        db::upsert_broker_session(
            &self.pool,
            broker_id,
            &auth_cipher,
            &auth_nonce,
            feed_cipher,
            feed_nonce,
            user_id,
        )
        .await?;
        tracing::info!(broker_id, "broker session saved");
        Ok(())
    }

    /// Decrypt the active session. A damaged row is cleared before
    /// `SessionCorrupted` is returned; the ciphertext is never surfaced.
    pub async fn load_active_session(&self) -> CoreResult<Option<ActiveSession>> {
        let _guard = self.lock.lock().await;

        let Some(row) = db::get_broker_session(&self.pool).await? else {
            return Ok(None);
        };

        let (Some(auth_cipher), Some(auth_nonce)) = (&row.auth_token, &row.auth_token_nonce)
        else {
            // A row without ciphertext is a legacy or tampered artifact.
            db::clear_broker_session(&self.pool).await?;
            return Err(CoreError::SessionCorrupted);
        };

        let auth_token = match self.vault.decrypt(auth_cipher, auth_nonce) {
            Ok(bytes) => String::from_utf8(bytes)
                .map_err(|_| CoreError::CryptoFailure("auth token is not utf-8".into()))?,
            Err(CoreError::AuthTagMismatch) => {
                db::clear_broker_session(&self.pool).await?;
                tracing::warn!(broker_id = %row.broker_id, "session row failed decryption, cleared");
                return Err(CoreError::SessionCorrupted);
            }
            Err(e) => return Err(e),
        };

        let feed_token = match (&row.feed_token, &row.feed_token_nonce) {
            (Some(cipher), Some(nonce)) => match self.vault.decrypt(cipher, nonce) {
                Ok(bytes) => Some(
                    String::from_utf8(bytes)
                        .map_err(|_| CoreError::CryptoFailure("feed token is not utf-8".into()))?,
                ),
                Err(CoreError::AuthTagMismatch) => {
                    db::clear_broker_session(&self.pool).await?;
                    tracing::warn!(broker_id = %row.broker_id, "feed token failed decryption, session cleared");
                    return Err(CoreError::SessionCorrupted);
                }
                Err(e) => return Err(e),
            },
            _ => None,
        };

        Ok(Some(ActiveSession {
            broker_id: row.broker_id,
            auth_token,
            feed_token,
            authenticated_at: row.authenticated_at,
        }))
    }

    /// Active broker id without decrypting tokens.
    pub async fn active_broker(&self) -> CoreResult<Option<String>> {
        Ok(db::get_broker_session(&self.pool)
            .await?
            .map(|row| row.broker_id))
    }

    /// Delete the session row. Idempotent; returns whether a row existed.
    /// Callers additionally ask the broker adapter to invalidate the token
    /// upstream, best-effort.
    pub async fn revoke(&self) -> CoreResult<bool> {
        let _guard = self.lock.lock().await;
        let existed = db::clear_broker_session(&self.pool).await?;
        if existed {
            tracing::info!("broker session revoked");
        }
        Ok(existed)
    }

    // ---- broker credentials ----

    /// Encrypt and upsert a broker credential. Key and secret draw
    /// independent nonces; the client id is plaintext by design.
    pub async fn save_credential(
        &self,
        broker_id: &str,
        api_key: &str,
        api_secret: Option<&str>,
        client_id: Option<&str>,
    ) -> CoreResult<()> {
        let (key_cipher, key_nonce) = self.vault.encrypt(api_key.as_bytes())?;
        let secret = match api_secret {
            Some(secret) => Some(self.vault.encrypt(secret.as_bytes())?),
            None => None,
        };
        let (secret_cipher, secret_nonce) = match &secret {
            Some((c, n)) => (Some(c.as_slice()), Some(n.as_slice())),
            None => (None, None),
        };
        db::upsert_broker_credential(
            &self.pool,
            broker_id,
            &key_cipher,
            &key_nonce,
            secret_cipher,
            secret_nonce,
            client_id,
        )
        .await?;
        tracing::info!(broker_id, "broker credential stored");
        Ok(())
    }

    /// Decrypt a stored credential into adapter-ready material.
    pub async fn load_credential(&self, broker_id: &str) -> CoreResult<Option<AuthCredentials>> {
        let Some(row) = db::get_broker_credential(&self.pool, broker_id).await? else {
            return Ok(None);
        };
        let api_key = String::from_utf8(self.vault.decrypt(&row.api_key, &row.api_key_nonce)?)
            .map_err(|_| CoreError::CryptoFailure("api key is not utf-8".into()))?;
        let api_secret = match (&row.api_secret, &row.api_secret_nonce) {
            (Some(cipher), Some(nonce)) => Some(
                String::from_utf8(self.vault.decrypt(cipher, nonce)?)
                    .map_err(|_| CoreError::CryptoFailure("api secret is not utf-8".into()))?,
            ),
            _ => None,
        };
        Ok(Some(AuthCredentials {
            api_key,
            api_secret,
            client_id: row.client_id,
            auth_code: None,
        }))
    }

    pub async fn delete_credential(&self, broker_id: &str) -> CoreResult<bool> {
        db::delete_broker_credential(&self.pool, broker_id).await
    }

    pub async fn list_credential_brokers(&self) -> CoreResult<Vec<String>> {
        db::list_broker_credential_ids(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MasterSecrets;

    async fn custodian() -> (SessionCustodian, DbPool) {
        let pool = db::create_test_pool().await;
        let vault = Arc::new(SecretVault::from_secrets(MasterSecrets::generate()));
        (SessionCustodian::new(pool.clone(), vault), pool)
    }

    async fn seed_user(pool: &DbPool) -> i64 {
        db::insert_user(pool, "alice", "$argon2id$stub").await.unwrap()
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (custodian, pool) = custodian().await;
        let user_id = seed_user(&pool).await;

        custodian
            .save_session("fyers", "TOKEN_A", Some("FEED_B"), user_id)
            .await
            .unwrap();

        let session = custodian.load_active_session().await.unwrap().unwrap();
        assert_eq!(session.broker_id, "fyers");
        assert_eq!(session.auth_token, "TOKEN_A");
        assert_eq!(session.feed_token.as_deref(), Some("FEED_B"));
    }

    #[tokio::test]
    async fn test_token_nonces_are_independent() {
        let (custodian, pool) = custodian().await;
        let user_id = seed_user(&pool).await;
        custodian
            .save_session("fyers", "TOKEN_A", Some("FEED_B"), user_id)
            .await
            .unwrap();

        let row = db::get_broker_session(&pool).await.unwrap().unwrap();
        assert_ne!(row.auth_token_nonce, row.feed_token_nonce);
    }

    #[tokio::test]
    async fn test_corrupted_row_cleared_and_surfaced() {
        let (custodian, pool) = custodian().await;
        let user_id = seed_user(&pool).await;
        custodian
            .save_session("fyers", "TOKEN_A", None, user_id)
            .await
            .unwrap();

        // Flip one ciphertext byte directly in the store.
        let row = db::get_broker_session(&pool).await.unwrap().unwrap();
        let mut cipher = row.auth_token.unwrap();
        cipher[0] ^= 0xFF;
        sqlx::query("UPDATE broker_sessions SET auth_token = ? WHERE id = 1")
            .bind(&cipher)
            .execute(&pool)
            .await
            .unwrap();

        assert!(matches!(
            custodian.load_active_session().await,
            Err(CoreError::SessionCorrupted)
        ));
        // The damaged row is gone; the next load is a clean miss.
        assert!(custodian.load_active_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let (custodian, pool) = custodian().await;
        let user_id = seed_user(&pool).await;
        custodian
            .save_session("fyers", "TOKEN_A", None, user_id)
            .await
            .unwrap();

        assert!(custodian.revoke().await.unwrap());
        assert!(!custodian.revoke().await.unwrap());
        assert!(custodian.load_active_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_credential_round_trip() {
        let (custodian, _pool) = custodian().await;
        custodian
            .save_credential("fyers", "KEY", Some("SECRET"), Some("CLIENT1"))
            .await
            .unwrap();

        let creds = custodian.load_credential("fyers").await.unwrap().unwrap();
        assert_eq!(creds.api_key, "KEY");
        assert_eq!(creds.api_secret.as_deref(), Some("SECRET"));
        assert_eq!(creds.client_id.as_deref(), Some("CLIENT1"));

        assert!(custodian.delete_credential("fyers").await.unwrap());
        assert!(custodian.load_credential("fyers").await.unwrap().is_none());
    }
}
