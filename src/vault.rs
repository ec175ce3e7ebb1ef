//! Secret vault: OS-keychain-bound master key and pepper (C1).
//!
//! One keychain entry (service `tradedesk-core`) holds both secrets. They are
//! created from the OS random source on first run and never rotate in normal
//! operation; destroying the entry makes every encrypted field unreadable.
//!
//! Encryption is AES-256-GCM with a fresh 96-bit nonce per call. The caller
//! must persist the nonce alongside the ciphertext; auth and feed tokens of
//! one session draw independent nonces.

use std::io::Write;
use std::path::PathBuf;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CoreError, CoreResult};

/// Keychain service identifier. Stable across releases; changing it strands
/// every previously encrypted field.
pub const KEYCHAIN_SERVICE: &str = "tradedesk-core";

/// Keychain account name under the service entry.
pub const KEYCHAIN_USER: &str = "master-secrets";

const MASTER_KEY_LEN: usize = 32;
const PEPPER_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Master key + pepper, zeroized on drop. Never serialized to the primary
/// store; the only durable copy lives behind a [`SecretStore`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterSecrets {
    master_key: [u8; MASTER_KEY_LEN],
    pepper: Vec<u8>,
}

impl MasterSecrets {
    /// Generate fresh secrets from the OS random source.
    pub fn generate() -> Self {
        let mut master_key = [0u8; MASTER_KEY_LEN];
        let mut pepper = vec![0u8; PEPPER_LEN];
        OsRng.fill_bytes(&mut master_key);
        OsRng.fill_bytes(&mut pepper);
        Self { master_key, pepper }
    }
}

/// Serialized shape of the keychain payload.
#[derive(Serialize, Deserialize)]
struct SecretsPayload {
    master_key: String,
    pepper: String,
}

fn serialize_secrets(secrets: &MasterSecrets) -> CoreResult<String> {
    let b64 = base64::engine::general_purpose::STANDARD;
    serde_json::to_string(&SecretsPayload {
        master_key: b64.encode(secrets.master_key),
        pepper: b64.encode(&secrets.pepper),
    })
    .map_err(|e| CoreError::CryptoFailure(format!("serialize secrets: {e}")))
}

fn deserialize_secrets(payload: &str) -> CoreResult<MasterSecrets> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let parsed: SecretsPayload = serde_json::from_str(payload)
        .map_err(|e| CoreError::CryptoFailure(format!("malformed secrets payload: {e}")))?;
    let key_bytes = b64
        .decode(&parsed.master_key)
        .map_err(|e| CoreError::CryptoFailure(format!("malformed master key: {e}")))?;
    let pepper = b64
        .decode(&parsed.pepper)
        .map_err(|e| CoreError::CryptoFailure(format!("malformed pepper: {e}")))?;
    if key_bytes.len() != MASTER_KEY_LEN {
        return Err(CoreError::CryptoFailure(format!(
            "master key must be {MASTER_KEY_LEN} bytes, got {}",
            key_bytes.len()
        )));
    }
    if pepper.len() < 16 {
        return Err(CoreError::CryptoFailure(
            "pepper must be at least 16 bytes".into(),
        ));
    }
    let mut master_key = [0u8; MASTER_KEY_LEN];
    master_key.copy_from_slice(&key_bytes);
    Ok(MasterSecrets { master_key, pepper })
}

/// Durable backend for the serialized master secrets.
pub trait SecretStore: Send + Sync {
    /// Load the payload, `None` if no entry exists yet.
    fn load(&self) -> CoreResult<Option<String>>;
    /// Persist the payload atomically.
    fn store(&self, payload: &str) -> CoreResult<()>;
}

/// OS keychain backend (Secret Service / macOS Keychain / Windows
/// Credential Manager via the `keyring` crate).
pub struct KeyringStore {
    service: String,
    user: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: KEYCHAIN_SERVICE.to_string(),
            user: KEYCHAIN_USER.to_string(),
        }
    }

    fn entry(&self) -> CoreResult<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.user)
            .map_err(|e| CoreError::VaultUnavailable(e.to_string()))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyringStore {
    fn load(&self) -> CoreResult<Option<String>> {
        match self.entry()?.get_password() {
            Ok(payload) => Ok(Some(payload)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CoreError::VaultUnavailable(e.to_string())),
        }
    }

    fn store(&self, payload: &str) -> CoreResult<()> {
        self.entry()?
            .set_password(payload)
            .map_err(|e| CoreError::VaultUnavailable(e.to_string()))
    }
}

/// File fallback for headless hosts without a keychain daemon. The payload
/// shape is identical to the keychain entry; the file is written 0600.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SecretStore for FileStore {
    fn load(&self) -> CoreResult<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::VaultUnavailable(format!(
                "secret file {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn store(&self, payload: &str) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::VaultUnavailable(format!("create {parent:?}: {e}")))?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut opts = std::fs::OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut f = opts
                .open(&tmp)
                .map_err(|e| CoreError::VaultUnavailable(format!("open {tmp:?}: {e}")))?;
            f.write_all(payload.as_bytes())
                .and_then(|()| f.sync_all())
                .map_err(|e| CoreError::VaultUnavailable(format!("write {tmp:?}: {e}")))?;
        }
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| CoreError::VaultUnavailable(format!("persist secrets: {e}")))
    }
}

/// The unlocked vault. One keychain read on startup unlocks both the field
/// encryption and the password-hashing pepper; the key material stays in
/// process memory only.
pub struct SecretVault {
    secrets: MasterSecrets,
}

impl SecretVault {
    /// Load the secrets from `store`, generating and persisting them on
    /// first run.
    pub fn open(store: &dyn SecretStore) -> CoreResult<Self> {
        let secrets = match store.load()? {
            Some(payload) => deserialize_secrets(&payload)?,
            None => {
                let secrets = MasterSecrets::generate();
                store.store(&serialize_secrets(&secrets)?)?;
                tracing::info!("generated new master secrets");
                secrets
            }
        };
        Ok(Self { secrets })
    }

    /// Build a vault from already-unlocked secrets (tests, import tools).
    pub fn from_secrets(secrets: MasterSecrets) -> Self {
        Self { secrets }
    }

    fn cipher(&self) -> CoreResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.secrets.master_key)
            .map_err(|e| CoreError::CryptoFailure(e.to_string()))
    }

    /// Encrypt `plaintext` under the master key with a fresh nonce.
    /// The nonce must be persisted alongside the ciphertext and is unique
    /// per call; never reuse one under this key.
    pub fn encrypt(&self, plaintext: &[u8]) -> CoreResult<(Vec<u8>, [u8; NONCE_LEN])> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CoreError::CryptoFailure(e.to_string()))?;
        Ok((ciphertext, nonce))
    }

    /// Decrypt a `(ciphertext, nonce)` pair. Any authentication failure is
    /// reported as [`CoreError::AuthTagMismatch`]; no bytes are returned.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> CoreResult<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(CoreError::CryptoFailure(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CoreError::AuthTagMismatch)
    }

    /// Argon2id hash of `plaintext` + pepper, returned as a PHC string.
    /// Default parameters are sized for interactive desktop login; run on
    /// the blocking pool from async contexts.
    pub fn hash_password(&self, plaintext: &str) -> CoreResult<String> {
        let peppered = self.peppered(plaintext);
        let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
        let hash = Argon2::default()
            .hash_password(&peppered, &salt)
            .map_err(|e| CoreError::CryptoFailure(e.to_string()))?;
        Ok(hash.to_string())
    }

    /// Constant-time verification of `plaintext` against a PHC string
    /// produced by [`hash_password`](Self::hash_password).
    pub fn verify_password(&self, plaintext: &str, phc: &str) -> CoreResult<bool> {
        let peppered = self.peppered(plaintext);
        let parsed =
            PasswordHash::new(phc).map_err(|e| CoreError::CryptoFailure(e.to_string()))?;
        match Argon2::default().verify_password(&peppered, &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(CoreError::CryptoFailure(e.to_string())),
        }
    }

    fn peppered(&self, plaintext: &str) -> Vec<u8> {
        let mut input = plaintext.as_bytes().to_vec();
        input.extend_from_slice(&self.secrets.pepper);
        input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> SecretVault {
        SecretVault::from_secrets(MasterSecrets::generate())
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let vault = test_vault();
        let (ciphertext, nonce) = vault.encrypt(b"TOKEN_A").unwrap();
        assert_ne!(ciphertext, b"TOKEN_A");
        let plaintext = vault.decrypt(&ciphertext, &nonce).unwrap();
        assert_eq!(plaintext, b"TOKEN_A");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let vault = test_vault();
        let (_, n1) = vault.encrypt(b"same input").unwrap();
        let (_, n2) = vault.encrypt(b"same input").unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn test_tampered_ciphertext_is_tag_mismatch() {
        let vault = test_vault();
        let (mut ciphertext, nonce) = vault.encrypt(b"secret").unwrap();
        ciphertext[0] ^= 0xFF;
        match vault.decrypt(&ciphertext, &nonce) {
            Err(CoreError::AuthTagMismatch) => {}
            other => panic!("expected AuthTagMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_nonce_length_rejected() {
        let vault = test_vault();
        let (ciphertext, _) = vault.encrypt(b"secret").unwrap();
        assert!(vault.decrypt(&ciphertext, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_password_hash_and_verify() {
        let vault = test_vault();
        let phc = vault.hash_password("pw1").unwrap();
        assert!(phc.starts_with("$argon2id$"));
        assert!(vault.verify_password("pw1", &phc).unwrap());
        assert!(!vault.verify_password("pw2", &phc).unwrap());
    }

    #[test]
    fn test_pepper_binds_hash_to_vault() {
        let a = test_vault();
        let b = test_vault();
        let phc = a.hash_password("pw1").unwrap();
        // A different pepper must not verify the same password.
        assert!(!b.verify_password("pw1", &phc).unwrap());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("secrets.json"));
        assert!(store.load().unwrap().is_none());

        let vault = SecretVault::open(&store).unwrap();
        let (ciphertext, nonce) = vault.encrypt(b"TOKEN").unwrap();

        // Re-open: same secrets must come back.
        let reopened = SecretVault::open(&store).unwrap();
        assert_eq!(reopened.decrypt(&ciphertext, &nonce).unwrap(), b"TOKEN");
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        assert!(deserialize_secrets("{\"master_key\":\"AAA\",\"pepper\":\"AAA\"}").is_err());
        assert!(deserialize_secrets("not json").is_err());
    }
}
