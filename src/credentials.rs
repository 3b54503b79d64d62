//! Credential encryption at rest
//!
//! Feed and broker credentials are stored as AES-256-GCM blobs
//! (`nonce || ciphertext`) and only decrypted in memory right before use.
//! Decrypted material is zeroized when dropped.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{RelayError, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// AES-256-GCM with a random 96-bit nonce per blob
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesGcmCipher(..)")
    }
}

impl AesGcmCipher {
    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(RelayError::Credentials(format!(
                "encryption key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| RelayError::Credentials("invalid encryption key".into()))?;
        Ok(Self { cipher })
    }

    /// Key given as base64 (the form used in configuration)
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let mut key = BASE64
            .decode(encoded.trim())
            .map_err(|e| RelayError::Credentials(format!("encryption key is not base64: {}", e)))?;
        let cipher = Self::from_key(&key);
        key.zeroize();
        cipher
    }

    /// Fresh random key, base64-encoded
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let encoded = BASE64.encode(key);
        key.zeroize();
        encoded
    }
}

impl CredentialCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| RelayError::Credentials("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if blob.len() <= NONCE_LEN {
            return Err(RelayError::Credentials("credential blob is truncated".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| RelayError::Credentials("credential blob failed authentication".into()))
    }
}

/// Serialize then encrypt
pub fn seal<T: Serialize>(cipher: &dyn CredentialCipher, value: &T) -> Result<Vec<u8>> {
    let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
    cipher.encrypt(&plaintext)
}

/// Decrypt then deserialize
pub fn open<T: DeserializeOwned>(cipher: &dyn CredentialCipher, blob: &[u8]) -> Result<T> {
    let plaintext = cipher.decrypt(blob)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| RelayError::Credentials(format!("credential payload is malformed: {}", e)))
}

/// Login material for a tenant's feed account
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct FeedCredentials {
    pub account: String,
    pub token: String,
}

impl std::fmt::Debug for FeedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedCredentials")
            .field("account", &self.account)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Login material for a broker account
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub account_id: Option<String>,
    /// Use the broker's demo environment
    #[serde(default)]
    pub demo: bool,
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("username", &self.username)
            .field("account_id", &self.account_id)
            .field("demo", &self.demo)
            .finish_non_exhaustive()
    }
}
