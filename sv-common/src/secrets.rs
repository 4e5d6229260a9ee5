//! Provider API key wrapping
//!
//! Stored LLM provider keys are sealed with AES-256-GCM under a master key
//! supplied via `SV_MASTER_KEY` (base64url, 32 bytes). Each record gets a
//! fresh random nonce; the provider id is bound in as associated data so a
//! ciphertext cannot be replayed onto a different provider row.

use crate::{Error, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

pub const MASTER_KEY_ENV: &str = "SV_MASTER_KEY";
pub const KEY_ID_ENV: &str = "SV_KEY_ID";
const DEFAULT_KEY_ID: &str = "v1";
const NONCE_LEN: usize = 12;

/// The loaded master key plus its rotation id.
pub struct SecretBox {
    pub key_id: String,
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Load the master key from the environment.
    pub fn from_env() -> Result<SecretBox> {
        let encoded = std::env::var(MASTER_KEY_ENV)
            .map_err(|_| Error::Config(format!("{MASTER_KEY_ENV} is not set")))?;
        Self::from_encoded_key(&encoded)
    }

    /// Build a box from a base64url-encoded 32-byte key.
    pub fn from_encoded_key(encoded: &str) -> Result<SecretBox> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|_| Error::Config("master key is not valid base64url".to_string()))?;
        if raw.len() != 32 {
            return Err(Error::Config(
                "master key must be 32 bytes (base64url encoded)".to_string(),
            ));
        }
        let cipher = Aes256Gcm::new_from_slice(&raw)
            .map_err(|_| Error::Internal("cipher construction failed".to_string()))?;
        let key_id = std::env::var(KEY_ID_ENV).unwrap_or_else(|_| DEFAULT_KEY_ID.to_string());
        Ok(SecretBox { key_id, cipher })
    }

    /// Seal a plaintext secret. Returns base64url(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str, aad: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad,
                },
            )
            .map_err(|_| Error::Internal("secret encryption failed".to_string()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    /// Open a sealed secret produced by [`SecretBox::encrypt`].
    pub fn decrypt(&self, blob_b64: &str, aad: &[u8]) -> Result<String> {
        let blob = URL_SAFE_NO_PAD
            .decode(blob_b64.trim_end_matches('='))
            .map_err(|_| Error::Validation("secret blob is not valid base64url".to_string()))?;
        if blob.len() <= NONCE_LEN {
            return Err(Error::Validation("secret blob is truncated".to_string()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::Validation("secret decryption failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::Validation("decrypted secret is not UTF-8".to_string()))
    }
}
