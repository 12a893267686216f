//! Encryption of secrets at rest
//!
//! The OAuth client secret and every persisted token value go through a
//! [`SecretVault`]. Storage only ever sees ciphertext.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{AnafError, AnafResult};

/// Seals and opens secret strings
pub trait SecretVault: Send + Sync {
    /// Encrypt `plaintext`, returning an opaque printable string
    fn seal(&self, plaintext: &str) -> AnafResult<String>;

    /// Decrypt a value produced by [`SecretVault::seal`]
    fn open(&self, sealed: &str) -> AnafResult<String>;
}

/// AES-256-GCM vault. Output is base64(nonce || ciphertext).
pub struct AesGcmVault {
    cipher: Aes256Gcm,
}

impl AesGcmVault {
    const NONCE_LEN: usize = 12;

    /// Create a vault from a base64-encoded 32-byte master key
    pub fn new(master_key_b64: &str) -> AnafResult<Self> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(master_key_b64.trim())
            .map_err(|e| AnafError::Vault(format!("master key is not valid base64: {e}")))?;

        if key.len() != 32 {
            return Err(AnafError::Vault(format!(
                "master key must be 32 bytes, got {}",
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| AnafError::Vault(format!("failed to init cipher: {e}")))?;
        Ok(Self { cipher })
    }

    /// Derive the key as SHA-256 of an application secret
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }
}

impl SecretVault for AesGcmVault {
    fn seal(&self, plaintext: &str) -> AnafResult<String> {
        let mut nonce_bytes = [0u8; Self::NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AnafError::Vault(format!("encryption failed: {e}")))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    fn open(&self, sealed: &str) -> AnafResult<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| AnafError::Vault(format!("sealed value is not valid base64: {e}")))?;

        if combined.len() <= Self::NONCE_LEN {
            return Err(AnafError::Vault("sealed value too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(Self::NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AnafError::Vault("decryption failed (wrong key or tampered value)".into()))?;

        String::from_utf8(plaintext)
            .map_err(|e| AnafError::Vault(format!("decrypted value is not UTF-8: {e}")))
    }
}
