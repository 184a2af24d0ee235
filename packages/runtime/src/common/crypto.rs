//! At-rest encryption for plugin-instance settings.
//!
//! AES-256-GCM with a random 96-bit nonce prefixed to the ciphertext, the
//! whole blob hex-encoded for storage in a TEXT column. The key is the
//! 32-byte hex `ENCRYPTION_KEY` environment variable.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use rand::RngCore;

const NONCE_LEN: usize = 12;

/// Cipher for secret columns.
#[derive(Clone)]
pub struct SecretCipher {
    key: Key<Aes256Gcm>,
}

impl SecretCipher {
    /// Build a cipher from a 64-char hex key (32 bytes).
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim()).context("ENCRYPTION_KEY must be valid hex")?;
        if bytes.len() != 32 {
            bail!("ENCRYPTION_KEY must be 32 bytes (64 hex chars), got {}", bytes.len());
        }
        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(&bytes),
        })
    }

    /// Encrypt a plaintext secret into a storable hex blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(hex::encode(blob))
    }

    /// Decrypt a hex blob produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let blob = hex::decode(stored).context("stored secret is not valid hex")?;
        if blob.len() < NONCE_LEN {
            bail!("stored secret is too short");
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow!("decryption failed (wrong key or corrupted data)"))?;
        String::from_utf8(plaintext).context("decrypted secret is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn round_trips_plaintext() {
        let cipher = SecretCipher::from_hex(TEST_KEY).unwrap();
        let stored = cipher.encrypt("bot-token-123").unwrap();
        assert_eq!(cipher.decrypt(&stored).unwrap(), "bot-token-123");
    }

    #[test]
    fn ciphertexts_differ_per_encryption() {
        let cipher = SecretCipher::from_hex(TEST_KEY).unwrap();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_short_key() {
        assert!(SecretCipher::from_hex("deadbeef").is_err());
    }

    #[test]
    fn rejects_tampered_blob() {
        let cipher = SecretCipher::from_hex(TEST_KEY).unwrap();
        let mut stored = cipher.encrypt("secret").unwrap();
        // Flip a nibble in the ciphertext body
        let flipped = if stored.ends_with('0') { '1' } else { '0' };
        stored.pop();
        stored.push(flipped);
        assert!(cipher.decrypt(&stored).is_err());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher = SecretCipher::from_hex(TEST_KEY).unwrap();
        let other = SecretCipher::from_hex(
            "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .unwrap();
        let stored = cipher.encrypt("secret").unwrap();
        assert!(other.decrypt(&stored).is_err());
    }
}
