//! Encryption at rest for provider API keys (SPEC_FULL.md §6, §8 scenario 10).
//!
//! Keys are stored as `base64(nonce || ciphertext)` using AES-256-GCM. The
//! 256-bit key is derived from `ENCRYPTION_KEY` (or `SECRET_KEY` as a
//! fallback) by SHA-256, so operators can supply a passphrase of any length.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

pub fn encrypt_secret(plaintext: &str, secret: &str) -> Result<String> {
    let key_bytes = derive_key(secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| anyhow!("failed to encrypt secret"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

pub fn decrypt_secret(encoded: &str, secret: &str) -> Result<String> {
    let raw = BASE64
        .decode(encoded)
        .context("encrypted secret is not valid base64")?;
    if raw.len() < NONCE_LEN {
        return Err(anyhow!("encrypted secret is too short"));
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);

    let key_bytes = derive_key(secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow!("failed to decrypt secret (wrong key or corrupted data)"))?;
    String::from_utf8(plaintext).context("decrypted secret is not valid utf-8")
}

/// Masks everything but the first and last 3 characters, for display in the
/// provider config list endpoint. Short secrets are fully masked.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len().max(3));
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    let masked = "*".repeat(chars.len() - 6);
    format!("{head}{masked}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_secret() {
        let encrypted = encrypt_secret("sk-test-123456", "my-secret-key").unwrap();
        assert_eq!(decrypt_secret(&encrypted, "my-secret-key").unwrap(), "sk-test-123456");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let encrypted = encrypt_secret("sk-test-123456", "right-key").unwrap();
        assert!(decrypt_secret(&encrypted, "wrong-key").is_err());
    }

    #[test]
    fn mask_keeps_head_and_tail() {
        assert_eq!(mask_secret("sk-test-123456"), "sk-********456");
    }

    #[test]
    fn mask_short_secret_is_fully_masked() {
        assert_eq!(mask_secret("abcd"), "****");
    }
}
