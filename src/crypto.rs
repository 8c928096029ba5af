// At-rest secret encryption and token fingerprinting.
//
// Secrets (refresh tokens, client secrets, custom API keys) are stored as
// AES-256-GCM ciphertext: base64(nonce || ciphertext). Token fingerprints
// are deterministic SHA-256 hex digests used for unique lookup.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use std::fmt;

const NONCE_SIZE: usize = 12;

#[derive(Debug)]
pub enum CryptoError {
    EncryptionFailed,
    DecryptionFailed,
    InvalidFormat,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::EncryptionFailed => write!(f, "Encryption failed"),
            CryptoError::DecryptionFailed => write!(f, "Decryption failed"),
            CryptoError::InvalidFormat => write!(f, "Invalid encrypted data format"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Symmetric cipher keyed by the process-wide `TOKEN_ENCRYPT_KEY`.
///
/// The configured key string is stretched to 32 bytes with SHA-256, so any
/// non-empty passphrase works as a key.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; 32],
}

impl SecretBox {
    pub fn new(encrypt_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"kirogate-v1:");
        hasher.update(encrypt_key.as_bytes());

        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let key = aes_gcm::Key::<Aes256Gcm>::from_slice(&self.key);
        let cipher = Aes256Gcm::new(key);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        use aes_gcm::aead::rand_core::RngCore;
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&combined))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, CryptoError> {
        let combined = BASE64
            .decode(encrypted)
            .map_err(|_| CryptoError::InvalidFormat)?;

        if combined.len() < NONCE_SIZE {
            return Err(CryptoError::InvalidFormat);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let key = aes_gcm::Key::<Aes256Gcm>::from_slice(&self.key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Deterministic fingerprint of a secret, used as a unique lookup key.
///
/// Also used to resolve client API keys to users without storing the key.
pub fn token_hash(secret: &str) -> String {
    use std::fmt::Write;

    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

/// Mask a secret for logging (first and last 4 chars only).
pub fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let secrets = SecretBox::new("unit-test-key");
        let plaintext = "test_refresh_token_12345";
        let encrypted = secrets.encrypt(plaintext).unwrap();
        let decrypted = secrets.decrypt(&encrypted).unwrap();
        assert_eq!(plaintext, decrypted);
    }

    #[test]
    fn test_ciphertext_never_equals_plaintext() {
        let secrets = SecretBox::new("unit-test-key");
        let plaintext = "super-secret";
        let encrypted = secrets.encrypt(plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        assert!(!encrypted.contains(plaintext));
    }

    #[test]
    fn test_encrypt_produces_different_ciphertext() {
        let secrets = SecretBox::new("unit-test-key");
        let encrypted1 = secrets.encrypt("same_plaintext").unwrap();
        let encrypted2 = secrets.encrypt("same_plaintext").unwrap();
        assert_ne!(encrypted1, encrypted2);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let a = SecretBox::new("key-a");
        let b = SecretBox::new("key-b");
        let encrypted = a.encrypt("payload").unwrap();
        assert!(b.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_decrypt_invalid_format() {
        let secrets = SecretBox::new("unit-test-key");
        assert!(secrets.decrypt("not base64!").is_err());

        let short = BASE64.encode(b"short");
        assert!(secrets.decrypt(&short).is_err());
    }

    #[test]
    fn test_encrypt_unicode() {
        let secrets = SecretBox::new("unit-test-key");
        let plaintext = "токен 中文 🔐";
        let encrypted = secrets.encrypt(plaintext).unwrap();
        assert_eq!(secrets.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_token_hash_deterministic() {
        let h1 = token_hash("refresh-token-abc");
        let h2 = token_hash("refresh-token-abc");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, token_hash("refresh-token-abd"));
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("short"), "***");
        assert_eq!(mask_token("abcdefghijkl"), "abcd...ijkl");
    }
}
