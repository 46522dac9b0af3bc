use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid UTF-8 in decrypted data")]
    InvalidUtf8,
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Symmetric field cipher: ChaCha20-Poly1305 with a fresh nonce per call.
///
/// Output is `base64(nonce || ciphertext || tag)`.
#[derive(Clone)]
pub struct FieldCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").field("key", &"<redacted>").finish()
    }
}

impl FieldCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Accepts a base64-encoded 32-byte key; anything else is treated as a
    /// passphrase and stretched with SHA-256.
    pub fn from_config_key(material: &str) -> Result<Self, CryptoError> {
        let material = material.trim();
        if material.is_empty() {
            return Err(CryptoError::InvalidKey("key material is empty".into()));
        }
        if let Ok(bytes) = STANDARD.decode(material) {
            if let Ok(key) = <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
                return Ok(Self::new(key));
            }
        }
        let digest = Sha256::digest(material.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        Ok(Self::new(key))
    }

    /// Random key, base64-encoded so it can be dropped into `encryptionKey`.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut key);
        STANDARD.encode(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let combined = STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::InvalidEncoding)?;
        if combined.len() < NONCE_LEN {
            return Err(CryptoError::InvalidEncoding);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> FieldCipher {
        FieldCipher::from_config_key("correct horse battery staple").unwrap()
    }

    #[test]
    fn roundtrip() {
        let c = cipher();
        let encrypted = c.encrypt("jane@example.com").unwrap();
        assert_ne!(encrypted, "jane@example.com");
        assert_eq!(c.decrypt(&encrypted).unwrap(), "jane@example.com");
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let c = cipher();
        let a = c.encrypt("same").unwrap();
        let b = c.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_input_fails() {
        let err = cipher().decrypt("garbage").unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidEncoding | CryptoError::DecryptionFailed
        ));
    }

    #[test]
    fn truncated_input_fails() {
        let short = STANDARD.encode([1u8, 2, 3]);
        assert_eq!(cipher().decrypt(&short).unwrap_err(), CryptoError::InvalidEncoding);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let c = cipher();
        let mut bytes = STANDARD.decode(c.encrypt("secret").unwrap()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert_eq!(
            c.decrypt(&STANDARD.encode(bytes)).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn wrong_key_fails() {
        let encrypted = cipher().encrypt("secret").unwrap();
        let other = FieldCipher::from_config_key("another passphrase").unwrap();
        assert_eq!(other.decrypt(&encrypted).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn base64_key_is_used_verbatim() {
        let encoded = FieldCipher::generate_key();
        let a = FieldCipher::from_config_key(&encoded).unwrap();
        let raw: [u8; 32] = STANDARD.decode(&encoded).unwrap().try_into().unwrap();
        let b = FieldCipher::new(raw);
        let ct = a.encrypt("x").unwrap();
        assert_eq!(b.decrypt(&ct).unwrap(), "x");
    }

    #[test]
    fn empty_key_rejected() {
        assert!(matches!(
            FieldCipher::from_config_key("  "),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn empty_plaintext() {
        let c = cipher();
        assert_eq!(c.decrypt(&c.encrypt("").unwrap()).unwrap(), "");
    }

    #[test]
    fn debug_redacts_key() {
        assert!(!format!("{:?}", cipher()).contains('['));
    }
}
