use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use beacon_core::{CryptoError, Event, FieldCipher};

/// Property keys whose values are encrypted before persistence.
pub const SENSITIVE_KEYS: &[&str] = &["user_id", "email", "phone", "address"];

/// Receives `(property key, error)` when a field could not be encrypted.
pub type CryptoErrorReporter = Arc<dyn Fn(&str, &CryptoError) + Send + Sync>;

type Encryptor = fn(&FieldCipher, &str) -> Result<String, CryptoError>;

fn field_encrypt(cipher: &FieldCipher, plaintext: &str) -> Result<String, CryptoError> {
    cipher.encrypt(plaintext)
}

/// Field-level transforms applied between `track` and the queue.
#[derive(Clone)]
pub struct EventProcessor {
    cipher: Option<FieldCipher>,
    reporter: Option<CryptoErrorReporter>,
    encryptor: Encryptor,
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self {
            cipher: None,
            reporter: None,
            encryptor: field_encrypt,
        }
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("encryption", &self.cipher.is_some())
            .finish()
    }
}

impl EventProcessor {
    /// Pass-through processor.
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn with_cipher(cipher: FieldCipher) -> Self {
        Self {
            cipher: Some(cipher),
            ..Self::default()
        }
    }

    pub fn with_reporter(mut self, reporter: CryptoErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    #[cfg(test)]
    fn with_encryptor(mut self, encryptor: Encryptor) -> Self {
        self.encryptor = encryptor;
        self
    }

    pub fn is_sensitive(key: &str) -> bool {
        SENSITIVE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
    }

    /// Encrypt sensitive properties. A field that fails to encrypt keeps its
    /// cleartext value; the event itself is never dropped.
    pub fn process(&self, event: Event) -> Event {
        let Some(cipher) = &self.cipher else {
            return event;
        };
        if !event.properties().keys().any(|k| Self::is_sensitive(k)) {
            return event;
        }

        let mut properties = event.properties().clone();
        for (key, value) in properties.iter_mut() {
            if !Self::is_sensitive(key) {
                continue;
            }
            let plaintext = match &*value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match (self.encryptor)(cipher, &plaintext) {
                Ok(ciphertext) => *value = Value::String(ciphertext),
                Err(e) => {
                    warn!(key = %key, event = event.name(), error = %e, "field encryption failed, keeping cleartext");
                    if let Some(report) = &self.reporter {
                        report(key, &e);
                    }
                }
            }
        }
        event.with_properties(properties)
    }
}
