use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Length of the random tail appended to session ids.
const SESSION_SUFFIX_LEN: usize = 8;

macro_rules! branded_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId);
branded_id!(BatchId);

impl SessionId {
    /// `<timestamp>-<random suffix>`. Uniqueness is best-effort, not cryptographic.
    pub fn generate(now_ms: i64) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_SUFFIX_LEN)
            .map(char::from)
            .collect();
        Self(format!("{now_ms}-{suffix}"))
    }
}

impl BatchId {
    pub fn new() -> Self {
        Self(format!("batch_{}", Uuid::now_v7()))
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_starts_with_timestamp() {
        let id = SessionId::generate(1_700_000_000_000);
        let (ts, suffix) = id.as_str().split_once('-').unwrap();
        assert_eq!(ts, "1700000000000");
        assert_eq!(suffix.len(), SESSION_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn session_ids_at_same_instant_differ() {
        let a = SessionId::generate(42);
        let b = SessionId::generate(42);
        assert_ne!(a, b);
    }

    #[test]
    fn batch_id_has_prefix() {
        let id = BatchId::new();
        assert!(id.as_str().starts_with("batch_"), "got: {id}");
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = SessionId::generate(7);
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_raw("123-abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""123-abc""#);
    }
}
