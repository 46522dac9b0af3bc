use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use beacon_core::RemoteConfig;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const TABLE: &str = "kv_store";
const REMOTE_CONFIG_KEY: &str = "remote_config";
const USER_ID_KEY: &str = "user_id";

/// Last successfully fetched remote config and when it was fetched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedRemoteConfig {
    pub config: RemoteConfig,
    pub fetched_at: i64,
}

/// Small JSON-valued slots that outlive the process.
#[derive(Clone, Debug)]
pub struct KvRepo {
    db: Database,
}

impl KvRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, value))]
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, now_ms: i64) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, raw, now_ms],
            )?;
            Ok(())
        })
    }

    /// Value and its `updated_at`, if the slot is set.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, i64)>, StoreError> {
        let raw: Option<(String, i64)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value, updated_at FROM kv_store WHERE key = ?1",
                    [key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;
        match raw {
            Some((value, updated_at)) => {
                Ok(Some((row_helpers::parse_json(&value, TABLE, "value")?, updated_at)))
            }
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.db
            .with_tx(|conn| Ok(conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])? > 0))
    }

    pub fn save_remote_config(&self, config: &RemoteConfig, fetched_at: i64) -> Result<(), StoreError> {
        let persisted = PersistedRemoteConfig {
            config: config.clone(),
            fetched_at,
        };
        self.put_json(REMOTE_CONFIG_KEY, &persisted, fetched_at)
    }

    pub fn load_remote_config(&self) -> Result<Option<PersistedRemoteConfig>, StoreError> {
        Ok(self
            .get_json::<PersistedRemoteConfig>(REMOTE_CONFIG_KEY)?
            .map(|(persisted, _)| persisted))
    }

    /// `None` clears the slot.
    pub fn save_user_id(&self, user_id: Option<&str>, now_ms: i64) -> Result<(), StoreError> {
        match user_id {
            Some(id) => self.put_json(USER_ID_KEY, &id, now_ms),
            None => self.delete(USER_ID_KEY).map(|_| ()),
        }
    }

    pub fn load_user_id(&self) -> Result<Option<String>, StoreError> {
        Ok(self.get_json::<String>(USER_ID_KEY)?.map(|(id, _)| id))
    }
}
