use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON text column into `T`, returning CorruptRow on failure.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Non-negative INTEGER column as `u32`.
pub fn get_count(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<u32, StoreError> {
    let raw: i64 = get(row, idx, table, column)?;
    u32::try_from(raw).map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("out of range: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_success() {
        let value: serde_json::Value = parse_json(r#"{"key": "value"}"#, "kv_store", "value").unwrap();
        assert_eq!(value["key"], "value");
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<serde_json::Value, _> = parse_json("not valid json", "kv_store", "value");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "kv_store", column: "value", .. })
        ));
    }

    #[test]
    fn get_count_rejects_negative() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT -1", [], |row| {
                Ok(get_count(row, 0, "queue_records", "retry_count"))
            })
            .unwrap();
        assert!(matches!(err, Err(StoreError::CorruptRow { column: "retry_count", .. })));
    }
}
