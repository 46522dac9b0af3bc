//! Durable outbox of serialized events.
//!
//! Records are appended with a monotonically increasing id, which is also
//! the delivery order. This repo is the only writer of `delivered` and
//! `retry_count`; once a record is delivered it is only ever deleted.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument, warn};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const TABLE: &str = "queue_records";

/// A stored outbox row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueRecord {
    pub id: i64,
    pub payload: Vec<u8>,
    pub enqueued_at: i64,
    pub delivered: bool,
    pub retry_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: i64,
    /// Oldest undelivered records dropped to make room.
    pub evicted: usize,
}

#[derive(Clone, Debug)]
pub struct EventQueue {
    db: Database,
}

impl EventQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub fn enqueue(&self, payload: &[u8], enqueued_at: i64) -> Result<i64, StoreError> {
        self.db.with_tx(|conn| insert(conn, payload, enqueued_at))
    }

    /// Enqueue, evicting the oldest undelivered records first if the pending
    /// count is already at `ceiling`.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub fn enqueue_bounded(
        &self,
        payload: &[u8],
        enqueued_at: i64,
        ceiling: usize,
    ) -> Result<EnqueueOutcome, StoreError> {
        let ceiling = ceiling.max(1) as i64;
        self.db.with_tx(|conn| {
            let pending = count_pending(conn)?;
            let evicted = if pending >= ceiling {
                let excess = pending - ceiling + 1;
                conn.execute(
                    "DELETE FROM queue_records WHERE id IN (
                         SELECT id FROM queue_records WHERE delivered = 0 ORDER BY id ASC LIMIT ?1
                     )",
                    [excess],
                )?
            } else {
                0
            };
            if evicted > 0 {
                warn!(evicted, ceiling, "outbox full, dropped oldest pending events");
            }
            let id = insert(conn, payload, enqueued_at)?;
            Ok(EnqueueOutcome { id, evicted })
        })
    }

    /// Up to `limit` undelivered records, oldest first.
    #[instrument(skip(self))]
    pub fn peek_batch(&self, limit: usize) -> Result<Vec<QueueRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.db.with_tx(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, payload, enqueued_at, delivered, retry_count
                 FROM queue_records WHERE delivered = 0 ORDER BY id ASC LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit as i64])?;
            let mut batch = Vec::with_capacity(limit.min(256));
            while let Some(row) = rows.next()? {
                batch.push(row_to_record(row)?);
            }
            Ok(batch)
        })
    }

    /// Idempotent. Returns how many records changed state.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn mark_delivered(&self, ids: &[i64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.db.with_tx(|conn| {
            let mut stmt = conn
                .prepare_cached("UPDATE queue_records SET delivered = 1 WHERE id = ?1 AND delivered = 0")?;
            let mut changed = 0;
            for id in ids {
                changed += stmt.execute([id])?;
            }
            debug!(changed, "marked delivered");
            Ok(changed)
        })
    }

    /// Bump the retry counter on undelivered records.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn increment_retry(&self, ids: &[i64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.db.with_tx(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE queue_records SET retry_count = retry_count + 1 WHERE id = ?1 AND delivered = 0",
            )?;
            let mut changed = 0;
            for id in ids {
                changed += stmt.execute([id])?;
            }
            Ok(changed)
        })
    }

    /// Delete delivered records enqueued before `older_than`.
    #[instrument(skip(self))]
    pub fn purge_delivered(&self, older_than: i64) -> Result<usize, StoreError> {
        self.db.with_tx(|conn| {
            Ok(conn.execute(
                "DELETE FROM queue_records WHERE delivered = 1 AND enqueued_at < ?1",
                [older_than],
            )?)
        })
    }

    /// Delete undelivered records that have used up their retries and were
    /// enqueued before `older_than`.
    #[instrument(skip(self))]
    pub fn purge_exhausted(&self, older_than: i64, max_retries: u32) -> Result<usize, StoreError> {
        self.db.with_tx(|conn| {
            let dropped = conn.execute(
                "DELETE FROM queue_records
                 WHERE delivered = 0 AND retry_count >= ?1 AND enqueued_at < ?2",
                params![max_retries, older_than],
            )?;
            if dropped > 0 {
                warn!(dropped, max_retries, "dropped events that exhausted their retries");
            }
            Ok(dropped)
        })
    }

    pub fn pending_count(&self) -> Result<usize, StoreError> {
        self.db.with_tx(|conn| Ok(count_pending(conn)? as usize))
    }

    pub fn total_count(&self) -> Result<usize, StoreError> {
        self.db.with_tx(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM queue_records", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<QueueRecord>, StoreError> {
        self.db.with_tx(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, payload, enqueued_at, delivered, retry_count
                 FROM queue_records WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id])?;
            let record = match rows.next()? {
                Some(row) => Some(row_to_record(row)?),
                None => None,
            };
            Ok(record)
        })
    }

    /// Oldest undelivered `enqueued_at`, for diagnostics.
    pub fn oldest_pending_at(&self) -> Result<Option<i64>, StoreError> {
        self.db.with_tx(|conn| {
            Ok(conn
                .query_row(
                    "SELECT enqueued_at FROM queue_records WHERE delivered = 0 ORDER BY id ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }
}

fn insert(conn: &Connection, payload: &[u8], enqueued_at: i64) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO queue_records (payload, enqueued_at) VALUES (?1, ?2)",
        params![payload, enqueued_at],
    )?;
    Ok(conn.last_insert_rowid())
}

fn count_pending(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM queue_records WHERE delivered = 0",
        [],
        |row| row.get(0),
    )?)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<QueueRecord, StoreError> {
    let delivered: i64 = row_helpers::get(row, 3, TABLE, "delivered")?;
    Ok(QueueRecord {
        id: row_helpers::get(row, 0, TABLE, "id")?,
        payload: row_helpers::get(row, 1, TABLE, "payload")?,
        enqueued_at: row_helpers::get(row, 2, TABLE, "enqueued_at")?,
        delivered: delivered != 0,
        retry_count: row_helpers::get_count(row, 4, TABLE, "retry_count")?,
    })
}
