//! Postgres-backed outbox store.
//!
//! ## Schema
//!
//! One table, `outbox_notifications`, keyed by `id`, with an index on
//! `processing_status` (dispatcher poll) and one on
//! `(processing_status, COALESCE(modified, created))` (garbage collector range scan).
//! [`PostgresOutboxStore::ensure_schema`] creates both idempotently.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxStoreError |
//! |------------|----------------------|------------------|
//! | Database (unique violation on insert) | `23505` | `DuplicateKey` |
//! | Database (other) | Any other | `Storage` |
//! | Decode / ColumnDecode | N/A | `Serialization` |
//! | Other | N/A | `Storage` |
//!
//! ## Sync bridge
//!
//! `OutboxStore` is synchronous. The trait impl runs the async methods on the
//! runtime handle captured at construction. It works from plain threads,
//! `spawn_blocking` and multi-thread runtime workers (via `block_in_place`).
//! A `current_thread` runtime cannot block, so calls from inside one return
//! `Storage`; async callers use the inherent `*_async` methods directly.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::instrument;

use super::store::{OutboxStore, OutboxStoreError};
use super::types::{
    NotificationId, NotificationType, OutboxRecord, OutboxStats, ProcessingStatus, RecordChanges,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_notifications (
    id                        TEXT PRIMARY KEY,
    notification_type         TEXT NOT NULL,
    label                     TEXT NOT NULL,
    details                   JSONB NOT NULL,
    processing_status         TEXT NOT NULL,
    processing_fail_count     INTEGER NOT NULL DEFAULT 0 CHECK (processing_fail_count >= 0),
    processing_error_message  TEXT,
    created                   TIMESTAMPTZ NOT NULL,
    modified                  TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS outbox_notifications_status_idx
    ON outbox_notifications (processing_status);
CREATE INDEX IF NOT EXISTS outbox_notifications_status_age_idx
    ON outbox_notifications (processing_status, (COALESCE(modified, created)));
"#;

const COLUMNS: &str = "id, notification_type, label, details, processing_status, \
     processing_fail_count, processing_error_message, created, modified";

/// Postgres-backed outbox store.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresOutboxStore {
    /// Wrap an existing pool; `handle` drives the sync `OutboxStore` impl.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Connect using the current runtime's handle.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, OutboxStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    /// Create the table and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), OutboxStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(notification_id = %record.id), err)]
    pub async fn put_async(
        &self,
        record: &OutboxRecord,
        allow_overwrite: bool,
    ) -> Result<(), OutboxStoreError> {
        let conflict = if allow_overwrite {
            "ON CONFLICT (id) DO UPDATE SET \
                notification_type = EXCLUDED.notification_type, \
                label = EXCLUDED.label, \
                details = EXCLUDED.details, \
                processing_status = EXCLUDED.processing_status, \
                processing_fail_count = EXCLUDED.processing_fail_count, \
                processing_error_message = EXCLUDED.processing_error_message, \
                created = EXCLUDED.created, \
                modified = EXCLUDED.modified"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO outbox_notifications ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) {conflict}"
        );

        sqlx::query(&sql)
            .bind(record.id.as_str())
            .bind(record.kind.as_str())
            .bind(&record.label)
            .bind(&record.details)
            .bind(record.processing_status.as_str())
            .bind(fail_count_to_db(record.processing_fail_count))
            .bind(record.processing_error_message.as_deref())
            .bind(record.created)
            .bind(record.modified)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    OutboxStoreError::DuplicateKey(record.id.clone())
                } else {
                    map_sqlx_error("put", e)
                }
            })?;
        Ok(())
    }

    pub async fn get_async(
        &self,
        id: &NotificationId,
    ) -> Result<Option<OutboxRecord>, OutboxStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_notifications WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn query_by_status_async(
        &self,
        statuses: &[ProcessingStatus],
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_notifications \
             WHERE processing_status = ANY($1) \
             ORDER BY created ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(statuses)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_by_status", e))?;
        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn query_by_status_older_than_async(
        &self,
        status: ProcessingStatus,
        age_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_notifications \
             WHERE processing_status = $1 AND COALESCE(modified, created) < $2 \
             ORDER BY COALESCE(modified, created) ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(now - age_threshold)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_by_status_older_than", e))?;
        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self, changes), fields(notification_id = %id), err)]
    pub async fn update_async(
        &self,
        id: &NotificationId,
        changes: &RecordChanges,
    ) -> Result<OutboxRecord, OutboxStoreError> {
        let sql = format!(
            "UPDATE outbox_notifications SET \
                processing_status = COALESCE($2, processing_status), \
                processing_fail_count = COALESCE($3, processing_fail_count), \
                processing_error_message = COALESCE($4, processing_error_message), \
                modified = $5 \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(changes.processing_status.map(|s| s.as_str()))
            .bind(changes.processing_fail_count.map(fail_count_to_db))
            .bind(changes.processing_error_message.as_deref())
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update", e))?
            .ok_or_else(|| OutboxStoreError::NotFound(id.clone()))?;
        record_from_row(&row)
    }

    #[instrument(skip(self), fields(notification_id = %id), err)]
    pub async fn delete_async(&self, id: &NotificationId) -> Result<(), OutboxStoreError> {
        let result = sqlx::query("DELETE FROM outbox_notifications WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        if result.rows_affected() == 0 {
            return Err(OutboxStoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    pub async fn count_by_status_async(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = sqlx::query(
            "SELECT processing_status, COUNT(*) AS total \
             FROM outbox_notifications GROUP BY processing_status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let raw: String = row.try_get("processing_status").map_err(decode_error)?;
            let total: i64 = row.try_get("total").map_err(decode_error)?;
            let status = ProcessingStatus::parse(&raw)
                .ok_or_else(|| OutboxStoreError::Serialization(format!("unknown status {raw}")))?;
            stats.add(status, usize::try_from(total).unwrap_or(usize::MAX));
        }
        Ok(stats)
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T, OutboxStoreError>
    where
        F: std::future::Future<Output = Result<T, OutboxStoreError>>,
    {
        match Handle::try_current().map(|current| current.runtime_flavor()) {
            Err(_) => self.handle.block_on(fut),
            Ok(RuntimeFlavor::CurrentThread) => Err(OutboxStoreError::Storage(
                "PostgresOutboxStore sync API called on a current-thread runtime; use the *_async methods"
                    .to_string(),
            )),
            Ok(_) => tokio::task::block_in_place(|| self.handle.block_on(fut)),
        }
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn put(&self, record: OutboxRecord, allow_overwrite: bool) -> Result<(), OutboxStoreError> {
        self.block_on(self.put_async(&record, allow_overwrite))
    }

    fn get(&self, id: &NotificationId) -> Result<Option<OutboxRecord>, OutboxStoreError> {
        self.block_on(self.get_async(id))
    }

    fn query_by_status(
        &self,
        statuses: &[ProcessingStatus],
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        self.block_on(self.query_by_status_async(statuses))
    }

    fn query_by_status_older_than(
        &self,
        status: ProcessingStatus,
        age_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        self.block_on(self.query_by_status_older_than_async(status, age_threshold, now))
    }

    fn update(
        &self,
        id: &NotificationId,
        changes: &RecordChanges,
    ) -> Result<OutboxRecord, OutboxStoreError> {
        self.block_on(self.update_async(id, changes))
    }

    fn delete(&self, id: &NotificationId) -> Result<(), OutboxStoreError> {
        self.block_on(self.delete_async(id))
    }

    fn count_by_status(&self) -> Result<OutboxStats, OutboxStoreError> {
        self.block_on(self.count_by_status_async())
    }
}

fn record_from_row(row: &PgRow) -> Result<OutboxRecord, OutboxStoreError> {
    let kind_raw: String = row.try_get("notification_type").map_err(decode_error)?;
    let status_raw: String = row.try_get("processing_status").map_err(decode_error)?;
    let fail_count: i32 = row.try_get("processing_fail_count").map_err(decode_error)?;
    let created: DateTime<Utc> = row.try_get("created").map_err(decode_error)?;
    let modified: Option<DateTime<Utc>> = row.try_get("modified").map_err(decode_error)?;

    Ok(OutboxRecord {
        id: NotificationId::new(row.try_get::<String, _>("id").map_err(decode_error)?),
        kind: NotificationType::parse(&kind_raw).ok_or_else(|| {
            OutboxStoreError::Serialization(format!("unknown notification type {kind_raw}"))
        })?,
        label: row.try_get("label").map_err(decode_error)?,
        details: row.try_get("details").map_err(decode_error)?,
        processing_status: ProcessingStatus::parse(&status_raw).ok_or_else(|| {
            OutboxStoreError::Serialization(format!("unknown processing status {status_raw}"))
        })?,
        processing_fail_count: u32::try_from(fail_count).map_err(|_| {
            OutboxStoreError::Serialization(format!("negative fail count {fail_count}"))
        })?,
        processing_error_message: row.try_get("processing_error_message").map_err(decode_error)?,
        created,
        // Rows written before `modified` existed age from their creation time.
        modified: modified.unwrap_or(created),
    })
}

fn fail_count_to_db(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn decode_error(err: sqlx::Error) -> OutboxStoreError {
    OutboxStoreError::Serialization(format!("failed to decode outbox row: {err}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => OutboxStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::Decode(e) | sqlx::Error::ColumnDecode { source: e, .. } => {
            OutboxStoreError::Serialization(format!("decode error in {operation}: {e}"))
        }
        other => OutboxStoreError::Storage(format!("{operation} failed: {other}")),
    }
}
