//! Postgres-backed sync log. Error details are stored as a JSONB array.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use innsync_core::{ConnectionId, SyncLogId};

use super::entry::{SyncDirection, SyncErrorDetail, SyncLogEntry, SyncLogError, SyncStatus, SyncType};
use super::store::SyncLogRecorder;

const ENTRY_COLUMNS: &str = "id, connection_id, sync_type, direction, status, records_processed, \
     records_succeeded, records_failed, records_requeued, started_at, completed_at, error_details";

#[derive(Debug, Clone)]
pub struct PostgresSyncLog {
    pool: Arc<PgPool>,
}

impl PostgresSyncLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl SyncLogRecorder for PostgresSyncLog {
    #[instrument(skip(self, entry), fields(sync_log_id = %entry.id, connection_id = %entry.connection_id), err)]
    async fn insert(&self, entry: &SyncLogEntry) -> Result<(), SyncLogError> {
        let details = details_json(entry)?;
        sqlx::query(
            r#"
            INSERT INTO sync_log (
                id, connection_id, sync_type, direction, status, records_processed,
                records_succeeded, records_failed, records_requeued, started_at, completed_at,
                error_details
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.connection_id.as_uuid())
        .bind(entry.sync_type.label())
        .bind(entry.direction.as_str())
        .bind(entry.status.as_str())
        .bind(entry.records_processed as i32)
        .bind(entry.records_succeeded as i32)
        .bind(entry.records_failed as i32)
        .bind(entry.records_requeued as i32)
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .bind(details)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    #[instrument(skip(self, entry), fields(sync_log_id = %entry.id, status = entry.status.as_str()), err)]
    async fn update(&self, entry: &SyncLogEntry) -> Result<(), SyncLogError> {
        let details = details_json(entry)?;
        let result = sqlx::query(
            r#"
            UPDATE sync_log
            SET status = $2, records_processed = $3, records_succeeded = $4,
                records_failed = $5, records_requeued = $6, completed_at = $7,
                error_details = $8
            WHERE id = $1 AND completed_at IS NULL
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.status.as_str())
        .bind(entry.records_processed as i32)
        .bind(entry.records_succeeded as i32)
        .bind(entry.records_failed as i32)
        .bind(entry.records_requeued as i32)
        .bind(entry.completed_at)
        .bind(details)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return match self.get(entry.id).await? {
                Some(_) => Err(SyncLogError::Closed(entry.id)),
                None => Err(SyncLogError::NotFound(entry.id)),
            };
        }
        Ok(())
    }

    async fn get(&self, id: SyncLogId) -> Result<Option<SyncLogEntry>, SyncLogError> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM sync_log WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn history(
        &self,
        connection_id: Option<ConnectionId>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, SyncLogError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_log \
             WHERE ($1::uuid IS NULL OR connection_id = $1) \
             ORDER BY started_at DESC, id DESC \
             LIMIT $2"
        ))
        .bind(connection_id.map(|c| *c.as_uuid()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history", e))?;

        rows.iter().map(entry_from_row).collect()
    }
}

fn details_json(entry: &SyncLogEntry) -> Result<serde_json::Value, SyncLogError> {
    serde_json::to_value(&entry.error_details)
        .map_err(|e| SyncLogError::Storage(format!("failed to encode error details: {e}")))
}

fn entry_from_row(row: &PgRow) -> Result<SyncLogEntry, SyncLogError> {
    let decode = |e: sqlx::Error| SyncLogError::Storage(format!("failed to decode sync log row: {e}"));
    let count = |name: &str| -> Result<u32, SyncLogError> {
        let v: i32 = row.try_get(name).map_err(decode)?;
        Ok(v.max(0) as u32)
    };

    let sync_type: String = row.try_get("sync_type").map_err(decode)?;
    let direction: String = row.try_get("direction").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let details: serde_json::Value = row.try_get("error_details").map_err(decode)?;

    Ok(SyncLogEntry {
        id: SyncLogId::from_uuid(row.try_get("id").map_err(decode)?),
        connection_id: ConnectionId::from_uuid(row.try_get("connection_id").map_err(decode)?),
        sync_type: SyncType::parse(&sync_type)
            .ok_or_else(|| SyncLogError::Storage(format!("unknown sync type: {sync_type}")))?,
        direction: match direction.as_str() {
            "push" => SyncDirection::Push,
            "pull" => SyncDirection::Pull,
            other => return Err(SyncLogError::Storage(format!("unknown direction: {other}"))),
        },
        status: SyncStatus::parse(&status)
            .ok_or_else(|| SyncLogError::Storage(format!("unknown sync status: {status}")))?,
        records_processed: count("records_processed")?,
        records_succeeded: count("records_succeeded")?,
        records_failed: count("records_failed")?,
        records_requeued: count("records_requeued")?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at").map_err(decode)?,
        completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at").map_err(decode)?,
        error_details: serde_json::from_value::<Vec<SyncErrorDetail>>(details)
            .map_err(|e| SyncLogError::Storage(format!("failed to decode error details: {e}")))?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SyncLogError {
    match err {
        sqlx::Error::Database(db_err) => {
            SyncLogError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => SyncLogError::Storage(format!("{operation}: {other}")),
    }
}
