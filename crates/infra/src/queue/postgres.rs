//! Postgres-backed publish queue.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so several workers can drain the same
//! table. State transitions load the row under `FOR UPDATE`, apply the same
//! `PublishTask` transition methods the in-memory queue uses, then write the
//! row back inside the transaction. Enqueues of equivalent tasks serialize on
//! a transaction-scoped advisory lock, so concurrent producers coalesce
//! instead of inserting duplicates.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use innsync_core::{ConnectionId, RoomTypeId, StayRange, TaskId};

use super::store::{PublishQueue, QueueStats};
use super::types::{
    FailureOutcome, PublishTask, PublishTaskInput, QueueError, RetryPolicy, RoomScope, TaskKind,
    TaskPayload, TaskPriority, TaskStatus,
};

const TASK_COLUMNS: &str = "id, connection_id, kind, priority, room_type_id, range_start, range_end, \
     status, attempts, created_at, updated_at, next_attempt_at, last_error, seq";

#[derive(Debug, Clone)]
pub struct PostgresPublishQueue {
    pool: Arc<PgPool>,
    policy: RetryPolicy,
}

impl PostgresPublishQueue {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self {
            pool: Arc::new(pool),
            policy,
        }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, QueueError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Load a task under a row lock, apply `apply`, persist the result.
    async fn transition<R, F>(&self, operation: &str, task_id: TaskId, apply: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut PublishTask) -> Result<R, QueueError> + Send,
        R: Send,
    {
        let mut tx = self.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM publish_tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(task_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        let Some(row) = row else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(QueueError::NotFound(task_id));
        };
        let (mut task, _) = task_from_row(&row)?;

        let result = match apply(&mut task) {
            Ok(result) => result,
            Err(err) => {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
        };

        if task.status == TaskStatus::Completed {
            sqlx::query("DELETE FROM publish_tasks WHERE id = $1")
                .bind(task.id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;
        } else {
            write_back(&mut tx, &task)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(result)
    }

    async fn list(
        &self,
        operation: &str,
        statuses: &[&str],
        connection_id: Option<ConnectionId>,
        order: &str,
    ) -> Result<Vec<PublishTask>, QueueError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM publish_tasks \
             WHERE status = ANY($1) AND ($2::uuid IS NULL OR connection_id = $2) \
             ORDER BY {order}"
        ))
        .bind(&statuses)
        .bind(connection_id.map(|c| *c.as_uuid()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter()
            .map(|row| task_from_row(row).map(|(task, _)| task))
            .collect()
    }
}

#[async_trait::async_trait]
impl PublishQueue for PostgresPublishQueue {
    #[instrument(skip(self, input), fields(connection_id = %input.connection_id, kind = input.kind.as_str()), err)]
    async fn enqueue(&self, input: PublishTaskInput) -> Result<PublishTask, QueueError> {
        let now = Utc::now();
        let room_type_id = scope_column(&input.payload.room_scope);
        let mut tx = self.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(coalesce_key(&input))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("enqueue_lock", e))?;

        let existing = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM publish_tasks \
             WHERE connection_id = $1 AND kind = $2 \
               AND room_type_id IS NOT DISTINCT FROM $3 \
               AND range_start = $4 AND range_end = $5 \
               AND status = 'queued' \
             ORDER BY created_at ASC \
             LIMIT 1 \
             FOR UPDATE"
        ))
        .bind(input.connection_id.as_uuid())
        .bind(input.kind.as_str())
        .bind(room_type_id)
        .bind(input.payload.range.check_in())
        .bind(input.payload.range.check_out())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue_lookup", e))?;

        let task = if let Some(row) = existing {
            let (mut task, _) = task_from_row(&row)?;
            task.absorb(input.priority, now);
            write_back(&mut tx, &task)
                .await
                .map_err(|e| map_sqlx_error("enqueue_coalesce", e))?;
            tracing::debug!(task_id = %task.id, "coalesced publish task");
            task
        } else {
            let task = PublishTask::from_input(input, now);
            sqlx::query(
                r#"
                INSERT INTO publish_tasks (
                    id, connection_id, kind, priority, room_type_id, range_start, range_end,
                    status, attempts, created_at, updated_at, next_attempt_at, last_error
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(task.id.as_uuid())
            .bind(task.connection_id.as_uuid())
            .bind(task.kind.as_str())
            .bind(task.priority.rank())
            .bind(scope_column(&task.payload.room_scope))
            .bind(task.payload.range.check_in())
            .bind(task.payload.range.check_out())
            .bind(task.status.as_str())
            .bind(task.attempts as i32)
            .bind(task.created_at)
            .bind(task.updated_at)
            .bind(task.next_attempt_at)
            .bind(&task.last_error)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("enqueue_insert", e))?;
            task
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(task)
    }

    #[instrument(skip(self), fields(connection_id = %connection_id), err)]
    async fn dequeue_next_batch(
        &self,
        connection_id: ConnectionId,
        max: usize,
    ) -> Result<Vec<PublishTask>, QueueError> {
        let now = Utc::now();
        let rows = sqlx::query(&format!(
            "UPDATE publish_tasks SET status = 'processing', updated_at = $3 \
             WHERE id IN ( \
                 SELECT id FROM publish_tasks \
                 WHERE connection_id = $1 AND status = 'queued' AND next_attempt_at <= $3 \
                 ORDER BY priority DESC, created_at ASC, seq ASC \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(connection_id.as_uuid())
        .bind(max as i64)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dequeue_next_batch", e))?;

        let mut claimed = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING carries no order guarantee.
        claimed.sort_by(|(a, a_seq), (b, b_seq)| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a_seq.cmp(b_seq))
        });
        Ok(claimed.into_iter().map(|(task, _)| task).collect())
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn mark_completed(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.transition("mark_completed", task_id, |task| task.mark_completed(Utc::now()))
            .await
    }

    #[instrument(skip(self, error), fields(task_id = %task_id), err)]
    async fn mark_failed(&self, task_id: TaskId, error: &str) -> Result<FailureOutcome, QueueError> {
        let policy = self.policy.clone();
        let error = error.to_string();
        self.transition("mark_failed", task_id, move |task| {
            task.mark_failed(&error, &policy, Utc::now())
        })
        .await
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn requeue(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.transition("requeue", task_id, |task| task.requeue(Utc::now()))
            .await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<PublishTask>, QueueError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM publish_tasks WHERE id = $1"))
            .bind(task_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref()
            .map(|r| task_from_row(r).map(|(task, _)| task))
            .transpose()
    }

    async fn snapshot(&self, connection_id: Option<ConnectionId>) -> Result<Vec<PublishTask>, QueueError> {
        self.list(
            "snapshot",
            &["queued", "processing"],
            connection_id,
            "priority DESC, created_at ASC, seq ASC",
        )
        .await
    }

    async fn failed_tasks(&self, connection_id: Option<ConnectionId>) -> Result<Vec<PublishTask>, QueueError> {
        self.list("failed_tasks", &["failed"], connection_id, "created_at ASC")
            .await
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn retry_failed(&self, task_id: TaskId) -> Result<PublishTask, QueueError> {
        self.transition("retry_failed", task_id, |task| {
            task.reset_for_retry(Utc::now())?;
            Ok(task.clone())
        })
        .await
    }

    async fn stats(&self, connection_id: ConnectionId) -> Result<QueueStats, QueueError> {
        let tasks = self
            .list(
                "stats",
                &["queued", "processing", "failed"],
                Some(connection_id),
                "created_at ASC",
            )
            .await?;
        Ok(QueueStats::from_tasks(&tasks))
    }

    #[instrument(skip(self), err)]
    async fn requeue_in_flight(&self) -> Result<usize, QueueError> {
        let result = sqlx::query(
            "UPDATE publish_tasks SET status = 'queued', updated_at = $1 WHERE status = 'processing'",
        )
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_in_flight", e))?;
        Ok(result.rows_affected() as usize)
    }
}

/// Advisory lock key shared by every enqueue of an equivalent task.
fn coalesce_key(input: &PublishTaskInput) -> String {
    let room = match input.payload.room_scope {
        RoomScope::All => "all".to_string(),
        RoomScope::RoomType(id) => id.to_string(),
    };
    format!(
        "publish_tasks:{}:{}:{}:{}:{}",
        input.connection_id,
        input.kind.as_str(),
        room,
        input.payload.range.check_in(),
        input.payload.range.check_out()
    )
}

fn scope_column(scope: &RoomScope) -> Option<Uuid> {
    match scope {
        RoomScope::All => None,
        RoomScope::RoomType(id) => Some(*id.as_uuid()),
    }
}

async fn write_back(tx: &mut Transaction<'static, Postgres>, task: &PublishTask) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE publish_tasks
        SET priority = $2, status = $3, attempts = $4, updated_at = $5,
            next_attempt_at = $6, last_error = $7
        WHERE id = $1
        "#,
    )
    .bind(task.id.as_uuid())
    .bind(task.priority.rank())
    .bind(task.status.as_str())
    .bind(task.attempts as i32)
    .bind(task.updated_at)
    .bind(task.next_attempt_at)
    .bind(&task.last_error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn task_from_row(row: &PgRow) -> Result<(PublishTask, i64), QueueError> {
    let decode = |e: sqlx::Error| QueueError::Storage(format!("failed to decode publish task row: {e}"));

    let kind: String = row.try_get("kind").map_err(decode)?;
    let priority: i16 = row.try_get("priority").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let room_type_id: Option<Uuid> = row.try_get("room_type_id").map_err(decode)?;
    let range_start: NaiveDate = row.try_get("range_start").map_err(decode)?;
    let range_end: NaiveDate = row.try_get("range_end").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;

    let range = StayRange::new(range_start, range_end)
        .map_err(|e| QueueError::Storage(format!("stored task range is invalid: {e}")))?;

    let task = PublishTask {
        id: TaskId::from_uuid(row.try_get("id").map_err(decode)?),
        connection_id: ConnectionId::from_uuid(row.try_get("connection_id").map_err(decode)?),
        kind: TaskKind::parse(&kind)
            .ok_or_else(|| QueueError::Storage(format!("unknown task kind: {kind}")))?,
        priority: TaskPriority::from_rank(priority)
            .ok_or_else(|| QueueError::Storage(format!("unknown task priority: {priority}")))?,
        payload: TaskPayload {
            room_scope: room_type_id
                .map(|id| RoomScope::RoomType(RoomTypeId::from_uuid(id)))
                .unwrap_or(RoomScope::All),
            range,
        },
        status: TaskStatus::parse(&status)
            .ok_or_else(|| QueueError::Storage(format!("unknown task status: {status}")))?,
        attempts: attempts.max(0) as u32,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode)?,
        next_attempt_at: row.try_get::<DateTime<Utc>, _>("next_attempt_at").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
    };
    let seq: i64 = row.try_get("seq").map_err(decode)?;
    Ok((task, seq))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            QueueError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => QueueError::Storage(format!("{operation}: {other}")),
    }
}
