//! Postgres connection and schema bootstrap for the durable stores.

use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to postgres: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("failed to apply schema ({table}): {source}")]
    Schema {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Idempotent DDL, applied in order at startup.
const SCHEMA: &[(&str, &str)] = &[
    (
        "inventory_days",
        r#"
        CREATE TABLE IF NOT EXISTS inventory_days (
            hotel_id            UUID        NOT NULL,
            room_type_id        UUID        NOT NULL,
            date                DATE        NOT NULL,
            allotment           INTEGER     NOT NULL CHECK (allotment >= 0),
            reserved            INTEGER     NOT NULL DEFAULT 0 CHECK (reserved >= 0),
            min_stay            INTEGER     NOT NULL DEFAULT 1,
            max_stay            INTEGER     NULL,
            closed_to_arrival   BOOLEAN     NOT NULL DEFAULT FALSE,
            closed_to_departure BOOLEAN     NOT NULL DEFAULT FALSE,
            stop_sell           BOOLEAN     NOT NULL DEFAULT FALSE,
            updated_at          TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (hotel_id, room_type_id, date)
        )
        "#,
    ),
    (
        "reservation_holds",
        r#"
        CREATE TABLE IF NOT EXISTS reservation_holds (
            reservation_id UUID        PRIMARY KEY,
            hotel_id       UUID        NOT NULL,
            room_type_id   UUID        NOT NULL,
            check_in       DATE        NOT NULL,
            check_out      DATE        NOT NULL CHECK (check_out > check_in),
            held_at        TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "publish_tasks",
        r#"
        CREATE TABLE IF NOT EXISTS publish_tasks (
            id              UUID        PRIMARY KEY,
            connection_id   UUID        NOT NULL,
            kind            TEXT        NOT NULL,
            priority        SMALLINT    NOT NULL,
            room_type_id    UUID        NULL,
            range_start     DATE        NOT NULL,
            range_end       DATE        NOT NULL,
            status          TEXT        NOT NULL,
            attempts        INTEGER     NOT NULL DEFAULT 0,
            created_at      TIMESTAMPTZ NOT NULL,
            updated_at      TIMESTAMPTZ NOT NULL,
            next_attempt_at TIMESTAMPTZ NULL,
            last_error      TEXT        NULL,
            seq             BIGSERIAL   NOT NULL
        )
        "#,
    ),
    (
        "publish_tasks",
        r#"
        CREATE INDEX IF NOT EXISTS publish_tasks_dequeue_idx
            ON publish_tasks (connection_id, status, priority DESC, created_at, seq)
        "#,
    ),
    (
        "sync_log",
        r#"
        CREATE TABLE IF NOT EXISTS sync_log (
            id                UUID        PRIMARY KEY,
            connection_id     UUID        NOT NULL,
            sync_type         TEXT        NOT NULL,
            direction         TEXT        NOT NULL,
            status            TEXT        NOT NULL,
            records_processed INTEGER     NOT NULL DEFAULT 0,
            records_succeeded INTEGER     NOT NULL DEFAULT 0,
            records_failed    INTEGER     NOT NULL DEFAULT 0,
            records_requeued  INTEGER     NOT NULL DEFAULT 0,
            started_at        TIMESTAMPTZ NOT NULL,
            completed_at      TIMESTAMPTZ NULL,
            error_details     JSONB       NOT NULL DEFAULT '[]'::jsonb
        )
        "#,
    ),
    (
        "sync_log",
        r#"
        CREATE INDEX IF NOT EXISTS sync_log_history_idx
            ON sync_log (connection_id, started_at DESC)
        "#,
    ),
];

pub async fn connect(database_url: &str) -> Result<PgPool, DbError> {
    PgPool::connect(database_url).await.map_err(DbError::Connect)
}

/// Create missing tables and indexes. Safe to run on every start.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), DbError> {
    for &(table, ddl) in SCHEMA {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|source| DbError::Schema { table, source })?;
    }
    tracing::info!(statements = SCHEMA.len(), "postgres schema ensured");
    Ok(())
}
