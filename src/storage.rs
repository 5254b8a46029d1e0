use crate::errors::QueueError;
use crate::schema::{JobData, JobRecord, JobState, JobTable, RECORD_COLUMNS};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Creates the job table and the index used by the claim query.
///
/// Safe to call on every start-up.
pub async fn setup_database(pool: &PgPool, table: &JobTable) -> Result<(), QueueError> {
    let mut tx = pool.begin().await?;

    let create_table = format!(
        r"
        CREATE TABLE IF NOT EXISTS {table} (
            id UUID PRIMARY KEY,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            deleted_at TIMESTAMPTZ,
            queue TEXT NOT NULL,
            state TEXT NOT NULL CHECK (state IN ('pending', 'processing', 'completed')),
            data JSONB NOT NULL
        )
        ",
        table = table.quoted(),
    );
    sqlx::query(&create_table).execute(&mut *tx).await?;

    let create_index = format!(
        r"
        CREATE INDEX IF NOT EXISTS {index} ON {table} (queue, created_at, id)
        WHERE state = 'pending' AND deleted_at IS NULL
        ",
        index = table.pending_index(),
        table = table.quoted(),
    );
    sqlx::query(&create_index).execute(&mut *tx).await?;

    tx.commit().await?;
    Ok(())
}

/// Drops the job table, and every job in it.
pub async fn drop_database(pool: &PgPool, table: &JobTable) -> Result<(), QueueError> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.quoted()))
        .execute(pool)
        .await?;
    Ok(())
}

/// Inserts a new pending job.
pub async fn create(
    pool: &PgPool,
    table: &JobTable,
    id: Uuid,
    queue: &str,
    data: &JobData,
) -> Result<(), QueueError> {
    let sql = format!(
        "INSERT INTO {} (id, queue, state, data) VALUES ($1, $2, $3, $4)",
        table.quoted()
    );

    let result = sqlx::query(&sql)
        .bind(id)
        .bind(queue)
        .bind(JobState::Pending.as_str())
        .bind(Json(data))
        .execute(pool)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
            Err(QueueError::DuplicateIdentifier(id.into()))
        }
        Err(error) => Err(error.into()),
    }
}

/// Loads a job by id.
///
/// Soft-deleted jobs are only returned when `include_deleted` is set.
pub async fn find(
    pool: &PgPool,
    table: &JobTable,
    id: Uuid,
    include_deleted: bool,
) -> Result<Option<JobRecord>, QueueError> {
    let filter = if include_deleted {
        ""
    } else {
        " AND deleted_at IS NULL"
    };
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} WHERE id = $1{filter}",
        table.quoted()
    );

    let record = sqlx::query_as::<_, JobRecord>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Writes back the mutable fields of `record`.
///
/// `id`, `queue` and `created_at` are never changed; `updated_at` is always
/// refreshed.
pub async fn update(pool: &PgPool, table: &JobTable, record: &JobRecord) -> Result<(), QueueError> {
    let sql = format!(
        r"
        UPDATE {}
        SET data = $2, state = $3, deleted_at = $4, updated_at = now()
        WHERE id = $1
        ",
        table.quoted()
    );

    let result = sqlx::query(&sql)
        .bind(record.id)
        .bind(Json(&record.data))
        .bind(record.state.as_str())
        .bind(record.deleted_at)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(QueueError::MissingJob(record.id.into()));
    }
    Ok(())
}

/// Inserts a pending job, or overwrites the payload of an existing one and
/// makes it pending again.
///
/// An existing job keeps its `queue` and `created_at`, and is revived if it
/// was soft-deleted.
pub async fn upsert(
    pool: &PgPool,
    table: &JobTable,
    id: Uuid,
    queue: &str,
    data: &JobData,
) -> Result<(), QueueError> {
    let sql = format!(
        r"
        INSERT INTO {} (id, queue, state, data) VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE
        SET data = EXCLUDED.data, state = EXCLUDED.state, deleted_at = NULL, updated_at = now()
        ",
        table.quoted()
    );

    sqlx::query(&sql)
        .bind(id)
        .bind(queue)
        .bind(JobState::Pending.as_str())
        .bind(Json(data))
        .execute(pool)
        .await?;
    Ok(())
}

/// Makes a job pending again without touching its payload.
///
/// Soft-deleted jobs are revived. Absent jobs are reported as missing.
pub async fn requeue(pool: &PgPool, table: &JobTable, id: Uuid) -> Result<(), QueueError> {
    let sql = format!(
        r"
        UPDATE {}
        SET state = $2, deleted_at = NULL, updated_at = now()
        WHERE id = $1
        ",
        table.quoted()
    );

    let result = sqlx::query(&sql)
        .bind(id)
        .bind(JobState::Pending.as_str())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(QueueError::MissingJob(id.into()));
    }
    Ok(())
}

/// Retires a job that has not completed yet.
///
/// With `hard` the row is deleted, otherwise it is marked completed and
/// stamped with `deleted_at`. A job that is absent, soft-deleted or already
/// completed is reported as missing and left untouched.
pub async fn retire(pool: &PgPool, table: &JobTable, id: Uuid, hard: bool) -> Result<(), QueueError> {
    let sql = if hard {
        format!(
            "DELETE FROM {} WHERE id = $1 AND state <> $2 AND deleted_at IS NULL",
            table.quoted()
        )
    } else {
        format!(
            r"
            UPDATE {}
            SET state = $2, deleted_at = now(), updated_at = now()
            WHERE id = $1 AND state <> $2 AND deleted_at IS NULL
            ",
            table.quoted()
        )
    };

    let result = sqlx::query(&sql)
        .bind(id)
        .bind(JobState::Completed.as_str())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(QueueError::MissingJob(id.into()));
    }
    Ok(())
}

/// Snapshot of all jobs in `state`, optionally restricted to one queue.
///
/// Soft-deleted jobs are included. Rows are ordered by claim priority.
pub async fn list(
    pool: &PgPool,
    table: &JobTable,
    queue: Option<&str>,
    state: JobState,
) -> Result<Vec<JobRecord>, QueueError> {
    let sql = format!(
        r"
        SELECT {RECORD_COLUMNS}
        FROM {}
        WHERE state = $1 AND ($2::TEXT IS NULL OR queue = $2)
        ORDER BY created_at ASC, id ASC
        ",
        table.quoted()
    );

    let records = sqlx::query_as::<_, JobRecord>(&sql)
        .bind(state.as_str())
        .bind(queue)
        .fetch_all(pool)
        .await?;
    Ok(records)
}

/// Finds the oldest pending job of `queue`.
///
/// `locking` is appended verbatim, e.g. `FOR UPDATE SKIP LOCKED`.
pub(crate) async fn find_next_pending<'e>(
    executor: impl PgExecutor<'e>,
    table: &JobTable,
    queue: &str,
    locking: &str,
) -> Result<Option<Uuid>, sqlx::Error> {
    let sql = format!(
        r"
        SELECT id
        FROM {}
        WHERE queue = $1 AND state = $2 AND deleted_at IS NULL
        ORDER BY created_at ASC, id ASC
        LIMIT 1
        {locking}
        ",
        table.quoted()
    );

    sqlx::query_scalar::<_, Uuid>(&sql)
        .bind(queue)
        .bind(JobState::Pending.as_str())
        .fetch_optional(executor)
        .await
}

/// Moves a job from pending to processing.
///
/// Returns `false` if the job was not pending anymore.
pub(crate) async fn mark_processing<'e>(
    executor: impl PgExecutor<'e>,
    table: &JobTable,
    id: Uuid,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        r"
        UPDATE {}
        SET state = $2, updated_at = now()
        WHERE id = $1 AND state = $3 AND deleted_at IS NULL
        ",
        table.quoted()
    );

    let result = sqlx::query(&sql)
        .bind(id)
        .bind(JobState::Processing.as_str())
        .bind(JobState::Pending.as_str())
        .execute(executor)
        .await?;

    Ok(result.rows_affected() == 1)
}
