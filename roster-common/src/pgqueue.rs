//! # PgQueue
//!
//! The balance job queue, backed by the `balance_jobs` table.
//!
//! Jobs are enqueued with any executor, so a handler can enqueue in the same transaction as the
//! mutation that made the balancing necessary. A dequeued job holds its row lock for as long as
//! its transaction stays open, and its outcome is committed together with the balancing run.
use std::str::FromStr;
use std::time;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, Postgres};
use sqlx::{Connection, Transaction};
use thiserror::Error;

use crate::error::RosterError;
use crate::model::DepartmentId;

/// Postgres channel carrying the id of each department whose balancing run committed.
pub const BALANCE_DONE_CHANNEL: &str = "balance_done";

/// Errors that can originate from sqlx, wrapped with the command that failed.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
}

impl From<DatabaseError> for RosterError {
    fn from(error: DatabaseError) -> Self {
        match error {
            DatabaseError::PoolCreationError { error }
            | DatabaseError::ConnectionError { error }
            | DatabaseError::QueryError { error, .. }
            | DatabaseError::TransactionError { error, .. } => RosterError::from(error),
        }
    }
}

/// An error that occurs when a job cannot be retried.
/// Returns the underlying job so that a client can fail it.
#[derive(Error, Debug)]
#[error("retry is an invalid state for this job: {error}")]
pub struct RetryInvalidError<T> {
    pub job: T,
    pub error: String,
}

#[derive(Error, Debug)]
pub enum RetryError<T> {
    #[error(transparent)]
    DatabaseError(#[from] DatabaseError),
    #[error(transparent)]
    RetryInvalidError(#[from] RetryInvalidError<T>),
}

/// Completed jobs are deleted, so only two states are ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "balance_job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be picked up once `scheduled_at` has passed.
    Available,
    /// Gave up: attempts exhausted or a non-retryable error.
    Failed,
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(format!("{invalid} is not a valid JobStatus")),
        }
    }
}

/// A request to rebalance one department.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BalanceJob {
    pub id: i64,
    pub department_id: DepartmentId,
    /// 1-based number of the current attempt.
    pub attempt: i32,
    pub max_attempts: i32,
    pub status: JobStatus,
    pub errors: Vec<String>,
    /// Workers that picked up this job, one entry per attempt.
    pub attempted_by: Vec<String>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
}

impl BalanceJob {
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NewBalanceJob {
    pub department_id: DepartmentId,
    pub max_attempts: i32,
}

impl NewBalanceJob {
    pub fn new(department_id: DepartmentId, max_attempts: i32) -> Self {
        Self {
            department_id,
            max_attempts: max_attempts.max(1),
        }
    }
}

#[derive(Debug)]
pub struct CompletedJob {
    pub id: i64,
    pub department_id: DepartmentId,
}

#[derive(Debug)]
pub struct RetriedJob {
    pub id: i64,
    pub department_id: DepartmentId,
    pub retry_interval: time::Duration,
}

#[derive(Debug)]
pub struct FailedJob {
    pub id: i64,
    pub department_id: DepartmentId,
    pub error: String,
}

pub type PgQueueResult<T> = std::result::Result<T, DatabaseError>;

/// A dequeued job together with the transaction that locks its row.
///
/// Dropping it without calling `complete`, `retry` or `fail` rolls everything back and makes the
/// job available again.
#[derive(Debug)]
pub struct PgBalanceJob {
    pub job: BalanceJob,
    tx: Transaction<'static, Postgres>,
}

impl PgBalanceJob {
    /// Open a savepoint in the job's transaction. Work done in it can be rolled back on its own,
    /// leaving the job row lock in place so the outcome can still be recorded.
    pub async fn savepoint(&mut self) -> PgQueueResult<Transaction<'_, Postgres>> {
        Connection::begin(&mut *self.tx)
            .await
            .map_err(|error| DatabaseError::TransactionError {
                command: "SAVEPOINT".to_owned(),
                error,
            })
    }

    /// Publish `payload` on `channel`. Postgres delivers it only if the job's transaction commits.
    pub async fn notify(&mut self, channel: &str, payload: &str) -> PgQueueResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&mut *self.tx)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "NOTIFY".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Delete the job and commit.
    pub async fn complete(mut self) -> PgQueueResult<CompletedJob> {
        sqlx::query("DELETE FROM balance_jobs WHERE id = $1")
            .bind(self.job.id)
            .execute(&mut *self.tx)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        commit(self.tx).await?;

        Ok(CompletedJob {
            id: self.job.id,
            department_id: self.job.department_id,
        })
    }

    /// Mark the job as failed, record `error` and commit.
    pub async fn fail(mut self, error: &str) -> PgQueueResult<FailedJob> {
        let base_query = r#"
UPDATE
    balance_jobs
SET
    status = 'failed'::balance_job_status,
    errors = array_append(errors, $2)
WHERE
    id = $1
        "#;

        sqlx::query(base_query)
            .bind(self.job.id)
            .bind(error)
            .execute(&mut *self.tx)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        commit(self.tx).await?;

        Ok(FailedJob {
            id: self.job.id,
            department_id: self.job.department_id,
            error: error.to_owned(),
        })
    }

    /// Record `error`, push the job `retry_interval` into the future and commit.
    /// Fails with `RetryInvalidError`, handing the job back, once attempts are exhausted.
    pub async fn retry(
        mut self,
        error: &str,
        retry_interval: time::Duration,
    ) -> Result<RetriedJob, RetryError<Box<PgBalanceJob>>> {
        if self.job.is_gte_max_attempts() {
            return Err(RetryError::from(RetryInvalidError {
                job: Box::new(self),
                error: "Maximum attempts reached".to_owned(),
            }));
        }

        let base_query = r#"
UPDATE
    balance_jobs
SET
    scheduled_at = NOW() + $2,
    errors = array_append(errors, $3)
WHERE
    id = $1
        "#;

        sqlx::query(base_query)
            .bind(self.job.id)
            .bind(retry_interval)
            .bind(error)
            .execute(&mut *self.tx)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        commit(self.tx).await?;

        Ok(RetriedJob {
            id: self.job.id,
            department_id: self.job.department_id,
            retry_interval,
        })
    }
}

async fn commit(tx: Transaction<'static, Postgres>) -> PgQueueResult<()> {
    tx.commit()
        .await
        .map_err(|error| DatabaseError::TransactionError {
            command: "COMMIT".to_owned(),
            error,
        })
}

#[derive(Clone)]
pub struct BalanceQueue {
    pool: PgPool,
}

impl BalanceQueue {
    /// Build a queue over a lazily connected pool to the database at `url`.
    pub fn new(url: &str, max_connections: u32, app_name: &'static str) -> PgQueueResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| DatabaseError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a job with `executor`, usually the transaction that changed the department.
    pub async fn enqueue<'c, E>(executor: E, job: NewBalanceJob) -> PgQueueResult<i64>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let base_query = r#"
INSERT INTO balance_jobs
    (department_id, max_attempts, status, created_at, scheduled_at)
VALUES
    ($1, $2, 'available'::balance_job_status, NOW(), NOW())
RETURNING
    id
        "#;

        sqlx::query_scalar(base_query)
            .bind(job.department_id)
            .bind(job.max_attempts)
            .fetch_one(executor)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })
    }

    /// Pick the next due job and hold its row lock in a new transaction.
    /// Jobs locked by other workers are skipped.
    pub async fn dequeue_tx(&self, attempted_by: &str) -> PgQueueResult<Option<PgBalanceJob>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| DatabaseError::ConnectionError { error })?;

        let base_query = r#"
WITH due AS (
    SELECT
        id
    FROM
        balance_jobs
    WHERE
        status = 'available'
        AND scheduled_at <= NOW()
    ORDER BY
        attempt,
        scheduled_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    balance_jobs
SET
    attempted_at = NOW(),
    attempt = attempt + 1,
    attempted_by = array_append(attempted_by, $1::text)
FROM
    due
WHERE
    balance_jobs.id = due.id
RETURNING
    balance_jobs.*
        "#;

        let query_result: Result<Option<BalanceJob>, sqlx::Error> = sqlx::query_as(base_query)
            .bind(attempted_by)
            .fetch_optional(&mut *tx)
            .await;

        match query_result {
            Ok(Some(job)) => Ok(Some(PgBalanceJob { job, tx })),
            // Transaction is rolled back on drop.
            Ok(None) => Ok(None),
            Err(error) => Err(DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            }),
        }
    }

    /// Number of jobs that gave up, for reporting.
    pub async fn failed_count(&self) -> PgQueueResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM balance_jobs WHERE status = 'failed'")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }
}
