use std::sync::Arc;
use std::time;

use tokio::sync;
use tracing::{error, info, instrument, warn};

use roster_common::balancer::{BalanceReport, Balancer};
use roster_common::error::{RosterError, RosterResult};
use roster_common::health::HealthHandle;
use roster_common::pgqueue::{
    BalanceQueue, DatabaseError, PgBalanceJob, RetryError, RetryInvalidError,
    BALANCE_DONE_CHANNEL,
};
use roster_common::retry::RetryPolicy;
use roster_common::store::PgRoster;

use crate::error::WorkerError;

/// A worker to poll `BalanceQueue` and spawn tasks to rebalance departments as jobs become
/// available.
pub struct BalanceWorker<'p> {
    /// An identifier for this worker. Used to mark jobs we have consumed.
    name: String,
    /// The queue we will be dequeuing jobs from.
    queue: &'p BalanceQueue,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// Maximum number of concurrent jobs being processed.
    max_concurrent_jobs: usize,
    balancer: Balancer,
    /// The retry policy used to calculate retry intervals when a job fails with a retryable error.
    retry_policy: RetryPolicy,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl<'p> BalanceWorker<'p> {
    pub fn new(
        name: &str,
        queue: &'p BalanceQueue,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        balancer: Balancer,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            poll_interval,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            balancer,
            retry_policy,
            liveness,
        }
    }

    /// Wait until a job becomes available in our queue.
    async fn wait_for_job_tx(&self) -> PgBalanceJob {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy();

            match self.queue.dequeue_tx(&self.name).await {
                Ok(Some(job)) => return job,
                Ok(None) => continue,
                Err(error) => {
                    error!("error while trying to dequeue_tx job: {}", error);
                    continue;
                }
            }
        }
    }

    /// Run this worker to continuously process any jobs that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("balance_worker_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64);
        };

        info!(worker = self.name.as_str(), "balance worker started");

        loop {
            report_semaphore_utilization();

            // Taken before dequeuing: a dequeued job already holds its row lock.
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::SemaphoreClosed)?;

            let job = self.wait_for_job_tx().await;
            metrics::counter!("balance_jobs_total").increment(1);

            let balancer = self.balancer;
            let retry_policy = self.retry_policy.clone();

            tokio::spawn(async move {
                let _permit = permit;

                if let Err(error) = process_balance_job(job, &balancer, &retry_policy).await {
                    error!("error processing balance job: {}", error);
                }
            });
        }
    }
}

/// What to record for a job once its balancing run is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDecision {
    Complete,
    Retry {
        interval: time::Duration,
        error: String,
    },
    Fail {
        error: String,
    },
}

/// Decide the outcome of `attempt` (1-based) of a job allowed `max_attempts` attempts.
///
/// A job for a department that no longer exists has nothing left to do and completes.
pub fn decide(
    result: &RosterResult<BalanceReport>,
    attempt: i32,
    max_attempts: i32,
    retry_policy: &RetryPolicy,
) -> JobDecision {
    let error = match result {
        Ok(_) | Err(RosterError::NotFound("department", _)) => return JobDecision::Complete,
        Err(error) => error,
    };

    if error.is_retryable() && attempt < max_attempts {
        let attempt = u32::try_from(attempt).unwrap_or(1);
        JobDecision::Retry {
            interval: retry_policy.retry_interval(attempt),
            error: error.to_string(),
        }
    } else {
        JobDecision::Fail {
            error: error.to_string(),
        }
    }
}

/// Run the balancer for a dequeued job and record the outcome in the job's transaction.
///
/// The balancing run happens inside a savepoint. On error only the savepoint is rolled back, so
/// the retry or failure can still be committed while the job row stays locked.
#[instrument(skip_all, fields(job_id = job.job.id, department_id = job.job.department_id, attempt = job.job.attempt))]
pub async fn process_balance_job(
    mut job: PgBalanceJob,
    balancer: &Balancer,
    retry_policy: &RetryPolicy,
) -> Result<(), WorkerError> {
    let department_id = job.job.department_id;
    let now = tokio::time::Instant::now();

    let result = {
        let mut savepoint = job.savepoint().await?;
        let result = balancer
            .balance(&mut PgRoster::new(&mut savepoint), department_id)
            .await;

        match result {
            Ok(_) => savepoint.commit().await.map_err(|error| {
                DatabaseError::TransactionError {
                    command: "RELEASE SAVEPOINT".to_owned(),
                    error,
                }
            })?,
            Err(_) => savepoint.rollback().await.map_err(|error| {
                DatabaseError::TransactionError {
                    command: "ROLLBACK TO SAVEPOINT".to_owned(),
                    error,
                }
            })?,
        }

        result
    };

    metrics::histogram!("balance_jobs_processing_duration_seconds")
        .record(now.elapsed().as_secs_f64());

    match decide(&result, job.job.attempt, job.job.max_attempts, retry_policy) {
        JobDecision::Complete => {
            match &result {
                Ok(report) => {
                    metrics::counter!("balance_groups_created")
                        .increment(report.groups_created as u64);
                    metrics::counter!("balance_groups_deleted")
                        .increment(report.groups_deleted as u64);
                    if !report.is_noop() {
                        info!(
                            groups = report.group_count,
                            created = report.groups_created,
                            deleted = report.groups_deleted,
                            students_reassigned = report.students_reassigned,
                            "department rebalanced"
                        );
                    }

                    job.notify(BALANCE_DONE_CHANNEL, &department_id.to_string())
                        .await?;
                }
                Err(_) => warn!("department no longer exists, dropping balance job"),
            }

            job.complete().await?;
            metrics::counter!("balance_jobs_completed").increment(1);
        }
        JobDecision::Retry { interval, error } => {
            warn!(retry_in = ?interval, "balancing failed, will retry: {}", error);

            match job.retry(&error, interval).await {
                Ok(_) => {
                    metrics::counter!("balance_jobs_retried").increment(1);
                }
                Err(RetryError::RetryInvalidError(RetryInvalidError { job, .. })) => {
                    job.fail(&error).await?;
                    metrics::counter!("balance_jobs_failed").increment(1);
                }
                Err(RetryError::DatabaseError(error)) => return Err(error.into()),
            }
        }
        JobDecision::Fail { error } => {
            error!("balancing failed permanently: {}", error);

            job.fail(&error).await?;
            metrics::counter!("balance_jobs_failed").increment(1);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use roster_common::model::DepartmentId;
    use roster_common::pgqueue::NewBalanceJob;
    use sqlx::PgPool;

    fn report(department_id: DepartmentId) -> BalanceReport {
        BalanceReport {
            department_id,
            groups_created: 1,
            groups_deleted: 0,
            group_count: 1,
            students_reassigned: 3,
            instructors_assigned: 1,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::build(2, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(5))
            .provide()
    }

    #[test]
    fn test_successful_run_completes() {
        let decision = decide(&Ok(report(1)), 1, 3, &policy());
        assert_eq!(decision, JobDecision::Complete);
    }

    #[test]
    fn test_missing_department_completes() {
        let result = Err(RosterError::NotFound("department", 7));
        assert_eq!(decide(&result, 1, 3, &policy()), JobDecision::Complete);
    }

    #[test]
    fn test_database_error_is_retried_with_backoff() {
        let result = Err(RosterError::Database(sqlx::Error::PoolTimedOut));

        match decide(&result, 1, 3, &policy()) {
            JobDecision::Retry { interval, .. } => {
                assert_eq!(interval, time::Duration::from_secs(1))
            }
            other => panic!("expected a retry, got {other:?}"),
        }
        match decide(&result, 2, 3, &policy()) {
            JobDecision::Retry { interval, .. } => {
                assert_eq!(interval, time::Duration::from_secs(2))
            }
            other => panic!("expected a retry, got {other:?}"),
        }
    }

    #[test]
    fn test_database_error_on_last_attempt_fails() {
        let result = Err(RosterError::Database(sqlx::Error::PoolTimedOut));
        assert!(matches!(
            decide(&result, 3, 3, &policy()),
            JobDecision::Fail { .. }
        ));
    }

    #[test]
    fn test_invariant_breach_is_never_retried() {
        let result = Err(RosterError::InvariantBreach(
            "department 1 has students but no instructors".to_owned(),
        ));

        match decide(&result, 1, 3, &policy()) {
            JobDecision::Fail { error } => assert!(error.contains("no instructors")),
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_group_is_not_mistaken_for_missing_department() {
        let result = Err(RosterError::NotFound("group", 4));
        assert!(matches!(
            decide(&result, 1, 3, &policy()),
            JobDecision::Fail { .. }
        ));
    }

    async fn seed_department(pool: &PgPool, instructors: usize, students: usize) -> DepartmentId {
        let department_id: DepartmentId =
            sqlx::query_scalar("INSERT INTO departments (name) VALUES ('physics') RETURNING id")
                .fetch_one(pool)
                .await
                .unwrap();

        for _ in 0..instructors {
            sqlx::query(
                "INSERT INTO instructors (first_name, last_name, birth_date, department_id) VALUES ('Ada', 'Lovelace', '1985-12-10', $1)",
            )
            .bind(department_id)
            .execute(pool)
            .await
            .unwrap();
        }
        for _ in 0..students {
            sqlx::query(
                "INSERT INTO students (first_name, last_name, birth_date, department_id) VALUES ('Alan', 'Turing', '2004-06-23', $1)",
            )
            .bind(department_id)
            .execute(pool)
            .await
            .unwrap();
        }

        department_id
    }

    async fn job_count(pool: &PgPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM balance_jobs")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a postgres server at DATABASE_URL"]
    async fn test_job_rebalances_department_and_completes(db: PgPool) {
        let department_id = seed_department(&db, 2, 25).await;
        let queue = BalanceQueue::new_from_pool(db.clone());
        BalanceQueue::enqueue(&db, NewBalanceJob::new(department_id, 3))
            .await
            .unwrap();

        let job = queue.dequeue_tx("test").await.unwrap().unwrap();
        process_balance_job(job, &Balancer::default(), &policy())
            .await
            .expect("failed to process job");

        assert_eq!(job_count(&db).await, 0);

        let groups: Vec<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT g.id, g.instructor_id FROM groups g WHERE g.department_id = $1 ORDER BY g.id",
        )
        .bind(department_id)
        .fetch_all(&db)
        .await
        .unwrap();
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|(_, instructor)| instructor.is_some()));

        let unassigned: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM students WHERE group_id IS NULL")
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(unassigned, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a postgres server at DATABASE_URL"]
    async fn test_breach_fails_job_without_writing_groups(db: PgPool) {
        let department_id = seed_department(&db, 0, 4).await;
        let queue = BalanceQueue::new_from_pool(db.clone());
        BalanceQueue::enqueue(&db, NewBalanceJob::new(department_id, 3))
            .await
            .unwrap();

        let job = queue.dequeue_tx("test").await.unwrap().unwrap();
        process_balance_job(job, &Balancer::default(), &policy())
            .await
            .unwrap();

        assert_eq!(queue.failed_count().await.unwrap(), 1);
        assert!(queue.dequeue_tx("test").await.unwrap().is_none());

        let groups: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM groups")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(groups, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a postgres server at DATABASE_URL"]
    async fn test_job_for_deleted_department_completes(db: PgPool) {
        let queue = BalanceQueue::new_from_pool(db.clone());
        BalanceQueue::enqueue(&db, NewBalanceJob::new(424242, 3))
            .await
            .unwrap();

        let job = queue.dequeue_tx("test").await.unwrap().unwrap();
        process_balance_job(job, &Balancer::default(), &policy())
            .await
            .unwrap();

        assert_eq!(job_count(&db).await, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a postgres server at DATABASE_URL"]
    async fn test_completed_job_announces_balance_done(db: PgPool) {
        let department_id = seed_department(&db, 1, 5).await;
        let queue = BalanceQueue::new_from_pool(db.clone());
        let mut listener = sqlx::postgres::PgListener::connect_with(&db).await.unwrap();
        listener.listen(BALANCE_DONE_CHANNEL).await.unwrap();

        BalanceQueue::enqueue(&db, NewBalanceJob::new(department_id, 3))
            .await
            .unwrap();
        let job = queue.dequeue_tx("test").await.unwrap().unwrap();
        process_balance_job(job, &Balancer::default(), &policy())
            .await
            .unwrap();

        let notification = tokio::time::timeout(time::Duration::from_secs(5), listener.recv())
            .await
            .expect("timed out waiting for balance_done")
            .unwrap();
        assert_eq!(notification.payload(), department_id.to_string());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a postgres server at DATABASE_URL"]
    async fn test_concurrent_runs_for_one_department_are_serialized(db: PgPool) {
        let department_id = seed_department(&db, 3, 47).await;
        let queue = BalanceQueue::new_from_pool(db.clone());
        for _ in 0..4 {
            BalanceQueue::enqueue(&db, NewBalanceJob::new(department_id, 1))
                .await
                .unwrap();
        }

        // Each job is held by its own transaction before any of them runs.
        let mut jobs = Vec::new();
        for worker in ["w1", "w2", "w3", "w4"] {
            jobs.push(queue.dequeue_tx(worker).await.unwrap().unwrap());
        }

        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                tokio::spawn(async move {
                    process_balance_job(job, &Balancer::default(), &policy()).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().expect("failed to process job");
        }

        assert_eq!(job_count(&db).await, 0);
        assert_eq!(queue.failed_count().await.unwrap(), 0);

        // max(ceil(47 / 10), min(47, 3)) = 5 groups of at most ceil(47 / 5) = 10 students.
        let groups: Vec<(i64, Option<i64>, i64)> = sqlx::query_as(
            r#"
SELECT g.id, g.instructor_id, COUNT(s.id)
FROM groups g LEFT JOIN students s ON s.group_id = g.id
WHERE g.department_id = $1
GROUP BY g.id
ORDER BY g.id
            "#,
        )
        .bind(department_id)
        .fetch_all(&db)
        .await
        .unwrap();
        assert_eq!(groups.len(), 5);
        assert!(groups
            .iter()
            .all(|(_, instructor, members)| instructor.is_some() && *members <= 10));

        let unassigned: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM students WHERE group_id IS NULL")
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(unassigned, 0);
    }
}
