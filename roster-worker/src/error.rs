use roster_common::pgqueue;
use thiserror::Error;

/// Errors that stop the worker loop or abandon a job without recording an outcome.
/// An abandoned job is rolled back and picked up again once its row lock is released.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when executing a job: {0}")]
    DatabaseError(#[from] pgqueue::DatabaseError),
    #[error("the job semaphore has been closed")]
    SemaphoreClosed,
}
