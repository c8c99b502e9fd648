//! Bounded waits for check operations

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::instrument::WithSubscriber;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeadlineError<E> {
    #[error("deadline of {0:?} exceeded")]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(E),

    #[error("operation was aborted before completing")]
    Aborted,
}

impl<E> DeadlineError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeadlineError::TimedOut(_))
    }
}

/// Await `op` for at most `deadline`. On expiry the operation is dropped.
pub async fn wait_with_deadline<F, T, E>(op: F, deadline: Duration) -> Result<T, DeadlineError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(DeadlineError::Failed(err)),
        Err(_) => Err(DeadlineError::TimedOut(deadline)),
    }
}

/// Run `op` in its own task and wait for at most `deadline`.
///
/// On expiry the task keeps running detached and whatever it eventually
/// produces is discarded.
pub async fn race_detached<F, T, E>(op: F, deadline: Duration) -> Result<T, DeadlineError<E>>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let task = tokio::spawn(op.with_current_subscriber());
    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(DeadlineError::Failed(err)),
        Ok(Err(_)) => Err(DeadlineError::Aborted),
        Err(_) => Err(DeadlineError::TimedOut(deadline)),
    }
}
