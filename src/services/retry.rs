//! Bounded retries for idempotent storage calls.

use super::error::BlobResult;
use std::{future::Future, time::Duration};
use tracing::warn;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only use for operations that are safe to repeat.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> BlobResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BlobResult<T>>,
    {
        let mut attempt = 1;
        let mut delay = self.base_delay;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    warn!(op = name, attempt, error = %err, "transient storage failure, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::error::BlobError;
    use std::{
        io::{self, ErrorKind},
        sync::atomic::{AtomicU32, Ordering},
    };

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast()
            .run("flaky", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BlobError::Io(io::Error::from(ErrorKind::TimedOut)))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: BlobResult<()> = fast()
            .run("down", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BlobError::Sqlx(sqlx::Error::PoolTimedOut))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: BlobResult<()> = fast()
            .run("missing", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BlobError::not_found("w", "n"))
            })
            .await;
        assert!(matches!(result, Err(BlobError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
