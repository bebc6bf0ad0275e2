//! Fixed-backoff retry policy shared by election, lease and quorum waits.

use std::future::Future;
use std::time::Duration;

use litebase_proto::error::{LbError, LbResult};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(backoff: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `f` until it succeeds, attempts run out, or `cancel` fires.
    ///
    /// `f` receives the 1-based attempt number. The last error is returned
    /// once attempts are exhausted; cancellation returns `LbError::Cancelled`.
    pub async fn run<F, Fut, T>(&self, cancel: &CancellationToken, f: F) -> LbResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = LbResult<T>>,
    {
        self.run_if(cancel, |_| true, f).await
    }

    /// Like [`RetryPolicy::run`], but errors rejected by `should_retry` are
    /// returned immediately.
    pub async fn run_if<P, F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        should_retry: P,
        mut f: F,
    ) -> LbResult<T>
    where
        P: Fn(LbError) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = LbResult<T>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(LbError::Cancelled);
            }
            attempt += 1;
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts || !should_retry(e) => return Err(e),
                Err(e) => {
                    debug!("retry: attempt {} failed: {}", attempt, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LbError::Cancelled),
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }
    }
}
