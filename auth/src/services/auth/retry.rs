//! Timeout and bounded retry for store calls.
//!
//! Every store call is bounded by a timeout. Only idempotent calls (lookups,
//! revocations) are retried; the rotation compare-and-set is attempted once,
//! since a retried success could be indistinguishable from reuse.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::repos::error::RepoError;
use crate::services::auth::error::TokenError;

#[derive(Debug, Clone)]
pub struct StorePolicy {
    /// Upper bound for a single store call.
    pub timeout: Duration,
    /// Additional attempts for idempotent calls.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
enum Attempt {
    TimedOut,
    Failed(RepoError),
}

impl Attempt {
    fn is_retryable(&self) -> bool {
        match self {
            Attempt::TimedOut => true,
            Attempt::Failed(e) => e.is_transient(),
        }
    }

    fn into_token_error(self) -> TokenError {
        match self {
            Attempt::TimedOut => TokenError::StorageUnavailable,
            Attempt::Failed(e) => e.into(),
        }
    }
}

impl StorePolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Exponential backoff: initial_delay * 2^attempt, capped at max_delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    async fn attempt<T, Fut>(&self, fut: Fut) -> Result<T, Attempt>
    where
        Fut: Future<Output = Result<T, RepoError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(Attempt::Failed(e)),
            Err(_) => Err(Attempt::TimedOut),
        }
    }

    /// Run a non-idempotent store call exactly once, bounded by the timeout.
    pub async fn once<T, Fut>(&self, op: &'static str, fut: Fut) -> Result<T, TokenError>
    where
        Fut: Future<Output = Result<T, RepoError>>,
    {
        self.attempt(fut).await.map_err(|a| {
            warn!(op, error = ?a, "store call failed");
            a.into_token_error()
        })
    }

    /// Run an idempotent store call, retrying timeouts and transient errors.
    pub async fn idempotent<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, TokenError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepoError>>,
    {
        let mut attempt = 0;
        loop {
            match self.attempt(call()).await {
                Ok(v) => return Ok(v),
                Err(a) if a.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = ?a, "retrying store call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(a) => {
                    warn!(op, attempt, error = ?a, "store call failed");
                    return Err(a.into_token_error());
                }
            }
        }
    }
}
