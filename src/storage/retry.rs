use super::{ByteRange, ObjectInfo, ObjectReader, ObjectStore};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff for transient object store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        what,
                        e,
                        delay,
                        attempt + 1,
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!("{} failed after {} attempts: {}", what, attempt + 1, e);
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

/// Object store decorator that retries transient failures.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for RetryingStore<S> {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.policy
            .run(&format!("list {prefix}"), || self.inner.list(prefix))
            .await
    }

    async fn open_at(&self, key: &str, offset: u64) -> Result<ObjectReader> {
        self.policy
            .run(&format!("open {key}@{offset}"), || {
                self.inner.open_at(key, offset)
            })
            .await
    }

    async fn read_range(&self, key: &str, range: ByteRange) -> Result<Bytes> {
        self.policy
            .run(&format!("read {key}@{}", range.offset), || {
                self.inner.read_range(key, range)
            })
            .await
    }
}
