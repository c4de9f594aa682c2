//! Exponential back-off for object store calls
//!
//! Only [`StoreError::Transient`] failures are retried. Anything else, and a
//! transient failure on the last attempt, is returned to the caller.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::{ObjectStore, Part, UploadSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay after the `attempt`-th failure: base, 2x base, 4x base, ... capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently or the attempts run out
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}/{}", operation, attempt, self.max_attempts);
                    }
                    return Ok(value);
                },
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {}ms...",
                        operation,
                        attempt,
                        self.max_attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) if e.is_transient() => {
                    return Err(StoreError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                },
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1_000), Duration::from_millis(30_000))
    }
}

/// [`ObjectStore`] decorator applying a [`RetryPolicy`] to every call
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ObjectStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for RetryingStore<S> {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn begin_chunked_upload(&self, key: &str) -> StoreResult<UploadSession> {
        self.policy
            .run("create_multipart_upload", || self.inner.begin_chunked_upload(key))
            .await
    }

    async fn upload_chunk(&self, session: &UploadSession, part_number: u32, data: &[u8]) -> StoreResult<String> {
        self.policy
            .run("upload_part", || self.inner.upload_chunk(session, part_number, data))
            .await
    }

    async fn complete(&self, session: &UploadSession, parts: &[Part]) -> StoreResult<()> {
        self.policy
            .run("complete_multipart_upload", || self.inner.complete(session, parts))
            .await
    }

    async fn abort(&self, session: &UploadSession) -> StoreResult<()> {
        self.policy
            .run("abort_multipart_upload", || self.inner.abort(session))
            .await
    }

    async fn list_open_uploads(&self, prefix: &str) -> StoreResult<Vec<UploadSession>> {
        self.policy
            .run("list_multipart_uploads", || self.inner.list_open_uploads(prefix))
            .await
    }
}
