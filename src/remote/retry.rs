use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use super::{ByteStream, Remote, RemoteError, UploadBody};
use crate::types::ObjectId;

const DEFAULT_MAX_ATTEMPTS: u32 = 8;
const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 10_000;

/// Decorates a [`Remote`] with exponential-backoff retry on the read and
/// delete paths. `create`/`update` pass through untouched: their body stream
/// is consumed by the first attempt, and the upload queue owns retry for
/// uploads because it can reopen the staging file.
pub struct RetryRemote<R> {
    inner: R,
    max_attempts: u32,
}

impl<R> RetryRemote<R> {
    pub fn new(inner: R) -> Self {
        RetryRemote {
            inner,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Exponential backoff with uniform jitter, capped.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY_MS.saturating_mul(1_u64 << attempt.min(16));
    let capped = exp.min(MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(capped + jitter)
}

macro_rules! retry_loop {
    ($self:ident, $op:literal, $call:expr) => {{
        let mut attempt = 0_u32;
        loop {
            match $call {
                Ok(out) => break Ok(out),
                Err(err) if err.is_retryable() && attempt + 1 < $self.max_attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        op = $op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient remote failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        }
    }};
}

#[async_trait]
impl<R: Remote> Remote for RetryRemote<R> {
    async fn create(&self, body: UploadBody) -> Result<ObjectId, RemoteError> {
        self.inner.create(body).await
    }

    async fn update(&self, id: &ObjectId, body: UploadBody) -> Result<(), RemoteError> {
        self.inner.update(id, body).await
    }

    async fn read_at(
        &self,
        id: &ObjectId,
        size: u64,
        offset: u64,
    ) -> Result<ByteStream, RemoteError> {
        retry_loop!(self, "read_at", self.inner.read_at(id, size, offset).await)
    }

    async fn read_all(&self, id: &ObjectId) -> Result<ByteStream, RemoteError> {
        retry_loop!(self, "read_all", self.inner.read_all(id).await)
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), RemoteError> {
        retry_loop!(self, "delete", self.inner.delete(id).await)
    }
}
