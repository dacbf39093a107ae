pub mod http;
pub mod mock;
pub mod retry;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::types::ObjectId;

pub use http::HttpRemote;
pub use mock::MockRemote;
pub use retry::RetryRemote;

/// Body of a ranged or whole-object download.
pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

/// Upload payload. Uploads always originate from a staging file on local
/// disk, which keeps them re-openable for retry by the upload queue.
pub type UploadBody = tokio::fs::File;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The remote answered with a non-success HTTP status.
    #[error("remote returned http {status}")]
    Status { status: u16 },
    /// The request never completed: connect failure, timeout, broken body.
    #[error("network error: {0}")]
    Network(String),
    /// The remote answered with something we cannot interpret.
    #[error("malformed remote response: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Classification per status: 403 (quota), 429 and 500 are worth
    /// retrying; 400, 401, 404 and anything unknown are permanent. Plain
    /// network faults are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Status { status } => matches!(status, 403 | 429 | 500),
            RemoteError::Network(_) => true,
            RemoteError::Protocol(_) => false,
        }
    }
}

/// A remote object store: whole-object create/update/delete plus ranged
/// download. Everything above this trait is backend-agnostic; tests plug in
/// [`MockRemote`].
#[async_trait]
pub trait Remote: Send + Sync {
    /// Uploads a new object and returns its id.
    async fn create(&self, body: UploadBody) -> Result<ObjectId, RemoteError>;

    /// Replaces the contents of an existing object.
    async fn update(&self, id: &ObjectId, body: UploadBody) -> Result<(), RemoteError>;

    /// Streams `size` bytes of the object starting at `offset`.
    async fn read_at(
        &self,
        id: &ObjectId,
        size: u64,
        offset: u64,
    ) -> Result<ByteStream, RemoteError>;

    /// Streams the entire object.
    async fn read_all(&self, id: &ObjectId) -> Result<ByteStream, RemoteError>;

    /// Deletes the object.
    async fn delete(&self, id: &ObjectId) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        for status in [403, 429, 500] {
            assert!(RemoteError::Status { status }.is_retryable(), "{status}");
        }
        for status in [400, 401, 404, 416, 418, 502, 503] {
            assert!(!RemoteError::Status { status }.is_retryable(), "{status}");
        }
    }

    #[test]
    fn network_faults_are_retryable() {
        assert!(RemoteError::Network("connection reset".into()).is_retryable());
        assert!(!RemoteError::Protocol("missing id".into()).is_retryable());
    }
}
