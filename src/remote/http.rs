use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};

use super::{ByteStream, Remote, RemoteError, UploadBody};
use crate::types::ObjectId;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/drive/v3";
const DEFAULT_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3";
const HTTP_TIMEOUT_SECS: u64 = 300;
const BINARY_MIME_TYPE: &str = "application/octet-stream";

#[derive(Deserialize)]
struct FileResource {
    id: String,
}

#[derive(Deserialize)]
struct StoredToken {
    access_token: String,
}

/// Drive-style HTTP backend: media upload endpoints for create/update,
/// `alt=media` downloads with a `Range` header, and `DELETE` per object.
///
/// The bearer token is read once from `token.json`; acquisition and refresh
/// live outside this crate.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    upload_url: String,
    token: String,
}

impl HttpRemote {
    pub fn new(token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .pool_max_idle_per_host(16)
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .context("failed to build http client")?;

        Ok(HttpRemote {
            client,
            base_url: DEFAULT_BASE_URL.to_owned(),
            upload_url: DEFAULT_UPLOAD_URL.to_owned(),
            token,
        })
    }

    /// Reads the bearer token from a `token.json` written by the auth flow.
    pub fn from_token_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read token file {}", path.display()))?;
        let token: StoredToken =
            serde_json::from_str(&raw).context("failed to parse token file")?;
        Self::new(token.access_token)
    }

    /// Overrides the API endpoints; used to point at a stand-in server.
    pub fn with_endpoints(mut self, base_url: String, upload_url: String) -> Self {
        self.base_url = base_url;
        self.upload_url = upload_url;
        self
    }

    fn check_status(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(RemoteError::Status {
                status: status.as_u16(),
            })
        }
    }

    fn body_stream(response: Response) -> ByteStream {
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| RemoteError::Network(err.to_string())))
            .boxed()
    }
}

fn send_error(err: reqwest::Error) -> RemoteError {
    RemoteError::Network(err.to_string())
}

#[async_trait]
impl Remote for HttpRemote {
    async fn create(&self, body: UploadBody) -> Result<ObjectId, RemoteError> {
        let url = format!("{}/files?uploadType=media", self.upload_url);
        debug!(url = %url, "remote create");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, BINARY_MIME_TYPE)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body)))
            .send()
            .await
            .map_err(send_error)?;

        let response = Self::check_status(response)?;
        let resource: FileResource = response
            .json()
            .await
            .map_err(|err| RemoteError::Protocol(format!("create response: {}", err)))?;
        Ok(ObjectId::from_bytes(resource.id.as_bytes()))
    }

    async fn update(&self, id: &ObjectId, body: UploadBody) -> Result<(), RemoteError> {
        let url = format!(
            "{}/files/{}?uploadType=media",
            self.upload_url,
            id.as_str()
        );
        debug!(url = %url, "remote update");

        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, BINARY_MIME_TYPE)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body)))
            .send()
            .await
            .map_err(send_error)?;

        Self::check_status(response)?;
        Ok(())
    }

    async fn read_at(
        &self,
        id: &ObjectId,
        size: u64,
        offset: u64,
    ) -> Result<ByteStream, RemoteError> {
        if size == 0 {
            return Ok(futures::stream::empty().boxed());
        }
        // HTTP byte ranges are inclusive: bytes=a-b yields b-a+1 bytes.
        let end = offset + size - 1;
        let url = format!("{}/files/{}?alt=media", self.base_url, id.as_str());
        trace!(url = %url, offset, size, "remote read_at");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", offset, end),
            )
            .send()
            .await
            .map_err(send_error)?;

        // 206 is the expected answer; a plain 200 means the server ignored
        // the range and is sending the whole object, which still reads
        // correctly when offset is zero.
        if response.status() == StatusCode::OK && offset != 0 {
            return Err(RemoteError::Protocol(
                "server ignored range request".to_owned(),
            ));
        }
        let response = Self::check_status(response)?;
        Ok(Self::body_stream(response))
    }

    async fn read_all(&self, id: &ObjectId) -> Result<ByteStream, RemoteError> {
        let url = format!("{}/files/{}?alt=media", self.base_url, id.as_str());
        trace!(url = %url, "remote read_all");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(send_error)?;

        let response = Self::check_status(response)?;
        Ok(Self::body_stream(response))
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), RemoteError> {
        let url = format!("{}/files/{}", self.base_url, id.as_str());
        debug!(url = %url, "remote delete");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(send_error)?;

        Self::check_status(response)?;
        Ok(())
    }
}
