//! In-memory test double for the remote object store.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use super::{ByteStream, Remote, RemoteError, UploadBody};
use crate::types::ObjectId;

/// Chunk granularity of mock download streams; small enough that ranged
/// readers exercise their chunk-reassembly paths.
const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct MockState {
    objects: HashMap<ObjectId, Vec<u8>>,
    next_id: u64,
    create_calls: u64,
    update_calls: u64,
    read_at_calls: u64,
    delete_calls: u64,
    read_requests: Vec<(u64, u64)>,
    fail_reads: Vec<RemoteError>,
    fail_uploads: Vec<RemoteError>,
    read_delay: Option<std::time::Duration>,
}

/// A [`Remote`] backed by a map, with call counting and fault injection.
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl MockRemote {
    pub fn new() -> Self {
        MockRemote {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Seeds an object and returns its id.
    pub fn insert_object(&self, data: Vec<u8>) -> ObjectId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = ObjectId::from_bytes(format!("mock-{}", state.next_id).as_bytes());
        state.objects.insert(id.clone(), data);
        id
    }

    pub fn object(&self, id: &ObjectId) -> Option<Vec<u8>> {
        self.state.lock().objects.get(id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn create_calls(&self) -> u64 {
        self.state.lock().create_calls
    }

    pub fn update_calls(&self) -> u64 {
        self.state.lock().update_calls
    }

    pub fn read_at_calls(&self) -> u64 {
        self.state.lock().read_at_calls
    }

    pub fn delete_calls(&self) -> u64 {
        self.state.lock().delete_calls
    }

    /// `(offset, size)` of every ranged request, in order.
    pub fn read_requests(&self) -> Vec<(u64, u64)> {
        self.state.lock().read_requests.clone()
    }

    /// Delays every ranged read, simulating request latency.
    pub fn set_read_delay(&self, delay: std::time::Duration) {
        self.state.lock().read_delay = Some(delay);
    }

    /// The next `n` read_at/read_all calls fail with `err`.
    pub fn fail_next_reads(&self, n: u32, err: RemoteError) {
        let mut state = self.state.lock();
        for _ in 0..n {
            state.fail_reads.push(err.clone());
        }
    }

    /// The next `n` create/update calls fail with `err`.
    pub fn fail_next_uploads(&self, n: u32, err: RemoteError) {
        let mut state = self.state.lock();
        for _ in 0..n {
            state.fail_uploads.push(err.clone());
        }
    }

    fn take_read_fault(&self) -> Option<RemoteError> {
        self.state.lock().fail_reads.pop()
    }

    fn take_upload_fault(&self) -> Option<RemoteError> {
        self.state.lock().fail_uploads.pop()
    }

    fn stream_of(data: Vec<u8>) -> ByteStream {
        let chunks: Vec<Result<Bytes, RemoteError>> = data
            .chunks(STREAM_CHUNK)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        stream::iter(chunks).boxed()
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_body(mut body: UploadBody) -> Result<Vec<u8>, RemoteError> {
    let mut data = Vec::new();
    body.read_to_end(&mut data)
        .await
        .map_err(|err| RemoteError::Network(format!("reading upload body: {}", err)))?;
    Ok(data)
}

#[async_trait]
impl Remote for MockRemote {
    async fn create(&self, body: UploadBody) -> Result<ObjectId, RemoteError> {
        self.state.lock().create_calls += 1;
        if let Some(err) = self.take_upload_fault() {
            return Err(err);
        }
        let data = read_body(body).await?;
        Ok(self.insert_object(data))
    }

    async fn update(&self, id: &ObjectId, body: UploadBody) -> Result<(), RemoteError> {
        self.state.lock().update_calls += 1;
        if let Some(err) = self.take_upload_fault() {
            return Err(err);
        }
        let data = read_body(body).await?;
        let mut state = self.state.lock();
        match state.objects.get_mut(id) {
            Some(existing) => {
                *existing = data;
                Ok(())
            }
            None => Err(RemoteError::Status { status: 404 }),
        }
    }

    async fn read_at(
        &self,
        id: &ObjectId,
        size: u64,
        offset: u64,
    ) -> Result<ByteStream, RemoteError> {
        let delay = {
            let mut state = self.state.lock();
            state.read_at_calls += 1;
            state.read_requests.push((offset, size));
            state.read_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.take_read_fault() {
            return Err(err);
        }
        let state = self.state.lock();
        let Some(data) = state.objects.get(id) else {
            return Err(RemoteError::Status { status: 404 });
        };
        if offset >= data.len() as u64 {
            // Range entirely past the end: 416, permanent.
            return Err(RemoteError::Status { status: 416 });
        }
        let end = (offset + size).min(data.len() as u64);
        Ok(Self::stream_of(data[offset as usize..end as usize].to_vec()))
    }

    async fn read_all(&self, id: &ObjectId) -> Result<ByteStream, RemoteError> {
        if let Some(err) = self.take_read_fault() {
            return Err(err);
        }
        let state = self.state.lock();
        let Some(data) = state.objects.get(id) else {
            return Err(RemoteError::Status { status: 404 });
        };
        Ok(Self::stream_of(data.clone()))
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), RemoteError> {
        self.state.lock().delete_calls += 1;
        let mut state = self.state.lock();
        match state.objects.remove(id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::Status { status: 404 }),
        }
    }
}

/// Drains a download stream into a buffer. Test helper.
pub async fn collect(mut stream: ByteStream) -> Result<Vec<u8>, RemoteError> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
