pub mod gate;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, trace};

use crate::remote::{ByteStream, Remote, RemoteError};
use crate::types::ObjectId;

pub use gate::{GatePass, ReadGate};

/// Initial request window while reads look sequential.
pub const SEQUENTIAL_READ_SIZE: u64 = 512 * 1024 * 1024;
/// Request window once the access pattern has proven random.
pub const RANDOM_READ_SIZE: u64 = 4 * 1024 * 1024;

/// Times the body stream is reopened within one read call before a
/// transient mid-stream failure is surfaced.
const MAX_STREAM_REOPENS: u32 = 3;

struct LastChunk {
    offset: u64,
    data: Bytes,
}

/// Streaming reader over one remote object.
///
/// The kernel issues many small reads; answering each with its own request
/// wastes round trips. Instead one large ranged request is opened and
/// consumed across successive reads for as long as they stay sequential. A
/// non-sequential read inside the most recent chunk is served from memory
/// without disturbing the stream; anything else abandons the stream and
/// reopens at the new offset with the smaller random-access window.
pub struct RangedReader {
    remote: Arc<dyn Remote>,
    id: ObjectId,
    /// Object length; reads are capped here and never error at end of file.
    length: u64,
    /// Next byte the current body will produce.
    position: u64,
    body: Option<ByteStream>,
    /// Bytes pulled off the body but not yet handed to the kernel.
    leftover: Bytes,
    read_size: u64,
    last_chunk: Option<LastChunk>,
}

impl RangedReader {
    pub fn new(remote: Arc<dyn Remote>, id: ObjectId, length: u64) -> Self {
        RangedReader {
            remote,
            id,
            length,
            position: 0,
            body: None,
            leftover: Bytes::new(),
            read_size: SEQUENTIAL_READ_SIZE,
            last_chunk: None,
        }
    }

    /// Reads up to `size` bytes at `offset`. Returns a short read at end of
    /// file and an empty buffer at or past it.
    pub async fn read(&mut self, offset: u64, size: u32) -> Result<Bytes, RemoteError> {
        if size == 0 || offset >= self.length {
            return Ok(Bytes::new());
        }

        if self.body.is_some() && self.position != offset {
            if let Some(chunk) = self.serve_from_last_chunk(offset, size) {
                trace!(offset, size, "re-read served from last chunk");
                return Ok(chunk);
            }
            debug!(
                offset,
                position = self.position,
                "non-sequential read, reopening stream"
            );
            self.body = None;
            self.leftover = Bytes::new();
            self.read_size = RANDOM_READ_SIZE;
        }

        if self.body.is_none() {
            self.open_body(offset).await?;
        }

        let want = (size as u64).min(self.length - offset) as usize;
        let mut out = BytesMut::with_capacity(want);
        let mut reopens = 0_u32;

        while out.len() < want {
            if !self.leftover.is_empty() {
                let take = self.leftover.len().min(want - out.len());
                out.extend_from_slice(&self.leftover.split_to(take));
                self.position += take as u64;
                continue;
            }

            let chunk = match self.body.as_mut() {
                Some(body) => body.next().await,
                None => None,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    self.leftover = chunk;
                }
                Some(Err(err)) if err.is_retryable() && reopens < MAX_STREAM_REOPENS => {
                    reopens += 1;
                    debug!(
                        position = self.position,
                        reopens,
                        error = %err,
                        "body stream failed mid-flight, reopening"
                    );
                    self.open_body(self.position).await?;
                }
                Some(Err(err)) => {
                    self.body = None;
                    return Err(err);
                }
                None => {
                    self.body = None;
                    if self.position < self.length {
                        self.open_body(self.position).await?;
                    } else {
                        break;
                    }
                }
            }
        }

        let data = out.freeze();
        self.last_chunk = Some(LastChunk {
            offset,
            data: data.clone(),
        });
        Ok(data)
    }

    fn serve_from_last_chunk(&self, offset: u64, size: u32) -> Option<Bytes> {
        let last = self.last_chunk.as_ref()?;
        let end = offset.checked_add(size as u64)?;
        let last_end = last.offset + last.data.len() as u64;
        if offset >= last.offset && end <= last_end {
            let start = (offset - last.offset) as usize;
            Some(last.data.slice(start..start + size as usize))
        } else {
            None
        }
    }

    async fn open_body(&mut self, offset: u64) -> Result<(), RemoteError> {
        let len = self.read_size.min(self.length - offset);
        debug!(offset, len, "opening ranged request");
        let body = self.remote.read_at(&self.id, len, offset).await?;
        self.body = Some(body);
        self.leftover = Bytes::new();
        self.position = offset;
        Ok(())
    }
}
