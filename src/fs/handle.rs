use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::cache::FileReference;
use crate::reader::{RangedReader, ReadGate};
use crate::remote::RemoteError;

/// State behind one kernel file handle.
#[derive(Clone)]
pub(crate) enum OpenHandle {
    /// Small file whose bytes live in the metadata store.
    Inline { path: String },
    /// Shared local working copy, read-write or joined read-only.
    Cached(Arc<FileReference>),
    /// Streaming remote reader for a read-only open.
    Ranged(Arc<RangedHandle>),
}

/// A ranged reader plus its reorder gate.
///
/// The gate runs before the reader lock so that a lower-offset read that
/// arrives a moment late can still overtake and keep the stream sequential.
pub(crate) struct RangedHandle {
    gate: ReadGate,
    reader: Mutex<RangedReader>,
}

impl RangedHandle {
    pub(crate) fn new(reader: RangedReader) -> Self {
        RangedHandle {
            gate: ReadGate::new(),
            reader: Mutex::new(reader),
        }
    }

    #[cfg(test)]
    fn with_gate_window(reader: RangedReader, window: std::time::Duration) -> Self {
        RangedHandle {
            gate: ReadGate::with_window(window),
            reader: Mutex::new(reader),
        }
    }

    pub(crate) async fn read(&self, offset: u64, size: u32) -> Result<Bytes, RemoteError> {
        let _pass = self.gate.wait(offset).await;
        let mut reader = self.reader.lock().await;
        reader.read(offset, size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemote;
    use crate::types::ObjectId;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn out_of_order_reads_stay_on_one_stream() {
        let data = content(4 * 1024 * 1024);
        let remote = Arc::new(MockRemote::new());
        // The first request is slow enough that the later, out-of-order
        // offsets are all pending at the gate before it completes.
        remote.set_read_delay(std::time::Duration::from_millis(50));
        let id = remote.insert_object(data.clone());
        let handle = Arc::new(RangedHandle::with_gate_window(
            RangedReader::new(remote.clone(), id, data.len() as u64),
            std::time::Duration::from_millis(500),
        ));

        // Offsets arrive as 0, then 8192, then 4096; the gate re-sequences
        // the trailing pair so the backing stream is opened exactly once.
        let mut tasks = Vec::new();
        for (delay_ms, offset) in [(0_u64, 0_u64), (5, 8192), (10, 4096)] {
            let handle = Arc::clone(&handle);
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                (offset, handle.read(offset, 4096).await.unwrap())
            }));
        }

        for task in tasks {
            let (offset, bytes) = task.await.unwrap();
            let offset = offset as usize;
            assert_eq!(&bytes[..], &data[offset..offset + 4096]);
        }
        assert_eq!(remote.read_at_calls(), 1);
    }
}
