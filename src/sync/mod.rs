use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::meta::MetaStore;
use crate::remote::Remote;
use crate::types::Upload;

const QUEUE_CAPACITY: usize = 16;
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Durable background upload pipeline.
///
/// Enqueue persists the record first and only then notifies the worker, so a
/// crash between the two replays the upload on the next start. A single
/// worker drains the channel; a failed upload is retried in place with
/// exponential backoff and is only removed from the durable log once the
/// remote has the bytes.
pub struct UploadQueue {
    meta: Arc<MetaStore>,
    tx: mpsc::Sender<Upload>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    /// Spawns the worker and replays any uploads persisted by a previous
    /// run.
    pub fn start(meta: Arc<MetaStore>, remote: Arc<dyn Remote>) -> Result<Arc<Self>> {
        let replay = meta
            .get_upload_queue()
            .context("failed to load persisted upload queue")?;
        if !replay.is_empty() {
            info!(pending = replay.len(), "replaying persisted uploads");
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            Arc::clone(&meta),
            remote,
            rx,
            shutdown.clone(),
            replay,
        ));

        Ok(Arc::new(UploadQueue {
            meta,
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Persists the upload, then notifies the worker.
    pub async fn enqueue(&self, upload: Upload) -> Result<()> {
        debug!(path = %upload.path, local = %upload.local_path, "enqueue upload");
        self.meta
            .add_to_upload_queue(&upload)
            .await
            .context("failed to persist upload record")?;
        self.tx
            .send(upload)
            .await
            .map_err(|_| anyhow!("upload queue is closed"))?;
        Ok(())
    }

    /// Cooperative shutdown: the in-flight upload finishes, pending entries
    /// stay in the durable log for the next start.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            worker.await.context("upload worker panicked")?;
        }
        Ok(())
    }
}

async fn run_worker(
    meta: Arc<MetaStore>,
    remote: Arc<dyn Remote>,
    mut rx: mpsc::Receiver<Upload>,
    shutdown: CancellationToken,
    replay: Vec<Upload>,
) {
    for upload in replay {
        if shutdown.is_cancelled() {
            return;
        }
        process_upload(&meta, remote.as_ref(), &shutdown, upload).await;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("upload worker shutting down");
                return;
            }
            maybe_upload = rx.recv() => {
                let Some(upload) = maybe_upload else { return };
                process_upload(&meta, remote.as_ref(), &shutdown, upload).await;
            }
        }
    }
}

/// Uploads one entry, retrying in place until it succeeds or shutdown is
/// requested. The durable record is only removed after success.
async fn process_upload(
    meta: &MetaStore,
    remote: &dyn Remote,
    shutdown: &CancellationToken,
    upload: Upload,
) {
    let mut attempt = 0_u32;
    loop {
        match upload_once(meta, remote, &upload).await {
            Ok(()) => {
                debug!(path = %upload.path, "upload complete");
                if let Err(err) = meta.remove_from_upload_queue(&upload).await {
                    error!(path = %upload.path, error = %err, "failed to remove upload record");
                }
                if let Err(err) = tokio::fs::remove_file(&upload.local_path).await {
                    warn!(local = %upload.local_path, error = %err, "failed to remove staging file");
                }
                return;
            }
            Err(UploadError::StagingGone) => {
                // A record whose staging file vanished can never succeed.
                error!(path = %upload.path, local = %upload.local_path, "staging file is gone, dropping upload");
                if let Err(err) = meta.remove_from_upload_queue(&upload).await {
                    error!(path = %upload.path, error = %err, "failed to remove upload record");
                }
                return;
            }
            Err(UploadError::Failed(err)) => {
                let delay = retry_delay(attempt);
                attempt = attempt.saturating_add(1);
                warn!(
                    path = %upload.path,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "upload failed, will retry"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

enum UploadError {
    /// The staging file no longer exists.
    StagingGone,
    Failed(anyhow::Error),
}

async fn upload_once(
    meta: &MetaStore,
    remote: &dyn Remote,
    upload: &Upload,
) -> Result<(), UploadError> {
    let file = match tokio::fs::File::open(&upload.local_path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(UploadError::StagingGone),
        Err(err) => {
            return Err(UploadError::Failed(
                anyhow::Error::new(err).context("failed to open staging file"),
            ))
        }
    };

    if upload.id.is_empty_sentinel() {
        let id = remote
            .create(file)
            .await
            .map_err(|err| UploadError::Failed(anyhow!(err).context("remote create")))?;
        meta.set_id(&upload.path, &id)
            .await
            .map_err(|err| UploadError::Failed(anyhow!(err).context("recording new object id")))?;
    } else {
        remote
            .update(&upload.id, file)
            .await
            .map_err(|err| UploadError::Failed(anyhow!(err).context("remote update")))?;
    }
    Ok(())
}

fn retry_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY_MS.saturating_mul(1_u64 << attempt.min(16));
    let capped = exp.min(RETRY_MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}
