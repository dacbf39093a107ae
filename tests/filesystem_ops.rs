//! End-to-end tests over the filesystem core: metadata store, write cache,
//! upload queue and front-end wired together against a mock remote, no
//! kernel mount involved.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use drivefs::cache::WriteCache;
use drivefs::config::Config;
use drivefs::fs::DriveFs;
use drivefs::meta::MetaStore;
use drivefs::remote::MockRemote;
use drivefs::sync::UploadQueue;
use drivefs::types::{ObjectId, Upload};

const O_RDONLY: u32 = libc::O_RDONLY as u32;
const O_RDWR: u32 = libc::O_RDWR as u32;

struct Stack {
    _dir: TempDir,
    fs: DriveFs,
    meta: Arc<MetaStore>,
    remote: Arc<MockRemote>,
    queue: Arc<UploadQueue>,
}

async fn build_stack() -> Stack {
    let dir = TempDir::new().unwrap();
    let config = Config::new(
        PathBuf::from("/unused/mountpoint"),
        Some(dir.path().to_path_buf()),
    )
    .unwrap();
    config.ensure_dirs().unwrap();

    let meta = Arc::new(MetaStore::open(&config.db_path()).await.unwrap());
    let remote = Arc::new(MockRemote::new());
    let queue = UploadQueue::start(Arc::clone(&meta), remote.clone()).unwrap();
    let cache = WriteCache::new(
        remote.clone(),
        Arc::clone(&meta),
        Arc::clone(&queue),
        config.staging_dir(),
    );
    let fs = DriveFs::new(config, Arc::clone(&meta), remote.clone(), cache, Arc::clone(&queue));

    Stack {
        _dir: dir,
        fs,
        meta,
        remote,
        queue,
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn pseudo_random(len: usize) -> Vec<u8> {
    let mut state = 0x9e37_79b9_7f4a_7c15_u64;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (state >> 33) as u8
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_then_read_inline() {
    let stack = build_stack().await;
    stack.fs.op_mkdir("x", 0o755).await.unwrap();

    let fh = stack
        .fs
        .op_create("x/gocryptfs.diriv", O_RDWR, 0o644)
        .await
        .unwrap();
    let written = stack
        .fs
        .op_write("x/gocryptfs.diriv", fh, 0, b"abcdefghijklmnop")
        .await
        .unwrap();
    assert_eq!(written, 16);
    stack.fs.op_flush("x/gocryptfs.diriv", fh).await.unwrap();
    stack.fs.op_release("x/gocryptfs.diriv", fh).await.unwrap();

    let fh = stack
        .fs
        .op_open("x/gocryptfs.diriv", O_RDONLY)
        .await
        .unwrap();
    let data = stack
        .fs
        .op_read("x/gocryptfs.diriv", fh, 0, 16)
        .await
        .unwrap();
    assert_eq!(&data[..], b"abcdefghijklmnop");
    stack.fs.op_release("x/gocryptfs.diriv", fh).await.unwrap();

    let attrs = stack.fs.op_getattr("x/gocryptfs.diriv").await.unwrap();
    assert_eq!(attrs.size, 16);
    assert!(attrs.has_content);
    // Inline files never touch the remote.
    assert_eq!(stack.remote.create_calls(), 0);

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_upload_and_reread_from_remote() {
    let stack = build_stack().await;
    let content = pseudo_random(1 << 20);

    let fh = stack.fs.op_create("data.bin", O_RDWR, 0o644).await.unwrap();
    for (index, chunk) in content.chunks(128 * 1024).enumerate() {
        stack
            .fs
            .op_write("data.bin", fh, (index * 128 * 1024) as u64, chunk)
            .await
            .unwrap();
    }
    stack.fs.op_release("data.bin", fh).await.unwrap();

    // The upload worker runs in the background and assigns the remote id.
    {
        let meta = Arc::clone(&stack.meta);
        wait_for(move || !meta.get_attrs("data.bin").unwrap().id.is_empty_sentinel()).await;
    }
    let attrs = stack.meta.get_attrs("data.bin").unwrap();
    assert_eq!(attrs.size, 1 << 20);
    assert!(!attrs.has_content);
    assert_eq!(stack.remote.object(&attrs.id), Some(content.clone()));

    // Wait for the queue to clear so the staging snapshot is gone too.
    {
        let meta = Arc::clone(&stack.meta);
        wait_for(move || meta.get_upload_queue().unwrap().is_empty()).await;
    }

    // Re-open read-only: with no working copy left this streams from the
    // remote through the ranged reader.
    let fh = stack.fs.op_open("data.bin", O_RDONLY).await.unwrap();
    let mut assembled = Vec::new();
    let mut offset = 0_u64;
    loop {
        let data = stack
            .fs
            .op_read("data.bin", fh, offset, 64 * 1024)
            .await
            .unwrap();
        if data.is_empty() {
            break;
        }
        offset += data.len() as u64;
        assembled.extend_from_slice(&data);
    }
    assert_eq!(assembled, content);
    stack.fs.op_release("data.bin", fh).await.unwrap();

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_while_writing_share_the_working_copy() {
    let stack = build_stack().await;

    let writer_fh = stack.fs.op_create("shared", O_RDWR, 0o644).await.unwrap();
    stack
        .fs
        .op_write("shared", writer_fh, 0, b"visible to readers")
        .await
        .unwrap();

    // A read-only open while the file is open for writing joins the same
    // working copy and sees the uncommitted bytes.
    let reader_fh = stack.fs.op_open("shared", O_RDONLY).await.unwrap();
    let data = stack.fs.op_read("shared", reader_fh, 0, 64).await.unwrap();
    assert_eq!(&data[..], b"visible to readers");

    // Writing through the read-only handle is a permission error.
    let err = stack
        .fs
        .op_write("shared", reader_fh, 0, b"nope")
        .await
        .unwrap_err();
    assert_eq!(err, libc::EPERM.into());

    stack.fs.op_release("shared", reader_fh).await.unwrap();
    stack.fs.op_release("shared", writer_fh).await.unwrap();

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rmdir_refuses_non_empty() {
    let stack = build_stack().await;
    stack.fs.op_mkdir("a", 0o755).await.unwrap();
    let fh = stack.fs.op_create("a/b", O_RDWR, 0o644).await.unwrap();
    stack.fs.op_release("a/b", fh).await.unwrap();

    let err = stack.fs.op_rmdir("a").await.unwrap_err();
    assert_eq!(err, libc::ENOTEMPTY.into());

    stack.fs.op_unlink("a/b").await.unwrap();
    stack.fs.op_rmdir("a").await.unwrap();
    assert_eq!(
        stack.fs.op_getattr("a").await.unwrap_err(),
        libc::ENOENT.into()
    );

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rmdir_on_file_is_not_a_directory() {
    let stack = build_stack().await;
    let fh = stack.fs.op_create("plain", O_RDWR, 0o644).await.unwrap();
    stack.fs.op_release("plain", fh).await.unwrap();

    let err = stack.fs.op_rmdir("plain").await.unwrap_err();
    assert_eq!(err, libc::ENOTDIR.into());

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_moves_subtree() {
    let stack = build_stack().await;
    stack.fs.op_mkdir("a", 0o755).await.unwrap();
    stack.fs.op_mkdir("a/c", 0o755).await.unwrap();
    for path in ["a/b", "a/c/d"] {
        let fh = stack.fs.op_create(path, O_RDWR, 0o644).await.unwrap();
        stack.fs.op_release(path, fh).await.unwrap();
    }
    let before = stack.fs.op_getattr("a/c/d").await.unwrap();

    stack.fs.op_rename("a", "z").await.unwrap();

    assert_eq!(
        stack.fs.op_getattr("a/b").await.unwrap_err(),
        libc::ENOENT.into()
    );
    assert_eq!(stack.fs.op_getattr("z/c/d").await.unwrap(), before);
    let mut names = stack.fs.op_list_dir("z").await.unwrap();
    names.sort();
    assert_eq!(names, vec!["b".to_owned(), "c".to_owned()]);

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_collision_and_missing_source() {
    let stack = build_stack().await;
    for path in ["a", "b"] {
        let fh = stack.fs.op_create(path, O_RDWR, 0o644).await.unwrap();
        stack.fs.op_release(path, fh).await.unwrap();
    }

    assert_eq!(
        stack.fs.op_rename("a", "b").await.unwrap_err(),
        libc::EINVAL.into()
    );
    assert_eq!(
        stack.fs.op_rename("missing", "c").await.unwrap_err(),
        libc::ENOENT.into()
    );

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_refuses_existing_path() {
    let stack = build_stack().await;
    let fh = stack.fs.op_create("dup", O_RDWR, 0o644).await.unwrap();
    stack.fs.op_release("dup", fh).await.unwrap();

    assert_eq!(
        stack.fs.op_create("dup", O_RDWR, 0o644).await.unwrap_err(),
        libc::EINVAL.into()
    );

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlink_deletes_remote_object() {
    let stack = build_stack().await;

    let fh = stack.fs.op_create("doomed", O_RDWR, 0o644).await.unwrap();
    stack.fs.op_write("doomed", fh, 0, b"bytes").await.unwrap();
    stack.fs.op_release("doomed", fh).await.unwrap();
    {
        let meta = Arc::clone(&stack.meta);
        wait_for(move || !meta.get_attrs("doomed").unwrap().id.is_empty_sentinel()).await;
    }
    assert_eq!(stack.remote.object_count(), 1);

    stack.fs.op_unlink("doomed").await.unwrap();
    assert_eq!(
        stack.fs.op_getattr("doomed").await.unwrap_err(),
        libc::ENOENT.into()
    );
    assert_eq!(stack.remote.object_count(), 0);
    assert_eq!(stack.remote.delete_calls(), 1);

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chmod_is_metadata_only() {
    let stack = build_stack().await;
    let fh = stack.fs.op_create("f", O_RDWR, 0o644).await.unwrap();
    stack.fs.op_release("f", fh).await.unwrap();

    stack.fs.op_chmod("f", 0o600).await.unwrap();
    assert_eq!(stack.fs.op_getattr("f").await.unwrap().mode, 0o600);

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_missing_directory_fails() {
    let stack = build_stack().await;
    assert_eq!(
        stack.fs.op_list_dir("nowhere").await.unwrap_err(),
        libc::ENOENT.into()
    );
    // The root always exists, even when empty.
    assert!(stack.fs.op_list_dir("").await.unwrap().is_empty());

    stack.queue.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_upload_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = Config::new(
        PathBuf::from("/unused/mountpoint"),
        Some(dir.path().to_path_buf()),
    )
    .unwrap();
    config.ensure_dirs().unwrap();

    let staging = config.staging_dir().join("up-crashed");
    tokio::fs::write(&staging, b"survived the crash").await.unwrap();

    // First process: persist the upload record, then go down before the
    // worker gets to it.
    {
        let meta = Arc::new(MetaStore::open(&config.db_path()).await.unwrap());
        meta.set_attrs(
            "crash.bin",
            &drivefs::types::Attributes {
                id: ObjectId::empty(),
                size: 18,
                is_regular_file: true,
                mode: 0o644,
                has_content: false,
            },
        )
        .await
        .unwrap();
        meta.add_to_upload_queue(&Upload {
            id: ObjectId::empty(),
            local_path: staging.to_string_lossy().into_owned(),
            path: "crash.bin".to_owned(),
        })
        .await
        .unwrap();
        meta.close().await.unwrap();
    }

    // Second process: the persisted entry is replayed on startup.
    let meta = Arc::new(MetaStore::open(&config.db_path()).await.unwrap());
    let remote = Arc::new(MockRemote::new());
    let queue = UploadQueue::start(Arc::clone(&meta), remote.clone()).unwrap();

    {
        let remote = remote.clone();
        wait_for(move || remote.object_count() == 1).await;
    }
    {
        let meta = Arc::clone(&meta);
        wait_for(move || meta.get_upload_queue().unwrap().is_empty()).await;
    }
    let attrs = meta.get_attrs("crash.bin").unwrap();
    assert_eq!(
        remote.object(&attrs.id),
        Some(b"survived the crash".to_vec())
    );

    queue.shutdown().await.unwrap();
}
