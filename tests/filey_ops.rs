//! End-to-end scenarios over a mounted in-memory bucket, driven through the
//! public operation surface.

use bucketfs::{
    BackendCall, BufferPool, FileKind, Filesystem, FsError, MemoryBackend, MountOptions,
    ROOT_INODE_ID,
};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn count_calls(store: &MemoryBackend, pred: impl Fn(&BackendCall) -> bool) -> usize {
    store.calls().iter().filter(|c| pred(c)).count()
}

fn completed_parts(store: &MemoryBackend) -> Option<Vec<u32>> {
    store.calls().into_iter().find_map(|c| match c {
        BackendCall::CompleteUpload { parts, .. } => Some(parts),
        _ => None,
    })
}

#[tokio::test]
async fn small_file_round_trip() {
    let store = MemoryBackend::new();
    let fs = Filesystem::new(store.clone(), MountOptions::default());

    let created = fs.create_file(ROOT_INODE_ID, "a");
    fs.write_file(created.handle, 0, b"hello").await.unwrap();
    fs.flush_file(created.handle).await.unwrap();
    fs.release_file_handle(created.handle);

    assert_eq!(
        count_calls(&store, |c| matches!(c, BackendCall::Put { key } if key == "a")),
        1
    );
    assert_eq!(
        count_calls(&store, |c| matches!(c, BackendCall::CreateUpload { .. })),
        0
    );
    assert_eq!(store.object("a").unwrap(), Bytes::from_static(b"hello"));

    let opened = fs.open_file(created.entry.child);
    let mut buf = [0u8; 16];
    let n = fs.read_file(opened.handle, 0, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");
    fs.release_file_handle(opened.handle);
}

#[tokio::test]
async fn multipart_upload_of_twelve_mebibytes() {
    let store = MemoryBackend::new();
    let fs = Filesystem::new(store.clone(), MountOptions::default());

    let mut data = vec![0u8; 12 * 1024 * 1024];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let created = fs.create_file(ROOT_INODE_ID, "big");
    fs.write_file(created.handle, 0, &data).await.unwrap();
    fs.flush_file(created.handle).await.unwrap();
    fs.release_file_handle(created.handle);

    // two full 5 MiB parts during the writes, the 2 MiB tail in the flush
    assert_eq!(
        count_calls(&store, |c| matches!(c, BackendCall::CreateUpload { .. })),
        1
    );
    assert_eq!(
        count_calls(&store, |c| matches!(c, BackendCall::UploadPart { .. })),
        3
    );
    assert_eq!(completed_parts(&store).unwrap(), vec![1, 2, 3]);
    assert_eq!(store.object("big").unwrap(), Bytes::from(data));
    assert_eq!(store.open_upload_count(), 0);
}

#[tokio::test]
async fn sequential_writes_concatenate() {
    let store = MemoryBackend::new();
    let pool = BufferPool::with_chunk_size(1024, 64 * 1024, 256 * 1024);
    let fs = Filesystem::with_buffer_pool(store.clone(), MountOptions::default(), pool);

    let b1 = vec![1u8; 1500];
    let b2 = vec![2u8; 700];

    let created = fs.create_file(ROOT_INODE_ID, "cat");
    fs.write_file(created.handle, 0, &b1).await.unwrap();
    fs.write_file(created.handle, b1.len() as u64, &b2)
        .await
        .unwrap();
    fs.flush_file(created.handle).await.unwrap();
    fs.release_file_handle(created.handle);

    let mut expected = b1.clone();
    expected.extend_from_slice(&b2);
    assert_eq!(store.object("cat").unwrap(), Bytes::from(expected.clone()));

    let opened = fs.open_file(created.entry.child);
    let mut buf = vec![0u8; expected.len()];
    let n = fs.read_file(opened.handle, 0, &mut buf).await.unwrap();
    assert_eq!(n, expected.len());
    assert_eq!(buf, expected);
    fs.release_file_handle(opened.handle);
}

#[tokio::test]
async fn non_sequential_write_poisons_the_handle() {
    let store = MemoryBackend::new();
    let fs = Filesystem::new(store.clone(), MountOptions::default());

    let created = fs.create_file(ROOT_INODE_ID, "x");
    fs.write_file(created.handle, 0, b"AAAA").await.unwrap();
    assert_eq!(
        fs.write_file(created.handle, 2, b"BB").await.unwrap_err(),
        FsError::Invalid
    );
    assert_eq!(
        fs.flush_file(created.handle).await.unwrap_err(),
        FsError::Invalid
    );

    // no upload id was ever received, so nothing is aborted
    assert_eq!(
        count_calls(&store, |c| matches!(c, BackendCall::AbortUpload { .. })),
        0
    );
    assert!(store.object("x").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poisoned_multipart_upload_is_aborted() {
    let store = MemoryBackend::new();
    let pool = BufferPool::with_chunk_size(1024, 16 * 1024, 64 * 1024);
    let fs = Filesystem::with_buffer_pool(store.clone(), MountOptions::default(), pool);

    let created = fs.create_file(ROOT_INODE_ID, "x");
    fs.write_file(created.handle, 0, &vec![9u8; 3000])
        .await
        .unwrap();
    assert_eq!(
        fs.write_file(created.handle, 17, b"BB").await.unwrap_err(),
        FsError::Invalid
    );
    assert_eq!(
        fs.flush_file(created.handle).await.unwrap_err(),
        FsError::Invalid
    );

    timeout(Duration::from_secs(1), async {
        while store.open_upload_count() != 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("the failed upload should be aborted");
    assert!(store.object("x").is_none());
}

#[tokio::test]
async fn directory_listing_omits_the_marker_blob() {
    let store = MemoryBackend::new();
    store.insert_object("d/", "");
    store.insert_object("d/a", "1");
    store.insert_object("d/b", "2");
    let fs = Filesystem::new(store.clone(), MountOptions::default());

    let dir = fs.look_up_inode(ROOT_INODE_ID, "d").await.unwrap();
    assert_eq!(dir.attributes.kind(), FileKind::Directory);

    let handle = fs.open_dir(dir.child);
    let entries = fs.read_dir(handle, 0).await.unwrap();
    let listed: Vec<(&str, u64)> = entries
        .iter()
        .map(|e| (e.name.as_str(), e.offset))
        .collect();
    assert_eq!(listed, vec![(".", 1), ("..", 2), ("a", 3), ("b", 4)]);
    fs.release_dir_handle(handle);
}

#[tokio::test]
async fn rename_of_non_empty_directory_leaves_bucket_unchanged() {
    let store = MemoryBackend::new();
    store.insert_object("d/", "");
    store.insert_object("d/a", "x");
    let fs = Filesystem::new(store.clone(), MountOptions::default());

    assert_eq!(
        fs.rename(ROOT_INODE_ID, "d", ROOT_INODE_ID, "e")
            .await
            .unwrap_err(),
        FsError::NotEmpty
    );
    assert_eq!(store.keys(), vec!["d/", "d/a"]);
}

#[tokio::test]
async fn rename_moves_bytes_and_forgets_the_source() {
    let store = MemoryBackend::new();
    store.insert_object("a", "the payload");
    let fs = Filesystem::new(store.clone(), MountOptions::default());

    fs.rename(ROOT_INODE_ID, "a", ROOT_INODE_ID, "b")
        .await
        .unwrap();
    assert!(store.object("a").is_none());

    let entry = fs.look_up_inode(ROOT_INODE_ID, "b").await.unwrap();
    let opened = fs.open_file(entry.child);
    let mut buf = vec![0u8; 32];
    let n = fs.read_file(opened.handle, 0, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"the payload");
    assert_eq!(
        fs.look_up_inode(ROOT_INODE_ID, "a").await.unwrap_err(),
        FsError::NotFound
    );
    fs.release_file_handle(opened.handle);
}

#[tokio::test]
async fn sibling_lookup_after_readdir_skips_the_backend() {
    let store = MemoryBackend::new();
    store.insert_object("parent/child", "contents");
    let fs = Filesystem::new(store.clone(), MountOptions::default());

    let parent = fs.look_up_inode(ROOT_INODE_ID, "parent").await.unwrap();
    let handle = fs.open_dir(parent.child);
    let _ = fs.read_dir(handle, 0).await.unwrap();

    store.clear_calls();
    let child = fs.look_up_inode(parent.child, "child").await.unwrap();
    assert_eq!(child.attributes.size, 8);
    assert_eq!(
        count_calls(&store, |c| matches!(
            c,
            BackendCall::Head { .. } | BackendCall::List { .. }
        )),
        0,
        "the listing must satisfy the sibling lookup"
    );
    fs.release_dir_handle(handle);
}

#[tokio::test]
async fn mkdir_rmdir_round_trip_restores_the_bucket() {
    let store = MemoryBackend::new();
    let fs = Filesystem::new(store.clone(), MountOptions::default());

    fs.mk_dir(ROOT_INODE_ID, "p").await.unwrap();
    assert_eq!(store.keys(), vec!["p/"]);
    fs.rm_dir(ROOT_INODE_ID, "p").await.unwrap();
    assert!(store.keys().is_empty());
}
