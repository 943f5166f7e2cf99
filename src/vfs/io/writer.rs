// Write pipeline (high-level):
// - Writes must land at the handle's next write offset; anything else poisons
//   the handle with a sticky error that every later write and the flush
//   return.
// - Data is appended into pool buffers. Each buffer that reaches the part
//   size is detached and uploaded by its own task; the first full buffer
//   kicks off the one-shot CreateMultipartUpload initializer that all part
//   uploads wait on.
// - flush() drains the in-flight tasks, uploads the trailing partial buffer
//   as the final part and completes the upload with the dense ETag list.
//   A handle that never filled a buffer is committed with one small-file PUT
//   instead. Any failure aborts the upload best-effort; cursors, buffer and
//   init gate are always reset on the way out.

use crate::cadapter::client::{CompletedPart, ObjectBackend};
use crate::vfs::backend::Backend;
use crate::vfs::buffer::PoolHandle;
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::inode::Inode;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Per-upload part cap imposed by the backend.
pub(crate) const MAX_UPLOAD_PARTS: u32 = 10_000;

enum MpuPhase {
    NotStarted,
    Pending,
    Ready(String),
    Failed,
}

#[derive(Default)]
struct UploadProgress {
    /// ETag of part `n` lives at index `n - 1`.
    etags: Vec<Option<String>>,
    /// First error wins and stays sticky for the life of the handle.
    error: Option<FsError>,
}

/// State shared between the writer and its spawned upload tasks.
struct UploadShared<B: ObjectBackend> {
    backend: Arc<Backend<B>>,
    key: String,
    gate: Mutex<MpuPhase>,
    gate_notify: Notify,
    progress: Mutex<UploadProgress>,
}

impl<B: ObjectBackend> UploadShared<B> {
    fn record_error(&self, err: FsError) {
        let mut progress = self.progress.lock();
        if progress.error.is_none() {
            progress.error = Some(err);
        }
    }

    fn error(&self) -> Option<FsError> {
        self.progress.lock().error.clone()
    }

    fn set_etag(&self, part: u32, etag: String) {
        let mut progress = self.progress.lock();
        let idx = (part - 1) as usize;
        if progress.etags.len() <= idx {
            progress.etags.resize(idx + 1, None);
        }
        debug_assert!(progress.etags[idx].is_none(), "etag for part {part} already set");
        progress.etags[idx] = Some(etag);
    }

    /// Dense part list in ascending part-number order.
    fn completed_parts(&self, nparts: u32) -> FsResult<Vec<CompletedPart>> {
        let progress = self.progress.lock();
        (1..=nparts)
            .map(|part| {
                progress
                    .etags
                    .get((part - 1) as usize)
                    .and_then(|etag| etag.clone())
                    .map(|etag| CompletedPart {
                        part_number: part,
                        etag,
                    })
                    .ok_or_else(|| FsError::Transport(format!("no etag recorded for part {part}")))
            })
            .collect()
    }

    fn upload_id(&self) -> Option<String> {
        match &*self.gate.lock() {
            MpuPhase::Ready(id) => Some(id.clone()),
            _ => None,
        }
    }

    fn reset_gate(&self) {
        *self.gate.lock() = MpuPhase::NotStarted;
        self.progress.lock().etags.clear();
    }

    /// Lazily starts the upload and parks until the id (or the init error)
    /// is available.
    async fn wait_for_upload_id(self: &Arc<Self>) -> FsResult<String> {
        loop {
            let notified = self.gate_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut phase = self.gate.lock();
                match &*phase {
                    MpuPhase::Ready(id) => return Ok(id.clone()),
                    MpuPhase::Failed => {
                        return Err(self.error().unwrap_or_else(|| {
                            FsError::Transport("multipart initialization failed".to_string())
                        }));
                    }
                    MpuPhase::NotStarted => {
                        *phase = MpuPhase::Pending;
                        Arc::clone(self).spawn_init();
                    }
                    MpuPhase::Pending => {}
                }
            }
            notified.await;
        }
    }

    fn spawn_init(self: Arc<Self>) {
        tokio::spawn(async move {
            let result = self
                .backend
                .client
                .create_multipart_upload(&self.key, self.backend.storage_class())
                .await;

            // the response may carry no id even on success
            let outcome = match result {
                Ok(Some(id)) => Ok(id),
                Ok(None) => Err(FsError::Transport(
                    "create multipart upload returned no upload id".to_string(),
                )),
                Err(err) => Err(FsError::from_object(err)),
            };

            {
                let mut phase = self.gate.lock();
                match outcome {
                    Ok(id) => *phase = MpuPhase::Ready(id),
                    Err(err) => {
                        *phase = MpuPhase::Failed;
                        self.record_error(err);
                    }
                }
            }
            self.gate_notify.notify_waiters();
        });
    }
}

pub(crate) struct FileWriter<B: ObjectBackend> {
    inode: Arc<Inode>,
    backend: Arc<Backend<B>>,
    pool: PoolHandle,
    shared: Arc<UploadShared<B>>,
    dirty: bool,
    /// Buffer currently being filled.
    buf: Option<Vec<u8>>,
    next_write_offset: u64,
    last_part_id: u32,
    /// In-flight per-part upload tasks; flush drains them.
    tasks: Vec<JoinHandle<()>>,
}

impl<B: ObjectBackend> FileWriter<B> {
    pub(crate) fn new(inode: Arc<Inode>, backend: Arc<Backend<B>>, dirty: bool) -> Self {
        let pool = backend.pool.new_handle();
        let shared = Arc::new(UploadShared {
            backend: Arc::clone(&backend),
            key: inode.full_name().to_string(),
            gate: Mutex::new(MpuPhase::NotStarted),
            gate_notify: Notify::new(),
            progress: Mutex::new(UploadProgress::default()),
        });
        Self {
            inode,
            backend,
            pool,
            shared,
            dirty,
            buf: None,
            next_write_offset: 0,
            last_part_id: 0,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[tracing::instrument(level = "trace", skip(self, data), fields(ino = self.inode.id(), len = data.len()))]
    pub(crate) async fn write(&mut self, offset: u64, data: &[u8]) -> FsResult<()> {
        if let Some(err) = self.shared.error() {
            return Err(err);
        }

        if offset != self.next_write_offset {
            debug!(
                ino = self.inode.id(),
                expected = self.next_write_offset,
                offset,
                "only sequential writes supported"
            );
            self.shared.record_error(FsError::Invalid);
            return Err(FsError::Invalid);
        }

        if offset == 0 {
            self.dirty = true;
        }

        let mut data = data;
        let mut written = 0u64;
        loop {
            let mut buf = match self.buf.take() {
                Some(buf) => buf,
                None => self.pool.request().await,
            };

            let n = self.pool.copy(&mut buf, data);
            self.next_write_offset += n as u64;
            written += n as u64;

            if buf.len() == buf.capacity() {
                // a full buffer becomes the next part
                let upload_id = match self.shared.wait_for_upload_id().await {
                    Ok(id) => id,
                    Err(err) => {
                        self.pool.free(buf);
                        return Err(err);
                    }
                };
                if self.last_part_id >= MAX_UPLOAD_PARTS {
                    warn!(ino = self.inode.id(), "upload exceeds the part limit");
                    self.pool.free(buf);
                    self.shared.record_error(FsError::Invalid);
                    return Err(FsError::Invalid);
                }
                self.last_part_id += 1;
                self.spawn_part(self.last_part_id, &upload_id, buf);
            } else {
                self.buf = Some(buf);
            }

            if n == data.len() {
                break;
            }
            data = &data[n..];
        }

        self.inode.set_size(offset + written);
        Ok(())
    }

    fn spawn_part(&mut self, part: u32, upload_id: &str, buf: Vec<u8>) {
        let detached = self.pool.detach(buf);
        let shared = Arc::clone(&self.shared);
        let upload_id = upload_id.to_string();
        self.tasks.push(tokio::spawn(async move {
            let result = shared
                .backend
                .client
                .upload_part(&shared.key, &upload_id, part, detached.bytes())
                .await;
            match result {
                Ok(etag) => shared.set_etag(part, etag),
                Err(err) => shared.record_error(FsError::from_object(err)),
            }
            // dropping the detached buffer returns its capacity to the pool
        }));
    }

    #[tracing::instrument(level = "trace", skip(self), fields(ino = self.inode.id()))]
    pub(crate) async fn flush(&mut self) -> FsResult<()> {
        if !self.dirty {
            return Ok(());
        }

        let result = self.flush_pipeline().await;

        if result.is_err()
            && let Some(upload_id) = self.shared.upload_id()
        {
            // best effort; the flush error is what the caller sees
            let client = self.backend.client.clone();
            let key = self.shared.key.clone();
            tokio::spawn(async move {
                if let Err(err) = client.abort_multipart_upload(&key, &upload_id).await {
                    debug!(key = %key, error = %err, "abort multipart upload");
                }
            });
        }

        if let Some(buf) = self.buf.take() {
            self.pool.free(buf);
        }
        self.shared.reset_gate();
        self.next_write_offset = 0;
        self.last_part_id = 0;
        self.dirty = false;

        result
    }

    async fn flush_pipeline(&mut self) -> FsResult<()> {
        if let Some(err) = self.shared.error() {
            return Err(err);
        }

        if self.last_part_id == 0 {
            return self.flush_small_file().await;
        }

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(err) = self.shared.error() {
            return Err(err);
        }
        let Some(upload_id) = self.shared.upload_id() else {
            return Ok(());
        };

        let mut nparts = self.last_part_id;
        if let Some(buf) = self.buf.take() {
            // trailing partial part rides with the flush
            if nparts >= MAX_UPLOAD_PARTS {
                self.pool.free(buf);
                return Err(FsError::Invalid);
            }
            nparts += 1;
            let detached = self.pool.detach(buf);
            let etag = self
                .backend
                .client
                .upload_part(&self.shared.key, &upload_id, nparts, detached.bytes())
                .await
                .map_err(FsError::from_object)?;
            self.shared.set_etag(nparts, etag);
        }

        let parts = self.shared.completed_parts(nparts)?;
        self.backend
            .client
            .complete_multipart_upload(&self.shared.key, &upload_id, parts)
            .await?;
        Ok(())
    }

    async fn flush_small_file(&mut self) -> FsResult<()> {
        let detached = self.buf.take().map(|buf| self.pool.detach(buf));
        let body = detached
            .as_ref()
            .map(|d| d.bytes())
            .unwrap_or_else(Bytes::new);
        self.backend
            .client
            .put_object(&self.shared.key, body, self.backend.storage_class())
            .await?;
        Ok(())
    }
}

impl<B: ObjectBackend> Drop for FileWriter<B> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::{BackendCall, MemoryBackend};
    use crate::vfs::buffer::BufferPool;
    use crate::vfs::config::MountOptions;
    use crate::vfs::inode::InodeAttributes;
    use std::time::{Duration, SystemTime};
    use tokio::time::{sleep, timeout};

    fn writer_for(store: &MemoryBackend, key: &str, chunk: usize) -> FileWriter<MemoryBackend> {
        let pool = BufferPool::with_chunk_size(chunk, 1024, 4096);
        let backend = Backend::with_pool(store.clone(), MountOptions::default(), pool);
        let attrs = InodeAttributes::file(&backend.options, 0, SystemTime::now());
        let inode = Inode::new(2, key, key, attrs);
        FileWriter::new(inode, backend, true)
    }

    fn count_calls(store: &MemoryBackend, pred: impl Fn(&BackendCall) -> bool) -> usize {
        store.calls().iter().filter(|c| pred(c)).count()
    }

    #[tokio::test]
    async fn test_small_file_is_one_put() {
        let store = MemoryBackend::new();
        let mut writer = writer_for(&store, "a", 64);

        writer.write(0, b"hello").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(store.object("a").unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(
            count_calls(&store, |c| matches!(c, BackendCall::Put { .. })),
            1
        );
        assert_eq!(
            count_calls(&store, |c| matches!(c, BackendCall::CreateUpload { .. })),
            0
        );
        assert_eq!(writer.backend.pool.outstanding_bytes(), 0);
    }

    #[tokio::test]
    async fn test_empty_create_flush_puts_empty_object() {
        let store = MemoryBackend::new();
        let mut writer = writer_for(&store, "empty", 64);

        writer.flush().await.unwrap();
        assert_eq!(store.object("empty").unwrap(), Bytes::new());
    }

    #[tokio::test]
    async fn test_multipart_upload_parts_in_order() {
        let store = MemoryBackend::new();
        let mut writer = writer_for(&store, "big", 4);

        let data: Vec<u8> = (0u8..10).collect();
        writer.write(0, &data).await.unwrap();
        // two full 4-byte buffers became parts during the write
        assert_eq!(writer.last_part_id, 2);

        writer.flush().await.unwrap();

        assert_eq!(store.object("big").unwrap(), Bytes::from(data));
        assert_eq!(
            count_calls(&store, |c| matches!(c, BackendCall::CreateUpload { .. })),
            1
        );
        assert_eq!(
            count_calls(&store, |c| matches!(c, BackendCall::UploadPart { .. })),
            3
        );
        let complete = store
            .calls()
            .into_iter()
            .find_map(|c| match c {
                BackendCall::CompleteUpload { parts, .. } => Some(parts),
                _ => None,
            })
            .expect("upload must be completed");
        assert_eq!(complete, vec![1, 2, 3]);
        assert_eq!(store.open_upload_count(), 0);
        assert_eq!(writer.backend.pool.outstanding_bytes(), 0);
    }

    #[tokio::test]
    async fn test_exact_chunk_multiple_has_no_trailing_part() {
        let store = MemoryBackend::new();
        let mut writer = writer_for(&store, "even", 4);

        writer.write(0, &[7u8; 8]).await.unwrap();
        writer.flush().await.unwrap();

        let complete = store
            .calls()
            .into_iter()
            .find_map(|c| match c {
                BackendCall::CompleteUpload { parts, .. } => Some(parts),
                _ => None,
            })
            .unwrap();
        assert_eq!(complete, vec![1, 2]);
        assert_eq!(store.object("even").unwrap(), Bytes::from(vec![7u8; 8]));
    }

    #[tokio::test]
    async fn test_sequential_writes_concatenate() {
        let store = MemoryBackend::new();
        let mut writer = writer_for(&store, "cat", 4);

        writer.write(0, b"abc").await.unwrap();
        writer.write(3, b"defgh").await.unwrap();
        assert_eq!(writer.inode.attributes().size, 8);

        writer.flush().await.unwrap();
        assert_eq!(store.object("cat").unwrap(), Bytes::from_static(b"abcdefgh"));
    }

    #[tokio::test]
    async fn test_non_sequential_write_poisons_handle() {
        let store = MemoryBackend::new();
        let mut writer = writer_for(&store, "x", 64);

        writer.write(0, b"AAAA").await.unwrap();
        assert_eq!(writer.write(2, b"BB").await.unwrap_err(), FsError::Invalid);
        // the error is sticky even for a correctly positioned write
        assert_eq!(writer.write(4, b"CC").await.unwrap_err(), FsError::Invalid);
        assert_eq!(writer.flush().await.unwrap_err(), FsError::Invalid);

        // no upload was ever created, so there is nothing to abort
        assert_eq!(
            count_calls(&store, |c| matches!(c, BackendCall::AbortUpload { .. })),
            0
        );
        assert!(store.object("x").is_none());
        assert_eq!(writer.backend.pool.outstanding_bytes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_poisoned_multipart_flush_aborts_upload() {
        let store = MemoryBackend::new();
        let mut writer = writer_for(&store, "y", 4);

        // enough to spawn a part, so an upload id exists
        writer.write(0, &[1u8; 8]).await.unwrap();
        assert_eq!(writer.write(3, b"zz").await.unwrap_err(), FsError::Invalid);
        assert_eq!(writer.flush().await.unwrap_err(), FsError::Invalid);

        // the abort is spawned off the flush path; wait for it to land
        timeout(Duration::from_secs(1), async {
            while store.open_upload_count() != 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("upload should be aborted");
        assert!(
            count_calls(&store, |c| matches!(c, BackendCall::AbortUpload { .. })) > 0
        );
        assert!(store.object("y").is_none());
    }

    #[tokio::test]
    async fn test_flush_resets_cursors_for_reuse() {
        let store = MemoryBackend::new();
        let mut writer = writer_for(&store, "reuse", 4);

        writer.write(0, &[1u8; 6]).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.next_write_offset, 0);
        assert_eq!(writer.last_part_id, 0);
        assert!(!writer.is_dirty());

        // a second upload starts cleanly on the same handle
        writer.write(0, b"hi").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(store.object("reuse").unwrap(), Bytes::from_static(b"hi"));
    }
}
