//! Fixed-chunk buffer pool shared by every writer on a mount.
//!
//! Buffers are handed out at the upload part size. The pool enforces two
//! totals: past the soft limit spare buffers are no longer kept around, and
//! past the hard limit `request` blocks until in-flight uploads give
//! capacity back. A buffer stays accounted from `request` until `free` or
//! until the guard returned by `detach` drops, so parts still on the wire
//! keep exerting backpressure.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Chunk size matches the minimum acceptable upload part size.
pub const BUFFER_CHUNK_SIZE: usize = 5 * 1024 * 1024;

struct PoolInner {
    outstanding: u64,
    spare: Vec<Vec<u8>>,
}

pub struct BufferPool {
    chunk_size: usize,
    soft_limit: u64,
    hard_limit: u64,
    inner: Mutex<PoolInner>,
    released: Notify,
}

impl BufferPool {
    pub fn new(soft_limit: u64, hard_limit: u64) -> Arc<Self> {
        Self::with_chunk_size(BUFFER_CHUNK_SIZE, soft_limit, hard_limit)
    }

    /// Pool with a non-default chunk size. Exists so tests can exercise the
    /// multi-part pipeline without multi-megabyte writes.
    pub fn with_chunk_size(chunk_size: usize, soft_limit: u64, hard_limit: u64) -> Arc<Self> {
        let chunk_size = chunk_size.max(1);
        Arc::new(Self {
            chunk_size,
            soft_limit,
            hard_limit: hard_limit.max(chunk_size as u64),
            inner: Mutex::new(PoolInner {
                outstanding: 0,
                spare: Vec::new(),
            }),
            released: Notify::new(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes currently checked out (including detached in-flight buffers).
    pub fn outstanding_bytes(&self) -> u64 {
        self.inner.lock().outstanding
    }

    pub fn new_handle(self: &Arc<Self>) -> PoolHandle {
        PoolHandle {
            pool: Arc::clone(self),
            in_use: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn acquire(&self) -> Vec<u8> {
        let chunk = self.chunk_size as u64;
        loop {
            // Register interest before checking capacity; a `free` racing
            // between the check and the await would otherwise be lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if inner.outstanding + chunk <= self.hard_limit {
                    inner.outstanding += chunk;
                    return inner
                        .spare
                        .pop()
                        .unwrap_or_else(|| Vec::with_capacity(self.chunk_size));
                }
            }
            notified.await;
        }
    }

    fn recycle(&self, mut buf: Vec<u8>) {
        let capacity = buf.capacity() as u64;
        {
            let mut inner = self.inner.lock();
            inner.outstanding = inner.outstanding.saturating_sub(capacity);
            if inner.outstanding > self.soft_limit {
                inner.spare.clear();
            } else {
                buf.clear();
                inner.spare.push(buf);
            }
        }
        self.released.notify_waiters();
    }

    fn release_capacity(&self, capacity: u64) {
        {
            let mut inner = self.inner.lock();
            inner.outstanding = inner.outstanding.saturating_sub(capacity);
        }
        self.released.notify_waiters();
    }
}

/// Per-writer view of the pool; tracks how many bytes this writer has out.
#[derive(Clone)]
pub struct PoolHandle {
    pool: Arc<BufferPool>,
    in_use: Arc<AtomicU64>,
}

impl PoolHandle {
    /// A zero-length buffer with one chunk of capacity. Blocks while the
    /// pool is at its hard limit.
    pub async fn request(&self) -> Vec<u8> {
        let buf = self.pool.acquire().await;
        self.in_use
            .fetch_add(buf.capacity() as u64, Ordering::Relaxed);
        buf
    }

    /// Append from `src` up to the buffer's remaining capacity; returns how
    /// many bytes were taken.
    pub fn copy(&self, buf: &mut Vec<u8>, src: &[u8]) -> usize {
        let n = (buf.capacity() - buf.len()).min(src.len());
        buf.extend_from_slice(&src[..n]);
        n
    }

    /// Return a buffer's capacity to the pool.
    pub fn free(&self, buf: Vec<u8>) {
        self.in_use
            .fetch_sub(buf.capacity() as u64, Ordering::Relaxed);
        self.pool.recycle(buf);
    }

    /// Convert a buffer into an upload body. The bytes stay accounted
    /// against the pool until the returned guard drops.
    pub fn detach(&self, buf: Vec<u8>) -> DetachedBuffer {
        let capacity = buf.capacity() as u64;
        DetachedBuffer {
            bytes: Bytes::from(buf),
            capacity,
            pool: Arc::clone(&self.pool),
            in_use: Arc::clone(&self.in_use),
        }
    }

    /// Bytes this writer currently has checked out.
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Relaxed)
    }
}

/// Releases its capacity back to the pool on drop.
pub struct DetachedBuffer {
    bytes: Bytes,
    capacity: u64,
    pool: Arc<BufferPool>,
    in_use: Arc<AtomicU64>,
}

impl DetachedBuffer {
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for DetachedBuffer {
    fn drop(&mut self) {
        self.in_use.fetch_sub(self.capacity, Ordering::Relaxed);
        self.pool.release_capacity(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_request_copy_free_accounting() {
        let pool = BufferPool::with_chunk_size(8, 16, 32);
        let handle = pool.new_handle();

        let mut buf = handle.request().await;
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(pool.outstanding_bytes(), 8);
        assert_eq!(handle.in_use(), 8);

        assert_eq!(handle.copy(&mut buf, b"hello world"), 8);
        assert_eq!(&buf, b"hello wo");
        assert_eq!(handle.copy(&mut buf, b"more"), 0);

        handle.free(buf);
        assert_eq!(pool.outstanding_bytes(), 0);
        assert_eq!(handle.in_use(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hard_limit_blocks_request() {
        let pool = BufferPool::with_chunk_size(8, 8, 16);
        let handle = pool.new_handle();

        let a = handle.request().await;
        let _b = handle.request().await;

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request().await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        handle.free(a);
        let buf = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("request should unblock")
            .unwrap();
        assert_eq!(buf.capacity(), 8);
    }

    #[tokio::test]
    async fn test_detach_keeps_capacity_until_drop() {
        let pool = BufferPool::with_chunk_size(8, 16, 16);
        let handle = pool.new_handle();

        let mut buf = handle.request().await;
        handle.copy(&mut buf, b"abc");
        let detached = handle.detach(buf);
        assert_eq!(detached.bytes(), Bytes::from_static(b"abc"));
        assert_eq!(pool.outstanding_bytes(), 8);
        assert_eq!(handle.in_use(), 8);

        drop(detached);
        assert_eq!(pool.outstanding_bytes(), 0);
        assert_eq!(handle.in_use(), 0);
    }
}
