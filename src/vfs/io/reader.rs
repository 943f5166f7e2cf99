//! Sequential streaming read path.
//!
//! One live response body at a time: sequential reads drain it, a seek
//! drops it and opens a ranged GET at the new offset. There is no prefetch
//! across seeks.

use crate::cadapter::client::{ObjectBackend, ObjectBody};
use crate::vfs::backend::Backend;
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::inode::Inode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

enum ReadEnd {
    /// The buffer was filled.
    Full,
    Eof,
    Error(std::io::Error),
}

/// Read until `buf` is full, the stream ends, or it fails; the byte count
/// is reported in every case.
async fn read_full(stream: &mut ObjectBody, buf: &mut [u8]) -> (usize, ReadEnd) {
    let mut read = 0;
    while read < buf.len() {
        match stream.read(&mut buf[read..]).await {
            Ok(0) => return (read, ReadEnd::Eof),
            Ok(n) => read += n,
            Err(err) => return (read, ReadEnd::Error(err)),
        }
    }
    (read, ReadEnd::Full)
}

pub(crate) struct FileReader<B: ObjectBackend> {
    inode: Arc<Inode>,
    backend: Arc<Backend<B>>,
    stream: Option<ObjectBody>,
    /// File offset of the next byte the live stream will yield.
    stream_offset: u64,
}

impl<B: ObjectBackend> FileReader<B> {
    pub(crate) fn new(inode: Arc<Inode>, backend: Arc<Backend<B>>) -> Self {
        Self {
            inode,
            backend,
            stream: None,
            stream_offset: 0,
        }
    }

    pub(crate) async fn read(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let size = self.inode.attributes().size;
        if offset >= size {
            // nothing to read
            return Ok(0);
        }

        let mut total = 0usize;

        if let Some(mut stream) = self.stream.take() {
            if offset == self.stream_offset {
                let (n, end) = read_full(&mut stream, buf).await;
                self.stream_offset += n as u64;
                total += n;
                match end {
                    ReadEnd::Full => {
                        self.stream = Some(stream);
                        return Ok(total);
                    }
                    ReadEnd::Eof => {}
                    ReadEnd::Error(err) => {
                        // the bytes already read are valid
                        if total == 0 {
                            return Err(FsError::Transport(err.to_string()));
                        }
                        return Ok(total);
                    }
                }
            } else {
                debug!(
                    ino = self.inode.id(),
                    offset,
                    stream_offset = self.stream_offset,
                    "out of order read, dropping stream"
                );
            }
        }

        if total == buf.len() || offset + total as u64 >= size {
            return Ok(total);
        }

        let start = offset + total as u64;
        let mut stream = match self
            .backend
            .client
            .get_object(self.inode.full_name(), start)
            .await
        {
            Ok(stream) => stream,
            Err(err) if total > 0 => {
                debug!(ino = self.inode.id(), error = %err, "suppressing error after partial read");
                return Ok(total);
            }
            Err(err) => return Err(err.into()),
        };

        let (n, end) = read_full(&mut stream, &mut buf[total..]).await;
        self.stream_offset = start + n as u64;
        total += n;
        match end {
            ReadEnd::Full => {
                self.stream = Some(stream);
                Ok(total)
            }
            ReadEnd::Eof => Ok(total),
            ReadEnd::Error(err) if total == 0 => Err(FsError::Transport(err.to_string())),
            ReadEnd::Error(_) => Ok(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::{BackendCall, MemoryBackend};
    use crate::vfs::config::MountOptions;
    use crate::vfs::inode::InodeAttributes;
    use std::time::SystemTime;

    fn reader_for(store: &MemoryBackend, key: &str, size: u64) -> FileReader<MemoryBackend> {
        let backend = Backend::new(store.clone(), MountOptions::default());
        let attrs = InodeAttributes::file(&backend.options, size, SystemTime::now());
        let inode = Inode::new(2, key, key, attrs);
        FileReader::new(inode, backend)
    }

    fn get_calls(store: &MemoryBackend) -> Vec<(String, u64)> {
        store
            .calls()
            .iter()
            .filter_map(|c| match c {
                BackendCall::Get { key, offset } => Some((key.clone(), *offset)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sequential_reads_share_one_stream() {
        let store = MemoryBackend::new();
        store.insert_object("f", "hello world");
        let mut reader = reader_for(&store, "f", 11);

        let mut buf = [0u8; 5];
        assert_eq!(reader.read(0, &mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(reader.read(5, &mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b" worl");

        assert_eq!(get_calls(&store), vec![("f".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_out_of_order_read_reopens_stream() {
        let store = MemoryBackend::new();
        store.insert_object("f", "0123456789");
        let mut reader = reader_for(&store, "f", 10);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(0, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"0123");

        // seek backwards: the live stream is discarded and a ranged GET issued
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(2, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"2345");

        assert_eq!(
            get_calls(&store),
            vec![("f".to_string(), 0), ("f".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_read_past_end_returns_zero_without_backend_call() {
        let store = MemoryBackend::new();
        store.insert_object("f", "abc");
        let mut reader = reader_for(&store, "f", 3);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(3, &mut buf).await.unwrap(), 0);
        assert_eq!(reader.read(100, &mut buf).await.unwrap(), 0);
        assert!(get_calls(&store).is_empty());
    }

    #[tokio::test]
    async fn test_short_read_at_eof() {
        let store = MemoryBackend::new();
        store.insert_object("f", "abcde");
        let mut reader = reader_for(&store, "f", 5);

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(0, &mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"abcde");
    }
}
