//! Shared per-mount services: the object client, mount options, the root
//! attribute record and the write buffer pool, plus the server-side copy
//! used by rename.

use crate::cadapter::client::{CompletedPart, ObjectBackend, ObjectClient};
use crate::vfs::buffer::BufferPool;
use crate::vfs::config::MountOptions;
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::inode::InodeAttributes;
use std::sync::Arc;
use tracing::debug;

/// Objects above this size cannot be copied in one request and fall back to
/// a server-side multipart copy.
pub(crate) const COPY_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

pub(crate) struct Backend<B: ObjectBackend> {
    pub(crate) client: ObjectClient<B>,
    pub(crate) options: Arc<MountOptions>,
    pub(crate) root_attrs: InodeAttributes,
    pub(crate) pool: Arc<BufferPool>,
}

impl<B: ObjectBackend> Backend<B> {
    pub(crate) fn new(backend: B, options: MountOptions) -> Arc<Self> {
        let pool = BufferPool::new(options.buffer_soft_limit, options.buffer_hard_limit);
        Self::with_pool(backend, options, pool)
    }

    pub(crate) fn with_pool(
        backend: B,
        options: MountOptions,
        pool: Arc<BufferPool>,
    ) -> Arc<Self> {
        let options = Arc::new(options);
        let client = ObjectClient::new(backend).log_requests(options.debug_s3);
        let root_attrs = InodeAttributes::directory(&options);
        Arc::new(Self {
            client,
            options,
            root_attrs,
            pool,
        })
    }

    pub(crate) fn storage_class(&self) -> Option<&str> {
        self.options.storage_class.as_deref()
    }

    /// Copy `from_key` to `to_key` server side. `size` of `None` means
    /// unknown and HEADs the source first.
    pub(crate) async fn copy_object_maybe_multipart(
        &self,
        size: Option<u64>,
        from_key: &str,
        to_key: &str,
    ) -> FsResult<()> {
        let size = match size {
            Some(size) => size,
            None => self.client.head_object(from_key).await?.size,
        };

        if size > COPY_PART_SIZE {
            return self.copy_object_multipart(size, from_key, to_key).await;
        }

        self.client
            .copy_object(from_key, to_key, self.storage_class())
            .await?;
        Ok(())
    }

    async fn copy_object_multipart(&self, size: u64, from_key: &str, to_key: &str) -> FsResult<()> {
        let upload_id = self
            .client
            .create_multipart_upload(to_key, self.storage_class())
            .await?
            .ok_or_else(|| {
                FsError::Transport("create multipart upload returned no upload id".to_string())
            })?;

        let parts = copy_part_ranges(size)
            .into_iter()
            .enumerate()
            .map(|(i, range)| {
                let client = self.client.clone();
                let from = from_key.to_string();
                let to = to_key.to_string();
                let upload_id = upload_id.clone();
                let part_number = (i + 1) as u32;
                async move {
                    client
                        .upload_part_copy(&from, &to, &upload_id, part_number, range)
                        .await
                        .map(|etag| CompletedPart { part_number, etag })
                }
            });

        match futures::future::try_join_all(parts).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload(to_key, &upload_id, parts)
                    .await?;
                Ok(())
            }
            Err(err) => {
                let client = self.client.clone();
                let to = to_key.to_string();
                tokio::spawn(async move {
                    if let Err(abort_err) = client.abort_multipart_upload(&to, &upload_id).await {
                        debug!(key = %to, error = %abort_err, "abort of failed copy upload");
                    }
                });
                Err(err.into())
            }
        }
    }
}

/// Inclusive byte ranges covering `size` bytes in copy-part-sized pieces.
pub(crate) fn copy_part_ranges(size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + COPY_PART_SIZE).min(size);
        ranges.push((start, end - 1));
        start = end;
    }
    ranges
}
