//! Object client: the wire surface the filesystem core consumes, plus a thin
//! wrapper that can log every request for debugging.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

/// Streaming body of a GET response.
pub type ObjectBody = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum ObjectError {
    /// The backend answered with an HTTP error status.
    #[error("{code} (http {status}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ObjectError {
    pub fn not_found(key: &str) -> Self {
        ObjectError::Service {
            status: 404,
            code: "NoSuchKey".to_string(),
            message: key.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ObjectError::Service { status, .. } => Some(*status),
            ObjectError::Transport(_) => None,
        }
    }
}

pub type ObjectResult<T> = Result<T, ObjectError>;

/// HEAD response for a single key.
#[derive(Debug, Clone)]
pub struct HeadObject {
    pub size: u64,
    pub last_modified: SystemTime,
    pub etag: Option<String>,
}

/// One key in a listing page.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
}

/// One page of a delimited listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    pub common_prefixes: Vec<String>,
    pub contents: Vec<ObjectInfo>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// Part identity handed back at multipart completion.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Backend primitives against one bucket. Implementations hold the bucket
/// name themselves; keys are bucket-relative.
#[async_trait]
pub trait ObjectBackend: Clone + Send + Sync + 'static {
    async fn head_object(&self, key: &str) -> ObjectResult<HeadObject>;

    /// Start streaming an object, optionally from a byte offset (open-ended
    /// `Range` request; no range header when `offset` is 0).
    async fn get_object(&self, key: &str, offset: u64) -> ObjectResult<ObjectBody>;

    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
        max_keys: Option<i32>,
    ) -> ObjectResult<ObjectListing>;

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        storage_class: Option<&str>,
    ) -> ObjectResult<()>;

    async fn delete_object(&self, key: &str) -> ObjectResult<()>;

    async fn copy_object(
        &self,
        from_key: &str,
        to_key: &str,
        storage_class: Option<&str>,
    ) -> ObjectResult<()>;

    /// Returns the upload id. Some backends can answer success with no id;
    /// callers must treat `None` as a failed initialization.
    async fn create_multipart_upload(
        &self,
        key: &str,
        storage_class: Option<&str>,
    ) -> ObjectResult<Option<String>>;

    /// Uploads one part and returns its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> ObjectResult<String>;

    /// Server-side copy of `range` (inclusive byte bounds) from `from_key`
    /// into part `part_number` of the upload on `to_key`. Returns the ETag.
    async fn upload_part_copy(
        &self,
        from_key: &str,
        to_key: &str,
        upload_id: &str,
        part_number: u32,
        range: (u64, u64),
    ) -> ObjectResult<String>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ObjectResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ObjectResult<()>;

    async fn get_bucket_location(&self) -> ObjectResult<String>;
}

/// Wraps a backend and mirrors each request to the log when asked to.
#[derive(Clone)]
pub struct ObjectClient<B: ObjectBackend> {
    backend: B,
    log_requests: bool,
}

impl<B: ObjectBackend> ObjectClient<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            log_requests: false,
        }
    }

    pub fn log_requests(self, log_requests: bool) -> Self {
        Self {
            log_requests,
            ..self
        }
    }

    fn trace(&self, op: &str, key: &str) {
        if self.log_requests {
            debug!(target: "bucketfs::object", op, key);
        }
    }

    pub async fn head_object(&self, key: &str) -> ObjectResult<HeadObject> {
        self.trace("HeadObject", key);
        self.backend.head_object(key).await
    }

    pub async fn get_object(&self, key: &str, offset: u64) -> ObjectResult<ObjectBody> {
        self.trace("GetObject", key);
        self.backend.get_object(key, offset).await
    }

    pub async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
        max_keys: Option<i32>,
    ) -> ObjectResult<ObjectListing> {
        self.trace("ListObjects", prefix);
        self.backend
            .list_objects(prefix, delimiter, marker, max_keys)
            .await
    }

    pub async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        storage_class: Option<&str>,
    ) -> ObjectResult<()> {
        self.trace("PutObject", key);
        self.backend.put_object(key, body, storage_class).await
    }

    pub async fn delete_object(&self, key: &str) -> ObjectResult<()> {
        self.trace("DeleteObject", key);
        self.backend.delete_object(key).await
    }

    pub async fn copy_object(
        &self,
        from_key: &str,
        to_key: &str,
        storage_class: Option<&str>,
    ) -> ObjectResult<()> {
        self.trace("CopyObject", to_key);
        self.backend
            .copy_object(from_key, to_key, storage_class)
            .await
    }

    pub async fn create_multipart_upload(
        &self,
        key: &str,
        storage_class: Option<&str>,
    ) -> ObjectResult<Option<String>> {
        self.trace("CreateMultipartUpload", key);
        self.backend
            .create_multipart_upload(key, storage_class)
            .await
    }

    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> ObjectResult<String> {
        self.trace("UploadPart", key);
        self.backend
            .upload_part(key, upload_id, part_number, body)
            .await
    }

    pub async fn upload_part_copy(
        &self,
        from_key: &str,
        to_key: &str,
        upload_id: &str,
        part_number: u32,
        range: (u64, u64),
    ) -> ObjectResult<String> {
        self.trace("UploadPartCopy", to_key);
        self.backend
            .upload_part_copy(from_key, to_key, upload_id, part_number, range)
            .await
    }

    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ObjectResult<()> {
        self.trace("CompleteMultipartUpload", key);
        self.backend
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ObjectResult<()> {
        self.trace("AbortMultipartUpload", key);
        self.backend.abort_multipart_upload(key, upload_id).await
    }

    pub async fn get_bucket_location(&self) -> ObjectResult<String> {
        self.trace("GetBucketLocation", "");
        self.backend.get_bucket_location().await
    }
}
