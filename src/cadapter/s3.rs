//! S3 adapter: aws-sdk-s3 implementation of the object backend.

use crate::cadapter::client::{
    CompletedPart, HeadObject, ObjectBackend, ObjectBody, ObjectError, ObjectInfo, ObjectListing,
    ObjectResult,
};
use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::{Client, config::Region};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use std::time::SystemTime;

/// S3 backend configuration options.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 bucket name.
    pub bucket: String,
    /// AWS region (optional, will use the ambient default if not specified).
    pub region: Option<String>,
    /// Custom endpoint URL (e.g. for MinIO or localstack).
    pub endpoint: Option<String>,
    /// Force path-style access (required for some S3-compatible services).
    pub force_path_style: bool,
    /// Attach Content-MD5 checksums to uploaded bodies (default: true).
    pub enable_md5: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: None,
            endpoint: None,
            force_path_style: false,
            enable_md5: true,
        }
    }
}

#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    config: S3Config,
}

impl S3Backend {
    /// Create a new S3 backend with default configuration.
    pub async fn new(bucket: impl Into<String>) -> ObjectResult<Self> {
        let config = S3Config {
            bucket: bucket.into(),
            ..Default::default()
        };
        Self::with_config(config).await
    }

    /// Create a new S3 backend with custom configuration.
    pub async fn with_config(config: S3Config) -> ObjectResult<Self> {
        if config.bucket.is_empty() {
            return Err(ObjectError::Transport(anyhow!(
                "bucket name cannot be empty"
            )));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let aws_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            config,
        })
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    fn content_md5(&self, data: &[u8]) -> Option<String> {
        self.config.enable_md5.then(|| Self::md5_base64(data))
    }

    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.config.bucket, key)
    }
}

fn map_sdk_error<E>(err: SdkError<E>) -> ObjectError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match err.raw_response().map(|r| r.status().as_u16()) {
        Some(status) => ObjectError::Service {
            status,
            code: err.code().unwrap_or("Unknown").to_string(),
            message: err.message().unwrap_or_default().to_string(),
        },
        None => ObjectError::Transport(anyhow::Error::new(err)),
    }
}

fn to_system_time(dt: Option<&DateTime>) -> SystemTime {
    dt.and_then(|dt| SystemTime::try_from(*dt).ok())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn storage_class_of(sc: Option<&str>) -> Option<StorageClass> {
    sc.map(StorageClass::from)
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn head_object(&self, key: &str) -> ObjectResult<HeadObject> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(HeadObject {
            size: resp.content_length().unwrap_or(0).max(0) as u64,
            last_modified: to_system_time(resp.last_modified()),
            etag: resp.e_tag().map(str::to_string),
        })
    }

    async fn get_object(&self, key: &str, offset: u64) -> ObjectResult<ObjectBody> {
        let mut request = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key);
        if offset != 0 {
            request = request.range(format!("bytes={offset}-"));
        }
        let resp = request.send().await.map_err(map_sdk_error)?;
        Ok(Box::new(resp.body.into_async_read()))
    }

    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
        max_keys: Option<i32>,
    ) -> ObjectResult<ObjectListing> {
        let resp = self
            .client
            .list_objects()
            .bucket(&self.config.bucket)
            .prefix(prefix)
            .set_delimiter(delimiter.map(str::to_string))
            .set_marker(marker.map(str::to_string))
            .set_max_keys(max_keys)
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(ObjectListing {
            common_prefixes: resp
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(str::to_string))
                .collect(),
            contents: resp
                .contents()
                .iter()
                .filter_map(|obj| {
                    obj.key().map(|key| ObjectInfo {
                        key: key.to_string(),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        last_modified: to_system_time(obj.last_modified()),
                    })
                })
                .collect(),
            is_truncated: resp.is_truncated().unwrap_or(false),
            next_marker: resp.next_marker().map(str::to_string),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        storage_class: Option<&str>,
    ) -> ObjectResult<()> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .set_content_md5(self.content_md5(&body))
            .set_storage_class(storage_class_of(storage_class))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> ObjectResult<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn copy_object(
        &self,
        from_key: &str,
        to_key: &str,
        storage_class: Option<&str>,
    ) -> ObjectResult<()> {
        self.client
            .copy_object()
            .bucket(&self.config.bucket)
            .copy_source(self.copy_source(from_key))
            .key(to_key)
            .set_storage_class(storage_class_of(storage_class))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        storage_class: Option<&str>,
    ) -> ObjectResult<Option<String>> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .set_storage_class(storage_class_of(storage_class))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(resp.upload_id().map(str::to_string))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> ObjectResult<String> {
        let resp = self
            .client
            .upload_part()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .set_content_md5(self.content_md5(&body))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(map_sdk_error)?;

        resp.e_tag()
            .map(str::to_string)
            .ok_or_else(|| ObjectError::Transport(anyhow!("upload part {part_number}: no etag")))
    }

    async fn upload_part_copy(
        &self,
        from_key: &str,
        to_key: &str,
        upload_id: &str,
        part_number: u32,
        range: (u64, u64),
    ) -> ObjectResult<String> {
        let resp = self
            .client
            .upload_part_copy()
            .bucket(&self.config.bucket)
            .key(to_key)
            .copy_source(self.copy_source(from_key))
            .copy_source_range(format!("bytes={}-{}", range.0, range.1))
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .send()
            .await
            .map_err(map_sdk_error)?;

        resp.copy_part_result()
            .and_then(|r| r.e_tag())
            .map(str::to_string)
            .ok_or_else(|| ObjectError::Transport(anyhow!("copy part {part_number}: no etag")))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ObjectResult<()> {
        let parts = parts
            .into_iter()
            .map(|p| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(p.etag)
                    .build()
            })
            .collect::<Vec<_>>();

        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ObjectResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn get_bucket_location(&self) -> ObjectResult<String> {
        let resp = self
            .client
            .get_bucket_location()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(map_sdk_error)?;

        // An empty constraint means the us-east-1 home region.
        let region = resp
            .location_constraint()
            .map(|c| c.as_str().to_string())
            .unwrap_or_default();
        Ok(if region.is_empty() {
            "us-east-1".to_string()
        } else {
            region
        })
    }
}
