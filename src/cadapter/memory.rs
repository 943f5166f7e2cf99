//! In-memory backend used to mock the object store (implements
//! `ObjectBackend`). Records every request so tests can assert the exact
//! wire traffic an operation produced.

use crate::cadapter::client::{
    CompletedPart, HeadObject, ObjectBackend, ObjectBody, ObjectError, ObjectInfo, ObjectListing,
    ObjectResult,
};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Default cap on listing page size, mirroring the service-side limit.
const DEFAULT_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Head { key: String },
    Get { key: String, offset: u64 },
    List { prefix: String },
    Put { key: String },
    Delete { key: String },
    Copy { from: String, to: String },
    CreateUpload { key: String },
    UploadPart { key: String, part: u32 },
    UploadPartCopy { key: String, part: u32 },
    CompleteUpload { key: String, parts: Vec<u32> },
    AbortUpload { key: String },
    BucketLocation,
}

struct StoredObject {
    data: Bytes,
    last_modified: SystemTime,
}

struct UploadSession {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct Inner {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: DashMap<String, UploadSession>,
    calls: Mutex<Vec<BackendCall>>,
    page_limit: Mutex<usize>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let inner = Inner {
            page_limit: Mutex::new(DEFAULT_PAGE_LIMIT),
            ..Default::default()
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Lower the listing page cap to exercise pagination in tests.
    pub fn with_page_limit(self, limit: usize) -> Self {
        *self.inner.page_limit.lock() = limit.max(1);
        self
    }

    /// Seed an object without going through the wire surface.
    pub fn insert_object(&self, key: &str, data: impl Into<Bytes>) {
        self.inner.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                last_modified: SystemTime::now(),
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.inner.objects.lock().get(key).map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.objects.lock().keys().cloned().collect()
    }

    /// Multipart uploads created but neither completed nor aborted.
    pub fn open_upload_count(&self) -> usize {
        self.inner.uploads.len()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
    }

    fn record(&self, call: BackendCall) {
        self.inner.calls.lock().push(call);
    }

    fn etag_of(data: &[u8]) -> String {
        format!("\"{:x}\"", md5::compute(data))
    }
}

enum ListItem {
    Prefix(String),
    Object(ObjectInfo),
}

impl ListItem {
    fn marker_key(&self) -> &str {
        match self {
            ListItem::Prefix(p) => p,
            ListItem::Object(o) => &o.key,
        }
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn head_object(&self, key: &str) -> ObjectResult<HeadObject> {
        self.record(BackendCall::Head {
            key: key.to_string(),
        });
        let objects = self.inner.objects.lock();
        let obj = objects.get(key).ok_or_else(|| ObjectError::not_found(key))?;
        Ok(HeadObject {
            size: obj.data.len() as u64,
            last_modified: obj.last_modified,
            etag: Some(Self::etag_of(&obj.data)),
        })
    }

    async fn get_object(&self, key: &str, offset: u64) -> ObjectResult<ObjectBody> {
        self.record(BackendCall::Get {
            key: key.to_string(),
            offset,
        });
        let objects = self.inner.objects.lock();
        let obj = objects.get(key).ok_or_else(|| ObjectError::not_found(key))?;
        let start = (offset as usize).min(obj.data.len());
        let tail = obj.data.slice(start..);
        Ok(Box::new(std::io::Cursor::new(tail)))
    }

    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
        max_keys: Option<i32>,
    ) -> ObjectResult<ObjectListing> {
        self.record(BackendCall::List {
            prefix: prefix.to_string(),
        });

        let page_limit = *self.inner.page_limit.lock();
        let limit = max_keys
            .map(|k| k.max(0) as usize)
            .unwrap_or(page_limit)
            .min(page_limit);

        // Collect every qualifying item past the marker, folding keys that
        // share a delimited prefix into one common prefix.
        let objects = self.inner.objects.lock();
        let mut items: Vec<ListItem> = Vec::new();
        for (key, obj) in objects.iter() {
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(marker) = marker
                && key.as_str() <= marker
            {
                continue;
            }

            let rest = &key[prefix.len()..];
            let folded = delimiter
                .and_then(|d| rest.find(d).map(|idx| (d, idx)))
                .map(|(d, idx)| format!("{prefix}{}", &rest[..idx + d.len()]));

            match folded {
                Some(cp) => {
                    // a prefix group at or before the marker was already
                    // reported in full on an earlier page
                    if let Some(marker) = marker
                        && cp.as_str() <= marker
                    {
                        continue;
                    }
                    let seen = matches!(items.last(), Some(ListItem::Prefix(last)) if *last == cp);
                    if !seen {
                        items.push(ListItem::Prefix(cp));
                    }
                }
                None => items.push(ListItem::Object(ObjectInfo {
                    key: key.clone(),
                    size: obj.data.len() as u64,
                    last_modified: obj.last_modified,
                })),
            }
        }

        let is_truncated = items.len() > limit;
        items.truncate(limit);
        let next_marker = if is_truncated {
            items.last().map(|i| i.marker_key().to_string())
        } else {
            None
        };

        let mut listing = ObjectListing {
            is_truncated,
            next_marker,
            ..Default::default()
        };
        for item in items {
            match item {
                ListItem::Prefix(p) => listing.common_prefixes.push(p),
                ListItem::Object(o) => listing.contents.push(o),
            }
        }
        Ok(listing)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        _storage_class: Option<&str>,
    ) -> ObjectResult<()> {
        self.record(BackendCall::Put {
            key: key.to_string(),
        });
        self.inner.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data: body,
                last_modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> ObjectResult<()> {
        self.record(BackendCall::Delete {
            key: key.to_string(),
        });
        // Deleting an absent key succeeds, as on the real service.
        self.inner.objects.lock().remove(key);
        Ok(())
    }

    async fn copy_object(
        &self,
        from_key: &str,
        to_key: &str,
        _storage_class: Option<&str>,
    ) -> ObjectResult<()> {
        self.record(BackendCall::Copy {
            from: from_key.to_string(),
            to: to_key.to_string(),
        });
        let mut objects = self.inner.objects.lock();
        let data = objects
            .get(from_key)
            .map(|o| o.data.clone())
            .ok_or_else(|| ObjectError::not_found(from_key))?;
        objects.insert(
            to_key.to_string(),
            StoredObject {
                data,
                last_modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        _storage_class: Option<&str>,
    ) -> ObjectResult<Option<String>> {
        self.record(BackendCall::CreateUpload {
            key: key.to_string(),
        });
        let upload_id = format!("upload-{:016x}", rand::rng().next_u64());
        self.inner.uploads.insert(
            upload_id.clone(),
            UploadSession {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(Some(upload_id))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> ObjectResult<String> {
        self.record(BackendCall::UploadPart {
            key: key.to_string(),
            part: part_number,
        });
        let mut session = self
            .inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| ObjectError::not_found(upload_id))?;
        let etag = Self::etag_of(&body);
        session.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn upload_part_copy(
        &self,
        from_key: &str,
        to_key: &str,
        upload_id: &str,
        part_number: u32,
        range: (u64, u64),
    ) -> ObjectResult<String> {
        self.record(BackendCall::UploadPartCopy {
            key: to_key.to_string(),
            part: part_number,
        });
        let data = {
            let objects = self.inner.objects.lock();
            let obj = objects
                .get(from_key)
                .ok_or_else(|| ObjectError::not_found(from_key))?;
            let start = (range.0 as usize).min(obj.data.len());
            let end = ((range.1 + 1) as usize).min(obj.data.len());
            obj.data.slice(start..end)
        };
        let mut session = self
            .inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| ObjectError::not_found(upload_id))?;
        let etag = Self::etag_of(&data);
        session.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ObjectResult<()> {
        self.record(BackendCall::CompleteUpload {
            key: key.to_string(),
            parts: parts.iter().map(|p| p.part_number).collect(),
        });
        let (_, session) = self
            .inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| ObjectError::not_found(upload_id))?;

        // The service requires ascending part numbers and matching etags.
        let mut assembled = Vec::new();
        let mut last_part = 0u32;
        for part in &parts {
            if part.part_number <= last_part {
                return Err(ObjectError::Transport(anyhow!(
                    "parts out of order: {} after {}",
                    part.part_number,
                    last_part
                )));
            }
            last_part = part.part_number;
            let (etag, data) = session.parts.get(&part.part_number).ok_or_else(|| {
                ObjectError::Transport(anyhow!("part {} never uploaded", part.part_number))
            })?;
            if *etag != part.etag {
                return Err(ObjectError::Transport(anyhow!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            assembled.extend_from_slice(data);
        }

        self.inner.objects.lock().insert(
            session.key,
            StoredObject {
                data: Bytes::from(assembled),
                last_modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ObjectResult<()> {
        self.record(BackendCall::AbortUpload {
            key: key.to_string(),
        });
        self.inner.uploads.remove(upload_id);
        Ok(())
    }

    async fn get_bucket_location(&self) -> ObjectResult<String> {
        self.record(BackendCall::BucketLocation);
        Ok("us-east-1".to_string())
    }
}
