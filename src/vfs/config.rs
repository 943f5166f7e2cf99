//! Mount options recognized by the core.

use std::time::Duration;

pub const DEFAULT_STAT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_TYPE_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_BUFFER_SOFT_LIMIT: u64 = 200 * 1024 * 1024; // 200MB
pub const DEFAULT_BUFFER_HARD_LIMIT: u64 = 1000 * 1024 * 1024; // 1000MB

#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Mode bits reported for directories.
    pub dir_mode: u32,
    /// Mode bits reported for files.
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Storage class applied to every PUT / multipart upload.
    pub storage_class: Option<String>,
    /// How long the kernel may cache attributes returned by lookups.
    pub stat_cache_ttl: Duration,
    /// How long the kernel may cache entry (name -> inode) mappings.
    pub type_cache_ttl: Duration,
    /// Log every filesystem operation.
    pub debug_fuse: bool,
    /// Log every object store request.
    pub debug_s3: bool,
    /// Write buffer total above which spare buffers stop being pooled.
    pub buffer_soft_limit: u64,
    /// Write buffer total above which buffer requests block.
    pub buffer_hard_limit: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            dir_mode: 0o755,
            file_mode: 0o644,
            uid: 0,
            gid: 0,
            storage_class: None,
            stat_cache_ttl: DEFAULT_STAT_CACHE_TTL,
            type_cache_ttl: DEFAULT_TYPE_CACHE_TTL,
            debug_fuse: false,
            debug_s3: false,
            buffer_soft_limit: DEFAULT_BUFFER_SOFT_LIMIT,
            buffer_hard_limit: DEFAULT_BUFFER_HARD_LIMIT,
        }
    }
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir_mode(self, dir_mode: u32) -> Self {
        Self { dir_mode, ..self }
    }

    pub fn file_mode(self, file_mode: u32) -> Self {
        Self { file_mode, ..self }
    }

    pub fn uid(self, uid: u32) -> Self {
        Self { uid, ..self }
    }

    pub fn gid(self, gid: u32) -> Self {
        Self { gid, ..self }
    }

    pub fn storage_class(self, storage_class: impl Into<String>) -> Self {
        Self {
            storage_class: Some(storage_class.into()),
            ..self
        }
    }

    pub fn stat_cache_ttl(self, stat_cache_ttl: Duration) -> Self {
        Self {
            stat_cache_ttl,
            ..self
        }
    }

    pub fn type_cache_ttl(self, type_cache_ttl: Duration) -> Self {
        Self {
            type_cache_ttl,
            ..self
        }
    }

    pub fn debug_fuse(self, debug_fuse: bool) -> Self {
        Self { debug_fuse, ..self }
    }

    pub fn debug_s3(self, debug_s3: bool) -> Self {
        Self { debug_s3, ..self }
    }

    pub fn buffer_limits(self, soft: u64, hard: u64) -> Self {
        Self {
            buffer_soft_limit: soft,
            buffer_hard_limit: hard,
            ..self
        }
    }
}
