//! bucketfs projects an object-store bucket as a filey system: all backend
//! data is stored in the bucket as-is, and the mount makes minimal effort
//! at being POSIX compliant. Operations that are difficult to express
//! against a flat key namespace, or that would take more than one round
//! trip, either fail (renaming a non-empty directory) or are faked (per
//! file permissions). There is no on-disk cache; the consistency model is
//! close-to-open.
//!
//! The crate is the core only: the kernel FUSE session, mount orchestration
//! and credential handling live with the caller, which drives the typed
//! operation surface on [`Filesystem`].

pub(crate) mod cadapter;
pub(crate) mod vfs;

// Public surface for bridge/backend integrations.
pub use crate::cadapter::client::{
    CompletedPart, HeadObject, ObjectBackend, ObjectBody, ObjectClient, ObjectError, ObjectInfo,
    ObjectListing, ObjectResult,
};
pub use crate::cadapter::memory::{BackendCall, MemoryBackend};
pub use crate::cadapter::s3::{S3Backend, S3Config};
pub use crate::vfs::buffer::{BUFFER_CHUNK_SIZE, BufferPool, DetachedBuffer, PoolHandle};
pub use crate::vfs::config::MountOptions;
pub use crate::vfs::error::{FsError, FsResult};
pub use crate::vfs::fs::{
    AttrReply, CreateFileReply, EntryReply, Filesystem, OpenFileReply, ROOT_INODE_ID, StatFs,
};
pub use crate::vfs::handles::Dirent;
pub use crate::vfs::inode::{FileKind, Inode, InodeAttributes, S_IFDIR, S_IFREG};
