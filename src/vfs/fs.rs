//! The filesystem root: global tables, ID allocation and the typed
//! operation surface the kernel bridge drives.
//!
//! The coarse table lock only covers ID resolution and table updates; it is
//! never held across backend I/O. Lock order is filesystem, then inode,
//! then handle.

use crate::cadapter::client::ObjectBackend;
use crate::vfs::backend::Backend;
use crate::vfs::buffer::BufferPool;
use crate::vfs::config::MountOptions;
use crate::vfs::error::FsResult;
use crate::vfs::handles::{DirHandle, Dirent, FileHandle};
use crate::vfs::inode::{Inode, InodeAttributes};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Reserved for the root directory; real inode IDs start just above.
pub const ROOT_INODE_ID: u64 = 1;

/// Dirents handed back per ReadDir call, sized for one kernel batch.
const MAX_READDIR_ENTRIES: usize = 50;

/// Attribute answers carry a year of validity; refreshing attributes from
/// the backend is an open gap.
const ATTR_REPLY_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub io_size: u32,
    pub inodes: u64,
    pub inodes_free: u64,
}

#[derive(Debug, Clone)]
pub struct EntryReply {
    pub child: u64,
    pub attributes: InodeAttributes,
    pub attributes_expiration: SystemTime,
    pub entry_expiration: SystemTime,
}

#[derive(Debug, Clone)]
pub struct AttrReply {
    pub attributes: InodeAttributes,
    pub attributes_expiration: SystemTime,
}

#[derive(Debug, Clone)]
pub struct OpenFileReply {
    pub handle: u64,
    pub keep_page_cache: bool,
}

#[derive(Debug, Clone)]
pub struct CreateFileReply {
    pub entry: EntryReply,
    pub handle: u64,
}

struct Tables<B: ObjectBackend> {
    next_inode_id: u64,
    next_handle_id: u64,
    inodes: HashMap<u64, Arc<Inode>>,
    inodes_by_name: HashMap<String, Arc<Inode>>,
    dir_handles: HashMap<u64, Arc<DirHandle<B>>>,
    file_handles: HashMap<u64, Arc<FileHandle<B>>>,
}

impl<B: ObjectBackend> Tables<B> {
    /// The kernel must never reference a forgotten inode.
    fn inode_or_die(&self, id: u64) -> &Arc<Inode> {
        self.inodes
            .get(&id)
            .unwrap_or_else(|| panic!("unknown inode: {id}"))
    }

    fn dir_handle_or_die(&self, id: u64) -> &Arc<DirHandle<B>> {
        self.dir_handles
            .get(&id)
            .unwrap_or_else(|| panic!("unknown dir handle: {id}"))
    }

    fn file_handle_or_die(&self, id: u64) -> &Arc<FileHandle<B>> {
        self.file_handles
            .get(&id)
            .unwrap_or_else(|| panic!("unknown file handle: {id}"))
    }
}

/// One mount's worth of filey system.
pub struct Filesystem<B: ObjectBackend> {
    backend: Arc<Backend<B>>,
    tables: Mutex<Tables<B>>,
}

impl<B: ObjectBackend> Filesystem<B> {
    pub fn new(store: B, options: MountOptions) -> Self {
        let backend = Backend::new(store, options);
        Self::with_backend(backend)
    }

    /// Mount with a caller-provided buffer pool (e.g. a non-default chunk
    /// size, or one pool shared for accounting purposes).
    pub fn with_buffer_pool(store: B, options: MountOptions, pool: Arc<BufferPool>) -> Self {
        Self::with_backend(Backend::with_pool(store, options, pool))
    }

    fn with_backend(backend: Arc<Backend<B>>) -> Self {
        let root = Inode::new(ROOT_INODE_ID, "", "", backend.root_attrs.clone());
        let mut inodes = HashMap::new();
        inodes.insert(ROOT_INODE_ID, Arc::clone(&root));
        let mut inodes_by_name = HashMap::new();
        inodes_by_name.insert(String::new(), root);

        Self {
            backend,
            tables: Mutex::new(Tables {
                next_inode_id: ROOT_INODE_ID + 1,
                next_handle_id: 1,
                inodes,
                inodes_by_name,
                dir_handles: HashMap::new(),
                file_handles: HashMap::new(),
            }),
        }
    }

    fn log_fuse(&self, op: &str, args: std::fmt::Arguments<'_>) {
        if self.backend.options.debug_fuse {
            debug!(target: "bucketfs::fuse", "{op}: {args}");
        }
    }

    /// Mount-time probe that the bucket exists; returns its region.
    pub async fn verify_bucket(&self) -> FsResult<String> {
        let region = self.backend.client.get_bucket_location().await?;
        debug!(region, "bucket location");
        Ok(region)
    }

    pub fn statfs(&self) -> StatFs {
        const BLOCK_SIZE: u32 = 4096;
        const TOTAL_SPACE: u64 = 1 << 50; // 1PB
        const TOTAL_BLOCKS: u64 = TOTAL_SPACE / BLOCK_SIZE as u64;
        const INODES: u64 = 1_000_000_000; // 1 billion

        StatFs {
            block_size: BLOCK_SIZE,
            blocks: TOTAL_BLOCKS,
            blocks_free: TOTAL_BLOCKS,
            blocks_available: TOTAL_BLOCKS,
            io_size: 1024 * 1024,
            inodes: INODES,
            inodes_free: INODES,
        }
    }

    pub fn get_inode_attributes(&self, inode_id: u64) -> AttrReply {
        let inode = Arc::clone(self.tables.lock().inode_or_die(inode_id));
        let attributes = inode.get_attributes(&self.backend);
        AttrReply {
            attributes,
            attributes_expiration: SystemTime::now() + ATTR_REPLY_TTL,
        }
    }

    /// None of the settable attributes are supported; report success with
    /// the unchanged snapshot.
    pub fn set_inode_attributes(&self, inode_id: u64) -> AttrReply {
        let inode = Arc::clone(self.tables.lock().inode_or_die(inode_id));
        AttrReply {
            attributes: inode.attributes(),
            attributes_expiration: SystemTime::now() + self.backend.options.stat_cache_ttl,
        }
    }

    fn entry_reply(&self, inode: &Inode) -> EntryReply {
        let now = SystemTime::now();
        EntryReply {
            child: inode.id(),
            attributes: inode.attributes(),
            attributes_expiration: now + self.backend.options.stat_cache_ttl,
            entry_expiration: now + self.backend.options.type_cache_ttl,
        }
    }

    /// Put `full_name` into both indices, reusing whatever a racing
    /// operation may have installed first so one key never gets two IDs.
    fn install_inode(&self, name: &str, full_name: &str, attrs: InodeAttributes) -> Arc<Inode> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.inodes_by_name.get(full_name) {
            let existing = Arc::clone(existing);
            existing.inc_ref();
            return existing;
        }

        let id = tables.next_inode_id;
        tables.next_inode_id += 1;
        let inode = Inode::new(id, name, full_name, attrs);
        tables.inodes.insert(id, Arc::clone(&inode));
        tables
            .inodes_by_name
            .insert(full_name.to_string(), Arc::clone(&inode));
        inode
    }

    pub async fn look_up_inode(&self, parent_id: u64, name: &str) -> FsResult<EntryReply> {
        self.log_fuse("LookUpInode", format_args!("{parent_id} {name}"));

        let (parent, cached) = {
            let tables = self.tables.lock();
            let parent = Arc::clone(tables.inode_or_die(parent_id));
            let cached = tables.inodes_by_name.get(&parent.child_name(name)).cloned();
            (parent, cached)
        };

        if let Some(inode) = cached {
            inode.inc_ref();
            return Ok(self.entry_reply(&inode));
        }

        let attrs = parent.lookup(&self.backend, name).await?;
        let inode = self.install_inode(name, &parent.child_name(name), attrs);
        Ok(self.entry_reply(&inode))
    }

    pub fn forget_inode(&self, inode_id: u64, n: u64) {
        self.log_fuse("ForgetInode", format_args!("{inode_id} {n}"));

        let inode = Arc::clone(self.tables.lock().inode_or_die(inode_id));
        if inode.deref(n) {
            let mut tables = self.tables.lock();
            tables.inodes.remove(&inode_id);
            // the name slot may already belong to a newer incarnation
            if let Some(current) = tables.inodes_by_name.get(inode.full_name())
                && Arc::ptr_eq(current, &inode)
            {
                tables.inodes_by_name.remove(inode.full_name());
            }
        }
    }

    pub async fn mk_dir(&self, parent_id: u64, name: &str) -> FsResult<EntryReply> {
        let parent = Arc::clone(self.tables.lock().inode_or_die(parent_id));
        let attrs = parent.mkdir(&self.backend, name).await?;
        let inode = self.install_inode(name, &parent.child_name(name), attrs);
        Ok(self.entry_reply(&inode))
    }

    pub async fn rm_dir(&self, parent_id: u64, name: &str) -> FsResult<()> {
        let parent = Arc::clone(self.tables.lock().inode_or_die(parent_id));
        parent.rmdir(&self.backend, name).await
    }

    /// Synthesizes the child and a dirty write handle; the object appears in
    /// the bucket when the handle is flushed.
    pub fn create_file(&self, parent_id: u64, name: &str) -> CreateFileReply {
        self.log_fuse("CreateFile", format_args!("{parent_id} {name}"));

        let mut tables = self.tables.lock();
        let parent = Arc::clone(tables.inode_or_die(parent_id));
        let full_name = parent.child_name(name);
        let attrs = InodeAttributes::file(&self.backend.options, 0, SystemTime::now());

        let id = tables.next_inode_id;
        tables.next_inode_id += 1;
        let inode = Inode::new(id, name, &full_name, attrs);
        tables.inodes.insert(id, Arc::clone(&inode));
        tables.inodes_by_name.insert(full_name, Arc::clone(&inode));

        let fh = FileHandle::create(Arc::clone(&inode), Arc::clone(&self.backend));
        let handle = tables.next_handle_id;
        tables.next_handle_id += 1;
        tables.file_handles.insert(handle, fh);
        drop(tables);

        CreateFileReply {
            entry: self.entry_reply(&inode),
            handle,
        }
    }

    pub fn open_file(&self, inode_id: u64) -> OpenFileReply {
        let inode = Arc::clone(self.tables.lock().inode_or_die(inode_id));
        let fh = FileHandle::open(inode, Arc::clone(&self.backend));

        let mut tables = self.tables.lock();
        let handle = tables.next_handle_id;
        tables.next_handle_id += 1;
        tables.file_handles.insert(handle, fh);

        OpenFileReply {
            handle,
            keep_page_cache: true,
        }
    }

    pub fn open_dir(&self, inode_id: u64) -> u64 {
        let (handle, inode) = {
            let mut tables = self.tables.lock();
            let handle = tables.next_handle_id;
            tables.next_handle_id += 1;
            (handle, Arc::clone(tables.inode_or_die(inode_id)))
        };

        let dh = DirHandle::new(handle, inode, Arc::clone(&self.backend));
        self.tables.lock().dir_handles.insert(handle, dh);
        handle
    }

    /// Dirents following `offset` (0 to start), one kernel batch at a time.
    pub async fn read_dir(&self, handle: u64, offset: u64) -> FsResult<Vec<Dirent>> {
        let dh = Arc::clone(self.tables.lock().dir_handle_or_die(handle));
        self.log_fuse(
            "ReadDir",
            format_args!("{} {offset}", dh.inode().full_name()),
        );

        let mut entries = Vec::new();
        let mut pos = offset;
        while entries.len() < MAX_READDIR_ENTRIES {
            match dh.read_dir(pos).await? {
                Some(entry) => {
                    pos = entry.offset;
                    entries.push(entry);
                }
                None => break,
            }
        }
        Ok(entries)
    }

    pub fn release_dir_handle(&self, handle: u64) {
        let dh = {
            let mut tables = self.tables.lock();
            tables
                .dir_handles
                .remove(&handle)
                .unwrap_or_else(|| panic!("unknown dir handle: {handle}"))
        };
        self.log_fuse(
            "ReleaseDirHandle",
            format_args!("{}", dh.inode().full_name()),
        );
        dh.close_dir();
    }

    pub async fn read_file(&self, handle: u64, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let fh = Arc::clone(self.tables.lock().file_handle_or_die(handle));
        fh.read(offset, buf).await
    }

    pub async fn write_file(&self, handle: u64, offset: u64, data: &[u8]) -> FsResult<()> {
        let fh = Arc::clone(self.tables.lock().file_handle_or_die(handle));
        fh.write(offset, data).await
    }

    pub async fn flush_file(&self, handle: u64) -> FsResult<()> {
        let fh = Arc::clone(self.tables.lock().file_handle_or_die(handle));
        fh.flush().await
    }

    pub async fn sync_file(&self, handle: u64) -> FsResult<()> {
        self.flush_file(handle).await
    }

    pub fn release_file_handle(&self, handle: u64) {
        self.tables.lock().file_handles.remove(&handle);
    }

    pub async fn unlink(&self, parent_id: u64, name: &str) -> FsResult<()> {
        let parent = Arc::clone(self.tables.lock().inode_or_die(parent_id));
        parent.unlink(&self.backend, name).await
    }

    pub async fn rename(
        &self,
        old_parent_id: u64,
        old_name: &str,
        new_parent_id: u64,
        new_name: &str,
    ) -> FsResult<()> {
        let (old_parent, new_parent) = {
            let tables = self.tables.lock();
            (
                Arc::clone(tables.inode_or_die(old_parent_id)),
                Arc::clone(tables.inode_or_die(new_parent_id)),
            )
        };
        old_parent
            .rename(&self.backend, old_name, &new_parent, new_name)
            .await
    }
}
