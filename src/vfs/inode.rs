//! Live inodes and the namespace operations that run against them.
//!
//! An inode is one live name in the projected tree. Directories have no
//! per-entity metadata in the backend, so their attributes reuse the root's
//! attribute record; files carry the size and timestamps reported by the
//! last HEAD or listing that produced them.

use crate::cadapter::client::ObjectBackend;
use crate::vfs::backend::Backend;
use crate::vfs::error::{FsError, FsResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::oneshot;
use tracing::debug;

pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone)]
pub struct InodeAttributes {
    pub size: u64,
    pub nlink: u32,
    pub mode: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub uid: u32,
    pub gid: u32,
}

impl InodeAttributes {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFDIR != 0
    }

    pub fn kind(&self) -> FileKind {
        if self.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        }
    }

    pub(crate) fn file(
        options: &crate::vfs::config::MountOptions,
        size: u64,
        mtime: SystemTime,
    ) -> Self {
        Self {
            size,
            nlink: 1,
            mode: options.file_mode | S_IFREG,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            uid: options.uid,
            gid: options.gid,
        }
    }

    pub(crate) fn directory(options: &crate::vfs::config::MountOptions) -> Self {
        let now = SystemTime::now();
        Self {
            size: 4096,
            nlink: 2,
            mode: options.dir_mode | S_IFDIR,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            uid: options.uid,
            gid: options.gid,
        }
    }
}

/// Attributes a directory listing saw for each child, shared between the
/// directory handle that fills it and the inode that consults it on lookup.
#[derive(Default)]
pub(crate) struct EntryCache {
    entries: Mutex<HashMap<String, InodeAttributes>>,
}

impl EntryCache {
    pub(crate) fn get(&self, name: &str) -> Option<InodeAttributes> {
        self.entries.lock().get(name).cloned()
    }

    pub(crate) fn insert(&self, name: &str, attrs: InodeAttributes) {
        self.entries.lock().insert(name.to_string(), attrs);
    }
}

struct InodeState {
    attrs: InodeAttributes,
    refcnt: u64,
    dir_caches: HashMap<u64, Arc<EntryCache>>,
}

pub struct Inode {
    id: u64,
    name: String,
    full_name: String,
    state: Mutex<InodeState>,
}

impl Inode {
    pub(crate) fn new(id: u64, name: &str, full_name: &str, attrs: InodeAttributes) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            full_name: full_name.to_string(),
            state: Mutex::new(InodeState {
                attrs,
                refcnt: 1,
                dir_caches: HashMap::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key prefix from the root; empty for the root itself.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn is_dir(&self) -> bool {
        self.state.lock().attrs.is_dir()
    }

    pub fn attributes(&self) -> InodeAttributes {
        self.state.lock().attrs.clone()
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.state.lock().attrs.size = size;
    }

    /// Object key of the directory marker blob.
    pub(crate) fn marker_key(&self) -> String {
        format!("{}/", self.full_name)
    }

    /// Listing prefix for this directory: empty for the root, otherwise the
    /// full name with the trailing delimiter.
    pub(crate) fn list_prefix(&self) -> String {
        if self.full_name.is_empty() {
            String::new()
        } else {
            format!("{}/", self.full_name)
        }
    }

    /// Key of the child `name` under this directory.
    pub(crate) fn child_name(&self, name: &str) -> String {
        if self.full_name.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.full_name, name)
        }
    }

    pub(crate) fn inc_ref(&self) {
        self.state.lock().refcnt += 1;
    }

    /// Drop `n` kernel references; true when the inode became stale.
    pub(crate) fn deref(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        assert!(
            state.refcnt >= n,
            "deref {} from {} on inode {}",
            n,
            state.refcnt,
            self.id
        );
        state.refcnt -= n;
        state.refcnt == 0
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> u64 {
        self.state.lock().refcnt
    }

    pub(crate) fn register_dir_cache(&self, handle_id: u64, cache: Arc<EntryCache>) {
        self.state.lock().dir_caches.insert(handle_id, cache);
    }

    pub(crate) fn unregister_dir_cache(&self, handle_id: u64) {
        self.state.lock().dir_caches.remove(&handle_id);
    }

    pub(crate) fn open_dir_handles(&self) -> usize {
        self.state.lock().dir_caches.len()
    }

    fn log_fuse<B: ObjectBackend>(&self, backend: &Backend<B>, op: &str, args: impl fmt::Display) {
        if backend.options.debug_fuse {
            debug!(ino = self.id, full_name = %self.full_name, "{op} {args}");
        }
    }

    /// A listing on some open handle of this directory may already know the
    /// child; that spares the backend round trips.
    fn lookup_from_dir_handles(&self, name: &str) -> Option<InodeAttributes> {
        let caches: Vec<Arc<EntryCache>> = self.state.lock().dir_caches.values().cloned().collect();
        caches.iter().find_map(|cache| cache.get(name))
    }

    pub(crate) async fn lookup<B: ObjectBackend>(
        &self,
        backend: &Backend<B>,
        name: &str,
    ) -> FsResult<InodeAttributes> {
        self.log_fuse(backend, "Inode.LookUp", name);

        if let Some(attrs) = self.lookup_from_dir_handles(name) {
            return Ok(attrs);
        }

        lookup_maybe_dir(backend, &self.child_name(name)).await
    }

    /// PUT the directory marker and report the new child's attributes.
    pub(crate) async fn mkdir<B: ObjectBackend>(
        &self,
        backend: &Backend<B>,
        name: &str,
    ) -> FsResult<InodeAttributes> {
        self.log_fuse(backend, "MkDir", name);

        let marker = format!("{}/", self.child_name(name));
        backend
            .client
            .put_object(&marker, Bytes::new(), backend.storage_class())
            .await?;
        Ok(backend.root_attrs.clone())
    }

    pub(crate) async fn rmdir<B: ObjectBackend>(
        &self,
        backend: &Backend<B>,
        name: &str,
    ) -> FsResult<()> {
        self.log_fuse(backend, "RmDir", name);

        let full_name = self.child_name(name);
        match empty_dir_status(backend, &full_name).await? {
            DirStatus::Missing => Err(FsError::NotFound),
            DirStatus::NotEmpty => Err(FsError::NotEmpty),
            DirStatus::Empty => {
                backend
                    .client
                    .delete_object(&format!("{full_name}/"))
                    .await?;
                Ok(())
            }
        }
    }

    pub(crate) async fn unlink<B: ObjectBackend>(
        &self,
        backend: &Backend<B>,
        name: &str,
    ) -> FsResult<()> {
        self.log_fuse(backend, "Unlink", name);

        backend.client.delete_object(&self.child_name(name)).await?;
        Ok(())
    }

    /// Copy-then-delete rename. Both sides are classified before anything is
    /// mutated; a failed copy leaves the source intact.
    pub(crate) async fn rename<B: ObjectBackend>(
        &self,
        backend: &Backend<B>,
        from: &str,
        new_parent: &Inode,
        to: &str,
    ) -> FsResult<()> {
        self.log_fuse(backend, "Rename", format_args!("{from} -> {to}"));

        let from_full = self.child_name(from);
        let from_status = empty_dir_status(backend, &from_full).await?;
        if matches!(from_status, DirStatus::NotEmpty) {
            // renaming a directory that's not empty is not supported
            return Err(FsError::NotEmpty);
        }

        let to_full = new_parent.child_name(to);
        let to_status = empty_dir_status(backend, &to_full).await?;
        if matches!(to_status, DirStatus::NotEmpty) {
            return Err(FsError::NotEmpty);
        }

        let from_is_dir = from_status.is_dir();
        let to_is_dir = to_status.is_dir();
        if from_is_dir && !to_is_dir {
            return Err(FsError::NotDirectory);
        } else if !from_is_dir && to_is_dir {
            return Err(FsError::IsDirectory);
        }

        let (from_key, to_key, size) = if from_is_dir {
            (format!("{from_full}/"), format!("{to_full}/"), Some(0))
        } else {
            (from_full, to_full, None)
        };

        backend
            .copy_object_maybe_multipart(size, &from_key, &to_key)
            .await?;
        backend.client.delete_object(&from_key).await?;
        Ok(())
    }

    pub(crate) fn get_attributes<B: ObjectBackend>(
        &self,
        backend: &Backend<B>,
    ) -> InodeAttributes {
        // TODO: refresh from the backend instead of serving the snapshot
        self.log_fuse(backend, "GetAttributes", "");
        self.attributes()
    }
}

/// Classification of a path by a two-key listing under its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirStatus {
    /// Nothing lives under the prefix; the path is not a directory.
    Missing,
    /// Only the marker blob exists.
    Empty,
    /// At least one real child exists.
    NotEmpty,
}

impl DirStatus {
    pub(crate) fn is_dir(self) -> bool {
        !matches!(self, DirStatus::Missing)
    }
}

pub(crate) async fn empty_dir_status<B: ObjectBackend>(
    backend: &Backend<B>,
    full_name: &str,
) -> FsResult<DirStatus> {
    let prefix = format!("{full_name}/");
    let listing = backend
        .client
        .list_objects(&prefix, Some("/"), None, Some(2))
        .await?;

    if !listing.common_prefixes.is_empty() || listing.contents.len() > 1 {
        return Ok(DirStatus::NotEmpty);
    }
    match listing.contents.first() {
        Some(only) if only.key == prefix => Ok(DirStatus::Empty),
        Some(_) => Ok(DirStatus::NotEmpty),
        None => Ok(DirStatus::Missing),
    }
}

/// The candidate key may be a regular object or a directory inferred from
/// any key under `key + "/"`. Both probes run concurrently; the object
/// probe is polled first, so a key that is both resolves as a file. Probe
/// errors other than not-found are dropped without retry; once both probes
/// have finished without a decision the lookup gives up.
pub(crate) async fn lookup_maybe_dir<B: ObjectBackend>(
    backend: &Backend<B>,
    key: &str,
) -> FsResult<InodeAttributes> {
    let (head_tx, mut head_rx) = oneshot::channel();
    let (list_tx, mut list_rx) = oneshot::channel();

    {
        let client = backend.client.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let _ = head_tx.send(client.head_object(&key).await);
        });
    }
    {
        let client = backend.client.clone();
        let prefix = format!("{key}/");
        tokio::spawn(async move {
            let _ = list_tx.send(client.list_objects(&prefix, Some("/"), None, Some(1)).await);
        });
    }

    let mut head_done = false;
    let mut list_done = false;
    let mut seen_not_found = false;
    let mut last_error: Option<FsError> = None;

    loop {
        tokio::select! {
            biased;

            res = &mut head_rx, if !head_done => {
                head_done = true;
                match res {
                    Ok(Ok(head)) => {
                        return Ok(InodeAttributes::file(
                            &backend.options,
                            head.size,
                            head.last_modified,
                        ));
                    }
                    Ok(Err(err)) => match FsError::from_object(err) {
                        FsError::NotFound if seen_not_found => return Err(FsError::NotFound),
                        FsError::NotFound => seen_not_found = true,
                        other => last_error = Some(other),
                    },
                    Err(_) => {
                        last_error = Some(FsError::Transport("lookup probe dropped".to_string()));
                    }
                }
            }

            res = &mut list_rx, if !list_done => {
                list_done = true;
                match res {
                    Ok(Ok(listing)) => {
                        if !listing.common_prefixes.is_empty() || !listing.contents.is_empty() {
                            return Ok(backend.root_attrs.clone());
                        }
                        if seen_not_found {
                            return Err(FsError::NotFound);
                        }
                        seen_not_found = true;
                    }
                    Ok(Err(err)) => {
                        last_error = Some(FsError::from_object(err));
                    }
                    Err(_) => {
                        last_error = Some(FsError::Transport("lookup probe dropped".to_string()));
                    }
                }
            }
        }

        if head_done && list_done {
            return Err(if seen_not_found {
                FsError::NotFound
            } else {
                last_error.unwrap_or(FsError::NotFound)
            });
        }
    }
}
