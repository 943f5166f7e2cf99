//! File and directory handle management.

use crate::cadapter::client::ObjectBackend;
use crate::vfs::backend::Backend;
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::inode::{EntryCache, FileKind, Inode, InodeAttributes};
use crate::vfs::io::{FileReader, FileWriter};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Cursor abort threshold: a reader that advances this far past a page
/// without making progress is stuck.
const MAX_READDIR_LAG: u64 = 5000;

/// One directory entry as reported to the kernel. Offsets are 1-based and
/// include the synthetic dot entries.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub name: String,
    pub kind: FileKind,
    pub offset: u64,
}

struct DirState {
    /// Current page, sorted by name; `None` when the next access must fetch.
    entries: Option<Vec<Dirent>>,
    /// Continuation token; absent once the listing is complete.
    marker: Option<String>,
    /// Cumulative offset of the first entry of the current page.
    base_offset: u64,
}

/// Paginated listing cursor over one directory's slice of the namespace.
pub(crate) struct DirHandle<B: ObjectBackend> {
    id: u64,
    inode: Arc<Inode>,
    backend: Arc<Backend<B>>,
    /// Child attributes seen by this cursor; shared with the inode so
    /// lookups can skip the backend.
    cache: Arc<EntryCache>,
    state: Mutex<DirState>,
}

impl<B: ObjectBackend> DirHandle<B> {
    pub(crate) fn new(id: u64, inode: Arc<Inode>, backend: Arc<Backend<B>>) -> Arc<Self> {
        let cache = Arc::new(EntryCache::default());
        inode.register_dir_cache(id, Arc::clone(&cache));
        Arc::new(Self {
            id,
            inode,
            backend,
            cache,
            state: Mutex::new(DirState {
                entries: None,
                marker: None,
                base_offset: 0,
            }),
        })
    }

    pub(crate) fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Entry at position `offset` (0-based request, matching the kernel's
    /// resume-after protocol); `None` past the end of the listing.
    pub(crate) async fn read_dir(&self, offset: u64) -> FsResult<Option<Dirent>> {
        let mut state = self.state.lock().await;

        if offset == 0 {
            // first call or rewinddir
            state.entries = None;
            state.marker = None;
            state.base_offset = 0;
            self.cache.insert(".", self.backend.root_attrs.clone());
            return Ok(Some(Dirent {
                name: ".".to_string(),
                kind: FileKind::Directory,
                offset: 1,
            }));
        }
        if offset == 1 {
            self.cache.insert("..", self.backend.root_attrs.clone());
            return Ok(Some(Dirent {
                name: "..".to_string(),
                kind: FileKind::Directory,
                offset: 2,
            }));
        }

        let Some(past_dots) = (offset - 2).checked_sub(state.base_offset) else {
            return Err(FsError::Invalid);
        };
        let mut i = past_dots as usize;

        let page_exhausted = matches!(&state.entries, Some(entries) if i >= entries.len())
            && state.marker.is_some();
        if page_exhausted {
            state.base_offset += i as u64;
            state.entries = None;
            i = 0;
        }

        if i as u64 > MAX_READDIR_LAG {
            warn!(
                ino = self.inode.id(),
                offset, "directory cursor ran away without progress"
            );
            return Err(FsError::Invalid);
        }

        if state.entries.is_none() {
            self.fetch_page(&mut state).await?;
        }
        let Some(entries) = state.entries.as_ref() else {
            return Err(FsError::Invalid);
        };

        match i.cmp(&entries.len()) {
            Ordering::Less => Ok(Some(entries[i].clone())),
            Ordering::Equal => Ok(None),
            Ordering::Greater => Err(FsError::Invalid),
        }
    }

    async fn fetch_page(&self, state: &mut DirState) -> FsResult<()> {
        let prefix = self.inode.list_prefix();
        let listing = self
            .backend
            .client
            .list_objects(&prefix, Some("/"), state.marker.as_deref(), None)
            .await?;

        let mut entries =
            Vec::with_capacity(listing.common_prefixes.len() + listing.contents.len());

        for dir in &listing.common_prefixes {
            let Some(rest) = dir.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let name = rest.strip_suffix('/').unwrap_or(rest);
            entries.push(Dirent {
                name: name.to_string(),
                kind: FileKind::Directory,
                offset: 0,
            });
            self.cache.insert(name, self.backend.root_attrs.clone());
        }

        for obj in &listing.contents {
            let Some(name) = obj.key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if name.is_empty() {
                // the directory's own marker blob
                continue;
            }
            entries.push(Dirent {
                name: name.to_string(),
                kind: FileKind::File,
                offset: 0,
            });
            self.cache.insert(
                name,
                InodeAttributes::file(&self.backend.options, obj.size, obj.last_modified),
            );
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for (idx, entry) in entries.iter_mut().enumerate() {
            // 1 based, plus the two dot entries
            entry.offset = state.base_offset + idx as u64 + 1 + 2;
        }

        state.marker = if listing.is_truncated {
            listing.next_marker.clone()
        } else {
            None
        };
        state.entries = Some(entries);
        Ok(())
    }

    pub(crate) fn close_dir(&self) {
        self.inode.unregister_dir_cache(self.id);
    }
}

/// A file handle starts idle; the first read or write decides its mode for
/// the rest of its life.
enum HandleState<B: ObjectBackend> {
    Idle,
    Reading(FileReader<B>),
    Writing(FileWriter<B>),
}

pub(crate) struct FileHandle<B: ObjectBackend> {
    inode: Arc<Inode>,
    backend: Arc<Backend<B>>,
    state: Mutex<HandleState<B>>,
}

impl<B: ObjectBackend> FileHandle<B> {
    /// Handle for an existing object.
    pub(crate) fn open(inode: Arc<Inode>, backend: Arc<Backend<B>>) -> Arc<Self> {
        Arc::new(Self {
            inode,
            backend,
            state: Mutex::new(HandleState::Idle),
        })
    }

    /// Handle for a freshly created file: already dirty, so releasing it
    /// commits the (possibly empty) object.
    pub(crate) fn create(inode: Arc<Inode>, backend: Arc<Backend<B>>) -> Arc<Self> {
        let writer = FileWriter::new(Arc::clone(&inode), Arc::clone(&backend), true);
        Arc::new(Self {
            inode,
            backend,
            state: Mutex::new(HandleState::Writing(writer)),
        })
    }

    pub(crate) fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub(crate) async fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let mut state = self.state.lock().await;
        if matches!(*state, HandleState::Idle) {
            *state = HandleState::Reading(FileReader::new(
                Arc::clone(&self.inode),
                Arc::clone(&self.backend),
            ));
        }
        match &mut *state {
            HandleState::Reading(reader) => reader.read(offset, buf).await,
            _ => Err(FsError::Invalid),
        }
    }

    pub(crate) async fn write(&self, offset: u64, data: &[u8]) -> FsResult<()> {
        let mut state = self.state.lock().await;
        if matches!(*state, HandleState::Idle) {
            *state = HandleState::Writing(FileWriter::new(
                Arc::clone(&self.inode),
                Arc::clone(&self.backend),
                false,
            ));
        }
        match &mut *state {
            HandleState::Writing(writer) => writer.write(offset, data).await,
            _ => Err(FsError::Invalid),
        }
    }

    pub(crate) async fn flush(&self) -> FsResult<()> {
        let mut state = self.state.lock().await;
        match &mut *state {
            HandleState::Writing(writer) => writer.flush().await,
            // nothing buffered on read or untouched handles
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::MemoryBackend;
    use crate::vfs::config::MountOptions;

    fn dir_handle(
        store: &MemoryBackend,
        full_name: &str,
    ) -> (Arc<DirHandle<MemoryBackend>>, Arc<Inode>) {
        let backend = Backend::new(store.clone(), MountOptions::default());
        let inode = Inode::new(2, full_name, full_name, backend.root_attrs.clone());
        let dh = DirHandle::new(7, Arc::clone(&inode), backend);
        (dh, inode)
    }

    async fn read_all(dh: &DirHandle<MemoryBackend>) -> Vec<Dirent> {
        let mut out = Vec::new();
        let mut offset = 0;
        while let Some(entry) = dh.read_dir(offset).await.unwrap() {
            offset = entry.offset;
            out.push(entry);
        }
        out
    }

    #[tokio::test]
    async fn test_read_dir_with_marker_and_children() {
        let store = MemoryBackend::new();
        store.insert_object("d/", "");
        store.insert_object("d/a", "1");
        store.insert_object("d/b", "22");

        let (dh, _inode) = dir_handle(&store, "d");
        let entries = read_all(&dh).await;

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "a", "b"]);
        let offsets: Vec<u64> = entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3, 4]);
        assert_eq!(entries[2].kind, FileKind::File);
    }

    #[tokio::test]
    async fn test_read_dir_mixes_dirs_and_files_sorted() {
        let store = MemoryBackend::new();
        store.insert_object("p/z", "1");
        store.insert_object("p/a/x", "1");
        store.insert_object("p/m", "1");

        let (dh, _inode) = dir_handle(&store, "p");
        let entries = read_all(&dh).await;
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "a", "m", "z"]);
        assert_eq!(entries[2].kind, FileKind::Directory);
        assert_eq!(entries[3].kind, FileKind::File);
    }

    #[tokio::test]
    async fn test_read_dir_paginates_across_listing_pages() {
        let store = MemoryBackend::new().with_page_limit(2);
        for name in ["a", "b", "c", "d", "e"] {
            store.insert_object(&format!("d/{name}"), "x");
        }

        let (dh, _inode) = dir_handle(&store, "d");
        let entries = read_all(&dh).await;
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "a", "b", "c", "d", "e"]);
        let offsets: Vec<u64> = entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_read_dir_populates_lookup_cache() {
        let store = MemoryBackend::new();
        store.insert_object("d/f", "hello");
        store.insert_object("d/sub/x", "y");

        let (dh, inode) = dir_handle(&store, "d");
        let _ = read_all(&dh).await;
        store.clear_calls();

        let backend = Backend::new(store.clone(), MountOptions::default());
        let attrs = inode.lookup(&backend, "f").await.unwrap();
        assert_eq!(attrs.size, 5);
        let attrs = inode.lookup(&backend, "sub").await.unwrap();
        assert!(attrs.is_dir());
        assert!(store.calls().is_empty(), "lookups must come from the cache");

        dh.close_dir();
        assert_eq!(inode.open_dir_handles(), 0);
    }

    #[tokio::test]
    async fn test_file_handle_is_single_mode() {
        let store = MemoryBackend::new();
        store.insert_object("f", "hello");
        let backend = Backend::new(store.clone(), MountOptions::default());
        let attrs = crate::vfs::inode::lookup_maybe_dir(&backend, "f").await.unwrap();
        let inode = Inode::new(2, "f", "f", attrs);

        let fh = FileHandle::open(Arc::clone(&inode), Arc::clone(&backend));
        let mut buf = [0u8; 5];
        assert_eq!(fh.read(0, &mut buf).await.unwrap(), 5);
        assert_eq!(fh.write(0, b"nope").await.unwrap_err(), FsError::Invalid);

        let fh = FileHandle::open(inode, backend);
        fh.write(0, b"new contents").await.unwrap();
        assert_eq!(fh.read(0, &mut buf).await.unwrap_err(), FsError::Invalid);
        fh.flush().await.unwrap();
        assert_eq!(store.object("f").unwrap(), bytes::Bytes::from_static(b"new contents"));
    }
}
