//! The file/directory handle registry.
//!
//! A handle is a 64-bit token handed to the kernel from OPEN/OPENDIR
//! and surrendered on RELEASE/RELEASEDIR. Each handle is scoped to one
//! inode, pins it against forget-driven eviction while open, and is
//! released exactly once; releasing an unknown handle is a protocol
//! violation surfaced to the session.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;

use parking_lot::Mutex;

use super::inode::Inode;
use crate::node::{DirEntry, FileHandle, FileType};

/// Snapshot cursor for the default readdir path: the children of the
/// inode as they were at opendir time, with "." and ".." synthesized in
/// front. Cookies are index+1, so they strictly increase and any
/// previously returned cookie restarts the stream right after itself.
#[derive(Debug)]
pub(crate) struct DirCursor {
    entries: Vec<DirEntry>,
}

impl DirCursor {
    pub(crate) fn snapshot(inode: &Arc<Inode>) -> DirCursor {
        let mut entries = Vec::new();
        let self_ino = inode.stable().ino;
        let parent_ino = inode
            .any_parent()
            .map(|p| p.stable().ino)
            .unwrap_or(self_ino);
        entries.push((OsString::from("."), FileType::Directory, self_ino));
        entries.push((OsString::from(".."), FileType::Directory, parent_ino));
        for (name, child) in inode.children() {
            let stable = child.stable();
            entries.push((name, stable.kind, stable.ino));
        }
        let entries = entries
            .into_iter()
            .enumerate()
            .map(|(idx, (name, kind, ino))| DirEntry {
                name,
                kind,
                ino,
                cookie: idx as u64 + 1,
            })
            .collect();
        DirCursor { entries }
    }

    /// Entries with cookies greater than `offset`, i.e. the suffix
    /// after the last entry the kernel saw.
    pub(crate) fn from_offset(&self, offset: u64) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().skip(offset as usize)
    }
}

pub(crate) enum HandleKind {
    File(Arc<dyn FileHandle>),
    Dir(DirCursor),
}

pub(crate) struct HandleEntry {
    pub(crate) inode: Arc<Inode>,
    pub(crate) kind: HandleKind,
}

impl HandleEntry {
    pub(crate) fn file(&self) -> Option<&Arc<dyn FileHandle>> {
        match &self.kind {
            HandleKind::File(f) => Some(f),
            HandleKind::Dir(_) => None,
        }
    }

    pub(crate) fn dir(&self) -> Option<&DirCursor> {
        match &self.kind {
            HandleKind::Dir(d) => Some(d),
            HandleKind::File(_) => None,
        }
    }
}

struct HandleInner {
    map: HashMap<u64, Arc<HandleEntry>>,
    next: u64,
}

pub(crate) struct HandleTable {
    inner: Mutex<HandleInner>,
}

impl HandleTable {
    pub(crate) fn new() -> HandleTable {
        HandleTable {
            inner: Mutex::new(HandleInner {
                map: HashMap::new(),
                next: 1,
            }),
        }
    }

    /// Register a handle for `inode`, pinning it while open.
    pub(crate) fn alloc(&self, inode: Arc<Inode>, kind: HandleKind) -> u64 {
        let mut inner = self.inner.lock();
        let fh = inner.next;
        inner.next += 1;
        inode.inc_open();
        inner.map.insert(fh, Arc::new(HandleEntry { inode, kind }));
        fh
    }

    pub(crate) fn get(&self, fh: u64) -> Option<Arc<HandleEntry>> {
        self.inner.lock().map.get(&fh).cloned()
    }

    /// Surrender a handle. Returns `None` for a handle that was never
    /// issued or was already released, which callers treat as a
    /// protocol violation. The inode's open-count is dropped here; the
    /// caller runs the node release callback and any eviction.
    pub(crate) fn release(&self, fh: u64) -> Option<Arc<HandleEntry>> {
        let entry = self.inner.lock().map.remove(&fh)?;
        entry.inode.dec_open();
        Some(entry)
    }

    /// Drain every live handle for shutdown-time best-effort releases.
    pub(crate) fn drain(&self) -> Vec<Arc<HandleEntry>> {
        let mut inner = self.inner.lock();
        let entries: Vec<_> = inner.map.drain().map(|(_, e)| e).collect();
        for entry in &entries {
            entry.inode.dec_open();
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::tree::InodeTable;
    use std::ffi::OsStr;

    struct NullNode;
    impl Node for NullNode {}

    struct NullFile;
    impl FileHandle for NullFile {}

    #[test]
    fn release_is_exactly_once() {
        let table = InodeTable::new(Arc::new(NullNode));
        let handles = HandleTable::new();
        let root = table.root();
        let fh = handles.alloc(root.clone(), HandleKind::File(Arc::new(NullFile)));
        assert_eq!(root.open_handle_count(), 1);
        assert!(handles.release(fh).is_some());
        assert_eq!(root.open_handle_count(), 0);
        assert!(handles.release(fh).is_none());
    }

    #[test]
    fn handles_are_not_shared_across_inodes() {
        let table = InodeTable::new(Arc::new(NullNode));
        let handles = HandleTable::new();
        let root = table.root();
        let child = table.intern(
            &root,
            OsStr::new("a"),
            Arc::new(NullNode),
            crate::node::StableAttr::file(),
        );
        let fh1 = handles.alloc(root.clone(), HandleKind::File(Arc::new(NullFile)));
        let fh2 = handles.alloc(child.clone(), HandleKind::File(Arc::new(NullFile)));
        assert_ne!(fh1, fh2);
        assert!(Arc::ptr_eq(&handles.get(fh1).unwrap().inode, &root));
        assert!(Arc::ptr_eq(&handles.get(fh2).unwrap().inode, &child));
    }

    #[test]
    fn dir_cursor_cookies_increase_and_restart() {
        let table = InodeTable::new(Arc::new(NullNode));
        let root = table.root();
        for name in ["c", "a", "b"] {
            table.intern(
                &root,
                OsStr::new(name),
                Arc::new(NullNode),
                crate::node::StableAttr::file(),
            );
        }
        let cursor = DirCursor::snapshot(&root);
        let full: Vec<_> = cursor.from_offset(0).cloned().collect();
        assert_eq!(full.len(), 5); // . .. a b c
        let cookies: Vec<u64> = full.iter().map(|e| e.cookie).collect();
        assert!(cookies.windows(2).all(|w| w[0] < w[1]));
        // Restarting from any cookie yields the suffix that completes
        // the prefix into the full stream.
        for split in &full {
            let prefix: Vec<_> = full
                .iter()
                .take_while(|e| e.cookie <= split.cookie)
                .cloned()
                .collect();
            let suffix: Vec<_> = cursor.from_offset(split.cookie).cloned().collect();
            let mut joined = prefix;
            joined.extend(suffix);
            assert_eq!(joined.len(), full.len());
            assert!(
                joined
                    .iter()
                    .zip(full.iter())
                    .all(|(a, b)| a.name == b.name && a.cookie == b.cookie)
            );
        }
    }
}
