//! The inode tree.
//!
//! A reference-counted DAG of live inodes keyed by kernel-assigned node
//! IDs, with lookup counts mirroring the kernel's references, a handle
//! registry for open files and directories, and the embedder-facing
//! [`Tree`] used to materialize subtrees up front.

mod handle;
mod inode;
mod table;

pub use inode::Inode;
pub(crate) use handle::{DirCursor, HandleEntry, HandleKind, HandleTable};
pub(crate) use table::InodeTable;

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use crate::ll::Errno;
use crate::node::{Node, StableAttr};

/// Validate a name segment: opaque bytes excluding NUL and `/`, never
/// empty, never `.` or `..`.
pub(crate) fn valid_name(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes != b"."
        && bytes != b".."
        && !bytes.contains(&0)
        && !bytes.contains(&b'/')
}

/// The embedder's view of the inode tree, handed to the `on_add` hook
/// and usable for materializing static filesystems.
#[derive(Clone)]
pub struct Tree {
    pub(crate) table: Arc<InodeTable>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("live_inodes", &self.table.len())
            .finish()
    }
}

impl Tree {
    pub(crate) fn new(root_ops: Arc<dyn Node>) -> Tree {
        Tree {
            table: Arc::new(InodeTable::new(root_ops)),
        }
    }

    /// The root inode (node ID 1).
    pub fn root(&self) -> Arc<Inode> {
        self.table.root()
    }

    /// Create a persistent inode: indexable immediately and never
    /// evicted when its lookup count drops to zero. Used by filesystems
    /// that materialize their whole tree up front.
    pub fn new_persistent_inode(&self, ops: Arc<dyn Node>, stable: StableAttr) -> Arc<Inode> {
        self.table.new_persistent(ops, stable)
    }

    /// Link `child` under `parent` with the given name. With
    /// `overwrite` false an existing entry is an error.
    pub fn add_child(
        &self,
        parent: &Arc<Inode>,
        name: &OsStr,
        child: Arc<Inode>,
        overwrite: bool,
    ) -> Result<(), Errno> {
        if !valid_name(name) {
            return Err(Errno::EINVAL);
        }
        self.table.add_child(parent, name, child, overwrite)
    }

    /// Unlink the named child from `parent`. Returns the detached child
    /// if there was one.
    pub fn rm_child(&self, parent: &Arc<Inode>, name: &OsStr) -> Option<Arc<Inode>> {
        self.table.rm_child(parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_hygiene() {
        assert!(valid_name(OsStr::new("file.txt")));
        assert!(valid_name(OsStr::new("...")));
        assert!(!valid_name(OsStr::new("")));
        assert!(!valid_name(OsStr::new(".")));
        assert!(!valid_name(OsStr::new("..")));
        assert!(!valid_name(OsStr::new("a/b")));
        assert!(!valid_name(OsStr::from_bytes(b"nul\0byte")));
    }
}
