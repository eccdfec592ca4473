//! A live inode.
//!
//! Inodes are shared through `Arc`; the ownership graph is acyclic
//! because parent and child links both go through the table's ID space:
//! children are strong references, parent back-links are weak. Each
//! inode guards its own children/parents maps, so unrelated directories
//! never contend. Lookup counts are plain atomics; the LOOKUP-vs-FORGET
//! tie-break is enforced by the table's eviction gate, under whose read
//! side every increment happens.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::ll::{Generation, INodeNo};
use crate::node::{FileType, Node, StableAttr};

pub(crate) struct InodeState {
    pub(crate) children: HashMap<OsString, Arc<Inode>>,
    // Keyed by (parent node ID, name under that parent); enough to
    // answer "which directories link to me" without owning the parent.
    pub(crate) parents: HashMap<(u64, OsString), Weak<Inode>>,
}

/// An entity in the filesystem tree, identified by a server-assigned
/// 64-bit node ID that the kernel references.
pub struct Inode {
    id: u64,
    generation: u64,
    stable: StableAttr,
    ops: Arc<dyn Node>,
    lookups: AtomicU64,
    persistent: AtomicBool,
    open_handles: AtomicU64,
    pub(crate) state: Mutex<InodeState>,
}

impl Inode {
    pub(crate) fn new(
        id: u64,
        generation: u64,
        stable: StableAttr,
        ops: Arc<dyn Node>,
        persistent: bool,
    ) -> Arc<Inode> {
        Arc::new(Inode {
            id,
            generation,
            stable,
            ops,
            lookups: AtomicU64::new(0),
            persistent: AtomicBool::new(persistent),
            open_handles: AtomicU64::new(0),
            state: Mutex::new(InodeState {
                children: HashMap::new(),
                parents: HashMap::new(),
            }),
        })
    }

    /// The kernel-visible node ID.
    pub fn id(&self) -> INodeNo {
        INodeNo(self.id)
    }

    pub(crate) fn raw_id(&self) -> u64 {
        self.id
    }

    /// The generation qualifying this node ID.
    pub fn generation(&self) -> Generation {
        Generation(self.generation)
    }

    /// The stable identity this inode was interned with. The `ino`
    /// field is always resolved (non-zero) here.
    pub fn stable(&self) -> StableAttr {
        self.stable
    }

    /// Whether this inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.stable.kind == FileType::Directory
    }

    /// The node implementation serving this inode.
    pub fn ops(&self) -> &Arc<dyn Node> {
        &self.ops
    }

    /// Pin this inode regardless of its lookup count.
    pub fn set_persistent(&self) {
        self.persistent.store(true, Ordering::Relaxed);
    }

    /// Whether the inode is pinned against lookup-count eviction.
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_persistent(&self) {
        self.persistent.store(false, Ordering::Relaxed);
    }

    pub(crate) fn has_parents(&self) -> bool {
        !self.state.lock().parents.is_empty()
    }

    /// Current lookup count, i.e. the number of outstanding references
    /// the kernel holds.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Look up a child by name.
    pub fn child(&self, name: &OsStr) -> Option<Arc<Inode>> {
        self.state.lock().children.get(name).cloned()
    }

    /// Snapshot of the children, sorted by name so readdir cookies are
    /// stable across snapshots of an unchanged directory.
    pub fn children(&self) -> Vec<(OsString, Arc<Inode>)> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state
            .children
            .iter()
            .map(|(name, inode)| (name.clone(), inode.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// One parent link, if any; used for the ".." readdir entry.
    pub(crate) fn any_parent(&self) -> Option<Arc<Inode>> {
        let state = self.state.lock();
        state.parents.values().find_map(Weak::upgrade)
    }

    // Lookup count bookkeeping. Callers hold the table lock.

    pub(crate) fn inc_lookup(&self) -> u64 {
        self.lookups.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn dec_lookup(&self, n: u64) -> u64 {
        // FORGET never takes the count below zero even if the kernel
        // and server disagree after an abort.
        let mut current = self.lookups.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(n);
            match self.lookups.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn inc_open(&self) {
        self.open_handles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_open(&self) {
        self.open_handles.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn open_handle_count(&self) -> u64 {
        self.open_handles.load(Ordering::Relaxed)
    }

    /// Whether this inode may be dropped from the table: no kernel
    /// references, not pinned, no open handles, and no live children
    /// keeping it reachable.
    pub(crate) fn evictable(&self) -> bool {
        self.lookup_count() == 0
            && !self.is_persistent()
            && self.open_handle_count() == 0
            && self.state.lock().children.is_empty()
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("stable", &self.stable)
            .field("lookups", &self.lookup_count())
            .field("persistent", &self.is_persistent())
            .field("open_handles", &self.open_handle_count())
            .finish()
    }
}
