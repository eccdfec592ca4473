//! The inode table.
//!
//! A concurrent mapping from 64-bit node IDs to live inodes. Locking is
//! two-tier: children and parent links live under each inode's own
//! mutex, so operations in unrelated directories run in parallel, and
//! the ID map is a separate short-lived lock for allocation and
//! resolution. What needs global agreement is only eviction: structural
//! mutators (intern, retain, child surgery, rename) hold the read side
//! of a structure gate, eviction takes the write side. A LOOKUP that
//! races a FORGET therefore wins: its increment happens under the read
//! gate, and the forget's eviction pass cannot observe the count until
//! the gate is released, by which time it is nonzero again.
//!
//! Node IDs are never reused within a session. A generation counter is
//! bumped on every eviction so a hypothetical wrap is still
//! disambiguated.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::inode::Inode;
use crate::ll::fuse_abi::RenameFlags;
use crate::ll::{Errno, INodeNo};
use crate::node::{Node, StableAttr};

struct MapInner {
    map: HashMap<u64, Arc<Inode>>,
    next_id: u64,
    generation: u64,
}

pub(crate) struct InodeTable {
    root: Arc<Inode>,
    map: Mutex<MapInner>,
    // Read side: any structural mutation of children/parents or a
    // lookup-count increment. Write side: eviction. Never held while
    // sleeping in node code.
    structure: RwLock<()>,
}

impl InodeTable {
    pub(crate) fn new(root_ops: Arc<dyn Node>) -> InodeTable {
        let root = Inode::new(
            crate::ll::fuse_abi::FUSE_ROOT_ID,
            0,
            StableAttr {
                kind: crate::node::FileType::Directory,
                ino: crate::ll::fuse_abi::FUSE_ROOT_ID,
            },
            root_ops,
            true,
        );
        let mut map = HashMap::new();
        map.insert(root.raw_id(), root.clone());
        InodeTable {
            root,
            map: Mutex::new(MapInner {
                map,
                next_id: crate::ll::fuse_abi::FUSE_ROOT_ID + 1,
                generation: 0,
            }),
            structure: RwLock::new(()),
        }
    }

    pub(crate) fn root(&self) -> Arc<Inode> {
        self.root.clone()
    }

    /// Resolve a kernel node ID. The root is always resolvable.
    pub(crate) fn resolve(&self, id: INodeNo) -> Result<Arc<Inode>, Errno> {
        self.map.lock().map.get(&id.0).cloned().ok_or(Errno::ENOENT)
    }

    /// Number of live inodes (including the root).
    pub(crate) fn len(&self) -> usize {
        self.map.lock().map.len()
    }

    /// Intern the child `name` under `parent`: if a child with a
    /// matching stable identity is already linked there, reuse it,
    /// otherwise allocate a fresh ID. Either way the returned inode's
    /// lookup count has been incremented, mirroring the reply the
    /// caller is about to send.
    pub(crate) fn intern(
        &self,
        parent: &Arc<Inode>,
        name: &OsStr,
        ops: Arc<dyn Node>,
        stable: StableAttr,
    ) -> Arc<Inode> {
        let _gate = self.structure.read();
        if let Some(existing) = parent.child(name) {
            let es = existing.stable();
            if es.kind == stable.kind && (stable.ino == 0 || stable.ino == es.ino) {
                existing.inc_lookup();
                return existing;
            }
            // Stale entry with a different identity: drop the link, the
            // old inode stays resolvable until the kernel forgets it.
            unlink_child(parent, name);
        }
        let inode = self.alloc(ops, stable, false);
        link_child(parent, name, &inode);
        inode.inc_lookup();
        inode
    }

    /// Record one more kernel reference to an already-live inode (a
    /// lookup served from the children map, or a hard link reply).
    /// Returns false when the inode lost a race with eviction after the
    /// caller picked it up; the reference must not be handed out then.
    pub(crate) fn retain(&self, inode: &Arc<Inode>) -> bool {
        let _gate = self.structure.read();
        if !self.map.lock().map.contains_key(&inode.raw_id()) {
            return false;
        }
        inode.inc_lookup();
        true
    }

    /// Apply a FORGET of `n` references. Unreferenced inodes are
    /// dropped unless pinned, and the drop cascades up parent chains
    /// that were only kept alive by this child.
    pub(crate) fn forget(&self, id: INodeNo, n: u64) {
        let Some(inode) = self.map.lock().map.get(&id.0).cloned() else {
            return;
        };
        inode.dec_lookup(n);
        self.reap(&inode);
    }

    /// Re-examine an inode whose pin situation changed (a forget landed
    /// or the last open handle went away) and drop it if nothing else
    /// keeps it.
    pub(crate) fn reap(&self, inode: &Arc<Inode>) {
        // Cheap pre-check so the common forget (count still positive)
        // never contends on the exclusive gate.
        if !inode.evictable() {
            return;
        }
        let _gate = self.structure.write();
        self.evict_cascade(inode.clone());
    }

    /// Create a persistent inode, immediately indexable and exempt from
    /// lookup-count eviction.
    pub(crate) fn new_persistent(&self, ops: Arc<dyn Node>, stable: StableAttr) -> Arc<Inode> {
        self.alloc(ops, stable, true)
    }

    pub(crate) fn add_child(
        &self,
        parent: &Arc<Inode>,
        name: &OsStr,
        child: Arc<Inode>,
        overwrite: bool,
    ) -> Result<(), Errno> {
        let _gate = self.structure.read();
        if !parent.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if !overwrite && parent.child(name).is_some() {
            return Err(Errno::EEXIST);
        }
        if parent.child(name).is_some() {
            unlink_child(parent, name);
        }
        link_child(parent, name, &child);
        Ok(())
    }

    pub(crate) fn rm_child(&self, parent: &Arc<Inode>, name: &OsStr) -> Option<Arc<Inode>> {
        let child = {
            let _gate = self.structure.read();
            let child = unlink_child(parent, name)?;
            // An explicitly unlinked child loses its persistence pin
            // once no directory links to it anymore; from then on the
            // usual lookup-count rules decide its fate.
            if !child.has_parents() {
                child.clear_persistent();
            }
            child
        };
        self.reap(&child);
        self.reap(parent);
        Some(child)
    }

    /// Atomically move `old_name` under `old_parent` to `new_name`
    /// under `new_parent`. EXCHANGE swaps the two entries, NOREPLACE
    /// fails if the target name is taken. Concurrent lookups of either
    /// name observe either the before or the after state, never a
    /// window where both are missing.
    pub(crate) fn rename(
        &self,
        old_parent: &Arc<Inode>,
        old_name: &OsStr,
        new_parent: &Arc<Inode>,
        new_name: &OsStr,
        flags: RenameFlags,
    ) -> Result<(), Errno> {
        let displaced = {
            let _gate = self.structure.read();
            // Both children maps stay locked across the swap so
            // concurrent lookups of either name serialize against it.
            // Locks are taken in node-ID order to match every other
            // pairwise acquisition.
            let (source, swapped, displaced) = if old_parent.raw_id() == new_parent.raw_id() {
                let mut st = old_parent.state.lock();
                let Some(source) = st.children.get(old_name).cloned() else {
                    return Err(Errno::ENOENT);
                };
                let target = st.children.get(new_name).cloned();
                apply_rename(
                    &mut st.children,
                    None,
                    old_name,
                    new_name,
                    source,
                    target,
                    flags,
                )?
            } else {
                let (mut old_guard, mut new_guard) = if old_parent.raw_id() < new_parent.raw_id() {
                    let a = old_parent.state.lock();
                    let b = new_parent.state.lock();
                    (a, b)
                } else {
                    let b = new_parent.state.lock();
                    let a = old_parent.state.lock();
                    (a, b)
                };
                let Some(source) = old_guard.children.get(old_name).cloned() else {
                    return Err(Errno::ENOENT);
                };
                let target = new_guard.children.get(new_name).cloned();
                apply_rename(
                    &mut old_guard.children,
                    Some(&mut new_guard.children),
                    old_name,
                    new_name,
                    source,
                    target,
                    flags,
                )?
            };
            // Parent back-links are fixed up after the swap; readers of
            // the back-links tolerate a brief lag.
            move_parent_link(&source, old_parent, old_name, new_parent, new_name);
            if let Some(swapped) = swapped {
                move_parent_link(&swapped, new_parent, new_name, old_parent, old_name);
            }
            if let Some(displaced) = &displaced {
                remove_parent_link(displaced, new_parent, new_name);
                if !displaced.has_parents() {
                    displaced.clear_persistent();
                }
            }
            displaced
        };
        if let Some(displaced) = displaced {
            self.reap(&displaced);
        }
        Ok(())
    }

    fn alloc(&self, ops: Arc<dyn Node>, stable: StableAttr, persistent: bool) -> Arc<Inode> {
        let mut inner = self.map.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let stable = StableAttr {
            kind: stable.kind,
            ino: if stable.ino == 0 { id } else { stable.ino },
        };
        let inode = Inode::new(id, inner.generation, stable, ops, persistent);
        inner.map.insert(id, inode.clone());
        inode
    }

    /// Drop `inode` from the table if nothing keeps it alive, then
    /// re-examine any parents that may have been pinned only by it.
    /// Caller holds the write side of the structure gate, so no
    /// lookup-count increment or re-link can slip past the checks.
    fn evict_cascade(&self, inode: Arc<Inode>) {
        let mut worklist = vec![inode];
        while let Some(inode) = worklist.pop() {
            if inode.raw_id() == self.root.raw_id() || !inode.evictable() {
                continue;
            }
            {
                let mut inner = self.map.lock();
                if inner.map.remove(&inode.raw_id()).is_none() {
                    continue;
                }
                // Retire the ID's generation so it can never alias.
                inner.generation += 1;
            }
            let parents: Vec<(u64, OsString)> = {
                let state = inode.state.lock();
                state.parents.keys().cloned().collect()
            };
            for (parent_id, name) in parents {
                let Some(parent) = self.map.lock().map.get(&parent_id).cloned() else {
                    continue;
                };
                {
                    let mut pstate = parent.state.lock();
                    if pstate
                        .children
                        .get(&name)
                        .is_some_and(|c| Arc::ptr_eq(c, &inode))
                    {
                        pstate.children.remove(&name);
                    }
                }
                worklist.push(parent);
            }
        }
    }
}

/// Insert the parent→child and child→parent links. Takes the two state
/// locks one at a time; callers hold the structure gate.
fn link_child(parent: &Arc<Inode>, name: &OsStr, child: &Arc<Inode>) {
    parent
        .state
        .lock()
        .children
        .insert(name.to_os_string(), child.clone());
    child.state.lock().parents.insert(
        (parent.raw_id(), name.to_os_string()),
        Arc::downgrade(parent),
    );
}

fn unlink_child(parent: &Arc<Inode>, name: &OsStr) -> Option<Arc<Inode>> {
    let child = parent.state.lock().children.remove(name)?;
    remove_parent_link(&child, parent, name);
    Some(child)
}

fn remove_parent_link(child: &Arc<Inode>, parent: &Arc<Inode>, name: &OsStr) {
    child
        .state
        .lock()
        .parents
        .remove(&(parent.raw_id(), name.to_os_string()));
}

fn move_parent_link(
    child: &Arc<Inode>,
    old_parent: &Arc<Inode>,
    old_name: &OsStr,
    new_parent: &Arc<Inode>,
    new_name: &OsStr,
) {
    let mut state = child.state.lock();
    state.parents.remove(&(old_parent.raw_id(), old_name.to_os_string()));
    state.parents.insert(
        (new_parent.raw_id(), new_name.to_os_string()),
        Arc::downgrade(new_parent),
    );
}

/// The map surgery shared by same-directory and cross-directory
/// renames. `new_children` is `None` when both names live in the same
/// map. Returns the moved inode, the exchanged inode (EXCHANGE only)
/// and the displaced target (plain replace only).
#[allow(clippy::type_complexity)]
fn apply_rename(
    old_children: &mut HashMap<OsString, Arc<Inode>>,
    new_children: Option<&mut HashMap<OsString, Arc<Inode>>>,
    old_name: &OsStr,
    new_name: &OsStr,
    source: Arc<Inode>,
    target: Option<Arc<Inode>>,
    flags: RenameFlags,
) -> Result<(Arc<Inode>, Option<Arc<Inode>>, Option<Arc<Inode>>), Errno> {
    if flags.contains(RenameFlags::RENAME_NOREPLACE) && target.is_some() {
        return Err(Errno::EEXIST);
    }
    if flags.contains(RenameFlags::RENAME_EXCHANGE) {
        let Some(target) = target else {
            return Err(Errno::ENOENT);
        };
        match new_children {
            Some(new_children) => {
                new_children.insert(new_name.to_os_string(), source.clone());
                old_children.insert(old_name.to_os_string(), target.clone());
            }
            None => {
                old_children.insert(new_name.to_os_string(), source.clone());
                old_children.insert(old_name.to_os_string(), target.clone());
            }
        }
        Ok((source, Some(target), None))
    } else {
        old_children.remove(old_name);
        match new_children {
            Some(new_children) => new_children.insert(new_name.to_os_string(), source.clone()),
            None => old_children.insert(new_name.to_os_string(), source.clone()),
        };
        Ok((source, None, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullNode;
    impl Node for NullNode {}

    fn table() -> InodeTable {
        InodeTable::new(Arc::new(NullNode))
    }

    fn file_entry() -> (Arc<dyn Node>, StableAttr) {
        (Arc::new(NullNode), StableAttr::file())
    }

    #[test]
    fn root_is_always_resolvable() {
        let t = table();
        let root = t.resolve(INodeNo::ROOT).unwrap();
        assert_eq!(root.id(), INodeNo(1));
        assert!(root.is_persistent());
        t.forget(INodeNo::ROOT, 100);
        assert!(t.resolve(INodeNo::ROOT).is_ok());
    }

    #[test]
    fn node_ids_start_after_root_and_never_reuse() {
        let t = table();
        let root = t.root();
        let (ops, stable) = file_entry();
        let a = t.intern(&root, OsStr::new("a"), ops, stable);
        assert_eq!(a.id(), INodeNo(2));
        t.rm_child(&root, OsStr::new("a"));
        t.forget(a.id(), 1);
        assert!(t.resolve(a.id()).is_err());
        let (ops, stable) = file_entry();
        let b = t.intern(&root, OsStr::new("b"), ops, stable);
        assert_eq!(b.id(), INodeNo(3));
    }

    #[test]
    fn lookup_forget_round_trip_restores_table() {
        let t = table();
        let root = t.root();
        let before = t.len();
        let (ops, stable) = file_entry();
        let a = t.intern(&root, OsStr::new("a"), ops, stable);
        assert_eq!(a.lookup_count(), 1);
        assert_eq!(t.len(), before + 1);
        t.forget(a.id(), 1);
        assert_eq!(t.len(), before);
        assert!(root.child(OsStr::new("a")).is_none());
    }

    #[test]
    fn intern_twice_aliases_and_counts() {
        let t = table();
        let root = t.root();
        let (ops, stable) = file_entry();
        let a = t.intern(&root, OsStr::new("a"), ops, stable);
        let (ops2, stable2) = file_entry();
        let again = t.intern(&root, OsStr::new("a"), ops2, stable2);
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(a.lookup_count(), 2);
        t.forget(a.id(), 1);
        assert!(t.resolve(a.id()).is_ok());
        t.forget(a.id(), 1);
        assert!(t.resolve(a.id()).is_err());
    }

    #[test]
    fn mismatched_identity_gets_fresh_id() {
        let t = table();
        let root = t.root();
        let (ops, _) = file_entry();
        let a = t.intern(&root, OsStr::new("a"), ops, StableAttr::file());
        let (ops2, _) = file_entry();
        let b = t.intern(&root, OsStr::new("a"), ops2, StableAttr::dir());
        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.id(), b.id());
        // The stale inode remains resolvable until forgotten.
        assert!(t.resolve(a.id()).is_ok());
        t.forget(a.id(), 1);
        assert!(t.resolve(a.id()).is_err());
    }

    #[test]
    fn persistent_inodes_survive_zero_lookups() {
        let t = table();
        let root = t.root();
        let (ops, stable) = file_entry();
        let p = t.new_persistent(ops, stable);
        t.add_child(&root, OsStr::new("pinned"), p.clone(), false)
            .unwrap();
        assert!(t.retain(&p));
        t.forget(p.id(), 1);
        assert_eq!(p.lookup_count(), 0);
        assert!(t.resolve(p.id()).is_ok());
        assert!(root.child(OsStr::new("pinned")).is_some());
    }

    #[test]
    fn open_handles_pin_against_forget() {
        let t = table();
        let root = t.root();
        let (ops, stable) = file_entry();
        let a = t.intern(&root, OsStr::new("a"), ops, stable);
        a.inc_open();
        t.forget(a.id(), 1);
        assert!(t.resolve(a.id()).is_ok());
        a.dec_open();
        t.forget(a.id(), 0);
        assert!(t.resolve(a.id()).is_err());
    }

    #[test]
    fn children_pin_parent_chain_and_eviction_cascades() {
        let t = table();
        let root = t.root();
        let (dops, _) = file_entry();
        let dir = t.intern(&root, OsStr::new("dir"), dops, StableAttr::dir());
        let (fops, fstable) = file_entry();
        let file = t.intern(&dir, OsStr::new("file"), fops, fstable);
        // The directory is forgotten but its live child keeps it.
        t.forget(dir.id(), 1);
        assert!(t.resolve(dir.id()).is_ok());
        // Forgetting the child drops it and cascades to the directory.
        t.forget(file.id(), 1);
        assert!(t.resolve(file.id()).is_err());
        assert!(t.resolve(dir.id()).is_err());
    }

    #[test]
    fn interns_in_unrelated_directories_run_unserialized() {
        // Regression guard for the locking granularity: two threads
        // hammering different directories make progress concurrently
        // (both hold the read side of the structure gate).
        let t = Arc::new(table());
        let root = t.root();
        let (dops, _) = file_entry();
        let left = t.intern(&root, OsStr::new("left"), dops, StableAttr::dir());
        let (dops2, _) = file_entry();
        let right = t.intern(&root, OsStr::new("right"), dops2, StableAttr::dir());
        let mut threads = Vec::new();
        for dir in [left.clone(), right.clone()] {
            let t = t.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let name = format!("f{i}");
                    let (ops, stable) = (Arc::new(NullNode) as Arc<dyn Node>, StableAttr::file());
                    let child = t.intern(&dir, OsStr::new(&name), ops, stable);
                    t.forget(child.id(), 1);
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(left.children().is_empty());
        assert!(right.children().is_empty());
        t.forget(left.id(), 1);
        t.forget(right.id(), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn rename_plain_and_replace() {
        let t = table();
        let root = t.root();
        let (ops, stable) = file_entry();
        let a = t.intern(&root, OsStr::new("a"), ops, stable);
        let (dops, _) = file_entry();
        let dir = t.intern(&root, OsStr::new("dir"), dops, StableAttr::dir());
        t.rename(
            &root,
            OsStr::new("a"),
            &dir,
            OsStr::new("b"),
            RenameFlags::empty(),
        )
        .unwrap();
        assert!(root.child(OsStr::new("a")).is_none());
        assert!(Arc::ptr_eq(&dir.child(OsStr::new("b")).unwrap(), &a));
        // Replacing an existing target drops the displaced entry.
        let (ops2, stable2) = file_entry();
        let c = t.intern(&root, OsStr::new("c"), ops2, stable2);
        t.rename(
            &root,
            OsStr::new("c"),
            &dir,
            OsStr::new("b"),
            RenameFlags::empty(),
        )
        .unwrap();
        assert!(Arc::ptr_eq(&dir.child(OsStr::new("b")).unwrap(), &c));
        // `a` was displaced; once forgotten it is gone.
        t.forget(a.id(), 1);
        assert!(t.resolve(a.id()).is_err());
    }

    #[test]
    fn rename_noreplace_and_exchange() {
        let t = table();
        let root = t.root();
        let (ops, stable) = file_entry();
        let a = t.intern(&root, OsStr::new("a"), ops, stable);
        let (ops2, stable2) = file_entry();
        let b = t.intern(&root, OsStr::new("b"), ops2, stable2);
        assert_eq!(
            t.rename(
                &root,
                OsStr::new("a"),
                &root,
                OsStr::new("b"),
                RenameFlags::RENAME_NOREPLACE,
            ),
            Err(Errno::EEXIST)
        );
        t.rename(
            &root,
            OsStr::new("a"),
            &root,
            OsStr::new("b"),
            RenameFlags::RENAME_EXCHANGE,
        )
        .unwrap();
        assert!(Arc::ptr_eq(&root.child(OsStr::new("a")).unwrap(), &b));
        assert!(Arc::ptr_eq(&root.child(OsStr::new("b")).unwrap(), &a));
        assert_eq!(
            t.rename(
                &root,
                OsStr::new("missing"),
                &root,
                OsStr::new("b"),
                RenameFlags::RENAME_EXCHANGE,
            ),
            Err(Errno::ENOENT)
        );
    }
}
