//! Operation bridge.
//!
//! Translates decoded kernel operations into inode-tree bookkeeping and
//! node capability calls, and assembles the typed reply for each. The
//! bridge owns the attribute/entry TTL policy: session defaults are
//! stamped on every reply unless the node overrides them.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::time::Duration;

use crate::ll::fuse_abi::{FopenFlags, RenameFlags};
use crate::ll::reply::{DirEntList, Response};
use crate::ll::request::op;
use crate::ll::{Errno, FileHandleId, INodeNo, Lock, LockOwner};
use crate::node::{Context, Entry, FileAttr, SetAttrRequest};
use crate::tree::{DirCursor, HandleEntry, HandleKind, HandleTable, Inode, Tree, valid_name};

/// How a request failed: with an errno the kernel passes through to the
/// caller, or with a protocol violation that takes the session down.
#[derive(Debug)]
pub(crate) enum DispatchError {
    Errno(Errno),
    Violation(&'static str),
}

impl From<Errno> for DispatchError {
    fn from(errno: Errno) -> DispatchError {
        DispatchError::Errno(errno)
    }
}

pub(crate) type OpResult = Result<Response, DispatchError>;

/// TTL policy for cacheable replies.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CachePolicy {
    pub(crate) entry_ttl: Duration,
    pub(crate) attr_ttl: Duration,
    pub(crate) negative_ttl: Duration,
}

pub(crate) struct Bridge {
    pub(crate) tree: Tree,
    pub(crate) handles: HandleTable,
    policy: CachePolicy,
    read_only: bool,
}

impl Bridge {
    pub(crate) fn new(tree: Tree, policy: CachePolicy, read_only: bool) -> Bridge {
        Bridge {
            tree,
            handles: HandleTable::new(),
            policy,
            read_only,
        }
    }

    fn resolve(&self, id: INodeNo) -> Result<Arc<Inode>, Errno> {
        self.tree.table.resolve(id)
    }

    fn write_gate(&self) -> Result<(), Errno> {
        if self.read_only {
            Err(Errno::EROFS)
        } else {
            Ok(())
        }
    }

    /// Attributes for an inode: the node's own getattr, falling back to
    /// a record synthesized from the stable identity when the node does
    /// not implement the capability.
    fn attr_of(&self, ctx: &Context, inode: &Arc<Inode>) -> Result<(FileAttr, Duration), Errno> {
        match inode.ops().getattr(ctx, None) {
            Ok(out) => {
                let mut attr = out.attr;
                if attr.ino == 0 {
                    attr.ino = inode.stable().ino;
                }
                Ok((attr, out.ttl.unwrap_or(self.policy.attr_ttl)))
            }
            Err(Errno::ENOSYS) => Ok((
                FileAttr::basic(inode.stable().ino, inode.stable().kind),
                self.policy.attr_ttl,
            )),
            Err(err) => Err(err),
        }
    }

    fn intern_entry(&self, parent: &Arc<Inode>, name: &OsStr, entry: &Entry) -> Arc<Inode> {
        let inode = self
            .tree
            .table
            .intern(parent, name, entry.ops.clone(), entry.stable);
        if entry.persistent {
            inode.set_persistent();
        }
        inode
    }

    fn entry_response(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        entry: Option<&Entry>,
    ) -> Result<Response, Errno> {
        let (attr, attr_ttl) = match entry.and_then(|e| e.attr) {
            Some(mut attr) => {
                if attr.ino == 0 {
                    attr.ino = inode.stable().ino;
                }
                (
                    attr,
                    entry
                        .and_then(|e| e.attr_ttl)
                        .unwrap_or(self.policy.attr_ttl),
                )
            }
            None => self.attr_of(ctx, inode)?,
        };
        let entry_ttl = entry
            .and_then(|e| e.entry_ttl)
            .unwrap_or(self.policy.entry_ttl);
        Ok(Response::new_entry(
            inode.id(),
            inode.generation(),
            &attr,
            attr_ttl,
            entry_ttl,
        ))
    }

    // Lookup-family

    pub(crate) fn lookup(&self, ctx: &Context, parent: INodeNo, name: &OsStr) -> OpResult {
        check_name(name)?;
        let parent = self.resolve(parent)?;
        if !parent.is_dir() {
            return Err(Errno::ENOTDIR.into());
        }
        match parent.ops().lookup(ctx, name) {
            Ok(entry) => {
                let inode = self.intern_entry(&parent, name, &entry);
                Ok(self.entry_response(ctx, &inode, Some(&entry))?)
            }
            Err(Errno::ENOSYS) => {
                // No lookup capability: serve names the tree already
                // knows, e.g. a subtree materialized via on_add. A
                // child evicted between the fetch and the retain is
                // treated as absent.
                match parent.child(name) {
                    Some(child) if self.tree.table.retain(&child) => {
                        Ok(self.entry_response(ctx, &child, None)?)
                    }
                    _ => self.negative_entry(),
                }
            }
            Err(Errno::ENOENT) => self.negative_entry(),
            Err(err) => Err(err.into()),
        }
    }

    fn negative_entry(&self) -> OpResult {
        if self.policy.negative_ttl > Duration::ZERO {
            Ok(Response::new_negative_entry(self.policy.negative_ttl))
        } else {
            Err(Errno::ENOENT.into())
        }
    }

    pub(crate) fn forget(&self, id: INodeNo, nlookup: u64) {
        self.tree.table.forget(id, nlookup);
    }

    pub(crate) fn getattr(&self, ctx: &Context, id: INodeNo, x: &op::GetAttr<'_>) -> OpResult {
        let inode = self.resolve(id)?;
        let fh = x.file_handle().and_then(|fh| self.file_of(fh).ok());
        match inode.ops().getattr(ctx, fh.as_ref()) {
            Ok(out) => {
                let mut attr = out.attr;
                if attr.ino == 0 {
                    attr.ino = inode.stable().ino;
                }
                Ok(Response::new_attr(
                    &out.ttl.unwrap_or(self.policy.attr_ttl),
                    &attr,
                ))
            }
            Err(Errno::ENOSYS) => Ok(Response::new_attr(
                &self.policy.attr_ttl,
                &FileAttr::basic(inode.stable().ino, inode.stable().kind),
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn setattr(&self, ctx: &Context, id: INodeNo, x: &op::SetAttr<'_>) -> OpResult {
        self.write_gate()?;
        let inode = self.resolve(id)?;
        let req = SetAttrRequest {
            mode: x.mode(),
            uid: x.uid(),
            gid: x.gid(),
            size: x.size(),
            atime: x.atime(),
            mtime: x.mtime(),
            ctime: x.ctime(),
        };
        let fh = x.file_handle().and_then(|fh| self.file_of(fh).ok());
        let out = inode.ops().setattr(ctx, &req, fh.as_ref())?;
        let mut attr = out.attr;
        if attr.ino == 0 {
            attr.ino = inode.stable().ino;
        }
        Ok(Response::new_attr(
            &out.ttl.unwrap_or(self.policy.attr_ttl),
            &attr,
        ))
    }

    pub(crate) fn readlink(&self, ctx: &Context, id: INodeNo) -> OpResult {
        let inode = self.resolve(id)?;
        let target = inode.ops().readlink(ctx)?;
        Ok(Response::new_data(target))
    }

    pub(crate) fn mknod(&self, ctx: &Context, parent: INodeNo, x: &op::MkNod<'_>) -> OpResult {
        self.write_gate()?;
        check_name(x.name)?;
        let parent = self.resolve(parent)?;
        let entry = parent.ops().mknod(ctx, x.name, x.arg.mode, x.arg.rdev)?;
        let inode = self.intern_entry(&parent, x.name, &entry);
        Ok(self.entry_response(ctx, &inode, Some(&entry))?)
    }

    pub(crate) fn mkdir(&self, ctx: &Context, parent: INodeNo, x: &op::MkDir<'_>) -> OpResult {
        self.write_gate()?;
        check_name(x.name)?;
        let parent = self.resolve(parent)?;
        let entry = parent.ops().mkdir(ctx, x.name, x.arg.mode)?;
        let inode = self.intern_entry(&parent, x.name, &entry);
        Ok(self.entry_response(ctx, &inode, Some(&entry))?)
    }

    pub(crate) fn symlink(&self, ctx: &Context, parent: INodeNo, x: &op::SymLink<'_>) -> OpResult {
        self.write_gate()?;
        check_name(x.name)?;
        let parent = self.resolve(parent)?;
        let entry = parent.ops().symlink(ctx, x.name, x.target)?;
        let inode = self.intern_entry(&parent, x.name, &entry);
        Ok(self.entry_response(ctx, &inode, Some(&entry))?)
    }

    pub(crate) fn unlink(&self, ctx: &Context, parent: INodeNo, name: &OsStr) -> OpResult {
        self.write_gate()?;
        check_name(name)?;
        let parent = self.resolve(parent)?;
        if let Some(child) = parent.child(name) {
            if child.is_dir() {
                return Err(Errno::EISDIR.into());
            }
        }
        parent.ops().unlink(ctx, name)?;
        self.tree.rm_child(&parent, name);
        Ok(Response::new_empty())
    }

    pub(crate) fn rmdir(&self, ctx: &Context, parent: INodeNo, name: &OsStr) -> OpResult {
        self.write_gate()?;
        check_name(name)?;
        let parent = self.resolve(parent)?;
        if let Some(child) = parent.child(name) {
            if !child.is_dir() {
                return Err(Errno::ENOTDIR.into());
            }
            if !child.children().is_empty() {
                return Err(Errno::ENOTEMPTY.into());
            }
        }
        parent.ops().rmdir(ctx, name)?;
        self.tree.rm_child(&parent, name);
        Ok(Response::new_empty())
    }

    pub(crate) fn rename(&self, ctx: &Context, parent: INodeNo, x: &op::Rename<'_>) -> OpResult {
        self.write_gate()?;
        check_name(x.name)?;
        check_name(x.newname)?;
        let flags = RenameFlags::from_bits_retain(x.flags);
        let old_parent = self.resolve(parent)?;
        let new_parent = self.resolve(INodeNo(x.newdir))?;
        if !new_parent.is_dir() {
            return Err(Errno::ENOTDIR.into());
        }
        // Flags are enforced against the tree before the node runs, so
        // a tree-backed filesystem gets them for free.
        let target = new_parent.child(x.newname);
        if flags.contains(RenameFlags::RENAME_NOREPLACE) && target.is_some() {
            return Err(Errno::EEXIST.into());
        }
        if flags.contains(RenameFlags::RENAME_EXCHANGE) && target.is_none() {
            return Err(Errno::ENOENT.into());
        }
        old_parent
            .ops()
            .rename(ctx, x.name, &new_parent, x.newname, flags)?;
        // The node agreed; mirror the move in the tree. A miss here
        // only means the kernel never looked the entry up.
        let _ = self
            .tree
            .table
            .rename(&old_parent, x.name, &new_parent, x.newname, flags);
        Ok(Response::new_empty())
    }

    pub(crate) fn link(&self, ctx: &Context, newparent: INodeNo, x: &op::Link<'_>) -> OpResult {
        self.write_gate()?;
        check_name(x.name)?;
        let parent = self.resolve(newparent)?;
        let target = self.resolve(INodeNo(x.arg.oldnodeid))?;
        parent.ops().link(ctx, &target, x.name)?;
        // The reply hands the kernel another reference to the target;
        // taking it first also pins the target for the child insert.
        if !self.tree.table.retain(&target) {
            return Err(Errno::ENOENT.into());
        }
        if let Err(err) = self
            .tree
            .table
            .add_child(&parent, x.name, target.clone(), true)
        {
            self.tree.table.forget(target.id(), 1);
            return Err(err.into());
        }
        Ok(self.entry_response(ctx, &target, None)?)
    }

    // File I/O

    pub(crate) fn open(&self, ctx: &Context, id: INodeNo, x: &op::Open<'_>) -> OpResult {
        let inode = self.resolve(id)?;
        let (file, flags) = inode.ops().open(ctx, x.arg.flags)?;
        let fh = self.handles.alloc(inode, HandleKind::File(file));
        Ok(Response::new_open(FileHandleId(fh), flags))
    }

    pub(crate) fn create(&self, ctx: &Context, parent: INodeNo, x: &op::Create<'_>) -> OpResult {
        self.write_gate()?;
        check_name(x.name)?;
        let parent = self.resolve(parent)?;
        let (entry, file, flags) = parent.ops().create(ctx, x.name, x.arg.flags, x.arg.mode)?;
        let inode = self.intern_entry(&parent, x.name, &entry);
        let (attr, attr_ttl) = match entry.attr {
            Some(mut attr) => {
                if attr.ino == 0 {
                    attr.ino = inode.stable().ino;
                }
                (attr, entry.attr_ttl.unwrap_or(self.policy.attr_ttl))
            }
            None => self.attr_of(ctx, &inode)?,
        };
        let fh = self.handles.alloc(inode.clone(), HandleKind::File(file));
        Ok(Response::new_create(
            inode.id(),
            inode.generation(),
            &attr,
            attr_ttl,
            entry.entry_ttl.unwrap_or(self.policy.entry_ttl),
            FileHandleId(fh),
            flags,
        ))
    }

    fn handle_of(&self, fh: u64) -> Result<Arc<HandleEntry>, Errno> {
        self.handles.get(fh).ok_or(Errno::EBADF)
    }

    fn file_of(&self, fh: u64) -> Result<Arc<dyn crate::node::FileHandle>, Errno> {
        let entry = self.handle_of(fh)?;
        entry.file().cloned().ok_or(Errno::EBADF)
    }

    pub(crate) fn read(&self, ctx: &Context, x: &op::Read<'_>) -> OpResult {
        let file = self.file_of(x.arg.fh)?;
        let mut data = file.read(ctx, x.arg.offset, x.arg.size)?;
        data.truncate(x.arg.size as usize);
        Ok(Response::new_data(data))
    }

    pub(crate) fn write(&self, ctx: &Context, x: &op::Write<'_>) -> OpResult {
        self.write_gate()?;
        let file = self.file_of(x.arg.fh)?;
        let written = file.write(ctx, x.arg.offset, x.data)?;
        Ok(Response::new_write(written))
    }

    pub(crate) fn flush(&self, ctx: &Context, x: &op::Flush<'_>) -> OpResult {
        let file = self.file_of(x.arg.fh)?;
        file.flush(ctx, LockOwner(x.arg.lock_owner))?;
        Ok(Response::new_empty())
    }

    pub(crate) fn release(&self, ctx: &Context, x: &op::Release<'_>) -> OpResult {
        let Some(entry) = self.handles.release(x.arg.fh) else {
            return Err(DispatchError::Violation("RELEASE of unknown handle"));
        };
        let result = match entry.file() {
            Some(file) => {
                // A close-triggered flush is surfaced before the final
                // release of the handle.
                if x.flush() {
                    let _ = file.flush(ctx, LockOwner(x.arg.lock_owner));
                }
                file.release(ctx)
            }
            None => Err(Errno::EBADF),
        };
        self.tree.table.reap(&entry.inode);
        result?;
        Ok(Response::new_empty())
    }

    pub(crate) fn fsync(&self, ctx: &Context, x: &op::FSync<'_>) -> OpResult {
        let file = self.file_of(x.arg.fh)?;
        file.fsync(ctx, x.fdatasync())?;
        Ok(Response::new_empty())
    }

    pub(crate) fn fallocate(&self, ctx: &Context, x: &op::FAllocate<'_>) -> OpResult {
        self.write_gate()?;
        let entry = self.handle_of(x.arg.fh)?;
        let file = entry.file().cloned().ok_or(Errno::EBADF)?;
        entry
            .inode
            .ops()
            .fallocate(ctx, &file, x.arg.offset, x.arg.length, x.arg.mode)?;
        Ok(Response::new_empty())
    }

    // Directories

    pub(crate) fn opendir(&self, ctx: &Context, id: INodeNo) -> OpResult {
        let inode = self.resolve(id)?;
        if !inode.is_dir() {
            return Err(Errno::ENOTDIR.into());
        }
        inode.ops().opendir(ctx)?;
        let cursor = DirCursor::snapshot(&inode);
        let fh = self.handles.alloc(inode, HandleKind::Dir(cursor));
        Ok(Response::new_open(FileHandleId(fh), FopenFlags::empty()))
    }

    pub(crate) fn readdir(&self, ctx: &Context, x: &op::ReadDir<'_>) -> OpResult {
        let entry = self.handle_of(x.arg.fh)?;
        let cursor = entry.dir().ok_or(Errno::ENOTDIR)?;
        let mut list = DirEntList::new(x.arg.size as usize);
        match entry.inode.ops().readdir(ctx, x.arg.offset)? {
            Some(stream) => {
                let mut last_cookie = x.arg.offset;
                for dirent in stream {
                    debug_assert!(dirent.cookie > last_cookie, "readdir cookies must increase");
                    last_cookie = dirent.cookie;
                    if list.push(dirent.ino, dirent.cookie, dirent.kind, &dirent.name) {
                        break;
                    }
                }
            }
            None => {
                for dirent in cursor.from_offset(x.arg.offset) {
                    if list.push(dirent.ino, dirent.cookie, dirent.kind, &dirent.name) {
                        break;
                    }
                }
            }
        }
        Ok(Response::new_directory(list))
    }

    pub(crate) fn releasedir(&self, ctx: &Context, x: &op::ReleaseDir<'_>) -> OpResult {
        let Some(entry) = self.handles.release(x.arg.fh) else {
            return Err(DispatchError::Violation("RELEASEDIR of unknown handle"));
        };
        let result = entry.inode.ops().releasedir(ctx);
        self.tree.table.reap(&entry.inode);
        result?;
        Ok(Response::new_empty())
    }

    pub(crate) fn fsyncdir(&self, ctx: &Context, x: &op::FSyncDir<'_>) -> OpResult {
        let entry = self.handle_of(x.arg.fh)?;
        entry.inode.ops().fsyncdir(ctx, x.fdatasync())?;
        Ok(Response::new_empty())
    }

    // The rest of the surface

    pub(crate) fn statfs(&self, ctx: &Context, id: INodeNo) -> OpResult {
        let inode = self.resolve(id)?;
        let st = inode.ops().statfs(ctx)?;
        Ok(Response::new_statfs(
            st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
        ))
    }

    pub(crate) fn getxattr(&self, ctx: &Context, id: INodeNo, x: &op::GetXAttr<'_>) -> OpResult {
        let inode = self.resolve(id)?;
        let value = inode.ops().getxattr(ctx, x.name)?;
        xattr_reply(value, x.arg.size)
    }

    pub(crate) fn setxattr(&self, ctx: &Context, id: INodeNo, x: &op::SetXAttr<'_>) -> OpResult {
        self.write_gate()?;
        let inode = self.resolve(id)?;
        if x.value.len() != x.arg.size as usize {
            return Err(DispatchError::Violation("SETXATTR size mismatch"));
        }
        inode.ops().setxattr(ctx, x.name, x.value, x.arg.flags)?;
        Ok(Response::new_empty())
    }

    pub(crate) fn listxattr(&self, ctx: &Context, id: INodeNo, x: &op::ListXAttr<'_>) -> OpResult {
        let inode = self.resolve(id)?;
        let names = inode.ops().listxattr(ctx)?;
        let mut joined = Vec::new();
        for name in names {
            joined.extend_from_slice(name.as_bytes());
            joined.push(0);
        }
        xattr_reply(joined, x.arg.size)
    }

    pub(crate) fn removexattr(&self, ctx: &Context, id: INodeNo, name: &OsStr) -> OpResult {
        self.write_gate()?;
        let inode = self.resolve(id)?;
        inode.ops().removexattr(ctx, name)?;
        Ok(Response::new_empty())
    }

    pub(crate) fn access(&self, ctx: &Context, id: INodeNo, x: &op::Access<'_>) -> OpResult {
        let inode = self.resolve(id)?;
        inode.ops().access(ctx, x.arg.mask)?;
        Ok(Response::new_empty())
    }

    pub(crate) fn getlk(&self, ctx: &Context, id: INodeNo, x: &op::GetLk<'_>) -> OpResult {
        let inode = self.resolve(id)?;
        let file = self.file_of(x.arg.fh)?;
        let lock = Lock {
            range: (x.arg.lk.start, x.arg.lk.end),
            typ: x.arg.lk.typ,
            pid: x.arg.lk.pid,
        };
        let out = inode.ops().getlk(ctx, &file, x.lock_owner(), &lock)?;
        Ok(Response::new_lock(&out))
    }

    pub(crate) fn setlk(
        &self,
        ctx: &Context,
        id: INodeNo,
        fh: u64,
        owner: LockOwner,
        lk: &crate::ll::fuse_abi::fuse_file_lock,
        sleep: bool,
    ) -> OpResult {
        let inode = self.resolve(id)?;
        let file = self.file_of(fh)?;
        let lock = Lock {
            range: (lk.start, lk.end),
            typ: lk.typ,
            pid: lk.pid,
        };
        inode.ops().setlk(ctx, &file, owner, &lock, sleep)?;
        Ok(Response::new_empty())
    }

    /// Best-effort releases for every handle still open at shutdown.
    pub(crate) fn release_all(&self, ctx: &Context) {
        let entries = self.handles.drain();
        if !entries.is_empty() {
            log::debug!("Releasing {} handles left open at shutdown", entries.len());
        }
        for entry in entries {
            match &entry.kind {
                HandleKind::File(file) => {
                    let _ = file.release(ctx);
                }
                HandleKind::Dir(_) => {
                    let _ = entry.inode.ops().releasedir(ctx);
                }
            }
        }
    }
}

fn check_name(name: &OsStr) -> Result<(), Errno> {
    if valid_name(name) {
        Ok(())
    } else {
        Err(Errno::EINVAL)
    }
}

/// The getxattr/listxattr size handshake: size 0 asks for the length,
/// otherwise the value must fit or the reply is ERANGE.
fn xattr_reply(value: Vec<u8>, size: u32) -> OpResult {
    if size == 0 {
        Ok(Response::new_xattr_size(value.len() as u32))
    } else if value.len() > size as usize {
        Err(Errno::ERANGE.into())
    } else {
        Ok(Response::new_data(value))
    }
}
