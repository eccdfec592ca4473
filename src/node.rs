//! The polymorphic node surface.
//!
//! A filesystem is a tree of objects implementing [`Node`]. Every
//! method has a default body returning `ENOSYS`, which the kernel
//! caches and stops asking about, so implementations only provide the
//! capabilities they actually have. Open files and directories are
//! represented by [`FileHandle`] state objects owned by the node and
//! opaque to the core.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use crate::ll::fuse_abi::{FopenFlags, RenameFlags};
use crate::ll::{Errno, Lock, LockOwner, TimeOrNow};
use crate::tree::Inode;

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}

impl FileType {
    /// Extract the file type from `st_mode`-style mode bits.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & libc::S_IFMT {
            libc::S_IFIFO => Some(FileType::NamedPipe),
            libc::S_IFCHR => Some(FileType::CharDevice),
            libc::S_IFBLK => Some(FileType::BlockDevice),
            libc::S_IFDIR => Some(FileType::Directory),
            libc::S_IFREG => Some(FileType::RegularFile),
            libc::S_IFLNK => Some(FileType::Symlink),
            libc::S_IFSOCK => Some(FileType::Socket),
            _ => None,
        }
    }
}

/// File attributes as carried in getattr and entry replies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileAttr {
    /// Inode number reported to `stat()`.
    pub ino: u64,
    /// Size in bytes
    pub size: u64,
    /// Allocated size in 512-byte blocks.
    pub blocks: u64,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last change
    pub ctime: SystemTime,
    /// Kind of file (directory, file, pipe, etc)
    pub kind: FileType,
    /// Permissions
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Rdev
    pub rdev: u32,
    /// Block size to be reported by `stat()`. If unsure, set to 4096.
    pub blksize: u32,
}

impl FileAttr {
    /// A minimal attribute record for the given kind, permissions 0755
    /// for directories and 0644 for everything else. This is what the
    /// core synthesizes when a node has no `getattr` of its own.
    pub fn basic(ino: u64, kind: FileType) -> FileAttr {
        let perm = match kind {
            FileType::Directory => 0o755,
            _ => 0o644,
        };
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            kind,
            perm,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }
}

/// The stable identity of a node: its kind plus a user-visible inode
/// number. An `ino` of 0 lets the inode table pick one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct StableAttr {
    /// Kind of the node. Two nodes with different kinds never alias.
    pub kind: FileType,
    /// User-visible inode number; 0 means "assign for me".
    pub ino: u64,
}

impl StableAttr {
    /// A stable identity for a directory with an auto-assigned number.
    pub fn dir() -> StableAttr {
        StableAttr {
            kind: FileType::Directory,
            ino: 0,
        }
    }

    /// A stable identity for a regular file with an auto-assigned number.
    pub fn file() -> StableAttr {
        StableAttr {
            kind: FileType::RegularFile,
            ino: 0,
        }
    }
}

/// The result of a successful lookup-family operation: which node
/// implementation serves the child, its stable identity, and optional
/// attribute/TTL overrides.
pub struct Entry {
    /// Operations for the child node.
    pub ops: Arc<dyn Node>,
    /// Stable identity used for aliasing decisions in the inode table.
    pub stable: StableAttr,
    /// Pin the resulting inode regardless of its lookup count. Set by
    /// filesystems whose tree IS the storage; such inodes die only at
    /// session teardown or on explicit unlink.
    pub persistent: bool,
    /// Attributes for the entry reply. `None` falls back to the child's
    /// `getattr` (or the synthesized default).
    pub attr: Option<FileAttr>,
    /// Override for the session's entry TTL.
    pub entry_ttl: Option<Duration>,
    /// Override for the session's attribute TTL.
    pub attr_ttl: Option<Duration>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("stable", &self.stable)
            .field("persistent", &self.persistent)
            .field("attr", &self.attr)
            .field("entry_ttl", &self.entry_ttl)
            .field("attr_ttl", &self.attr_ttl)
            .finish()
    }
}

impl Entry {
    /// An entry with no overrides.
    pub fn new(ops: Arc<dyn Node>, stable: StableAttr) -> Entry {
        Entry {
            ops,
            stable,
            persistent: false,
            attr: None,
            entry_ttl: None,
            attr_ttl: None,
        }
    }

    /// An entry whose inode is pinned against lookup-count eviction.
    pub fn persistent(ops: Arc<dyn Node>, stable: StableAttr) -> Entry {
        Entry {
            persistent: true,
            ..Entry::new(ops, stable)
        }
    }
}

/// Attribute reply with an optional TTL override.
#[derive(Debug, Clone, Copy)]
pub struct AttrOut {
    /// The attributes.
    pub attr: FileAttr,
    /// Override for the session's attribute TTL.
    pub ttl: Option<Duration>,
}

impl From<FileAttr> for AttrOut {
    fn from(attr: FileAttr) -> AttrOut {
        AttrOut { attr, ttl: None }
    }
}

/// Which fields of a setattr are authoritative, and their values.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    /// New mode bits, if changing.
    pub mode: Option<u32>,
    /// New owner, if changing.
    pub uid: Option<u32>,
    /// New group, if changing.
    pub gid: Option<u32>,
    /// New size (truncate/extend), if changing.
    pub size: Option<u64>,
    /// New access time, if changing.
    pub atime: Option<TimeOrNow>,
    /// New modification time, if changing.
    pub mtime: Option<TimeOrNow>,
    /// New change time, if changing.
    pub ctime: Option<SystemTime>,
}

/// One directory entry produced by a streaming `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name; opaque bytes without NUL or `/`.
    pub name: OsString,
    /// Kind of the entry.
    pub kind: FileType,
    /// User-visible inode number.
    pub ino: u64,
    /// Cookie of this entry. Cookies must strictly increase over one
    /// stream, and a later readdir may restart from any cookie
    /// previously handed out.
    pub cookie: u64,
}

/// A lazily evaluated directory stream.
pub type DirStream = Box<dyn Iterator<Item = DirEntry> + Send>;

/// Filesystem statistics for statfs replies.
#[derive(Debug, Clone, Copy)]
pub struct Statfs {
    /// Total blocks (in units of `frsize`)
    pub blocks: u64,
    /// Free blocks
    pub bfree: u64,
    /// Free blocks for unprivileged users
    pub bavail: u64,
    /// Total inodes
    pub files: u64,
    /// Free inodes
    pub ffree: u64,
    /// Filesystem block size
    pub bsize: u32,
    /// Maximum filename length
    pub namelen: u32,
    /// Fundamental filesystem block size
    pub frsize: u32,
}

impl Default for Statfs {
    fn default() -> Statfs {
        Statfs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 512,
            namelen: 255,
            frsize: 0,
        }
    }
}

/// Per-request context handed to every node call.
#[derive(Debug, Clone)]
pub struct Context {
    /// UID of the process that triggered the request.
    pub uid: u32,
    /// GID of the process that triggered the request.
    pub gid: u32,
    /// PID of the process that triggered the request.
    pub pid: u32,
    pub(crate) interrupted: Arc<AtomicBool>,
}

impl Context {
    /// Whether the kernel has interrupted this request. Long-running
    /// node calls may poll this and bail out early; the core checks it
    /// at its own suspension points either way.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn test() -> Context {
        Context {
            uid: 0,
            gid: 0,
            pid: 0,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// The capability set a filesystem implements, one object per node in
/// the tree. All methods default to `ENOSYS` (or a harmless success for
/// open/release-style bookkeeping calls), so a minimal read-only
/// filesystem only implements `open` and the handle's `read`.
#[allow(unused_variables)]
pub trait Node: Send + Sync + 'static {
    /// Look up a child by name. Filesystems that materialize their tree
    /// up front can skip this: names already present as children of the
    /// inode are served by the core.
    fn lookup(&self, ctx: &Context, name: &OsStr) -> Result<Entry, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Get attributes. `fh` is set when the kernel asked via an open
    /// handle. The default synthesizes attributes from the stable
    /// identity.
    fn getattr(&self, ctx: &Context, fh: Option<&Arc<dyn FileHandle>>) -> Result<AttrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Set attributes; `req` names which fields are authoritative.
    fn setattr(
        &self,
        ctx: &Context,
        req: &SetAttrRequest,
        fh: Option<&Arc<dyn FileHandle>>,
    ) -> Result<AttrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Read the target of a symbolic link.
    fn readlink(&self, ctx: &Context) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Create a device/fifo/socket/regular node under this directory.
    fn mknod(&self, ctx: &Context, name: &OsStr, mode: u32, rdev: u32) -> Result<Entry, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Create a directory under this directory.
    fn mkdir(&self, ctx: &Context, name: &OsStr, mode: u32) -> Result<Entry, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Remove a non-directory child. On success the core unlinks the
    /// child from the in-memory tree as well.
    fn unlink(&self, ctx: &Context, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Remove a directory child.
    fn rmdir(&self, ctx: &Context, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Create a symbolic link under this directory.
    fn symlink(&self, ctx: &Context, name: &OsStr, target: &OsStr) -> Result<Entry, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Move `name` from this directory to `new_name` under
    /// `new_parent`. On success the core applies the same move to the
    /// in-memory tree, honoring the exchange/noreplace flags.
    fn rename(
        &self,
        ctx: &Context,
        name: &OsStr,
        new_parent: &Arc<Inode>,
        new_name: &OsStr,
        flags: RenameFlags,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Hard-link `target` under this directory. On success the core
    /// adds the child link in the in-memory tree.
    fn link(&self, ctx: &Context, target: &Arc<Inode>, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Open this node. The returned state object receives the
    /// subsequent read/write/flush/release calls for the handle. The
    /// default hands out a no-op handle whose reads fail with `ENOSYS`.
    fn open(
        &self,
        ctx: &Context,
        flags: u32,
    ) -> Result<(Arc<dyn FileHandle>, FopenFlags), Errno> {
        let handle: Arc<dyn FileHandle> = Arc::new(DefaultFileHandle);
        Ok((handle, FopenFlags::empty()))
    }

    /// Atomically create-and-open a child.
    fn create(
        &self,
        ctx: &Context,
        name: &OsStr,
        flags: u32,
        mode: u32,
    ) -> Result<(Entry, Arc<dyn FileHandle>, FopenFlags), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Open this directory. Directory handles are managed by the core;
    /// this is a permission gate.
    fn opendir(&self, ctx: &Context) -> Result<(), Errno> {
        Ok(())
    }

    /// Stream directory entries starting at `offset` (0 or any cookie
    /// previously returned). `Ok(None)` makes the core serve the
    /// snapshot of this inode's children taken at opendir time.
    fn readdir(&self, ctx: &Context, offset: u64) -> Result<Option<DirStream>, Errno> {
        Ok(None)
    }

    /// Called exactly once when an open directory handle goes away.
    fn releasedir(&self, ctx: &Context) -> Result<(), Errno> {
        Ok(())
    }

    /// Synchronize directory contents.
    fn fsyncdir(&self, ctx: &Context, datasync: bool) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Filesystem statistics.
    fn statfs(&self, ctx: &Context) -> Result<Statfs, Errno> {
        Ok(Statfs::default())
    }

    /// Get an extended attribute value.
    fn getxattr(&self, ctx: &Context, name: &OsStr) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Set an extended attribute.
    fn setxattr(&self, ctx: &Context, name: &OsStr, value: &[u8], flags: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// List extended attribute names.
    fn listxattr(&self, ctx: &Context) -> Result<Vec<OsString>, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Remove an extended attribute.
    fn removexattr(&self, ctx: &Context, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Check access permissions (only called without
    /// `default_permissions`).
    fn access(&self, ctx: &Context, mask: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Test for a byte-range lock.
    fn getlk(
        &self,
        ctx: &Context,
        fh: &Arc<dyn FileHandle>,
        owner: LockOwner,
        lock: &Lock,
    ) -> Result<Lock, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Acquire, modify or release a byte-range lock; `sleep` requests a
    /// blocking wait (SETLKW).
    fn setlk(
        &self,
        ctx: &Context,
        fh: &Arc<dyn FileHandle>,
        owner: LockOwner,
        lock: &Lock,
        sleep: bool,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Preallocate or deallocate space.
    fn fallocate(
        &self,
        ctx: &Context,
        fh: &Arc<dyn FileHandle>,
        offset: u64,
        length: u64,
        mode: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }
}

/// The state object behind one open file handle. Handles are never
/// shared across inodes, and release is delivered exactly once.
#[allow(unused_variables)]
pub trait FileHandle: Send + Sync + 'static {
    /// Read up to `size` bytes at `offset`. Short reads are zero-filled
    /// by the kernel except in direct-io mode.
    fn read(&self, ctx: &Context, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    fn write(&self, ctx: &Context, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Called on each `close()` of a descriptor referring to this
    /// handle; always surfaced before the final release.
    fn flush(&self, ctx: &Context, owner: LockOwner) -> Result<(), Errno> {
        Ok(())
    }

    /// Called exactly once when the last reference to the handle goes
    /// away.
    fn release(&self, ctx: &Context) -> Result<(), Errno> {
        Ok(())
    }

    /// Synchronize file contents; `datasync` restricts to user data.
    fn fsync(&self, ctx: &Context, datasync: bool) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }
}

/// The handle produced by the default `open`: bookkeeping only, all I/O
/// fails with `ENOSYS`.
#[derive(Debug)]
pub struct DefaultFileHandle;

impl FileHandle for DefaultFileHandle {}
