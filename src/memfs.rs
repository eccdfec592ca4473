//! A memory-backed node implementation.
//!
//! Directories are plain tree inodes (children created here are
//! persistent, the tree IS the storage); files keep their bytes and
//! attributes in a shared cell so every open handle observes the same
//! content. Useful as a scratch filesystem and as the workhorse of the
//! integration tests.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::ll::fuse_abi::FopenFlags;
use crate::ll::{Errno, TimeOrNow};
use crate::node::{
    AttrOut, Context, Entry, FileAttr, FileHandle, FileType, Node, SetAttrRequest, StableAttr,
};

/// A memory-backed directory. Mount one of these as the root to get a
/// scratch read-write filesystem.
pub struct MemDir {
    meta: Mutex<MemMeta>,
}

impl std::fmt::Debug for MemDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDir").finish()
    }
}

#[derive(Clone, Copy)]
struct MemMeta {
    mode: u32,
    uid: u32,
    gid: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
}

impl MemMeta {
    fn new(mode: u32, ctx: &Context) -> MemMeta {
        let now = SystemTime::now();
        MemMeta {
            mode,
            uid: ctx.uid,
            gid: ctx.gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    fn apply(&mut self, req: &SetAttrRequest) {
        if let Some(mode) = req.mode {
            self.mode = mode & 0o7777 | (self.mode & !0o7777);
        }
        if let Some(uid) = req.uid {
            self.uid = uid;
        }
        if let Some(gid) = req.gid {
            self.gid = gid;
        }
        let now = SystemTime::now();
        if let Some(atime) = req.atime {
            self.atime = match atime {
                TimeOrNow::SpecificTime(t) => t,
                TimeOrNow::Now => now,
            };
        }
        if let Some(mtime) = req.mtime {
            self.mtime = match mtime {
                TimeOrNow::SpecificTime(t) => t,
                TimeOrNow::Now => now,
            };
        }
        self.ctime = req.ctime.unwrap_or(now);
    }

    fn fill(&self, kind: FileType, size: u64) -> FileAttr {
        FileAttr {
            // The inode number is stamped by the bridge from the
            // tree's stable identity.
            ino: 0,
            size,
            blocks: size.div_ceil(512),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            kind,
            perm: (self.mode & 0o7777) as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
        }
    }
}

impl MemDir {
    /// A fresh empty directory with the given permission bits.
    pub fn new(mode: u32) -> Arc<MemDir> {
        let fake_root = Context {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            pid: 0,
            interrupted: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        Arc::new(MemDir {
            meta: Mutex::new(MemMeta::new(mode, &fake_root)),
        })
    }

    fn child_dir(&self, ctx: &Context, mode: u32) -> Entry {
        Entry::persistent(
            Arc::new(MemDir {
                meta: Mutex::new(MemMeta::new(mode, ctx)),
            }),
            StableAttr::dir(),
        )
    }
}

impl Node for MemDir {
    fn getattr(&self, _ctx: &Context, _fh: Option<&Arc<dyn FileHandle>>) -> Result<AttrOut, Errno> {
        Ok(self.meta.lock().fill(FileType::Directory, 0).into())
    }

    fn setattr(
        &self,
        _ctx: &Context,
        req: &SetAttrRequest,
        _fh: Option<&Arc<dyn FileHandle>>,
    ) -> Result<AttrOut, Errno> {
        let mut meta = self.meta.lock();
        meta.apply(req);
        Ok(meta.fill(FileType::Directory, 0).into())
    }

    fn mknod(&self, ctx: &Context, _name: &OsStr, mode: u32, _rdev: u32) -> Result<Entry, Errno> {
        if mode & libc::S_IFMT != libc::S_IFREG && mode & libc::S_IFMT != 0 {
            return Err(Errno::EPERM);
        }
        Ok(MemFile::entry(MemFile::empty(mode, ctx)))
    }

    fn mkdir(&self, ctx: &Context, _name: &OsStr, mode: u32) -> Result<Entry, Errno> {
        Ok(self.child_dir(ctx, mode))
    }

    fn unlink(&self, _ctx: &Context, _name: &OsStr) -> Result<(), Errno> {
        // Children live in the tree; the core detaches them on success.
        Ok(())
    }

    fn rmdir(&self, _ctx: &Context, _name: &OsStr) -> Result<(), Errno> {
        Ok(())
    }

    fn symlink(&self, ctx: &Context, _name: &OsStr, target: &OsStr) -> Result<Entry, Errno> {
        Ok(Entry::persistent(
            Arc::new(MemSymlink {
                target: target.to_os_string(),
                meta: Mutex::new(MemMeta::new(0o777, ctx)),
            }),
            StableAttr {
                kind: FileType::Symlink,
                ino: 0,
            },
        ))
    }

    fn rename(
        &self,
        _ctx: &Context,
        _name: &OsStr,
        _new_parent: &Arc<crate::tree::Inode>,
        _new_name: &OsStr,
        _flags: crate::ll::fuse_abi::RenameFlags,
    ) -> Result<(), Errno> {
        // Pure tree surgery, performed by the core.
        Ok(())
    }

    fn create(
        &self,
        ctx: &Context,
        _name: &OsStr,
        _flags: u32,
        mode: u32,
    ) -> Result<(Entry, Arc<dyn FileHandle>, FopenFlags), Errno> {
        let file = MemFile::empty(mode, ctx);
        let handle: Arc<dyn FileHandle> = Arc::new(MemFileHandle {
            state: file.state.clone(),
        });
        Ok((MemFile::entry(file), handle, FopenFlags::empty()))
    }
}

struct MemFileState {
    data: Vec<u8>,
    meta: MemMeta,
}

/// A memory-backed regular file.
pub struct MemFile {
    state: Arc<Mutex<MemFileState>>,
}

impl std::fmt::Debug for MemFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemFile")
            .field("size", &self.state.lock().data.len())
            .finish()
    }
}

impl MemFile {
    fn empty(mode: u32, ctx: &Context) -> Arc<MemFile> {
        Arc::new(MemFile {
            state: Arc::new(Mutex::new(MemFileState {
                data: Vec::new(),
                meta: MemMeta::new(mode, ctx),
            })),
        })
    }

    /// A file pre-filled with `content`, for building static trees.
    pub fn with_content(content: impl Into<Vec<u8>>) -> Arc<MemFile> {
        let ctx = Context {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            pid: 0,
            interrupted: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        Arc::new(MemFile {
            state: Arc::new(Mutex::new(MemFileState {
                data: content.into(),
                meta: MemMeta::new(0o644, &ctx),
            })),
        })
    }

    fn entry(file: Arc<MemFile>) -> Entry {
        Entry::persistent(file, StableAttr::file())
    }
}

impl Node for MemFile {
    fn getattr(&self, _ctx: &Context, _fh: Option<&Arc<dyn FileHandle>>) -> Result<AttrOut, Errno> {
        let state = self.state.lock();
        Ok(state
            .meta
            .fill(FileType::RegularFile, state.data.len() as u64)
            .into())
    }

    fn setattr(
        &self,
        _ctx: &Context,
        req: &SetAttrRequest,
        _fh: Option<&Arc<dyn FileHandle>>,
    ) -> Result<AttrOut, Errno> {
        let mut state = self.state.lock();
        if let Some(size) = req.size {
            state.data.resize(size as usize, 0);
        }
        state.meta.apply(req);
        let size = state.data.len() as u64;
        Ok(state.meta.fill(FileType::RegularFile, size).into())
    }

    fn open(
        &self,
        _ctx: &Context,
        _flags: u32,
    ) -> Result<(Arc<dyn FileHandle>, FopenFlags), Errno> {
        let handle: Arc<dyn FileHandle> = Arc::new(MemFileHandle {
            state: self.state.clone(),
        });
        Ok((handle, FopenFlags::empty()))
    }
}

struct MemFileHandle {
    state: Arc<Mutex<MemFileState>>,
}

impl FileHandle for MemFileHandle {
    fn read(&self, _ctx: &Context, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        let state = self.state.lock();
        let start = (offset as usize).min(state.data.len());
        let end = (start + size as usize).min(state.data.len());
        Ok(state.data[start..end].to_vec())
    }

    fn write(&self, _ctx: &Context, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        let mut state = self.state.lock();
        let end = offset as usize + data.len();
        if end > state.data.len() {
            state.data.resize(end, 0);
        }
        state.data[offset as usize..end].copy_from_slice(data);
        state.meta.mtime = SystemTime::now();
        Ok(data.len() as u32)
    }

    fn fsync(&self, _ctx: &Context, _datasync: bool) -> Result<(), Errno> {
        Ok(())
    }
}

struct MemSymlink {
    target: std::ffi::OsString,
    meta: Mutex<MemMeta>,
}

impl Node for MemSymlink {
    fn getattr(&self, _ctx: &Context, _fh: Option<&Arc<dyn FileHandle>>) -> Result<AttrOut, Errno> {
        use std::os::unix::ffi::OsStrExt;
        Ok(self
            .meta
            .lock()
            .fill(FileType::Symlink, self.target.as_bytes().len() as u64)
            .into())
    }

    fn readlink(&self, _ctx: &Context) -> Result<Vec<u8>, Errno> {
        use std::os::unix::ffi::OsStrExt;
        Ok(self.target.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, CachePolicy};
    use crate::ll::INodeNo;
    use crate::ll::reply::Response;
    use crate::tree::Tree;
    use std::time::Duration;

    fn bridge() -> Bridge {
        Bridge::new(
            Tree::new(MemDir::new(0o755)),
            CachePolicy {
                entry_ttl: Duration::from_secs(1),
                attr_ttl: Duration::from_secs(1),
                negative_ttl: Duration::ZERO,
            },
            false,
        )
    }

    fn bytes(r: &Response) -> Vec<u8> {
        r.with_iovec(crate::ll::RequestId(1), |iov| {
            iov.iter().flat_map(|s| s.iter().copied()).collect()
        })
    }

    #[test]
    fn create_write_read_round_trip() {
        let bridge = bridge();
        let ctx = Context::test();
        let arg = crate::ll::fuse_abi::fuse_create_in {
            flags: libc::O_RDWR as u32,
            mode: 0o644,
            umask: 0,
            padding: 0,
        };
        let resp = bridge
            .create(
                &ctx,
                INodeNo::ROOT,
                &crate::ll::request::op::Create {
                    arg: &arg,
                    name: OsStr::new("test"),
                },
            )
            .unwrap();
        let raw = bytes(&resp);
        // fuse_create_out = entry_out (128) + open_out (16)
        assert_eq!(raw.len(), 16 + 144);
        let fh = u64::from_le_bytes(raw[144..152].try_into().unwrap());

        let warg = crate::ll::fuse_abi::fuse_write_in {
            fh,
            offset: 0,
            size: 5,
            write_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let resp = bridge
            .write(
                &ctx,
                &crate::ll::request::op::Write {
                    arg: &warg,
                    data: b"hello",
                },
            )
            .unwrap();
        let raw = bytes(&resp);
        assert_eq!(u32::from_le_bytes(raw[16..20].try_into().unwrap()), 5);

        let rarg = crate::ll::fuse_abi::fuse_read_in {
            fh,
            offset: 0,
            size: 4096,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let resp = bridge
            .read(&ctx, &crate::ll::request::op::Read { arg: &rarg })
            .unwrap();
        assert_eq!(&bytes(&resp)[16..], b"hello");
    }

    #[test]
    fn truncate_and_chown_via_setattr() {
        let file = MemFile::with_content(b"x".to_vec());
        let ctx = Context::test();
        let out = file
            .setattr(
                &ctx,
                &SetAttrRequest {
                    size: Some(4096),
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(out.attr.size, 4096);
        let out = file
            .setattr(
                &ctx,
                &SetAttrRequest {
                    uid: Some(21),
                    gid: Some(42),
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        assert_eq!((out.attr.uid, out.attr.gid), (21, 42));
        assert_eq!(out.attr.size, 4096);
    }

    #[test]
    fn created_children_survive_forget() {
        let bridge = bridge();
        let ctx = Context::test();
        let arg = crate::ll::fuse_abi::fuse_create_in {
            flags: 0,
            mode: 0o644,
            umask: 0,
            padding: 0,
        };
        bridge
            .create(
                &ctx,
                INodeNo::ROOT,
                &crate::ll::request::op::Create {
                    arg: &arg,
                    name: OsStr::new("keep"),
                },
            )
            .unwrap();
        let root = bridge.tree.root();
        let child = root.child(OsStr::new("keep")).unwrap();
        let id = child.id();
        // Release the handle the create left open, then forget.
        let release = crate::ll::fuse_abi::fuse_release_in {
            fh: 1,
            flags: 0,
            release_flags: 0,
            lock_owner: 0,
        };
        bridge
            .release(&ctx, &crate::ll::request::op::Release { arg: &release })
            .unwrap();
        bridge.forget(id, 1);
        // Persistent storage: still resolvable and still a child.
        assert!(bridge.tree.table.resolve(id).is_ok());
        assert!(root.child(OsStr::new("keep")).is_some());
        // An explicit unlink destroys it.
        bridge.unlink(&ctx, INodeNo::ROOT, OsStr::new("keep")).unwrap();
        assert!(bridge.tree.table.resolve(id).is_err());
    }
}
