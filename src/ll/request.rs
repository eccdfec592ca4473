//! Low-level filesystem operation request.
//!
//! A request represents information about a filesystem operation the
//! kernel driver wants us to perform. Parsing turns one device frame
//! into a typed header view plus an opcode-specific operation; the
//! [`Arguments`] cursor walks the body, peeling typed structures and
//! NUL-terminated names off the front without copying.

use std::convert::TryFrom;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::{error, fmt, mem};

use zerocopy::error::ConvertError;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::fuse_abi::{self as abi, fuse_in_header, fuse_opcode};
use super::{INodeNo, LockOwner, RequestId, TimeOrNow, Version};

/// Cursor over a request body. Arguments are consumed front to back in
/// the order the kernel lays them out for the opcode.
struct Arguments<'a> {
    data: &'a [u8],
}

impl<'a> Arguments<'a> {
    fn new(data: &'a [u8]) -> Arguments<'a> {
        Arguments { data }
    }

    /// Bytes not yet consumed.
    fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Consume every remaining byte, e.g. a WRITE payload or an xattr
    /// value that runs to the end of the declared body.
    fn take_all(&mut self) -> &'a [u8] {
        mem::take(&mut self.data)
    }

    /// View the front of the body as a `T`. `None` when fewer bytes
    /// remain than the opcode's declared arguments need.
    fn take<T: FromBytes + KnownLayout + Immutable>(&mut self) -> Option<&'a T> {
        let (value, rest) = match zerocopy::Ref::<_, T>::from_prefix(self.data) {
            Ok(split) => split,
            // The read buffer is header-aligned and every argument
            // struct is a multiple of its own alignment, so hitting
            // this is a bug in the caller, not bad input.
            Err(ConvertError::Alignment(_)) => panic!("unaligned request body"),
            Err(_) => return None,
        };
        self.data = rest;
        Some(zerocopy::Ref::into_ref(value))
    }

    /// View the front of the body as `count` consecutive `T`s
    /// (BATCH_FORGET's node array).
    fn take_slice<T: FromBytes + KnownLayout + Immutable>(
        &mut self,
        count: usize,
    ) -> Option<&'a [T]> {
        let (values, rest) =
            match zerocopy::Ref::<_, [T]>::from_prefix_with_elems(self.data, count) {
                Ok(split) => split,
                Err(ConvertError::Alignment(_)) => panic!("unaligned request body"),
                Err(_) => return None,
            };
        self.data = rest;
        Some(zerocopy::Ref::into_ref(values))
    }

    /// Consume a name: opaque bytes up to the next NUL, which is eaten
    /// as well. `None` if no terminator is left in the body.
    fn take_str(&mut self) -> Option<&'a OsStr> {
        let nul = memchr::memchr(0, self.data)?;
        let (name, rest) = self.data.split_at(nul);
        self.data = &rest[1..];
        Some(OsStr::from_bytes(name))
    }
}

/// Error that may occur while reading and parsing a request from the kernel driver.
#[derive(Debug)]
pub enum RequestError {
    /// Not enough data for parsing the header (short read).
    ShortReadHeader(usize),
    /// Kernel requested an unknown operation.
    UnknownOperation(u32),
    /// Not enough data for the declared frame length (short read).
    ShortRead(usize, usize),
    /// Insufficient argument data for the opcode.
    InsufficientData,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortReadHeader(len) => write!(
                f,
                "Short read of FUSE request header ({} < {})",
                len,
                mem::size_of::<fuse_in_header>()
            ),
            RequestError::UnknownOperation(opcode) => write!(f, "Unknown FUSE opcode ({opcode})"),
            RequestError::ShortRead(len, total) => {
                write!(f, "Short read of FUSE request ({len} < {total})")
            }
            RequestError::InsufficientData => write!(f, "Insufficient argument data"),
        }
    }
}

impl error::Error for RequestError {}

fn system_time_from_time(secs: i64, nsecs: u32) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, nsecs)
    }
}

pub(crate) mod op {
    use super::*;
    use std::ffi::OsStr;

    #[derive(Debug)]
    pub struct Lookup<'a> {
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Forget<'a> {
        pub arg: &'a abi::fuse_forget_in,
    }
    #[derive(Debug)]
    pub struct BatchForget<'a> {
        pub nodes: &'a [abi::fuse_forget_one],
    }
    #[derive(Debug)]
    pub struct GetAttr<'a> {
        pub arg: &'a abi::fuse_getattr_in,
    }
    impl GetAttr<'_> {
        pub fn file_handle(&self) -> Option<u64> {
            (self.arg.getattr_flags & abi::FUSE_GETATTR_FH != 0).then_some(self.arg.fh)
        }
    }
    #[derive(Debug)]
    pub struct SetAttr<'a> {
        pub arg: &'a abi::fuse_setattr_in,
    }
    impl SetAttr<'_> {
        pub fn mode(&self) -> Option<u32> {
            (self.arg.valid & abi::consts::FATTR_MODE != 0).then_some(self.arg.mode)
        }
        pub fn uid(&self) -> Option<u32> {
            (self.arg.valid & abi::consts::FATTR_UID != 0).then_some(self.arg.uid)
        }
        pub fn gid(&self) -> Option<u32> {
            (self.arg.valid & abi::consts::FATTR_GID != 0).then_some(self.arg.gid)
        }
        pub fn size(&self) -> Option<u64> {
            (self.arg.valid & abi::consts::FATTR_SIZE != 0).then_some(self.arg.size)
        }
        pub fn atime(&self) -> Option<TimeOrNow> {
            if self.arg.valid & abi::consts::FATTR_ATIME == 0 {
                return None;
            }
            Some(if self.arg.valid & abi::consts::FATTR_ATIME_NOW != 0 {
                TimeOrNow::Now
            } else {
                TimeOrNow::SpecificTime(system_time_from_time(self.arg.atime, self.arg.atimensec))
            })
        }
        pub fn mtime(&self) -> Option<TimeOrNow> {
            if self.arg.valid & abi::consts::FATTR_MTIME == 0 {
                return None;
            }
            Some(if self.arg.valid & abi::consts::FATTR_MTIME_NOW != 0 {
                TimeOrNow::Now
            } else {
                TimeOrNow::SpecificTime(system_time_from_time(self.arg.mtime, self.arg.mtimensec))
            })
        }
        pub fn ctime(&self) -> Option<SystemTime> {
            (self.arg.valid & abi::consts::FATTR_CTIME != 0)
                .then(|| system_time_from_time(self.arg.ctime, self.arg.ctimensec))
        }
        pub fn file_handle(&self) -> Option<u64> {
            (self.arg.valid & abi::consts::FATTR_FH != 0).then_some(self.arg.fh)
        }
    }
    #[derive(Debug)]
    pub struct ReadLink;
    #[derive(Debug)]
    pub struct SymLink<'a> {
        pub name: &'a OsStr,
        pub target: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct MkNod<'a> {
        pub arg: &'a abi::fuse_mknod_in,
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct MkDir<'a> {
        pub arg: &'a abi::fuse_mkdir_in,
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Unlink<'a> {
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct RmDir<'a> {
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Rename<'a> {
        pub newdir: u64,
        pub flags: u32,
        pub name: &'a OsStr,
        pub newname: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Link<'a> {
        pub arg: &'a abi::fuse_link_in,
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Open<'a> {
        pub arg: &'a abi::fuse_open_in,
    }
    #[derive(Debug)]
    pub struct Read<'a> {
        pub arg: &'a abi::fuse_read_in,
    }
    #[derive(Debug)]
    pub struct Write<'a> {
        pub arg: &'a abi::fuse_write_in,
        pub data: &'a [u8],
    }
    #[derive(Debug)]
    pub struct StatFs;
    #[derive(Debug)]
    pub struct Release<'a> {
        pub arg: &'a abi::fuse_release_in,
    }
    impl Release<'_> {
        pub fn flush(&self) -> bool {
            self.arg.release_flags & abi::consts::FUSE_RELEASE_FLUSH != 0
        }
    }
    #[derive(Debug)]
    pub struct FSync<'a> {
        pub arg: &'a abi::fuse_fsync_in,
    }
    impl FSync<'_> {
        pub fn fdatasync(&self) -> bool {
            self.arg.fsync_flags & 1 != 0
        }
    }
    #[derive(Debug)]
    pub struct SetXAttr<'a> {
        pub arg: &'a abi::fuse_setxattr_in,
        pub name: &'a OsStr,
        pub value: &'a [u8],
    }
    #[derive(Debug)]
    pub struct GetXAttr<'a> {
        pub arg: &'a abi::fuse_getxattr_in,
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct ListXAttr<'a> {
        pub arg: &'a abi::fuse_getxattr_in,
    }
    #[derive(Debug)]
    pub struct RemoveXAttr<'a> {
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Flush<'a> {
        pub arg: &'a abi::fuse_flush_in,
    }
    #[derive(Debug)]
    pub struct Init<'a> {
        pub arg: &'a abi::fuse_init_in,
    }
    impl Init<'_> {
        pub fn version(&self) -> Version {
            Version(self.arg.major, self.arg.minor)
        }
        pub fn capabilities(&self) -> u32 {
            self.arg.flags
        }
        pub fn max_readahead(&self) -> u32 {
            self.arg.max_readahead
        }
    }
    #[derive(Debug)]
    pub struct OpenDir<'a> {
        pub arg: &'a abi::fuse_open_in,
    }
    #[derive(Debug)]
    pub struct ReadDir<'a> {
        pub arg: &'a abi::fuse_read_in,
    }
    #[derive(Debug)]
    pub struct ReleaseDir<'a> {
        pub arg: &'a abi::fuse_release_in,
    }
    #[derive(Debug)]
    pub struct FSyncDir<'a> {
        pub arg: &'a abi::fuse_fsync_in,
    }
    impl FSyncDir<'_> {
        pub fn fdatasync(&self) -> bool {
            self.arg.fsync_flags & 1 != 0
        }
    }
    #[derive(Debug)]
    pub struct GetLk<'a> {
        pub arg: &'a abi::fuse_lk_in,
    }
    #[derive(Debug)]
    pub struct SetLk<'a> {
        pub arg: &'a abi::fuse_lk_in,
    }
    #[derive(Debug)]
    pub struct SetLkW<'a> {
        pub arg: &'a abi::fuse_lk_in,
    }
    #[derive(Debug)]
    pub struct Access<'a> {
        pub arg: &'a abi::fuse_access_in,
    }
    #[derive(Debug)]
    pub struct Create<'a> {
        pub arg: &'a abi::fuse_create_in,
        pub name: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Interrupt<'a> {
        pub arg: &'a abi::fuse_interrupt_in,
    }
    #[derive(Debug)]
    pub struct BMap<'a> {
        pub arg: &'a abi::fuse_bmap_in,
    }
    #[derive(Debug)]
    pub struct Destroy;
    #[derive(Debug)]
    pub struct FAllocate<'a> {
        pub arg: &'a abi::fuse_fallocate_in,
    }
    #[derive(Debug)]
    pub struct NotifyReply<'a> {
        pub arg: &'a abi::fuse_notify_retrieve_in,
        pub data: &'a [u8],
    }
}
use op::*;

/// Filesystem operation (and arguments) the kernel driver wants us to perform.
#[derive(Debug)]
pub(crate) enum Operation<'a> {
    Lookup(Lookup<'a>),
    Forget(Forget<'a>),
    BatchForget(BatchForget<'a>),
    GetAttr(GetAttr<'a>),
    SetAttr(SetAttr<'a>),
    ReadLink(ReadLink),
    SymLink(SymLink<'a>),
    MkNod(MkNod<'a>),
    MkDir(MkDir<'a>),
    Unlink(Unlink<'a>),
    RmDir(RmDir<'a>),
    Rename(Rename<'a>),
    Link(Link<'a>),
    Open(Open<'a>),
    Read(Read<'a>),
    Write(Write<'a>),
    StatFs(StatFs),
    Release(Release<'a>),
    FSync(FSync<'a>),
    SetXAttr(SetXAttr<'a>),
    GetXAttr(GetXAttr<'a>),
    ListXAttr(ListXAttr<'a>),
    RemoveXAttr(RemoveXAttr<'a>),
    Flush(Flush<'a>),
    Init(Init<'a>),
    OpenDir(OpenDir<'a>),
    ReadDir(ReadDir<'a>),
    ReleaseDir(ReleaseDir<'a>),
    FSyncDir(FSyncDir<'a>),
    GetLk(GetLk<'a>),
    SetLk(SetLk<'a>),
    SetLkW(SetLkW<'a>),
    Access(Access<'a>),
    Create(Create<'a>),
    Interrupt(Interrupt<'a>),
    BMap(BMap<'a>),
    Destroy(Destroy),
    FAllocate(FAllocate<'a>),
    NotifyReply(NotifyReply<'a>),
}

impl fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Lookup(x) => write!(f, "LOOKUP name {:?}", x.name),
            Operation::Forget(x) => write!(f, "FORGET nlookup {}", x.arg.nlookup),
            Operation::BatchForget(x) => write!(f, "BATCH_FORGET nodes {}", x.nodes.len()),
            Operation::GetAttr(_) => write!(f, "GETATTR"),
            Operation::SetAttr(x) => write!(f, "SETATTR valid {:#x}", x.arg.valid),
            Operation::ReadLink(_) => write!(f, "READLINK"),
            Operation::SymLink(x) => {
                write!(f, "SYMLINK name {:?}, target {:?}", x.name, x.target)
            }
            Operation::MkNod(x) => write!(
                f,
                "MKNOD name {:?}, mode {:#05o}, rdev {}",
                x.name, x.arg.mode, x.arg.rdev
            ),
            Operation::MkDir(x) => write!(f, "MKDIR name {:?}, mode {:#05o}", x.name, x.arg.mode),
            Operation::Unlink(x) => write!(f, "UNLINK name {:?}", x.name),
            Operation::RmDir(x) => write!(f, "RMDIR name {:?}", x.name),
            Operation::Rename(x) => write!(
                f,
                "RENAME name {:?}, newdir {:#018x}, newname {:?}, flags {:#x}",
                x.name, x.newdir, x.newname, x.flags
            ),
            Operation::Link(x) => {
                write!(f, "LINK name {:?}, oldnodeid {:#018x}", x.name, x.arg.oldnodeid)
            }
            Operation::Open(x) => write!(f, "OPEN flags {:#x}", x.arg.flags),
            Operation::Read(x) => write!(
                f,
                "READ fh {}, offset {}, size {}",
                x.arg.fh, x.arg.offset, x.arg.size
            ),
            Operation::Write(x) => write!(
                f,
                "WRITE fh {}, offset {}, size {}, write flags {:#x}",
                x.arg.fh, x.arg.offset, x.arg.size, x.arg.write_flags
            ),
            Operation::StatFs(_) => write!(f, "STATFS"),
            Operation::Release(x) => write!(
                f,
                "RELEASE fh {}, flags {:#x}, release flags {:#x}",
                x.arg.fh, x.arg.flags, x.arg.release_flags
            ),
            Operation::FSync(x) => {
                write!(f, "FSYNC fh {}, fsync flags {:#x}", x.arg.fh, x.arg.fsync_flags)
            }
            Operation::SetXAttr(x) => write!(
                f,
                "SETXATTR name {:?}, size {}, flags {:#x}",
                x.name, x.arg.size, x.arg.flags
            ),
            Operation::GetXAttr(x) => write!(f, "GETXATTR name {:?}, size {}", x.name, x.arg.size),
            Operation::ListXAttr(x) => write!(f, "LISTXATTR size {}", x.arg.size),
            Operation::RemoveXAttr(x) => write!(f, "REMOVEXATTR name {:?}", x.name),
            Operation::Flush(x) => {
                write!(f, "FLUSH fh {}, lock owner {}", x.arg.fh, x.arg.lock_owner)
            }
            Operation::Init(x) => write!(
                f,
                "INIT kernel ABI {}.{}, flags {:#x}, max readahead {}",
                x.arg.major, x.arg.minor, x.arg.flags, x.arg.max_readahead
            ),
            Operation::OpenDir(x) => write!(f, "OPENDIR flags {:#x}", x.arg.flags),
            Operation::ReadDir(x) => write!(
                f,
                "READDIR fh {}, offset {}, size {}",
                x.arg.fh, x.arg.offset, x.arg.size
            ),
            Operation::ReleaseDir(x) => {
                write!(f, "RELEASEDIR fh {}, flags {:#x}", x.arg.fh, x.arg.flags)
            }
            Operation::FSyncDir(x) => {
                write!(f, "FSYNCDIR fh {}, fsync flags {:#x}", x.arg.fh, x.arg.fsync_flags)
            }
            Operation::GetLk(x) => write!(f, "GETLK fh {}, lock owner {}", x.arg.fh, x.arg.owner),
            Operation::SetLk(x) => write!(f, "SETLK fh {}, lock owner {}", x.arg.fh, x.arg.owner),
            Operation::SetLkW(x) => write!(f, "SETLKW fh {}, lock owner {}", x.arg.fh, x.arg.owner),
            Operation::Access(x) => write!(f, "ACCESS mask {:#05o}", x.arg.mask),
            Operation::Create(x) => write!(
                f,
                "CREATE name {:?}, mode {:#05o}, flags {:#x}",
                x.name, x.arg.mode, x.arg.flags
            ),
            Operation::Interrupt(x) => write!(f, "INTERRUPT unique {}", x.arg.unique),
            Operation::BMap(x) => {
                write!(f, "BMAP blocksize {}, block {}", x.arg.blocksize, x.arg.block)
            }
            Operation::Destroy(_) => write!(f, "DESTROY"),
            Operation::FAllocate(x) => write!(
                f,
                "FALLOCATE fh {}, offset {}, length {}, mode {:#x}",
                x.arg.fh, x.arg.offset, x.arg.length, x.arg.mode
            ),
            Operation::NotifyReply(x) => write!(
                f,
                "NOTIFY_REPLY offset {}, size {}",
                x.arg.offset,
                x.data.len()
            ),
        }
    }
}

impl<'a> Operation<'a> {
    fn parse(opcode: fuse_opcode, data: &mut Arguments<'a>) -> Option<Self> {
        Some(match opcode {
            fuse_opcode::FUSE_LOOKUP => Operation::Lookup(Lookup {
                name: data.take_str()?,
            }),
            fuse_opcode::FUSE_FORGET => Operation::Forget(Forget { arg: data.take()? }),
            fuse_opcode::FUSE_BATCH_FORGET => {
                let arg: &abi::fuse_batch_forget_in = data.take()?;
                Operation::BatchForget(BatchForget {
                    nodes: data.take_slice(arg.count as usize)?,
                })
            }
            fuse_opcode::FUSE_GETATTR => Operation::GetAttr(GetAttr { arg: data.take()? }),
            fuse_opcode::FUSE_SETATTR => Operation::SetAttr(SetAttr { arg: data.take()? }),
            fuse_opcode::FUSE_READLINK => Operation::ReadLink(ReadLink),
            fuse_opcode::FUSE_SYMLINK => Operation::SymLink(SymLink {
                name: data.take_str()?,
                target: data.take_str()?,
            }),
            fuse_opcode::FUSE_MKNOD => Operation::MkNod(MkNod {
                arg: data.take()?,
                name: data.take_str()?,
            }),
            fuse_opcode::FUSE_MKDIR => Operation::MkDir(MkDir {
                arg: data.take()?,
                name: data.take_str()?,
            }),
            fuse_opcode::FUSE_UNLINK => Operation::Unlink(Unlink {
                name: data.take_str()?,
            }),
            fuse_opcode::FUSE_RMDIR => Operation::RmDir(RmDir {
                name: data.take_str()?,
            }),
            fuse_opcode::FUSE_RENAME => {
                let arg: &abi::fuse_rename_in = data.take()?;
                Operation::Rename(Rename {
                    newdir: arg.newdir,
                    flags: 0,
                    name: data.take_str()?,
                    newname: data.take_str()?,
                })
            }
            fuse_opcode::FUSE_RENAME2 => {
                let arg: &abi::fuse_rename2_in = data.take()?;
                Operation::Rename(Rename {
                    newdir: arg.newdir,
                    flags: arg.flags,
                    name: data.take_str()?,
                    newname: data.take_str()?,
                })
            }
            fuse_opcode::FUSE_LINK => Operation::Link(Link {
                arg: data.take()?,
                name: data.take_str()?,
            }),
            fuse_opcode::FUSE_OPEN => Operation::Open(Open { arg: data.take()? }),
            fuse_opcode::FUSE_READ => Operation::Read(Read { arg: data.take()? }),
            fuse_opcode::FUSE_WRITE => Operation::Write(Write {
                arg: data.take()?,
                data: data.take_all(),
            }),
            fuse_opcode::FUSE_STATFS => Operation::StatFs(StatFs),
            fuse_opcode::FUSE_RELEASE => Operation::Release(Release { arg: data.take()? }),
            fuse_opcode::FUSE_FSYNC => Operation::FSync(FSync { arg: data.take()? }),
            fuse_opcode::FUSE_SETXATTR => Operation::SetXAttr(SetXAttr {
                arg: data.take()?,
                name: data.take_str()?,
                value: data.take_all(),
            }),
            fuse_opcode::FUSE_GETXATTR => Operation::GetXAttr(GetXAttr {
                arg: data.take()?,
                name: data.take_str()?,
            }),
            fuse_opcode::FUSE_LISTXATTR => Operation::ListXAttr(ListXAttr { arg: data.take()? }),
            fuse_opcode::FUSE_REMOVEXATTR => Operation::RemoveXAttr(RemoveXAttr {
                name: data.take_str()?,
            }),
            fuse_opcode::FUSE_FLUSH => Operation::Flush(Flush { arg: data.take()? }),
            fuse_opcode::FUSE_INIT => Operation::Init(Init { arg: data.take()? }),
            fuse_opcode::FUSE_OPENDIR => Operation::OpenDir(OpenDir { arg: data.take()? }),
            fuse_opcode::FUSE_READDIR => Operation::ReadDir(ReadDir { arg: data.take()? }),
            fuse_opcode::FUSE_RELEASEDIR => {
                Operation::ReleaseDir(ReleaseDir { arg: data.take()? })
            }
            fuse_opcode::FUSE_FSYNCDIR => Operation::FSyncDir(FSyncDir { arg: data.take()? }),
            fuse_opcode::FUSE_GETLK => Operation::GetLk(GetLk { arg: data.take()? }),
            fuse_opcode::FUSE_SETLK => Operation::SetLk(SetLk { arg: data.take()? }),
            fuse_opcode::FUSE_SETLKW => Operation::SetLkW(SetLkW { arg: data.take()? }),
            fuse_opcode::FUSE_ACCESS => Operation::Access(Access { arg: data.take()? }),
            fuse_opcode::FUSE_CREATE => Operation::Create(Create {
                arg: data.take()?,
                name: data.take_str()?,
            }),
            fuse_opcode::FUSE_INTERRUPT => Operation::Interrupt(Interrupt { arg: data.take()? }),
            fuse_opcode::FUSE_BMAP => Operation::BMap(BMap { arg: data.take()? }),
            fuse_opcode::FUSE_DESTROY => Operation::Destroy(Destroy),
            fuse_opcode::FUSE_FALLOCATE => Operation::FAllocate(FAllocate { arg: data.take()? }),
            fuse_opcode::FUSE_NOTIFY_REPLY => Operation::NotifyReply(NotifyReply {
                arg: data.take()?,
                data: data.take_all(),
            }),
        })
    }
}

/// Low-level request of a filesystem operation the kernel driver wants to perform.
#[derive(Debug)]
pub(crate) struct AnyRequest<'a> {
    header: &'a fuse_in_header,
    operation: Operation<'a>,
}

impl fmt::Display for AnyRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FUSE({:3}) ino {:#018x}: {}",
            self.header.unique, self.header.nodeid, self.operation
        )
    }
}

impl<'a> TryFrom<&'a [u8]> for AnyRequest<'a> {
    type Error = RequestError;

    fn try_from(data: &'a [u8]) -> Result<Self, Self::Error> {
        // Every request begins with a fuse_in_header followed by
        // opcode-dependent arguments.
        let data_len = data.len();
        let mut data = Arguments::new(data);
        let header: &fuse_in_header = data
            .take()
            .ok_or_else(|| RequestError::ShortReadHeader(data.remaining()))?;
        let opcode = fuse_opcode::try_from(header.opcode)
            .map_err(|_| RequestError::UnknownOperation(header.opcode))?;
        if data_len < header.len as usize {
            return Err(RequestError::ShortRead(data_len, header.len as usize));
        }
        let operation =
            Operation::parse(opcode, &mut data).ok_or(RequestError::InsufficientData)?;
        Ok(Self { header, operation })
    }
}

impl AnyRequest<'_> {
    /// The unique identifier of this request, assigned by the kernel.
    #[inline]
    pub fn unique(&self) -> RequestId {
        RequestId(self.header.unique)
    }

    /// The node id of the inode this request is targeted to.
    #[inline]
    pub fn nodeid(&self) -> INodeNo {
        INodeNo(self.header.nodeid)
    }

    #[inline]
    pub fn uid(&self) -> u32 {
        self.header.uid
    }

    #[inline]
    pub fn gid(&self) -> u32 {
        self.header.gid
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.header.pid
    }

    /// The filesystem operation (and its arguments) of this request.
    #[inline]
    pub fn operation(&self) -> &Operation<'_> {
        &self.operation
    }
}

impl op::GetLk<'_> {
    pub(crate) fn lock_owner(&self) -> LockOwner {
        LockOwner(self.arg.owner)
    }
}

impl op::SetLk<'_> {
    pub(crate) fn lock_owner(&self) -> LockOwner {
        LockOwner(self.arg.owner)
    }
}

impl op::SetLkW<'_> {
    pub(crate) fn lock_owner(&self) -> LockOwner {
        LockOwner(self.arg.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test::AlignedData;
    use super::*;

    // A body laid out like a real opcode's: a fixed struct, then a
    // NUL-terminated name, then trailing payload bytes.
    const ARG_DATA: AlignedData<[u8; 14]> = AlignedData([
        0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, // fixed struct
        0x66, 0x6f, 0x6f, 0x00, // "foo\0"
        0xde, 0xad, // payload
    ]);

    #[repr(C)]
    #[derive(FromBytes, KnownLayout, Immutable)]
    struct TwoWords {
        lo: u32,
        hi: u32,
    }

    #[test]
    fn arguments_walk_struct_name_and_payload() {
        let mut args = Arguments::new(&*ARG_DATA);
        let fixed: &TwoWords = args.take().unwrap();
        assert_eq!(fixed.lo, 0x4433_2211);
        assert_eq!(fixed.hi, 0x8877_6655);
        assert_eq!(args.take_str().unwrap(), OsStr::new("foo"));
        assert_eq!(args.take_all(), [0xde, 0xad]);
        assert_eq!(args.remaining(), 0);
    }

    #[test]
    fn arguments_out_of_data() {
        let mut args = Arguments::new(&*ARG_DATA);
        args.take::<u64>().unwrap();
        // 6 bytes left: too short for another u64. A failed take
        // consumes nothing.
        assert!(args.take::<u64>().is_none());
        assert_eq!(args.remaining(), 6);
        args.take_str().unwrap();
        // No NUL remains in the 2 payload bytes.
        assert!(args.take_str().is_none());
        assert_eq!(args.remaining(), 2);
    }

    const INIT_REQUEST: AlignedData<[u8; 56]> = AlignedData([
        0x38, 0x00, 0x00, 0x00, 0x1a, 0x00, 0x00, 0x00, // len, opcode
        0x0d, 0xf0, 0xad, 0xba, 0xef, 0xbe, 0xad, 0xde, // unique
        0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // nodeid
        0x0d, 0xd0, 0x01, 0xc0, 0xfe, 0xca, 0x01, 0xc0, // uid, gid
        0x5e, 0xba, 0xde, 0xc0, 0x00, 0x00, 0x00, 0x00, // pid, padding
        0x07, 0x00, 0x00, 0x00, 0x17, 0x00, 0x00, 0x00, // major, minor
        0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // max_readahead, flags
    ]);

    const MKNOD_REQUEST: AlignedData<[u8; 64]> = AlignedData([
        0x40, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, // len, opcode
        0x0d, 0xf0, 0xad, 0xba, 0xef, 0xbe, 0xad, 0xde, // unique
        0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // nodeid
        0x0d, 0xd0, 0x01, 0xc0, 0xfe, 0xca, 0x01, 0xc0, // uid, gid
        0x5e, 0xba, 0xde, 0xc0, 0x00, 0x00, 0x00, 0x00, // pid, padding
        0xa4, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // mode, rdev
        0xed, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // umask, padding
        0x66, 0x6f, 0x6f, 0x2e, 0x74, 0x78, 0x74, 0x00, // name
    ]);

    #[test]
    fn short_read_header() {
        match AnyRequest::try_from(&INIT_REQUEST[..20]) {
            Err(RequestError::ShortReadHeader(20)) => (),
            _ => panic!("Unexpected request parsing result"),
        }
    }

    #[test]
    fn short_read() {
        match AnyRequest::try_from(&INIT_REQUEST[..48]) {
            Err(RequestError::ShortRead(48, 56)) => (),
            _ => panic!("Unexpected request parsing result"),
        }
    }

    #[test]
    fn unknown_opcode() {
        let mut raw = INIT_REQUEST.0;
        raw[4] = 0xff;
        // Copy into an aligned container before parsing.
        let raw = AlignedData(raw);
        match AnyRequest::try_from(&raw[..]) {
            Err(RequestError::UnknownOperation(0xff)) => (),
            _ => panic!("Unexpected request parsing result"),
        }
    }

    #[test]
    fn init() {
        let req = AnyRequest::try_from(&INIT_REQUEST[..]).unwrap();
        assert_eq!(req.header.len, 56);
        assert_eq!(req.header.opcode, 26);
        assert_eq!(req.unique(), RequestId(0xdead_beef_baad_f00d));
        assert_eq!(req.nodeid(), INodeNo(0x1122_3344_5566_7788));
        assert_eq!(req.uid(), 0xc001_d00d);
        assert_eq!(req.gid(), 0xc001_cafe);
        assert_eq!(req.pid(), 0xc0de_ba5e);
        match req.operation() {
            Operation::Init(x) => {
                assert_eq!(x.version(), Version(7, 23));
                assert_eq!(x.max_readahead(), 4096);
            }
            _ => panic!("Unexpected request operation"),
        }
    }

    #[test]
    fn mknod() {
        let req = AnyRequest::try_from(&MKNOD_REQUEST[..]).unwrap();
        assert_eq!(req.header.len, 64);
        assert_eq!(req.header.opcode, 8);
        match req.operation() {
            Operation::MkNod(x) => {
                assert_eq!(x.arg.mode, 0o644);
                assert_eq!(x.arg.umask, 0o755);
                assert_eq!(x.name, OsStr::new("foo.txt"));
            }
            _ => panic!("Unexpected request operation"),
        }
    }
}
