//! Low-level kernel protocol layer.
//!
//! Everything in here is concerned with the bit-exact wire contract:
//! typed views over incoming request frames, reply and notification
//! assembly, and the small newtypes shared by both directions.

pub(crate) mod fuse_abi;
pub(crate) mod notify;
pub(crate) mod reply;
pub(crate) mod request;

use std::fmt;
use std::io;
use std::num::NonZeroI32;
use std::time::SystemTime;

/// A newtype for kernel-assigned node IDs. The root of the tree is
/// always [`INodeNo::ROOT`]; 0 is reserved on the wire for "no entry".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct INodeNo(pub u64);

impl INodeNo {
    /// The well-known node ID of the root inode.
    pub const ROOT: INodeNo = INodeNo(fuse_abi::FUSE_ROOT_ID);
}

impl fmt::Display for INodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<INodeNo> for u64 {
    fn from(v: INodeNo) -> u64 {
        v.0
    }
}

/// A newtype for file handles issued by the handle registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandleId(pub u64);

impl fmt::Display for FileHandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The per-request identifier chosen by the kernel. Used to correlate
/// interrupts and replies; 0 is the sentinel carried by notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Generation qualifier for retired node IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(pub u64);

/// A lock owner token as passed in flush/lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(pub u64);

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A FUSE protocol version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32);

impl Version {
    /// Major protocol version.
    pub fn major(&self) -> u32 {
        self.0
    }

    /// Minor protocol version.
    pub fn minor(&self) -> u32 {
        self.1
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

/// Either a specific time, or "now" as requested by `utimensat(2)`'s
/// `UTIME_NOW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    /// A specific point in time.
    SpecificTime(SystemTime),
    /// The instant the operation is applied.
    Now,
}

/// A byte-range lock as carried by getlk/setlk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    /// Locked byte range, inclusive start and end.
    pub range: (u64, u64),
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`.
    pub typ: i32,
    /// PID holding the lock (getlk replies only).
    pub pid: u32,
}

/// A POSIX errno as carried in reply headers (always positive here,
/// negated on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub NonZeroI32);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        $(
            #[allow(missing_docs)]
            pub const $name: Errno = match NonZeroI32::new(libc::$name) {
                Some(v) => Errno(v),
                None => unreachable!(),
            };
        )*
    };
}

impl Errno {
    errno_consts!(
        EPERM, ENOENT, EINTR, EIO, EAGAIN, EACCES, EBUSY, EEXIST, ENOTDIR, EISDIR, EINVAL, EFBIG,
        ENOSPC, EROFS, ENOSYS, ENOTEMPTY, ENAMETOOLONG, ENODEV, ENODATA, ERANGE, EPROTO, EXDEV,
        ENOTSUP, EBADF, ENOLCK,
    );

    /// The raw positive errno value.
    pub fn code(&self) -> i32 {
        self.0.get()
    }

    /// Build an errno from a raw value; nonpositive values degrade to
    /// `EIO` since the wire cannot express them.
    pub fn from_i32(code: i32) -> Errno {
        match NonZeroI32::new(code.abs()) {
            Some(v) => Errno(v),
            None => Errno::EIO,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Errno {
        match err.raw_os_error() {
            Some(code) => Errno::from_i32(code),
            None => Errno::EIO,
        }
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(err: nix::errno::Errno) -> Errno {
        Errno::from_i32(err as i32)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::ops::Deref;

    /// Force 8-byte alignment onto wire fixtures so zerocopy reference
    /// casts in the decode tests are valid.
    #[repr(align(8))]
    pub(crate) struct AlignedData<T>(pub T);

    impl<T> Deref for AlignedData<T> {
        type Target = T;
        fn deref(&self) -> &T {
            &self.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_from_io_error() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(Errno::from(err), Errno::ENOENT);
        let err = io::Error::new(io::ErrorKind::Other, "no raw errno");
        assert_eq!(Errno::from(err), Errno::EIO);
    }

    #[test]
    fn errno_degrades_to_eio() {
        assert_eq!(Errno::from_i32(0), Errno::EIO);
        assert_eq!(Errno::from_i32(-libc::ENOENT), Errno::ENOENT);
    }
}
