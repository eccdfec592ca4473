//! Reply assembly.
//!
//! A [`Response`] is the typed body of one reply frame. It is turned
//! into iovecs together with the out-header at send time, so the header
//! `len` always matches the byte count handed to the device in a single
//! write. The codec here is stateless per message and shared freely
//! between workers.

use std::convert::TryInto;
use std::ffi::OsStr;
use std::io::IoSlice;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use smallvec::{SmallVec, smallvec};
use zerocopy::{Immutable, IntoBytes, KnownLayout};

use super::fuse_abi as abi;
use super::fuse_abi::FopenFlags;
use super::{Errno, FileHandleId, Generation, INodeNo, Lock, RequestId};
use crate::node::{FileAttr, FileType};

const INLINE_DATA_THRESHOLD: usize = size_of::<u64>() * 4;
pub(crate) type ResponseBuf = SmallVec<[u8; INLINE_DATA_THRESHOLD]>;

#[derive(Debug)]
pub(crate) enum Response {
    Error(Option<Errno>),
    Data(ResponseBuf),
}

impl Response {
    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(
        &self,
        unique: RequestId,
        f: F,
    ) -> T {
        let datalen = match &self {
            Response::Error(_) => 0,
            Response::Data(v) => v.len(),
        };
        let header = abi::fuse_out_header {
            unique: unique.0,
            error: if let Response::Error(Some(errno)) = self {
                -errno.0.get()
            } else {
                0
            },
            len: (size_of::<abi::fuse_out_header>() + datalen)
                .try_into()
                .expect("Too much data"),
        };
        let mut v: SmallVec<[IoSlice<'_>; 3]> = smallvec![IoSlice::new(header.as_bytes())];
        match &self {
            Response::Error(_) => {}
            Response::Data(d) => v.push(IoSlice::new(d)),
        }
        f(&v)
    }

    // Constructors

    pub(crate) fn new_empty() -> Self {
        Self::Error(None)
    }

    pub(crate) fn new_error(error: Errno) -> Self {
        Self::Error(Some(error))
    }

    pub(crate) fn new_data<T: AsRef<[u8]> + Into<Vec<u8>>>(data: T) -> Self {
        Self::Data(if data.as_ref().len() <= INLINE_DATA_THRESHOLD {
            ResponseBuf::from_slice(data.as_ref())
        } else {
            ResponseBuf::from_vec(data.into())
        })
    }

    pub(crate) fn new_entry(
        ino: INodeNo,
        generation: Generation,
        attr: &FileAttr,
        attr_ttl: Duration,
        entry_ttl: Duration,
    ) -> Self {
        let d = abi::fuse_entry_out {
            nodeid: ino.0,
            generation: generation.0,
            entry_valid: entry_ttl.as_secs(),
            attr_valid: attr_ttl.as_secs(),
            entry_valid_nsec: entry_ttl.subsec_nanos(),
            attr_valid_nsec: attr_ttl.subsec_nanos(),
            attr: fuse_attr_from(attr),
        };
        Self::from_struct(&d)
    }

    /// A negative entry: node ID 0 with a non-zero TTL makes the kernel
    /// cache the absence of the name.
    pub(crate) fn new_negative_entry(entry_ttl: Duration) -> Self {
        let d = abi::fuse_entry_out {
            nodeid: 0,
            generation: 0,
            entry_valid: entry_ttl.as_secs(),
            attr_valid: 0,
            entry_valid_nsec: entry_ttl.subsec_nanos(),
            attr_valid_nsec: 0,
            attr: zeroed_attr(),
        };
        Self::from_struct(&d)
    }

    pub(crate) fn new_attr(ttl: &Duration, attr: &FileAttr) -> Self {
        let r = abi::fuse_attr_out {
            attr_valid: ttl.as_secs(),
            attr_valid_nsec: ttl.subsec_nanos(),
            dummy: 0,
            attr: fuse_attr_from(attr),
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_open(fh: FileHandleId, flags: FopenFlags) -> Self {
        let r = abi::fuse_open_out {
            fh: fh.0,
            open_flags: flags.bits(),
            padding: 0,
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_create(
        ino: INodeNo,
        generation: Generation,
        attr: &FileAttr,
        attr_ttl: Duration,
        entry_ttl: Duration,
        fh: FileHandleId,
        flags: FopenFlags,
    ) -> Self {
        let r = abi::fuse_create_out {
            entry: abi::fuse_entry_out {
                nodeid: ino.0,
                generation: generation.0,
                entry_valid: entry_ttl.as_secs(),
                attr_valid: attr_ttl.as_secs(),
                entry_valid_nsec: entry_ttl.subsec_nanos(),
                attr_valid_nsec: attr_ttl.subsec_nanos(),
                attr: fuse_attr_from(attr),
            },
            open: abi::fuse_open_out {
                fh: fh.0,
                open_flags: flags.bits(),
                padding: 0,
            },
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_write(written: u32) -> Self {
        let r = abi::fuse_write_out {
            size: written,
            padding: 0,
        };
        Self::from_struct(&r)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_statfs(
        blocks: u64,
        bfree: u64,
        bavail: u64,
        files: u64,
        ffree: u64,
        bsize: u32,
        namelen: u32,
        frsize: u32,
    ) -> Self {
        let r = abi::fuse_statfs_out {
            st: abi::fuse_kstatfs {
                blocks,
                bfree,
                bavail,
                files,
                ffree,
                bsize,
                namelen,
                frsize,
                padding: 0,
                spare: [0; 6],
            },
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_xattr_size(size: u32) -> Self {
        let r = abi::fuse_getxattr_out { size, padding: 0 };
        Self::from_struct(&r)
    }

    pub(crate) fn new_lock(lock: &Lock) -> Self {
        let r = abi::fuse_lk_out {
            lk: abi::fuse_file_lock {
                start: lock.range.0,
                end: lock.range.1,
                typ: lock.typ,
                pid: lock.pid,
            },
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_directory(list: DirEntList) -> Self {
        Self::Data(list.buf)
    }

    fn from_struct<T: IntoBytes + Immutable + KnownLayout + ?Sized>(data: &T) -> Self {
        Self::Data(ResponseBuf::from_slice(data.as_bytes()))
    }
}

pub(crate) fn time_from_system_time(t: &SystemTime) -> (i64, u32) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(before) => {
            let d = before.duration();
            if d.subsec_nanos() == 0 {
                (-(d.as_secs() as i64), 0)
            } else {
                (-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
            }
        }
    }
}

fn mode_from_kind_and_perm(kind: FileType, perm: u16) -> u32 {
    (match kind {
        FileType::NamedPipe => libc::S_IFIFO,
        FileType::CharDevice => libc::S_IFCHR,
        FileType::BlockDevice => libc::S_IFBLK,
        FileType::Directory => libc::S_IFDIR,
        FileType::RegularFile => libc::S_IFREG,
        FileType::Symlink => libc::S_IFLNK,
        FileType::Socket => libc::S_IFSOCK,
    }) as u32
        | perm as u32
}

fn fuse_attr_from(attr: &FileAttr) -> abi::fuse_attr {
    let (atime_secs, atime_nanos) = time_from_system_time(&attr.atime);
    let (mtime_secs, mtime_nanos) = time_from_system_time(&attr.mtime);
    let (ctime_secs, ctime_nanos) = time_from_system_time(&attr.ctime);
    abi::fuse_attr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: atime_secs,
        mtime: mtime_secs,
        ctime: ctime_secs,
        atimensec: atime_nanos,
        mtimensec: mtime_nanos,
        ctimensec: ctime_nanos,
        mode: mode_from_kind_and_perm(attr.kind, attr.perm),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        padding: 0,
    }
}

fn zeroed_attr() -> abi::fuse_attr {
    abi::fuse_attr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        atimensec: 0,
        mtimensec: 0,
        ctimensec: 0,
        mode: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 0,
        padding: 0,
    }
}

/// A growable buffer of directory entries, bounded by the size the
/// kernel asked for in the READDIR request.
#[derive(Debug)]
pub(crate) struct DirEntList {
    buf: ResponseBuf,
    max_size: usize,
}

impl DirEntList {
    pub(crate) fn new(max_size: usize) -> Self {
        DirEntList {
            buf: ResponseBuf::new(),
            max_size,
        }
    }

    /// Append one entry. `offset` is the cookie of the NEXT entry, per
    /// the kernel's readdir convention. Returns true when the buffer is
    /// full and the entry was not added.
    pub(crate) fn push(&mut self, ino: u64, offset: u64, kind: FileType, name: &OsStr) -> bool {
        let name = name.as_bytes();
        let entlen = size_of::<abi::fuse_dirent>() + name.len();
        let entsize = (entlen + size_of::<u64>() - 1) & !(size_of::<u64>() - 1);
        if self.buf.len() + entsize > self.max_size {
            return true;
        }
        let header = abi::fuse_dirent {
            ino,
            off: offset,
            namelen: name.len().try_into().expect("Name too long"),
            typ: mode_from_kind_and_perm(kind, 0) >> 12,
        };
        self.buf.extend_from_slice(header.as_bytes());
        self.buf.extend_from_slice(name);
        let padlen = entsize - entlen;
        self.buf.extend_from_slice(&[0u8; 8][..padlen]);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroI32;

    fn sample_attr() -> FileAttr {
        FileAttr {
            ino: 0x11,
            size: 0x22,
            blocks: 0x33,
            atime: UNIX_EPOCH + Duration::new(0x1234_5678, 0x5678_9012),
            mtime: UNIX_EPOCH + Duration::new(0x1234_5678, 0x5678_9012),
            ctime: UNIX_EPOCH + Duration::new(0x1234_5678, 0x5678_9012),
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 0x55,
            uid: 0x66,
            gid: 0x77,
            rdev: 0x88,
            blksize: 0xbb,
        }
    }

    fn serialized(response: &Response, unique: RequestId) -> Vec<u8> {
        response.with_iovec(unique, |iov| {
            iov.iter().flat_map(|s| s.iter().copied()).collect()
        })
    }

    #[test]
    fn reply_empty() {
        let bytes = serialized(&Response::new_empty(), RequestId(0xdeadbeef));
        let expected: [u8; 16] = [
            0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // len, error
            0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00, // unique
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn reply_error() {
        let errno = Errno(NonZeroI32::new(66).unwrap());
        let bytes = serialized(&Response::new_error(errno), RequestId(0xdeadbeef));
        let expected: [u8; 16] = [
            0x10, 0x00, 0x00, 0x00, 0xbe, 0xff, 0xff, 0xff, // len, error (-66)
            0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00, // unique
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn reply_header_len_matches_bytes() {
        let attr = sample_attr();
        for response in [
            Response::new_empty(),
            Response::new_data(vec![0xde, 0xad]),
            Response::new_attr(&Duration::from_secs(1), &attr),
            Response::new_entry(
                INodeNo(2),
                Generation(1),
                &attr,
                Duration::from_secs(1),
                Duration::from_secs(2),
            ),
            Response::new_write(7),
            Response::new_open(FileHandleId(9), FopenFlags::empty()),
            Response::new_xattr_size(5),
        ] {
            let bytes = serialized(&response, RequestId(1));
            let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
            assert_eq!(len as usize, bytes.len());
        }
    }

    #[test]
    fn reply_entry_sizes() {
        let attr = sample_attr();
        let bytes = serialized(
            &Response::new_entry(
                INodeNo(0x11),
                Generation(0xaa),
                &attr,
                Duration::new(0x8765_4321, 0x1234_5678),
                Duration::new(0x8765_4321, 0x1234_5678),
            ),
            RequestId(0xdeadbeef),
        );
        assert_eq!(bytes.len(), 16 + 128);
        // nodeid immediately follows the out header
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 0x11);
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 0xaa);
    }

    #[test]
    fn negative_entry_has_node_id_zero() {
        let bytes = serialized(
            &Response::new_negative_entry(Duration::from_secs(3)),
            RequestId(1),
        );
        assert_eq!(bytes.len(), 16 + 128);
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 0);
        // entry_valid carries the negative TTL
        assert_eq!(u64::from_le_bytes(bytes[32..40].try_into().unwrap()), 3);
    }

    #[test]
    fn dirent_list_padding_and_limit() {
        let mut list = DirEntList::new(4096);
        assert!(!list.push(1, 1, FileType::Directory, OsStr::new("hello")));
        // 24 byte header + 5 byte name padded to 32
        assert_eq!(list.buf.len(), 32);
        let mut small = DirEntList::new(24);
        assert!(small.push(1, 1, FileType::RegularFile, OsStr::new("name")));
        assert!(small.buf.is_empty());
    }
}
