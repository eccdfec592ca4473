//! Notification message encoding.
//!
//! Server-initiated messages share the device with replies but carry
//! `unique == 0` and a notification code in the error field. The name
//! payloads are sent with a trailing NUL, which the kernel reads as
//! `namelen + 1` bytes.

use std::convert::TryInto;
use std::ffi::OsStr;
use std::io::IoSlice;
use std::mem::size_of;
use std::num::TryFromIntError;
use std::os::unix::ffi::OsStrExt;

use smallvec::{SmallVec, smallvec};
use zerocopy::{Immutable, IntoBytes, KnownLayout};

use super::fuse_abi as abi;
use super::fuse_abi::fuse_notify_code;
use super::INodeNo;
use super::reply::ResponseBuf;

#[derive(Debug)]
pub(crate) struct Notification<'a> {
    code: fuse_notify_code,
    body: ResponseBuf,
    payload: &'a [u8],
}

impl<'a> Notification<'a> {
    pub(crate) fn new_inval_inode(ino: INodeNo, offset: i64, len: i64) -> Self {
        let out = abi::fuse_notify_inval_inode_out {
            ino: ino.0,
            off: offset,
            len,
        };
        Self::from_struct(fuse_notify_code::FUSE_NOTIFY_INVAL_INODE, &out, &[])
    }

    pub(crate) fn new_inval_entry(
        parent: INodeNo,
        name: &'a OsStr,
    ) -> Result<Self, TryFromIntError> {
        let out = abi::fuse_notify_inval_entry_out {
            parent: parent.0,
            namelen: name.as_bytes().len().try_into()?,
            padding: 0,
        };
        let mut n = Self::from_struct(fuse_notify_code::FUSE_NOTIFY_INVAL_ENTRY, &out, &[]);
        n.body.extend_from_slice(name.as_bytes());
        n.body.push(0);
        Ok(n)
    }

    pub(crate) fn new_delete(
        parent: INodeNo,
        child: INodeNo,
        name: &'a OsStr,
    ) -> Result<Self, TryFromIntError> {
        let out = abi::fuse_notify_delete_out {
            parent: parent.0,
            child: child.0,
            namelen: name.as_bytes().len().try_into()?,
            padding: 0,
        };
        let mut n = Self::from_struct(fuse_notify_code::FUSE_NOTIFY_DELETE, &out, &[]);
        n.body.extend_from_slice(name.as_bytes());
        n.body.push(0);
        Ok(n)
    }

    pub(crate) fn new_store(
        ino: INodeNo,
        offset: u64,
        data: &'a [u8],
    ) -> Result<Self, TryFromIntError> {
        let out = abi::fuse_notify_store_out {
            nodeid: ino.0,
            offset,
            size: data.len().try_into()?,
            padding: 0,
        };
        Ok(Self::from_struct(
            fuse_notify_code::FUSE_NOTIFY_STORE,
            &out,
            data,
        ))
    }

    pub(crate) fn new_retrieve(ino: INodeNo, notify_unique: u64, offset: u64, size: u32) -> Self {
        let out = abi::fuse_notify_retrieve_out {
            notify_unique,
            nodeid: ino.0,
            offset,
            size,
            padding: 0,
        };
        Self::from_struct(fuse_notify_code::FUSE_NOTIFY_RETRIEVE, &out, &[])
    }

    fn from_struct<T: IntoBytes + Immutable + KnownLayout>(
        code: fuse_notify_code,
        data: &T,
        payload: &'a [u8],
    ) -> Self {
        Notification {
            code,
            body: ResponseBuf::from_slice(data.as_bytes()),
            payload,
        }
    }

    /// Assemble the notification as iovecs. Notifications reuse the
    /// out-header with `unique = 0` and the code in the error field.
    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(
        &self,
        f: F,
    ) -> Result<T, TryFromIntError> {
        let header = abi::fuse_out_header {
            unique: 0,
            error: self.code as i32,
            len: (size_of::<abi::fuse_out_header>() + self.body.len() + self.payload.len())
                .try_into()?,
        };
        let mut v: SmallVec<[IoSlice<'_>; 3]> = smallvec![
            IoSlice::new(header.as_bytes()),
            IoSlice::new(&self.body),
        ];
        if !self.payload.is_empty() {
            v.push(IoSlice::new(self.payload));
        }
        Ok(f(&v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialized(n: &Notification<'_>) -> Vec<u8> {
        n.with_iovec(|iov| iov.iter().flat_map(|s| s.iter().copied()).collect())
            .unwrap()
    }

    #[test]
    fn inval_entry_layout() {
        let n = Notification::new_inval_entry(INodeNo(1), OsStr::new("file.txt")).unwrap();
        let bytes = serialized(&n);
        // header + parent/namelen/padding + name + NUL
        assert_eq!(bytes.len(), 16 + 16 + 9);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize, bytes.len());
        // notifications carry unique == 0
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 0);
        // code 3 in the error field
        assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 3);
        assert_eq!(&bytes[32..40], b"file.txt");
        assert_eq!(bytes[40], 0);
    }

    #[test]
    fn inval_entry_is_deterministic() {
        let a = serialized(&Notification::new_inval_entry(INodeNo(7), OsStr::new("x")).unwrap());
        let b = serialized(&Notification::new_inval_entry(INodeNo(7), OsStr::new("x")).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn store_layout() {
        let n = Notification::new_store(INodeNo(5), 4096, b"abcd").unwrap();
        let bytes = serialized(&n);
        assert_eq!(bytes.len(), 16 + 24 + 4);
        assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 4);
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 5);
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 4096);
        assert_eq!(u32::from_le_bytes(bytes[32..36].try_into().unwrap()), 4);
        assert_eq!(&bytes[40..44], b"abcd");
    }

    #[test]
    fn retrieve_layout() {
        let n = Notification::new_retrieve(INodeNo(9), 77, 0, 512);
        let bytes = serialized(&n);
        assert_eq!(bytes.len(), 16 + 32);
        assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 5);
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 77);
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 9);
    }
}
