//! Server-initiated notifications.
//!
//! Notifications share the device with replies but carry `unique == 0`.
//! Sends take the write side of the session's notification gate, so an
//! entry invalidation can never slip between a LOOKUP request and the
//! reply that establishes the entry. Once the session is draining, all
//! sends report the session as gone.

use std::ffi::OsStr;
use std::io;
use std::sync::Arc;

use crate::channel::ChannelSender;
use crate::ll::INodeNo;
use crate::ll::notify::Notification;
use crate::session::SessionShared;

/// Data handed back by the kernel in response to a
/// [`Notifier::retrieve`] call.
#[derive(Debug)]
pub struct RetrieveReply {
    /// The unique returned by the `retrieve` that requested this data.
    pub unique: u64,
    /// The inode the data belongs to.
    pub ino: INodeNo,
    /// Offset of the data in the file.
    pub offset: u64,
    /// The cached bytes.
    pub data: Vec<u8>,
}

/// A handle for sending notifications into the kernel. Cheap to clone;
/// usable from any thread, including node implementations outside
/// their lookup-family handlers.
#[derive(Clone)]
pub struct Notifier {
    shared: Arc<SessionShared>,
    sender: ChannelSender,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("sender", &self.sender)
            .finish()
    }
}

impl Notifier {
    pub(crate) fn new(shared: Arc<SessionShared>, sender: ChannelSender) -> Notifier {
        Notifier { shared, sender }
    }

    /// Drop the kernel's data cache for a byte range of an inode. A
    /// `len` of 0 invalidates to the end of the file.
    pub fn inval_inode(&self, ino: INodeNo, offset: i64, len: i64) -> io::Result<()> {
        self.send(&Notification::new_inval_inode(ino, offset, len))
    }

    /// Drop the kernel's cached lookup of `name` under `parent`.
    /// Sending the same invalidation twice is harmless.
    pub fn inval_entry(&self, parent: INodeNo, name: &OsStr) -> io::Result<()> {
        let notification = Notification::new_inval_entry(parent, name).map_err(too_big)?;
        self.send(&notification)
    }

    /// Combined unlink notification: drops the cached entry and tells
    /// inotify watchers the file is gone.
    pub fn delete(&self, parent: INodeNo, child: INodeNo, name: &OsStr) -> io::Result<()> {
        let notification = Notification::new_delete(parent, child, name).map_err(too_big)?;
        self.send(&notification)
    }

    /// Push data into the kernel's page cache for an inode.
    pub fn store(&self, ino: INodeNo, offset: u64, data: &[u8]) -> io::Result<()> {
        let notification = Notification::new_store(ino, offset, data).map_err(too_big)?;
        self.send(&notification)
    }

    /// Ask the kernel for a range of its cached data back. The data
    /// arrives later through the session's `on_retrieve` callback,
    /// tagged with the returned unique.
    pub fn retrieve(&self, ino: INodeNo, offset: u64, size: u32) -> io::Result<u64> {
        let unique = self.shared.next_retrieve_unique();
        self.send(&Notification::new_retrieve(ino, unique, offset, size))?;
        Ok(unique)
    }

    fn send(&self, notification: &Notification<'_>) -> io::Result<()> {
        if self.shared.is_destroyed() {
            return Err(session_gone());
        }
        // Exclusive against in-flight entry-producing replies.
        let _gate = self.shared.notify_gate.write();
        if self.shared.is_destroyed() {
            return Err(session_gone());
        }
        let result = notification
            .with_iovec(|iov| self.sender.send(iov))
            .map_err(too_big)?;
        match result {
            // ENOENT from the kernel is harmless for an invalidation:
            // it had already dropped the entry on its own.
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            x => x,
        }
    }
}

fn session_gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "FUSE session is gone")
}

fn too_big(err: std::num::TryFromIntError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("Data too large: {err}"))
}
