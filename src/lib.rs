//! Tree-of-nodes FUSE framework.
//!
//! treefuse speaks the kernel's FUSE protocol on `/dev/fuse` and
//! presents filesystem authors with a tree of [`Node`] objects instead
//! of the raw opcode surface. The crate owns the hard parts: the
//! bit-exact wire codec, the worker pool with interrupt correlation,
//! the reference-counted inode table whose lookup counts mirror the
//! kernel's view, the open-handle registry, and the notification
//! channel with its ordering rules.
//!
//! A minimal filesystem materializes its tree up front:
//!
//! ```no_run
//! use treefuse::{MemDir, MemFile, Options, StableAttr, Tree, mount};
//!
//! let options = Options {
//!     on_add: Some(Box::new(|tree: &Tree| {
//!         let file = tree.new_persistent_inode(
//!             MemFile::with_content("hello world\n"),
//!             StableAttr::file(),
//!         );
//!         tree.add_child(&tree.root(), "hello.txt".as_ref(), file, false)
//!             .unwrap();
//!     })),
//!     ..Options::default()
//! };
//! mount(MemDir::new(0o755), "/mnt/hello".as_ref(), options).unwrap();
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![allow(clippy::too_many_arguments)]

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use crate::ll::fuse_abi::consts;
pub use crate::ll::fuse_abi::{FopenFlags, InitFlags, RenameFlags};
pub use crate::ll::{
    Errno, FileHandleId, Generation, INodeNo, Lock, LockOwner, RequestId, TimeOrNow, Version,
};
pub use crate::memfs::{MemDir, MemFile};
pub use crate::mnt::MountOption;
pub use crate::node::{
    AttrOut, Context, DefaultFileHandle, DirEntry, DirStream, Entry, FileAttr, FileHandle,
    FileType, Node, SetAttrRequest, StableAttr, Statfs,
};
pub use crate::notify::{Notifier, RetrieveReply};
pub use crate::session::{BackgroundSession, Negotiated, Session};
pub use crate::tree::{Inode, Tree};

mod bridge;
mod channel;
mod dispatch;
mod ll;
mod memfs;
mod mnt;
mod node;
mod notify;
mod session;
mod tree;

/// TTL sentinel meaning "cache indefinitely".
pub const TTL_FOREVER: Duration = Duration::from_secs(u64::MAX);

/// Session configuration.
///
/// The TTLs are the defaults stamped on replies; nodes can override
/// them per reply through [`Entry`] and [`AttrOut`]. A TTL of zero
/// means "do not cache", [`TTL_FOREVER`] means "cache indefinitely".
pub struct Options {
    /// How long the kernel may cache name→inode bindings.
    pub entry_timeout: Duration,
    /// How long the kernel may cache attributes.
    pub attr_timeout: Duration,
    /// How long the kernel may cache the absence of a name. Zero turns
    /// negative caching off and lookups of missing names fail ENOENT.
    pub negative_timeout: Duration,
    /// Trace every decoded request and reply status.
    pub debug: bool,
    /// Allow all users to access the mount.
    pub allow_other: bool,
    /// Allow root in addition to the mounting user.
    pub allow_root: bool,
    /// Let the kernel enforce permissions from the mode bits.
    pub default_permissions: bool,
    /// Mount read-only; mutating operations fail EROFS before reaching
    /// the nodes.
    pub read_only: bool,
    /// Maximum size of one WRITE request, negotiated at INIT.
    pub max_write: u32,
    /// Maximum read size, passed as a mount option (0 = kernel
    /// default).
    pub max_read: u32,
    /// Maximum readahead, negotiated at INIT.
    pub max_readahead: u32,
    /// Maximum number of worker threads. The pool starts with one
    /// reader and grows on demand whenever the last idle worker picks
    /// up a request, so FORGET/INTERRUPT traffic keeps a reader even
    /// while node callbacks are busy.
    pub worker_limit: usize,
    /// Automatically unmount when the process exits (needs the
    /// fusermount helper).
    pub auto_unmount: bool,
    /// Name of the filesystem source shown in mtab.
    pub fs_name: String,
    /// Hook run once after the handshake, before the kernel can look
    /// anything up; used to materialize initial children.
    pub on_add: Option<Box<dyn FnOnce(&Tree) + Send>>,
    /// Callback receiving the data the kernel hands back for
    /// [`Notifier::retrieve`] requests.
    pub on_retrieve: Option<Box<dyn Fn(RetrieveReply) + Send + Sync>>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            entry_timeout: Duration::from_secs(1),
            attr_timeout: Duration::from_secs(1),
            negative_timeout: Duration::ZERO,
            debug: false,
            allow_other: false,
            allow_root: false,
            default_permissions: false,
            read_only: false,
            max_write: 128 * 1024,
            max_read: 0,
            max_readahead: 128 * 1024,
            worker_limit: 10,
            auto_unmount: false,
            fs_name: "treefuse".to_string(),
            on_add: None,
            on_retrieve: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("entry_timeout", &self.entry_timeout)
            .field("attr_timeout", &self.attr_timeout)
            .field("negative_timeout", &self.negative_timeout)
            .field("debug", &self.debug)
            .field("allow_other", &self.allow_other)
            .field("allow_root", &self.allow_root)
            .field("default_permissions", &self.default_permissions)
            .field("read_only", &self.read_only)
            .field("max_write", &self.max_write)
            .field("max_read", &self.max_read)
            .field("max_readahead", &self.max_readahead)
            .field("worker_limit", &self.worker_limit)
            .field("auto_unmount", &self.auto_unmount)
            .field("fs_name", &self.fs_name)
            .field("on_add", &self.on_add.as_ref().map(|_| ".."))
            .field("on_retrieve", &self.on_retrieve.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Mount `root` at `mountpoint` and serve until the filesystem is
/// unmounted.
///
/// # Errors
/// Returns an error if the mount cannot be established, and any
/// terminal channel error when the session comes to an end.
pub fn mount(root: Arc<dyn Node>, mountpoint: &Path, options: Options) -> io::Result<()> {
    Session::new(root, mountpoint, options)?.run()
}

/// Mount `root` at `mountpoint` and serve on a background thread.
/// Dropping the returned handle unmounts the filesystem.
///
/// # Errors
/// Returns an error if the mount cannot be established.
pub fn spawn_mount(
    root: Arc<dyn Node>,
    mountpoint: &Path,
    options: Options,
) -> io::Result<BackgroundSession> {
    Session::new(root, mountpoint, options)?.spawn()
}
