//! Filesystem session.
//!
//! A session runs a node tree while it is mounted: it owns the device
//! channel, the worker pool that reads and dispatches request frames,
//! the handshake state, and the ordered shutdown that runs when the
//! channel reports the mount is gone.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::bridge::{Bridge, CachePolicy};
use crate::channel::{Channel, DevFuse, ReadResult};
use crate::dispatch::Outcome;
use crate::ll::fuse_abi as abi;
use crate::ll::fuse_abi::InitFlags;
use crate::ll::{INodeNo, RequestId, Version};
use crate::mnt::{Mount, MountOption, check_option_conflicts};
use crate::node::{Context, Node};
use crate::notify::Notifier;
use crate::tree::Tree;
use crate::{Options, RetrieveReply};

/// The hard cap on a single write request. The kernel maximum is 16M.
pub(crate) const MAX_WRITE_SIZE: usize = 16 * 1024 * 1024;

/// Extra space beyond `max_write` for the header and write arguments of
/// the largest request frame.
const BUFFER_HEADROOM: usize = 4096;

/// Negotiation knobs fixed before INIT.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InitConfig {
    pub(crate) max_write: u32,
    pub(crate) max_readahead: u32,
    pub(crate) max_background: u16,
}

impl InitConfig {
    pub(crate) fn congestion_threshold(&self) -> u16 {
        // Default to 3/4 of the background queue like libfuse.
        self.max_background * 3 / 4
    }
}

/// State negotiated with the kernel at INIT time.
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    /// Agreed protocol version.
    pub proto: Version,
    /// Capabilities granted to the kernel.
    pub capabilities: u32,
    /// Agreed maximum readahead.
    pub max_readahead: u32,
    /// Agreed maximum write size.
    pub max_write: u32,
}

/// State shared between the workers, the notifier and the session
/// handle.
pub(crate) struct SessionShared {
    pub(crate) bridge: Bridge,
    pub(crate) debug: bool,
    pub(crate) config: InitConfig,
    pub(crate) init_lock: Mutex<()>,
    /// Entry-producing workers hold the read side from decode to reply;
    /// notifications take the write side.
    pub(crate) notify_gate: RwLock<()>,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    negotiated: Mutex<Option<Negotiated>>,
    interrupts: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    retrieve_unique: AtomicU64,
    on_add: Mutex<Option<Box<dyn FnOnce(&Tree) + Send>>>,
    on_retrieve: Option<Box<dyn Fn(RetrieveReply) + Send + Sync>>,
    /// The mount is surrendered here so any worker can trigger the
    /// teardown that wakes the others out of their device reads.
    mount: Mutex<Option<Mount>>,
}

impl SessionShared {
    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn set_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub(crate) fn complete_handshake(
        &self,
        proto: Version,
        capabilities: InitFlags,
        max_readahead: u32,
    ) {
        *self.negotiated.lock() = Some(Negotiated {
            proto,
            capabilities: capabilities.bits(),
            max_readahead,
            max_write: self.config.max_write,
        });
    }

    pub(crate) fn negotiated(&self) -> Option<Negotiated> {
        *self.negotiated.lock()
    }

    pub(crate) fn run_on_add(&self) {
        if let Some(hook) = self.on_add.lock().take() {
            hook(&self.bridge.tree);
        }
    }

    pub(crate) fn register_interrupt(&self, unique: RequestId) -> Arc<AtomicBool> {
        let token = Arc::new(AtomicBool::new(false));
        self.interrupts.lock().insert(unique.0, token.clone());
        token
    }

    pub(crate) fn deregister_interrupt(&self, unique: RequestId) {
        self.interrupts.lock().remove(&unique.0);
    }

    /// Signal the cancellation token of a live request, if any.
    pub(crate) fn interrupt(&self, target: RequestId) {
        if let Some(token) = self.interrupts.lock().get(&target.0) {
            token.store(true, Ordering::Release);
        }
    }

    pub(crate) fn next_retrieve_unique(&self) -> u64 {
        self.retrieve_unique.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn deliver_retrieve(
        &self,
        unique: RequestId,
        ino: INodeNo,
        offset: u64,
        data: &[u8],
    ) {
        match &self.on_retrieve {
            Some(callback) => callback(RetrieveReply {
                unique: unique.0,
                ino,
                offset,
                data: data.to_vec(),
            }),
            None => warn!("NOTIFY_REPLY for {ino} dropped: no on_retrieve callback"),
        }
    }

    /// Tear the mount down; safe to call from any worker and
    /// idempotent. Unblocks every worker stuck in a device read.
    pub(crate) fn teardown_mount(&self) {
        if let Some(mut mount) = self.mount.lock().take() {
            mount.unmount();
        }
    }
}

/// An active FUSE session over one mount.
pub struct Session {
    shared: Arc<SessionShared>,
    channel: Channel,
    mountpoint: Option<PathBuf>,
    worker_limit: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mountpoint", &self.mountpoint)
            .field("worker_limit", &self.worker_limit)
            .field("initialized", &self.shared.is_initialized())
            .finish()
    }
}

impl Session {
    /// Mount `root` at `mountpoint` and build the session around the
    /// acquired device.
    pub fn new(root: Arc<dyn Node>, mountpoint: &Path, options: Options) -> io::Result<Session> {
        let mount_options = options.mount_options();
        check_option_conflicts(&mount_options)?;
        let (device, mount) = Mount::new(mountpoint, &mount_options)?;
        let mountpoint = mount.mountpoint().to_path_buf();
        let mut session = Session::assemble(root, device, options, Some(mount));
        session.mountpoint = Some(mountpoint);
        Ok(session)
    }

    /// Build a session over an already-acquired device descriptor.
    /// Useful for driving the protocol over a socketpair in tests, or
    /// when the embedder performs the mount itself.
    pub fn from_fd(device: File, root: Arc<dyn Node>, options: Options) -> Session {
        Session::assemble(root, Arc::new(DevFuse(device)), options, None)
    }

    fn assemble(
        root: Arc<dyn Node>,
        device: Arc<DevFuse>,
        options: Options,
        mount: Option<Mount>,
    ) -> Session {
        let policy = CachePolicy {
            entry_ttl: options.entry_timeout,
            attr_ttl: options.attr_timeout,
            negative_ttl: options.negative_timeout,
        };
        let config = InitConfig {
            max_write: (options.max_write as usize).clamp(4096, MAX_WRITE_SIZE) as u32,
            max_readahead: options.max_readahead,
            max_background: 16,
        };
        let worker_limit = options.worker_limit.max(1);
        let shared = Arc::new(SessionShared {
            bridge: Bridge::new(Tree::new(root), policy, options.read_only),
            debug: options.debug,
            config,
            init_lock: Mutex::new(()),
            notify_gate: RwLock::new(()),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            negotiated: Mutex::new(None),
            interrupts: Mutex::new(HashMap::new()),
            retrieve_unique: AtomicU64::new(1),
            on_add: Mutex::new(options.on_add),
            on_retrieve: options.on_retrieve,
            mount: Mutex::new(mount),
        });
        Session {
            shared,
            channel: Channel::new(device),
            mountpoint: None,
            worker_limit,
        }
    }

    /// The mounted path, when this session performed the mount.
    pub fn mountpoint(&self) -> Option<&Path> {
        self.mountpoint.as_deref()
    }

    /// The inode tree, for materializing children before or during the
    /// session.
    pub fn tree(&self) -> Tree {
        self.shared.bridge.tree.clone()
    }

    /// A handle for sending server-initiated notifications.
    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.shared.clone(), self.channel.sender())
    }

    /// What the handshake agreed on, once INIT has happened.
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.shared.negotiated()
    }

    /// Run the session until the mount goes away. Like the libfuse
    /// multithreaded loop, the pool starts with one worker and grows on
    /// demand whenever the last idle worker picks up a request, up to
    /// `worker_limit` threads. FORGET frames never trigger growth.
    pub fn run(self) -> io::Result<()> {
        let pool = Arc::new(WorkerPool::new(self.worker_limit));
        let error_slot: Arc<Mutex<Option<io::Error>>> = Arc::new(Mutex::new(None));
        spawn_worker(&self.shared, &self.channel, &error_slot, &pool)?;

        // Wait for every worker, including ones spawned later, to exit.
        {
            let mut handles = pool.handles.lock();
            while pool.total.load(Ordering::Acquire) > 0 {
                pool.exited.wait(&mut handles);
            }
            for handle in handles.drain(..) {
                if handle.join().is_err() {
                    warn!("A session worker panicked");
                }
            }
        }
        // Ordered shutdown: the channel is gone, release what is left.
        self.shared.set_destroyed();
        let ctx = Context {
            uid: 0,
            gid: 0,
            pid: 0,
            interrupted: Arc::new(AtomicBool::new(false)),
        };
        self.shared.bridge.release_all(&ctx);
        self.shared.teardown_mount();
        if let Some(mountpoint) = &self.mountpoint {
            info!("Session on {} ended", mountpoint.display());
        }
        match error_slot.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run the session on a background thread, unmounting when the
    /// returned handle is dropped.
    pub fn spawn(self) -> io::Result<BackgroundSession> {
        let shared = self.shared.clone();
        let mountpoint = self.mountpoint.clone();
        let guard = thread::Builder::new()
            .name("treefuse-session".to_string())
            .spawn(move || self.run())?;
        Ok(BackgroundSession {
            shared,
            mountpoint,
            guard: Some(guard),
        })
    }
}

/// Bookkeeping for the on-demand worker pool.
struct WorkerPool {
    limit: usize,
    total: AtomicUsize,
    idle: AtomicUsize,
    next_id: AtomicUsize,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    exited: Condvar,
}

impl WorkerPool {
    fn new(limit: usize) -> WorkerPool {
        WorkerPool {
            limit,
            total: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
            exited: Condvar::new(),
        }
    }
}

/// Start one worker thread, reserving its pool slot up front.
fn spawn_worker(
    shared: &Arc<SessionShared>,
    channel: &Channel,
    error_slot: &Arc<Mutex<Option<io::Error>>>,
    pool: &Arc<WorkerPool>,
) -> io::Result<()> {
    let worker_id = pool.next_id.fetch_add(1, Ordering::Relaxed);
    pool.total.fetch_add(1, Ordering::SeqCst);
    let shared = shared.clone();
    let channel = channel.clone();
    let error_slot = error_slot.clone();
    let pool_ref = pool.clone();
    let result = thread::Builder::new()
        .name(format!("treefuse-worker-{worker_id}"))
        .spawn(move || {
            worker_loop(&shared, &channel, &error_slot, &pool_ref);
            // The count drops under the handles lock so the session's
            // wait loop cannot miss the final wakeup.
            {
                let _handles = pool_ref.handles.lock();
                pool_ref.total.fetch_sub(1, Ordering::SeqCst);
            }
            pool_ref.exited.notify_all();
        });
    match result {
        Ok(handle) => {
            pool.handles.lock().push(handle);
            debug!("Worker {worker_id} started");
            Ok(())
        }
        Err(err) => {
            pool.total.fetch_sub(1, Ordering::SeqCst);
            Err(err)
        }
    }
}

fn worker_loop(
    shared: &Arc<SessionShared>,
    channel: &Channel,
    error_slot: &Arc<Mutex<Option<io::Error>>>,
    pool: &Arc<WorkerPool>,
) {
    // One buffer per worker, reused across requests. Reads must land on
    // a header-aligned address for the zerocopy views.
    let buffer_size = shared.config.max_write as usize + BUFFER_HEADROOM;
    let mut buffer = vec![0u8; buffer_size + align_of::<abi::fuse_in_header>()];
    let buf = aligned_sub_buf(&mut buffer, align_of::<abi::fuse_in_header>());
    let sender = channel.sender();
    loop {
        if shared.is_destroyed() {
            return;
        }
        pool.idle.fetch_add(1, Ordering::Release);
        let read = channel.read_frame(buf);
        let prev_idle = pool.idle.fetch_sub(1, Ordering::Acquire);
        match read {
            Ok(ReadResult::Frame(size)) => {
                // We just took the last idle slot: grow the pool so a
                // slow node callback cannot starve the FORGET/INTERRUPT
                // stream of a reader. FORGETs are processed inline and
                // never block, so they do not warrant growth.
                if prev_idle <= 1
                    && shared.is_initialized()
                    && !is_forget_frame(&buf[..size])
                    && pool.total.load(Ordering::Acquire) < pool.limit
                {
                    if let Err(err) = spawn_worker(shared, channel, error_slot, pool) {
                        warn!("Failed to grow the worker pool: {err}");
                    }
                }
                match shared.dispatch_frame(&sender, &buf[..size]) {
                    Outcome::Continue => {}
                    Outcome::Shutdown => {
                        shared.set_destroyed();
                        shared.teardown_mount();
                        return;
                    }
                }
            }
            Ok(ReadResult::Retry) => continue,
            Ok(ReadResult::SessionGone) => {
                shared.set_destroyed();
                shared.teardown_mount();
                return;
            }
            Err(err) => {
                *error_slot.lock() = Some(err);
                shared.set_destroyed();
                shared.teardown_mount();
                return;
            }
        }
    }
}

/// Peek at a raw frame's opcode to see whether it is FORGET-family.
fn is_forget_frame(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    let opcode = u32::from_le_bytes(data[4..8].try_into().unwrap());
    opcode == abi::fuse_opcode::FUSE_FORGET as u32
        || opcode == abi::fuse_opcode::FUSE_BATCH_FORGET as u32
}

fn aligned_sub_buf(buf: &mut [u8], alignment: usize) -> &mut [u8] {
    let off = alignment - (buf.as_ptr() as usize) % alignment;
    if off == alignment {
        buf
    } else {
        &mut buf[off..]
    }
}

/// Handle to a session running on a background thread. Dropping it
/// unmounts the filesystem and joins the session.
pub struct BackgroundSession {
    shared: Arc<SessionShared>,
    /// Path of the mounted filesystem.
    pub mountpoint: Option<PathBuf>,
    guard: Option<thread::JoinHandle<io::Result<()>>>,
}

impl BackgroundSession {
    /// Unmount and wait for the session to finish.
    pub fn join(mut self) -> io::Result<()> {
        self.end()
    }

    fn end(&mut self) -> io::Result<()> {
        self.shared.set_destroyed();
        self.shared.teardown_mount();
        match self.guard.take() {
            Some(guard) => guard
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("session thread panicked"))),
            None => Ok(()),
        }
    }
}

impl Drop for BackgroundSession {
    fn drop(&mut self) {
        if self.guard.is_some() {
            if let Some(mountpoint) = &self.mountpoint {
                info!("Unmounting {}", mountpoint.display());
            }
            let _ = self.end();
        }
    }
}

impl std::fmt::Debug for BackgroundSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSession")
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}

impl Options {
    /// The kernel-facing mount options implied by this configuration.
    pub(crate) fn mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![MountOption::FSName(self.fs_name.clone()), MountOption::NoDev];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.allow_root {
            options.push(MountOption::AllowRoot);
        }
        if self.default_permissions {
            options.push(MountOption::DefaultPermissions);
        }
        if self.read_only {
            options.push(MountOption::RO);
        }
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        if self.max_read > 0 {
            options.push(MountOption::Custom(format!("max_read={}", self.max_read)));
        }
        options
    }
}
