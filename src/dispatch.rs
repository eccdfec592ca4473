//! Request dispatch.
//!
//! One decoded frame in, at most one reply out. FORGET, BATCH_FORGET,
//! NOTIFY_REPLY and honored interrupts emit nothing; everything else
//! answers exactly once. INTERRUPT is correlated through a map of
//! `unique` to cancellation tokens that workers check before I/O and
//! again before sending the reply. Panics inside node implementations
//! are caught here, logged, and converted to EIO without taking the
//! session down.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, warn};

use crate::bridge::{DispatchError, OpResult};
use crate::channel::ChannelSender;
use crate::ll::fuse_abi as abi;
use crate::ll::reply::Response;
use crate::ll::request::{AnyRequest, Operation, RequestError};
use crate::ll::{Errno, RequestId, Version};
use crate::node::Context;
use crate::session::SessionShared;

/// What the worker loop should do after a frame has been handled.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Continue,
    /// A protocol violation or fatal send error; the session must shut
    /// down in an orderly fashion.
    Shutdown,
}

impl SessionShared {
    /// Handle one raw frame read from the device.
    pub(crate) fn dispatch_frame(&self, sender: &ChannelSender, data: &[u8]) -> Outcome {
        let req = match AnyRequest::try_from(data) {
            Ok(req) => req,
            Err(RequestError::UnknownOperation(opcode)) => {
                // The unique is still intact in the header; tell the
                // kernel we will never implement this opcode.
                if let Some(unique) = raw_unique(data) {
                    self.send_reply(sender, unique, &Response::new_error(Errno::ENOSYS));
                } else {
                    warn!("Frame with unknown opcode {opcode} too short for a reply");
                    return Outcome::Shutdown;
                }
                return Outcome::Continue;
            }
            Err(err) => {
                // Short or malformed frames are fatal to the session.
                error!("Fatal protocol error: {err}");
                return Outcome::Shutdown;
            }
        };
        if self.debug {
            debug!("{req}");
        }
        self.dispatch_request(sender, &req)
    }

    fn dispatch_request(&self, sender: &ChannelSender, req: &AnyRequest<'_>) -> Outcome {
        let unique = req.unique();

        // INIT runs alone, before general dispatch begins.
        if let Operation::Init(x) = req.operation() {
            return self.handle_init(sender, unique, x);
        }
        if !self.is_initialized() {
            warn!("Ignoring FUSE operation before init: {req}");
            if expects_reply(req.operation()) {
                self.send_reply(sender, unique, &Response::new_error(Errno::EIO));
            }
            return Outcome::Continue;
        }

        match req.operation() {
            // The no-reply family.
            Operation::Forget(x) => {
                self.bridge.forget(req.nodeid(), x.arg.nlookup);
                return Outcome::Continue;
            }
            Operation::BatchForget(x) => {
                for node in x.nodes {
                    self.bridge
                        .forget(crate::ll::INodeNo(node.nodeid), node.nlookup);
                }
                return Outcome::Continue;
            }
            Operation::Interrupt(x) => {
                self.interrupt(RequestId(x.arg.unique));
                return Outcome::Continue;
            }
            Operation::NotifyReply(x) => {
                self.deliver_retrieve(unique, req.nodeid(), x.arg.offset, x.data);
                return Outcome::Continue;
            }
            Operation::Destroy(_) => {
                self.set_destroyed();
                self.send_reply(sender, unique, &Response::new_empty());
                return Outcome::Continue;
            }
            _ => {}
        }
        if self.is_destroyed() {
            warn!("Ignoring FUSE operation after destroy: {req}");
            self.send_reply(sender, unique, &Response::new_error(Errno::EIO));
            return Outcome::Continue;
        }

        let token = self.register_interrupt(unique);
        let ctx = Context {
            uid: req.uid(),
            gid: req.gid(),
            pid: req.pid(),
            interrupted: token.clone(),
        };

        // Entry-producing operations hold the read side of the
        // notification gate from here until the reply is on the wire,
        // so an entry invalidation can never overtake the reply that
        // established the entry.
        let gate = entry_producing(req.operation()).then(|| self.notify_gate.read());

        let outcome = if token.load(Ordering::Acquire) {
            // Interrupted before we started; honor it silently.
            Outcome::Continue
        } else {
            let result = catch_unwind(AssertUnwindSafe(|| self.run_operation(&ctx, req)));
            let result: OpResult = match result {
                Ok(result) => result,
                Err(panic) => {
                    error!("Node implementation panicked in {req}: {panic:?}");
                    Err(DispatchError::Errno(Errno::EIO))
                }
            };
            self.finish(sender, unique, &token, result)
        };
        drop(gate);
        self.deregister_interrupt(unique);
        outcome
    }

    fn finish(
        &self,
        sender: &ChannelSender,
        unique: RequestId,
        token: &Arc<AtomicBool>,
        result: OpResult,
    ) -> Outcome {
        // An honored interrupt suppresses the reply entirely.
        if token.load(Ordering::Acquire) {
            debug!("Request {unique} interrupted, suppressing reply");
            return Outcome::Continue;
        }
        match result {
            Ok(response) => {
                self.send_reply(sender, unique, &response);
                Outcome::Continue
            }
            Err(DispatchError::Errno(errno)) => {
                self.send_reply(sender, unique, &Response::new_error(errno));
                Outcome::Continue
            }
            Err(DispatchError::Violation(what)) => {
                error!("Protocol violation: {what}");
                self.send_reply(sender, unique, &Response::new_error(Errno::EIO));
                Outcome::Shutdown
            }
        }
    }

    fn run_operation(&self, ctx: &Context, req: &AnyRequest<'_>) -> OpResult {
        let bridge = &self.bridge;
        let id = req.nodeid();
        match req.operation() {
            Operation::Lookup(x) => bridge.lookup(ctx, id, x.name),
            Operation::GetAttr(x) => bridge.getattr(ctx, id, x),
            Operation::SetAttr(x) => bridge.setattr(ctx, id, x),
            Operation::ReadLink(_) => bridge.readlink(ctx, id),
            Operation::SymLink(x) => bridge.symlink(ctx, id, x),
            Operation::MkNod(x) => bridge.mknod(ctx, id, x),
            Operation::MkDir(x) => bridge.mkdir(ctx, id, x),
            Operation::Unlink(x) => bridge.unlink(ctx, id, x.name),
            Operation::RmDir(x) => bridge.rmdir(ctx, id, x.name),
            Operation::Rename(x) => bridge.rename(ctx, id, x),
            Operation::Link(x) => bridge.link(ctx, id, x),
            Operation::Open(x) => bridge.open(ctx, id, x),
            Operation::Read(x) => bridge.read(ctx, x),
            Operation::Write(x) => bridge.write(ctx, x),
            Operation::StatFs(_) => bridge.statfs(ctx, id),
            Operation::Release(x) => bridge.release(ctx, x),
            Operation::FSync(x) => bridge.fsync(ctx, x),
            Operation::SetXAttr(x) => bridge.setxattr(ctx, id, x),
            Operation::GetXAttr(x) => bridge.getxattr(ctx, id, x),
            Operation::ListXAttr(x) => bridge.listxattr(ctx, id, x),
            Operation::RemoveXAttr(x) => bridge.removexattr(ctx, id, x.name),
            Operation::Flush(x) => bridge.flush(ctx, x),
            Operation::OpenDir(_) => bridge.opendir(ctx, id),
            Operation::ReadDir(x) => bridge.readdir(ctx, x),
            Operation::ReleaseDir(x) => bridge.releasedir(ctx, x),
            Operation::FSyncDir(x) => bridge.fsyncdir(ctx, x),
            Operation::GetLk(x) => bridge.getlk(ctx, id, x),
            Operation::SetLk(x) => {
                bridge.setlk(ctx, id, x.arg.fh, x.lock_owner(), &x.arg.lk, false)
            }
            Operation::SetLkW(x) => {
                bridge.setlk(ctx, id, x.arg.fh, x.lock_owner(), &x.arg.lk, true)
            }
            Operation::Access(x) => bridge.access(ctx, id, x),
            Operation::Create(x) => bridge.create(ctx, id, x),
            Operation::BMap(_) => Err(Errno::ENOSYS.into()),
            Operation::FAllocate(x) => bridge.fallocate(ctx, x),
            // Handled before we get here.
            Operation::Init(_)
            | Operation::Forget(_)
            | Operation::BatchForget(_)
            | Operation::Interrupt(_)
            | Operation::NotifyReply(_)
            | Operation::Destroy(_) => Err(Errno::EIO.into()),
        }
    }

    fn handle_init(
        &self,
        sender: &ChannelSender,
        unique: RequestId,
        x: &crate::ll::request::op::Init<'_>,
    ) -> Outcome {
        // A single reserved path: the first INIT wins, any duplicate is
        // answered from the already-negotiated state.
        let _guard = self.init_lock.lock();
        if self.is_initialized() {
            warn!("Duplicate INIT, renegotiating is not supported");
            self.send_reply(sender, unique, &Response::new_error(Errno::EIO));
            return Outcome::Continue;
        }
        let kernel = x.version();
        if kernel < Version(7, 6) {
            error!("Unsupported FUSE ABI version {kernel}");
            self.send_reply(sender, unique, &Response::new_error(Errno::EPROTO));
            return Outcome::Shutdown;
        }
        let negotiated = Version(
            abi::FUSE_KERNEL_VERSION,
            kernel.minor().min(abi::FUSE_KERNEL_MINOR_VERSION),
        );
        let capabilities = abi::InitFlags::from_bits_truncate(x.capabilities());
        let granted = capabilities
            & (abi::InitFlags::FUSE_ASYNC_READ
                | abi::InitFlags::FUSE_BIG_WRITES
                | abi::InitFlags::FUSE_ATOMIC_O_TRUNC
                | abi::InitFlags::FUSE_AUTO_INVAL_DATA);
        let max_readahead = x.max_readahead().min(self.config.max_readahead);
        let init = abi::fuse_init_out {
            major: negotiated.major(),
            minor: negotiated.minor(),
            max_readahead,
            flags: granted.bits(),
            max_background: self.config.max_background,
            congestion_threshold: self.config.congestion_threshold(),
            max_write: self.config.max_write,
            time_gran: 1,
            reserved: [0; 9],
        };
        debug!(
            "INIT response: ABI {}.{}, flags {:#x}, max readahead {}, max write {}",
            init.major, init.minor, init.flags, init.max_readahead, init.max_write
        );
        self.complete_handshake(negotiated, granted, max_readahead);
        // Materialize initial children before the kernel can look
        // anything up, and open the gate before the reply: the kernel
        // may dispatch follow-up requests to sibling workers as soon as
        // the reply lands.
        self.run_on_add();
        self.set_initialized();
        use zerocopy::IntoBytes;
        self.send_reply(sender, unique, &Response::new_data(init.as_bytes()));
        Outcome::Continue
    }

    fn send_reply(&self, sender: &ChannelSender, unique: RequestId, response: &Response) {
        if self.debug {
            if let Response::Error(Some(errno)) = response {
                debug!("Reply {unique}: errno {errno}");
            } else {
                debug!("Reply {unique}: ok");
            }
        }
        if let Err(err) = response.with_iovec(unique, |iov| sender.send(iov)) {
            warn!("Failed to send FUSE reply for {unique}: {err}");
        }
    }
}

/// FORGET, BATCH_FORGET, INTERRUPT and NOTIFY_REPLY never receive a
/// reply, not even an error.
fn expects_reply(op: &Operation<'_>) -> bool {
    !matches!(
        op,
        Operation::Forget(_)
            | Operation::BatchForget(_)
            | Operation::Interrupt(_)
            | Operation::NotifyReply(_)
    )
}

/// Operations whose reply establishes a name→inode binding in the
/// kernel's entry cache.
fn entry_producing(op: &Operation<'_>) -> bool {
    matches!(
        op,
        Operation::Lookup(_)
            | Operation::MkNod(_)
            | Operation::MkDir(_)
            | Operation::SymLink(_)
            | Operation::Link(_)
            | Operation::Create(_)
    )
}

/// Extract the `unique` straight from the raw header for frames we
/// could not fully parse.
fn raw_unique(data: &[u8]) -> Option<RequestId> {
    if data.len() < std::mem::size_of::<abi::fuse_in_header>() {
        return None;
    }
    let unique = u64::from_le_bytes(data[8..16].try_into().ok()?);
    Some(RequestId(unique))
}
