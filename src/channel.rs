//! Device channel.
//!
//! Framed communication with the FUSE kernel driver over the mount
//! device. Reads hand back one request frame per call; writes deliver
//! one reply or notification frame per `writev`, which the device
//! treats as atomic. Transient errnos are retried here, terminal ones
//! are surfaced as a "session gone" condition the dispatcher turns
//! into an ordered shutdown.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::Arc;

use log::error;
use nix::sys::uio::writev;
use parking_lot::Mutex;

/// A newtype for `File` that represents the FUSE character device.
#[derive(Debug)]
pub(crate) struct DevFuse(pub(crate) File);

impl DevFuse {
    pub(crate) const PATH: &'static str = "/dev/fuse";

    pub(crate) fn open() -> io::Result<Self> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::PATH)
            .map(Self)
            .map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    error!("{} not found. Try 'modprobe fuse'", Self::PATH);
                }
                err
            })
    }
}

impl AsRawFd for DevFuse {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for DevFuse {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Outcome of one attempt to read a request frame.
#[derive(Debug)]
pub(crate) enum ReadResult {
    /// A frame of the given length landed in the buffer.
    Frame(usize),
    /// A transient condition; the caller should simply retry.
    Retry,
    /// The mount went away underneath us.
    SessionGone,
}

/// A communication channel to the kernel driver, shared by all workers.
#[derive(Debug, Clone)]
pub(crate) struct Channel {
    device: Arc<DevFuse>,
    // Frames must hit the device as one write each; the write side is
    // serialized while reads proceed in parallel across workers.
    write_lock: Arc<Mutex<()>>,
}

impl Channel {
    pub(crate) fn new(device: Arc<DevFuse>) -> Self {
        Channel {
            device,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Read one request frame into `buffer`. Each successful read on
    /// the device is exactly one request.
    pub(crate) fn read_frame(&self, buffer: &mut [u8]) -> io::Result<ReadResult> {
        let rc = unsafe {
            libc::read(
                self.device.as_raw_fd(),
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Ok(match err.raw_os_error() {
                // Request queue emptied before we got to it, or an
                // interrupted/blocked read: retry.
                Some(libc::ENOENT) | Some(libc::EINTR) | Some(libc::EAGAIN) => ReadResult::Retry,
                // The filesystem was unmounted.
                Some(libc::ENODEV) => ReadResult::SessionGone,
                _ => return Err(err),
            });
        }
        if rc == 0 {
            return Ok(ReadResult::SessionGone);
        }
        Ok(ReadResult::Frame(rc as usize))
    }

    pub(crate) fn sender(&self) -> ChannelSender {
        ChannelSender {
            device: self.device.clone(),
            write_lock: self.write_lock.clone(),
        }
    }
}

/// The write side of the channel; cheap to clone into workers and the
/// notifier.
#[derive(Debug, Clone)]
pub(crate) struct ChannelSender {
    device: Arc<DevFuse>,
    write_lock: Arc<Mutex<()>>,
}

impl ChannelSender {
    /// Send one frame, gathered from `data`. The whole frame goes out
    /// in a single `writev`.
    pub(crate) fn send(&self, data: &[IoSlice<'_>]) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        loop {
            match writev(self.device.as_fd(), data) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(io::Error::from_raw_os_error(errno as i32));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::OwnedFd;

    fn pipe_channel() -> (Channel, File) {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let dev = DevFuse(File::from(OwnedFd::from(write_end)));
        let reader = File::from(OwnedFd::from(read_end));
        (Channel::new(Arc::new(dev)), reader)
    }

    #[test]
    fn send_is_one_contiguous_frame() {
        let (channel, mut reader) = pipe_channel();
        let sender = channel.sender();
        sender
            .send(&[IoSlice::new(b"head"), IoSlice::new(b"body")])
            .unwrap();
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"headbody");
    }

    #[test]
    fn read_retry_taxonomy() {
        // A pipe read end with no data and O_NONBLOCK reports EAGAIN,
        // which the channel classifies as a retry.
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let flags = unsafe { libc::fcntl(read_end.as_raw_fd(), libc::F_GETFL) };
        unsafe {
            libc::fcntl(
                read_end.as_raw_fd(),
                libc::F_SETFL,
                flags | libc::O_NONBLOCK,
            )
        };
        let channel = Channel::new(Arc::new(DevFuse(File::from(OwnedFd::from(read_end)))));
        let mut buf = [0u8; 16];
        match channel.read_frame(&mut buf).unwrap() {
            ReadResult::Retry => (),
            other => panic!("expected retry, got {other:?}"),
        }
        // Closing the write side makes reads return 0, i.e. the session
        // is gone.
        drop(write_end);
        match channel.read_frame(&mut buf).unwrap() {
            ReadResult::SessionGone => (),
            other => panic!("expected session gone, got {other:?}"),
        }
    }
}
