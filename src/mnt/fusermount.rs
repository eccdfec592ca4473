//! The setuid fusermount helper.
//!
//! Unprivileged mounts go through fusermount: the helper performs the
//! actual `mount(2)` and passes the opened device descriptor back over
//! a unix socket (`_FUSE_COMMFD`) via SCM_RIGHTS.

use std::env;
use std::io;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, error};
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};

use super::mount_options::{MountOption, option_to_string};

pub(crate) const FUSERMOUNT_BIN: &str = "fusermount";
pub(crate) const FUSERMOUNT3_BIN: &str = "fusermount3";
const FUSERMOUNT_COMM_ENV: &str = "_FUSE_COMMFD";

pub(crate) fn detect_fusermount_bin() -> Option<String> {
    if let Some(path) = env::var_os("FUSERMOUNT_PATH") {
        return path.into_string().ok();
    }
    for name in [
        FUSERMOUNT3_BIN.to_string(),
        FUSERMOUNT_BIN.to_string(),
        format!("/sbin/{FUSERMOUNT3_BIN}"),
        format!("/sbin/{FUSERMOUNT_BIN}"),
        format!("/bin/{FUSERMOUNT3_BIN}"),
        format!("/bin/{FUSERMOUNT_BIN}"),
    ] {
        if Command::new(&name)
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
        {
            return Some(name);
        }
    }
    None
}

/// Mount via the helper. Returns the device descriptor it passed back,
/// plus the socket that keeps an `auto_unmount` helper alive.
pub(crate) fn fusermount_mount(
    mountpoint: &Path,
    options: &[MountOption],
) -> io::Result<(OwnedFd, Option<UnixStream>)> {
    let binary = detect_fusermount_bin().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "fusermount binary not found; install fuse3 or run as root",
        )
    })?;
    let (child_socket, receive_socket) = UnixStream::pair()?;
    // The helper inherits its end of the pair; undo CLOEXEC on it.
    let rc = unsafe { libc::fcntl(child_socket.as_raw_fd(), libc::F_SETFD, 0) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }

    let mut builder = Command::new(&binary);
    builder.stdout(Stdio::piped()).stderr(Stdio::piped());
    let opts: Vec<String> = options.iter().map(option_to_string).collect();
    if !opts.is_empty() {
        builder.arg("-o").arg(opts.join(","));
    }
    builder
        .arg("--")
        .arg(mountpoint)
        .env(FUSERMOUNT_COMM_ENV, child_socket.as_raw_fd().to_string());
    debug!("mounting via {binary}");
    let mut child = builder.spawn()?;
    drop(child_socket);

    let device = receive_fusermount_fd(&receive_socket)?;

    let auto_unmount = options.contains(&MountOption::AutoUnmount);
    if auto_unmount {
        // The helper stays resident and unmounts when this socket is
        // closed; reap it in the background instead of waiting.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok((device, Some(receive_socket)))
    } else {
        let output = child.wait_with_output()?;
        if !output.status.success() {
            error!(
                "fusermount failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok((device, None))
    }
}

fn receive_fusermount_fd(socket: &UnixStream) -> io::Result<OwnedFd> {
    let mut buf = [0u8; 32];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!([std::os::fd::RawFd; 1]);
    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
    for cmsg in msg
        .cmsgs()
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?
    {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(*fd) });
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "fusermount did not pass a device descriptor",
    ))
}

/// Unmount: try the syscall, fall back to `fusermount -u` for
/// unprivileged users (Linux returns EPERM for non-root).
pub(crate) fn fusermount_unmount(mountpoint: &Path) -> io::Result<()> {
    match nix::mount::umount2(mountpoint, nix::mount::MntFlags::MNT_DETACH) {
        Ok(()) => return Ok(()),
        Err(nix::errno::Errno::EPERM) => {}
        Err(errno) => return Err(io::Error::from_raw_os_error(errno as i32)),
    }
    let binary = detect_fusermount_bin().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "fusermount binary not found")
    })?;
    let output = Command::new(binary)
        .arg("-u")
        .arg("-z")
        .arg("--")
        .arg(mountpoint)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "fusermount -u failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
