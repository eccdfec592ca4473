//! Mounting and unmounting.
//!
//! Scoped acquisition of the mount device: a [`Mount`] owns the
//! mountpoint for its lifetime and releases it on all exit paths,
//! including removing the mountpoint directory when it was created
//! here. Privileged processes mount directly via `mount(2)`; everyone
//! else goes through the setuid fusermount helper.

mod fusermount;
pub(crate) mod mount_options;

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, warn};

use crate::channel::DevFuse;
pub use mount_options::MountOption;
pub(crate) use mount_options::check_option_conflicts;

/// An active mount. Dropping it unmounts.
#[derive(Debug)]
pub(crate) struct Mount {
    mountpoint: PathBuf,
    device: Arc<DevFuse>,
    created_mountpoint: bool,
    // Held open for fusermount's auto_unmount mode; closing it is the
    // unmount.
    auto_unmount_socket: Option<UnixStream>,
    unmounted: bool,
}

impl Mount {
    pub(crate) fn new(
        mountpoint: &Path,
        options: &[MountOption],
    ) -> io::Result<(Arc<DevFuse>, Mount)> {
        let created_mountpoint = !mountpoint.exists();
        if created_mountpoint {
            fs::create_dir_all(mountpoint)?;
        }
        let mountpoint = mountpoint.canonicalize()?;
        match direct_mount(&mountpoint, options) {
            Ok(device) => {
                let device = Arc::new(device);
                return Ok((
                    device.clone(),
                    Mount {
                        mountpoint,
                        device,
                        created_mountpoint,
                        auto_unmount_socket: None,
                        unmounted: false,
                    },
                ));
            }
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                debug!("Direct mount denied, falling back to fusermount");
            }
            Err(err) => return Err(err),
        }
        let (fd, socket) = fusermount::fusermount_mount(&mountpoint, options)?;
        let device = Arc::new(DevFuse(fs::File::from(fd)));
        Ok((
            device.clone(),
            Mount {
                mountpoint,
                device,
                created_mountpoint,
                auto_unmount_socket: socket,
                unmounted: false,
            },
        ))
    }

    pub(crate) fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount now instead of at drop time.
    pub(crate) fn unmount(&mut self) {
        if self.unmounted {
            return;
        }
        self.unmounted = true;
        if !is_mounted(&self.device) {
            // Already unmounted from underneath us; unmounting again
            // could race a new filesystem at the same mountpoint.
        } else if let Some(socket) = self.auto_unmount_socket.take() {
            // fusermount in auto-unmount mode: dropping the socket does
            // the work.
            drop(socket);
        } else if let Err(err) = fusermount::fusermount_unmount(&self.mountpoint) {
            error!("Failed to unmount {}: {}", self.mountpoint.display(), err);
        }
        if self.created_mountpoint {
            if let Err(err) = fs::remove_dir(&self.mountpoint) {
                warn!(
                    "Failed to remove mountpoint {}: {}",
                    self.mountpoint.display(),
                    err
                );
            }
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Mount directly via `mount(2)`; requires privileges.
fn direct_mount(mountpoint: &Path, options: &[MountOption]) -> io::Result<DevFuse> {
    use nix::mount::MsFlags;

    let device = DevFuse::open()?;
    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    let mut data = format!(
        "fd={},rootmode=40000,user_id={},group_id={}",
        device.as_raw_fd(),
        nix::unistd::getuid(),
        nix::unistd::getgid(),
    );
    let mut fsname = "treefuse".to_string();
    let mut subtype = None;
    for option in options {
        flags |= mount_options::option_to_flag(option);
        match option {
            MountOption::FSName(name) => fsname = name.clone(),
            MountOption::Subtype(name) => subtype = Some(name.clone()),
            MountOption::Suid => flags &= !MsFlags::MS_NOSUID,
            MountOption::Dev => flags &= !MsFlags::MS_NODEV,
            option if !mount_options::is_helper_option(option) => {
                data.push(',');
                data.push_str(&mount_options::option_to_string(option));
            }
            _ => {}
        }
    }
    let fstype = match subtype {
        Some(subtype) => format!("fuse.{subtype}"),
        None => "fuse".to_string(),
    };
    nix::mount::mount(
        Some(fsname.as_str()),
        mountpoint,
        Some(fstype.as_str()),
        flags,
        Some(data.as_str()),
    )
    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
    Ok(device)
}

/// Poll the device to see whether the mount is still alive. POLLERR
/// means the kernel side is gone.
///
/// This will also return true for a detached (lazy-unmounted) mount the
/// kernel has not destroyed yet.
fn is_mounted(device: &DevFuse) -> bool {
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
    use std::slice;

    loop {
        let mut poll_fd = PollFd::new(device.as_fd(), PollFlags::empty());
        let res = poll(slice::from_mut(&mut poll_fd), PollTimeout::ZERO);
        break match res {
            Ok(0) => true,
            Ok(1) => !poll_fd
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLERR)),
            Ok(_) => unreachable!(),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                // The fd is guaranteed good as `File` owns it; poll has
                // no other failure mode we can recover from.
                panic!("Poll failed with error {err}")
            }
        };
    }
}
