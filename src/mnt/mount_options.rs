//! Mount options.
//!
//! See `man mount.fuse` for the semantics of the individual options.
//! Options are carried both to the kernel (as flags or the mount data
//! string) and to the fusermount helper, depending on how the mount is
//! performed.

use std::collections::HashSet;
use std::io;
use std::io::ErrorKind;

/// Mount options accepted by the FUSE filesystem type.
#[derive(Debug, Eq, PartialEq, Hash, Clone)]
pub enum MountOption {
    /// Set the name of the source in mtab
    FSName(String),
    /// Set the filesystem subtype in mtab
    Subtype(String),
    /// Allow all users to access files on this filesystem
    AllowOther,
    /// Allow the root user to access this filesystem in addition to the
    /// user who mounted it
    AllowRoot,
    /// Automatically unmount when the mounting process exits. Requires
    /// `AllowOther` or `AllowRoot`, or the system fuse configuration
    /// must permit `allow_other`.
    AutoUnmount,
    /// Enable permission checking in the kernel
    DefaultPermissions,
    /// Read-only filesystem
    RO,
    /// Read-write filesystem
    RW,
    /// Honor set-user-id and set-group-id bits on files
    Suid,
    /// Don't honor set-user-id and set-group-id bits on files
    NoSuid,
    /// Enable special character and block devices
    Dev,
    /// Disable special character and block devices
    NoDev,
    /// Allow execution of binaries
    Exec,
    /// Don't allow execution of binaries
    NoExec,
    /// Support inode access time
    Atime,
    /// Don't update inode access time
    NoAtime,
    /// Pass an option that is not otherwise covered by these variants
    Custom(String),
}

pub(crate) fn check_option_conflicts(options: &[MountOption]) -> io::Result<()> {
    let options_set: HashSet<MountOption> = options.iter().cloned().collect();
    let conflicting: HashSet<MountOption> = options.iter().flat_map(conflicts_with).collect();
    let intersection: Vec<MountOption> = conflicting.intersection(&options_set).cloned().collect();
    if intersection.is_empty() {
        Ok(())
    } else {
        Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("Conflicting mount options found: {intersection:?}"),
        ))
    }
}

fn conflicts_with(option: &MountOption) -> Vec<MountOption> {
    match option {
        MountOption::AllowOther => vec![MountOption::AllowRoot],
        MountOption::AllowRoot => vec![MountOption::AllowOther],
        MountOption::RO => vec![MountOption::RW],
        MountOption::RW => vec![MountOption::RO],
        MountOption::Suid => vec![MountOption::NoSuid],
        MountOption::NoSuid => vec![MountOption::Suid],
        MountOption::Dev => vec![MountOption::NoDev],
        MountOption::NoDev => vec![MountOption::Dev],
        MountOption::Exec => vec![MountOption::NoExec],
        MountOption::NoExec => vec![MountOption::Exec],
        MountOption::Atime => vec![MountOption::NoAtime],
        MountOption::NoAtime => vec![MountOption::Atime],
        _ => vec![],
    }
}

/// Format an option for the fusermount helper or the kernel's mount
/// data string.
pub(crate) fn option_to_string(option: &MountOption) -> String {
    match option {
        MountOption::FSName(name) => format!("fsname={name}"),
        MountOption::Subtype(subtype) => format!("subtype={subtype}"),
        MountOption::AllowOther => "allow_other".to_string(),
        MountOption::AllowRoot => "allow_root".to_string(),
        MountOption::AutoUnmount => "auto_unmount".to_string(),
        MountOption::DefaultPermissions => "default_permissions".to_string(),
        MountOption::RO => "ro".to_string(),
        MountOption::RW => "rw".to_string(),
        MountOption::Suid => "suid".to_string(),
        MountOption::NoSuid => "nosuid".to_string(),
        MountOption::Dev => "dev".to_string(),
        MountOption::NoDev => "nodev".to_string(),
        MountOption::Exec => "exec".to_string(),
        MountOption::NoExec => "noexec".to_string(),
        MountOption::Atime => "atime".to_string(),
        MountOption::NoAtime => "noatime".to_string(),
        MountOption::Custom(value) => value.clone(),
    }
}

/// Options that translate to kernel mount flags for the direct
/// `mount(2)` path. Options without a flag representation go into the
/// data string instead.
pub(crate) fn option_to_flag(option: &MountOption) -> nix::mount::MsFlags {
    use nix::mount::MsFlags;
    match option {
        MountOption::RO => MsFlags::MS_RDONLY,
        MountOption::NoSuid => MsFlags::MS_NOSUID,
        MountOption::NoDev => MsFlags::MS_NODEV,
        MountOption::NoExec => MsFlags::MS_NOEXEC,
        MountOption::NoAtime => MsFlags::MS_NOATIME,
        _ => MsFlags::empty(),
    }
}

/// Whether an option is meaningful only to the fusermount helper (and
/// must not be passed in the kernel data string).
pub(crate) fn is_helper_option(option: &MountOption) -> bool {
    matches!(
        option,
        MountOption::FSName(_)
            | MountOption::Subtype(_)
            | MountOption::AutoUnmount
            | MountOption::RO
            | MountOption::RW
            | MountOption::Suid
            | MountOption::NoSuid
            | MountOption::Dev
            | MountOption::NoDev
            | MountOption::Exec
            | MountOption::NoExec
            | MountOption::Atime
            | MountOption::NoAtime
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_checking() {
        assert!(check_option_conflicts(&[MountOption::Suid, MountOption::NoSuid]).is_err());
        assert!(check_option_conflicts(&[MountOption::RO, MountOption::RW]).is_err());
        assert!(check_option_conflicts(&[MountOption::Suid, MountOption::NoExec]).is_ok());
        assert!(
            check_option_conflicts(&[MountOption::AllowOther, MountOption::AllowRoot]).is_err()
        );
    }

    #[test]
    fn option_strings() {
        assert_eq!(
            option_to_string(&MountOption::FSName("blah".into())),
            "fsname=blah"
        );
        assert_eq!(option_to_string(&MountOption::AllowOther), "allow_other");
        assert_eq!(
            option_to_string(&MountOption::Custom("bongos".into())),
            "bongos"
        );
    }
}
