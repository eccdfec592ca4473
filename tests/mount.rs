//! End-to-end tests over a real mount.
//!
//! These exercise the whole stack through the kernel: mount a tree,
//! poke at it with ordinary syscalls, unmount. They skip themselves on
//! machines without a usable FUSE setup (no /dev/fuse, no fusermount,
//! restrictive sandbox).

use std::ffi::OsStr;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use treefuse::{
    BackgroundSession, Context, Errno, FileHandle, FileType, MemDir, MemFile, Node, Options,
    StableAttr, Tree,
};

fn fuse_usable() -> bool {
    Path::new("/dev/fuse").exists()
}

/// Mount `root` on a fresh tempdir, or skip the test when the
/// environment cannot mount FUSE filesystems.
fn try_mount(root: Arc<dyn Node>, options: Options) -> Option<(TempDir, BackgroundSession)> {
    let _ = env_logger::builder().is_test(true).try_init();
    if !fuse_usable() {
        eprintln!("skipping: /dev/fuse not available");
        return None;
    }
    let tmp = tempfile::tempdir().unwrap();
    match treefuse::spawn_mount(root, tmp.path(), options) {
        Ok(session) => Some((tmp, session)),
        Err(err) => {
            eprintln!("skipping: mount failed: {err}");
            None
        }
    }
}

fn static_tree(tree: &Tree) {
    // file.txt = "content", dir/subdir/subfile = "content3"
    let root = tree.root();
    let file = tree.new_persistent_inode(MemFile::with_content("content"), StableAttr::file());
    tree.add_child(&root, OsStr::new("file.txt"), file, false)
        .unwrap();
    let dir = tree.new_persistent_inode(MemDir::new(0o755), StableAttr::dir());
    tree.add_child(&root, OsStr::new("dir"), dir.clone(), false)
        .unwrap();
    let subdir = tree.new_persistent_inode(MemDir::new(0o755), StableAttr::dir());
    tree.add_child(&dir, OsStr::new("subdir"), subdir.clone(), false)
        .unwrap();
    let subfile = tree.new_persistent_inode(MemFile::with_content("content3"), StableAttr::file());
    tree.add_child(&subdir, OsStr::new("subfile"), subfile, false)
        .unwrap();
}

#[test]
fn static_tree_read() {
    let options = Options {
        on_add: Some(Box::new(static_tree)),
        ..Options::default()
    };
    let Some((mnt, session)) = try_mount(MemDir::new(0o755), options) else {
        return;
    };

    let meta = fs::metadata(mnt.path().join("dir")).unwrap();
    assert!(meta.is_dir());

    let content = fs::read(mnt.path().join("file.txt")).unwrap();
    assert_eq!(content, b"content");
    let content = fs::read(mnt.path().join("dir/subdir/subfile")).unwrap();
    assert_eq!(content, b"content3");

    let mut entries: Vec<(String, bool)> = fs::read_dir(mnt.path())
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            (
                e.file_name().to_string_lossy().into_owned(),
                e.file_type().unwrap().is_dir(),
            )
        })
        .collect();
    entries.sort();
    assert_eq!(
        entries,
        vec![("dir".to_string(), true), ("file.txt".to_string(), false)]
    );

    session.join().unwrap();
}

#[test]
fn memfs_write_and_read_back() {
    let Some((mnt, session)) = try_mount(MemDir::new(0o755), Options::default()) else {
        return;
    };

    let path = mnt.path().join("test");
    fs::write(&path, b"hello").unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"hello");
    assert_eq!(fs::metadata(&path).unwrap().len(), 5);

    // The directory listing shows exactly the one file.
    let names: Vec<String> = fs::read_dir(mnt.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["test".to_string()]);

    session.join().unwrap();
}

#[test]
fn truncate_and_chown_through_handle() {
    let Some((mnt, session)) = try_mount(MemDir::new(0o755), Options::default()) else {
        return;
    };

    let path = mnt.path().join("test");
    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .unwrap();
    file.set_len(4096).unwrap();
    assert_eq!(file.metadata().unwrap().len(), 4096);

    if nix::unistd::geteuid().is_root() {
        use nix::unistd::{Gid, Uid};
        nix::unistd::chown(&path, Some(Uid::from_raw(21)), Some(Gid::from_raw(42))).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (21, 42));
    }

    drop(file);
    session.join().unwrap();
}

struct XattrChild;
impl Node for XattrChild {
    fn getxattr(&self, _ctx: &Context, name: &OsStr) -> Result<Vec<u8>, Errno> {
        if name == OsStr::new("attr") {
            Ok(b"value".to_vec())
        } else {
            Ok(Vec::new())
        }
    }
}

fn getxattr(path: &Path, name: &str) -> std::io::Result<Vec<u8>> {
    use std::ffi::CString;
    let path = CString::new(path.as_os_str().as_bytes()).unwrap();
    let name = CString::new(name).unwrap();
    let mut buf = vec![0u8; 1024];
    let rc = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    buf.truncate(rc as usize);
    Ok(buf)
}

#[test]
fn xattr_values_and_empty_success() {
    let options = Options {
        on_add: Some(Box::new(|tree: &Tree| {
            let child = tree.new_persistent_inode(Arc::new(XattrChild), StableAttr::file());
            tree.add_child(&tree.root(), OsStr::new("child"), child, false)
                .unwrap();
        })),
        ..Options::default()
    };
    let Some((mnt, session)) = try_mount(MemDir::new(0o755), options) else {
        return;
    };

    let child = mnt.path().join("child");
    assert_eq!(getxattr(&child, "attr").unwrap(), b"value");
    assert_eq!(getxattr(&child, "attr2").unwrap(), b"");

    session.join().unwrap();
}

#[test]
fn concurrent_stats_agree_on_identity() {
    let options = Options {
        on_add: Some(Box::new(|tree: &Tree| {
            let file = tree.new_persistent_inode(MemFile::with_content("x"), StableAttr::file());
            tree.add_child(&tree.root(), OsStr::new("file"), file, false)
                .unwrap();
        })),
        entry_timeout: Duration::from_millis(50),
        attr_timeout: Duration::from_millis(50),
        ..Options::default()
    };
    let Some((mnt, session)) = try_mount(MemDir::new(0o755), options) else {
        return;
    };
    let target = mnt.path().join("file");
    fs::metadata(&target).unwrap();

    let mut threads = Vec::new();
    for _ in 0..16 {
        let path = target.clone();
        threads.push(std::thread::spawn(move || {
            let mut inos = Vec::new();
            for _ in 0..64 {
                inos.push(fs::metadata(&path).unwrap().ino());
            }
            inos
        }));
    }
    let mut inos: Vec<u64> = Vec::new();
    for t in threads {
        inos.extend(t.join().unwrap());
    }
    // Every stat observed the same identity.
    inos.sort_unstable();
    inos.dedup();
    assert_eq!(inos.len(), 1);

    session.join().unwrap();
}

struct PanickyOpen;
impl Node for PanickyOpen {
    fn open(
        &self,
        _ctx: &Context,
        _flags: u32,
    ) -> Result<(Arc<dyn FileHandle>, treefuse::FopenFlags), Errno> {
        panic!("injected failure");
    }

    fn getattr(
        &self,
        _ctx: &Context,
        _fh: Option<&Arc<dyn FileHandle>>,
    ) -> Result<treefuse::AttrOut, Errno> {
        let mut attr = treefuse::FileAttr::basic(0, FileType::RegularFile);
        attr.size = 1;
        Ok(attr.into())
    }
}

#[test]
fn node_panic_becomes_eio_and_session_survives() {
    let options = Options {
        on_add: Some(Box::new(|tree: &Tree| {
            let bad = tree.new_persistent_inode(Arc::new(PanickyOpen), StableAttr::file());
            tree.add_child(&tree.root(), OsStr::new("bad"), bad, false)
                .unwrap();
            let good =
                tree.new_persistent_inode(MemFile::with_content("fine"), StableAttr::file());
            tree.add_child(&tree.root(), OsStr::new("good"), good, false)
                .unwrap();
        })),
        ..Options::default()
    };
    let Some((mnt, session)) = try_mount(MemDir::new(0o755), options) else {
        return;
    };

    let err = fs::File::open(mnt.path().join("bad")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EIO));

    // The session is still alive and siblings work.
    let meta = fs::metadata(mnt.path().join("good")).unwrap();
    assert_eq!(meta.len(), 4);
    assert_eq!(fs::read(mnt.path().join("good")).unwrap(), b"fine");

    session.join().unwrap();
}

#[test]
fn rename_and_unlink() {
    let Some((mnt, session)) = try_mount(MemDir::new(0o755), Options::default()) else {
        return;
    };

    let a = mnt.path().join("a");
    let b = mnt.path().join("b");
    fs::write(&a, b"payload").unwrap();
    fs::rename(&a, &b).unwrap();
    assert!(!a.exists());
    assert_eq!(fs::read(&b).unwrap(), b"payload");

    fs::create_dir(mnt.path().join("sub")).unwrap();
    fs::rename(&b, mnt.path().join("sub/b")).unwrap();
    assert_eq!(fs::read(mnt.path().join("sub/b")).unwrap(), b"payload");

    fs::remove_file(mnt.path().join("sub/b")).unwrap();
    assert!(!mnt.path().join("sub/b").exists());
    fs::remove_dir(mnt.path().join("sub")).unwrap();
    assert!(fs::read_dir(mnt.path()).unwrap().next().is_none());

    session.join().unwrap();
}

#[test]
fn seek_and_partial_reads() {
    let Some((mnt, session)) = try_mount(MemDir::new(0o755), Options::default()) else {
        return;
    };

    let path = mnt.path().join("seeky");
    fs::write(&path, b"0123456789").unwrap();
    let mut file = fs::File::open(&path).unwrap();
    file.seek(SeekFrom::Start(4)).unwrap();
    let mut buf = [0u8; 3];
    file.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"456");

    // Permissions round-trip through setattr.
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
    assert_eq!(
        fs::metadata(&path).unwrap().permissions().mode() & 0o777,
        0o600
    );

    session.join().unwrap();
}
