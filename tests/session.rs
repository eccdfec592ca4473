//! Protocol-level session tests.
//!
//! Drive a session over a socketpair instead of /dev/fuse: the test
//! plays the kernel, writing request frames and reading reply frames.
//! This exercises the handshake gating, the codec, the dispatcher and
//! the tree without needing mount privileges. SOCK_SEQPACKET keeps the
//! one-message-per-read framing the real device has.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Write};
use std::thread;

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use treefuse::{MemDir, MemFile, Options, StableAttr, Tree};

const FUSE_LOOKUP: u32 = 1;
const FUSE_FORGET: u32 = 2;
const FUSE_GETATTR: u32 = 3;
const FUSE_INIT: u32 = 26;
const FUSE_DESTROY: u32 = 38;

/// Build a request frame: 40-byte header plus body.
fn frame(opcode: u32, unique: u64, nodeid: u64, body: &[u8]) -> Vec<u8> {
    let len = 40 + body.len() as u32;
    let mut out = Vec::with_capacity(len as usize);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&opcode.to_le_bytes());
    out.extend_from_slice(&unique.to_le_bytes());
    out.extend_from_slice(&nodeid.to_le_bytes());
    out.extend_from_slice(&1000u32.to_le_bytes()); // uid
    out.extend_from_slice(&1000u32.to_le_bytes()); // gid
    out.extend_from_slice(&4242u32.to_le_bytes()); // pid
    out.extend_from_slice(&0u32.to_le_bytes()); // padding
    out.extend_from_slice(body);
    out
}

fn init_body(major: u32, minor: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&major.to_le_bytes());
    body.extend_from_slice(&minor.to_le_bytes());
    body.extend_from_slice(&4096u32.to_le_bytes()); // max_readahead
    body.extend_from_slice(&0u32.to_le_bytes()); // flags
    body
}

struct Kernel {
    stream: File,
}

impl Kernel {
    fn send(&mut self, frame: &[u8]) {
        self.stream.write_all(frame).unwrap();
    }

    /// Read one reply message and split it into header and body.
    fn recv(&mut self) -> (u64, i32, Vec<u8>) {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.stream.read(&mut buf).unwrap();
        assert!(n >= 16, "reply shorter than the out header");
        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let error = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let unique = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        assert_eq!(len, n, "header length disagrees with the frame size");
        (unique, error, buf[16..n].to_vec())
    }

    fn handshake(&mut self) {
        self.send(&frame(FUSE_INIT, 1, 0, &init_body(7, 31)));
        let (unique, error, body) = self.recv();
        assert_eq!(unique, 1);
        assert_eq!(error, 0);
        assert_eq!(body.len(), 64);
        let major = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let minor = u32::from_le_bytes(body[4..8].try_into().unwrap());
        assert_eq!(major, 7);
        // Clamped to what the server supports.
        assert_eq!(minor, 23);
    }
}

fn spawn_session(options: Options) -> (Kernel, thread::JoinHandle<std::io::Result<()>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    let session = treefuse::Session::from_fd(File::from(theirs), MemDir::new(0o755), options);
    let handle = thread::spawn(move || session.run());
    (
        Kernel {
            stream: File::from(ours),
        },
        handle,
    )
}

fn one_file_options() -> Options {
    Options {
        worker_limit: 1,
        on_add: Some(Box::new(|tree: &Tree| {
            let file = tree.new_persistent_inode(MemFile::with_content("content"), StableAttr::file());
            tree.add_child(&tree.root(), OsStr::new("file.txt"), file, false)
                .unwrap();
        })),
        ..Options::default()
    }
}

#[test]
fn handshake_negotiates_and_gates() {
    let (mut kernel, handle) = spawn_session(one_file_options());
    kernel.handshake();
    drop(kernel);
    handle.join().unwrap().unwrap();
}

#[test]
fn requests_before_init_fail_eio() {
    let (mut kernel, handle) = spawn_session(one_file_options());
    kernel.send(&frame(FUSE_GETATTR, 7, 1, &[0u8; 16]));
    let (unique, error, _) = kernel.recv();
    assert_eq!(unique, 7);
    assert_eq!(error, -libc::EIO);
    drop(kernel);
    handle.join().unwrap().unwrap();
}

#[test]
fn lookup_getattr_forget_round_trip() {
    let (mut kernel, handle) = spawn_session(one_file_options());
    kernel.handshake();

    // LOOKUP file.txt under the root.
    kernel.send(&frame(FUSE_LOOKUP, 2, 1, b"file.txt\0"));
    let (unique, error, body) = kernel.recv();
    assert_eq!(unique, 2);
    assert_eq!(error, 0);
    assert_eq!(body.len(), 128);
    let nodeid = u64::from_le_bytes(body[0..8].try_into().unwrap());
    assert!(nodeid > 1);
    // Attr size sits in the embedded fuse_attr (40 bytes in, then ino/size).
    let size = u64::from_le_bytes(body[48..56].try_into().unwrap());
    assert_eq!(size, 7);

    // GETATTR on the looked-up node.
    kernel.send(&frame(FUSE_GETATTR, 3, nodeid, &[0u8; 16]));
    let (unique, error, body) = kernel.recv();
    assert_eq!(unique, 3);
    assert_eq!(error, 0);
    assert_eq!(body.len(), 104);

    // FORGET produces no reply; a follow-up GETATTR on the root shows
    // the session is still serving.
    let mut forget = Vec::new();
    forget.extend_from_slice(&1u64.to_le_bytes());
    kernel.send(&frame(FUSE_FORGET, 4, nodeid, &forget));
    kernel.send(&frame(FUSE_GETATTR, 5, 1, &[0u8; 16]));
    let (unique, error, _) = kernel.recv();
    assert_eq!(unique, 5);
    assert_eq!(error, 0);

    drop(kernel);
    handle.join().unwrap().unwrap();
}

#[test]
fn lookup_of_missing_name_is_enoent() {
    let (mut kernel, handle) = spawn_session(one_file_options());
    kernel.handshake();
    kernel.send(&frame(FUSE_LOOKUP, 2, 1, b"missing\0"));
    let (unique, error, _) = kernel.recv();
    assert_eq!(unique, 2);
    assert_eq!(error, -libc::ENOENT);
    drop(kernel);
    handle.join().unwrap().unwrap();
}

#[test]
fn negative_lookup_with_ttl_caches_absence() {
    let mut options = one_file_options();
    options.negative_timeout = std::time::Duration::from_secs(1);
    let (mut kernel, handle) = spawn_session(options);
    kernel.handshake();
    kernel.send(&frame(FUSE_LOOKUP, 2, 1, b"missing\0"));
    let (unique, error, body) = kernel.recv();
    assert_eq!(unique, 2);
    assert_eq!(error, 0);
    // Node ID 0 plus a non-zero entry TTL communicates the absence.
    assert_eq!(u64::from_le_bytes(body[0..8].try_into().unwrap()), 0);
    assert_eq!(u64::from_le_bytes(body[16..24].try_into().unwrap()), 1);
    drop(kernel);
    handle.join().unwrap().unwrap();
}

#[test]
fn unknown_opcode_is_enosys() {
    let (mut kernel, handle) = spawn_session(one_file_options());
    kernel.handshake();
    kernel.send(&frame(9999, 2, 1, &[]));
    let (unique, error, _) = kernel.recv();
    assert_eq!(unique, 2);
    assert_eq!(error, -libc::ENOSYS);
    drop(kernel);
    handle.join().unwrap().unwrap();
}

#[test]
fn names_with_slash_or_dots_are_einval() {
    let (mut kernel, handle) = spawn_session(one_file_options());
    kernel.handshake();
    for (unique, name) in [(2u64, &b".\0"[..]), (3, &b"..\0"[..]), (4, &b"a/b\0"[..])] {
        kernel.send(&frame(FUSE_LOOKUP, unique, 1, name));
        let (got, error, _) = kernel.recv();
        assert_eq!(got, unique);
        assert_eq!(error, -libc::EINVAL);
    }
    drop(kernel);
    handle.join().unwrap().unwrap();
}

#[test]
fn destroy_is_acknowledged() {
    let (mut kernel, handle) = spawn_session(one_file_options());
    kernel.handshake();
    kernel.send(&frame(FUSE_DESTROY, 2, 0, &[]));
    let (unique, error, _) = kernel.recv();
    assert_eq!(unique, 2);
    assert_eq!(error, 0);
    drop(kernel);
    handle.join().unwrap().unwrap();
}
