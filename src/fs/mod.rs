//! The `fuser::Filesystem` adapter: translates inode-addressed kernel
//! upcalls into path-addressed tree traversal calls, and normalised
//! `SessionError`s into errno codes.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, Request,
};
use parking_lot::Mutex;

use crate::session::{Attrs, OpenMode, SessionError};
use crate::tree::ops::{OpenOp, OpendirOp, RealpathOp, StatOp, StatvfsOp};
use crate::tree::{traverse, Node, RemoteSession};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

fn to_errno(err: &SessionError) -> i32 {
    match err {
        SessionError::InvalidArgument => libc::EINVAL,
        SessionError::PermissionDenied => libc::EACCES,
        SessionError::NotFound => libc::ENOENT,
        // Preserves the original's behaviour of surfacing any transport
        // failure to the kernel as "not found" rather than a distinct
        // I/O errno.
        SessionError::TransportError(_) => libc::ENOENT,
    }
}

struct OpenFile {
    session: Arc<dyn RemoteSession>,
    handle: u64,
}

struct OpenDir {
    entries: Vec<(String, Attrs)>,
}

/// Bridges the kernel's inode-addressed world to the tree's path-addressed
/// one. A path is always the local, mount-relative form: `/` for the root,
/// `/sub/file` for everything else.
pub struct Adapter {
    root: Node,
    inode_paths: Mutex<HashMap<u64, String>>,
    path_inodes: Mutex<HashMap<String, u64>>,
    next_inode: AtomicU64,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    open_dirs: Mutex<HashMap<u64, OpenDir>>,
    next_fh: AtomicU64,
    /// Serializes every `read` and `readdir` call, per the documented
    /// concurrency contract: bounds load on session mutexes and simplifies
    /// reasoning about interleaving with cursor/offset state.
    io_lock: Mutex<()>,
    uid: u32,
    gid: u32,
}

impl Adapter {
    pub fn new(root: Node) -> Self {
        let mut inode_paths = HashMap::new();
        let mut path_inodes = HashMap::new();
        inode_paths.insert(ROOT_INO, "/".to_string());
        path_inodes.insert("/".to_string(), ROOT_INO);
        Adapter {
            root,
            inode_paths: Mutex::new(inode_paths),
            path_inodes: Mutex::new(path_inodes),
            next_inode: AtomicU64::new(ROOT_INO + 1),
            open_files: Mutex::new(HashMap::new()),
            open_dirs: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            io_lock: Mutex::new(()),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn path_for(&self, ino: u64) -> Option<String> {
        self.inode_paths.lock().get(&ino).cloned()
    }

    fn inode_for(&self, path: &str) -> u64 {
        let mut path_inodes = self.path_inodes.lock();
        if let Some(&ino) = path_inodes.get(path) {
            return ino;
        }
        let ino = self.next_inode.fetch_add(1, Ordering::Relaxed);
        path_inodes.insert(path.to_string(), ino);
        self.inode_paths.lock().insert(ino, path.to_string());
        ino
    }

    fn join(parent: &str, name: &str) -> String {
        if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        }
    }

    fn tree_lstat(&self, path: &str) -> Result<Attrs, SessionError> {
        let mut op = StatOp {
            path,
            follow_symlink: false,
        };
        traverse(&self.root, &mut op)
    }

    fn tree_stat(&self, path: &str) -> Result<Attrs, SessionError> {
        let mut op = StatOp {
            path,
            follow_symlink: true,
        };
        traverse(&self.root, &mut op)
    }

    fn to_file_attr(&self, ino: u64, attrs: &Attrs) -> FileAttr {
        let kind = match attrs.mode & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFIFO => FileType::NamedPipe,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::RegularFile,
        };
        let secs_to_time = |s: i64| {
            if s >= 0 {
                UNIX_EPOCH + Duration::from_secs(s as u64)
            } else {
                UNIX_EPOCH
            }
        };
        FileAttr {
            ino,
            size: attrs.size,
            blocks: attrs.size.div_ceil(512),
            atime: secs_to_time(attrs.atime),
            mtime: secs_to_time(attrs.mtime),
            ctime: secs_to_time(attrs.ctime),
            crtime: secs_to_time(attrs.ctime),
            kind,
            perm: (attrs.mode & 0o7777) as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for Adapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let name = name.to_string_lossy();
        let path = Self::join(&parent_path, &name);
        match self.tree_lstat(&path) {
            Ok(attrs) => {
                let ino = self.inode_for(&path);
                reply.entry(&TTL, &self.to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    /// When called against an open file descriptor (`fh` is `Some`), this is
    /// the kernel's `fgetattr`: it goes straight to the session bound to
    /// that handle at `open` time, rather than re-traversing the tree. That
    /// distinction matters under a `Mirror` — re-traversing would advance
    /// the round-robin cursor and could report a different replica's
    /// attributes than the one the handle actually refers to.
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        if let Some(fh) = fh {
            if let Some(open) = self.open_files.lock().get(&fh) {
                match open.session.fstat(open.handle) {
                    Ok(attrs) => reply.attr(&TTL, &self.to_file_attr(ino, &attrs)),
                    Err(e) => reply.error(to_errno(&e)),
                }
                return;
            }
        }
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.tree_lstat(&path) {
            Ok(attrs) => reply.attr(&TTL, &self.to_file_attr(ino, &attrs)),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    /// The kernel's `readlink(2)` upcall. Mirrors the original's own
    /// surprising choice of binding this to `realpath` rather than
    /// `readlink` at the session level — callers get the canonical,
    /// mount-rewritten path of a symlink's target, not its raw link text.
    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut op = RealpathOp { path: &path };
        match traverse(&self.root, &mut op) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mode = match OpenMode::from_posix(flags) {
            Ok(m) => m,
            Err(_) => {
                reply.error(libc::EACCES);
                return;
            }
        };
        let mut op = OpenOp::new(&path, mode);
        match traverse(&self.root, &mut op) {
            Ok(bound) => {
                let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
                self.open_files.lock().insert(
                    fh,
                    OpenFile {
                        session: bound.session,
                        handle: bound.handle,
                    },
                );
                reply.opened(fh, 0);
            }
            Err(_) => reply.error(libc::EACCES),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let _guard = self.io_lock.lock();
        let open_files = self.open_files.lock();
        let Some(open) = open_files.get(&fh) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match open.session.read(open.handle, &mut buf, offset.max(0) as u64) {
            // A short (possibly zero-length) read is EOF; the kernel reads
            // this as end-of-file from an empty reply, not as an error.
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(open) = self.open_files.lock().remove(&fh) {
            open.session.close(open.handle);
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut op = OpendirOp::new(&path);
        match traverse(&self.root, &mut op) {
            Ok(()) => {
                let bound = op.accepted.expect("acceptable opendir result without a bound handle");
                let entries = match crate::tree::ops::read_all_entries(&bound.session, bound.handle) {
                    Ok(entries) => entries,
                    Err(e) => {
                        bound.session.closedir(bound.handle);
                        reply.error(to_errno(&e));
                        return;
                    }
                };
                bound.session.closedir(bound.handle);
                let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
                self.open_dirs.lock().insert(
                    fh,
                    OpenDir {
                        entries: entries.into_iter().map(|e| (e.name, e.attrs)).collect(),
                    },
                );
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let _guard = self.io_lock.lock();
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let open_dirs = self.open_dirs.lock();
        let Some(dir) = open_dirs.get(&fh) else {
            reply.error(libc::ENOENT);
            return;
        };

        let mut fixed = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for (name, attrs) in &dir.entries {
            let child_path = Self::join(&path, name);
            let child_ino = self.inode_for(&child_path);
            let kind = if attrs.mode & libc::S_IFMT == libc::S_IFDIR {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            fixed.push((child_ino, kind, name.clone()));
        }

        for (i, (child_ino, kind, name)) in fixed.into_iter().enumerate().skip(offset as usize) {
            let next_offset = (i + 1) as i64;
            if reply.add(child_ino, next_offset, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.open_dirs.lock().remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut op = StatvfsOp::new(&path);
        traverse(&self.root, &mut op);
        if !op.saw_any {
            reply.error(libc::ENOENT);
            return;
        }
        let v = op.accumulator;
        reply.statfs(v.blocks, v.bfree, v.bavail, v.files, v.ffree, 512, 255, 512);
    }

    // Read-only surface: every mutating entry point replies EROFS rather
    // than falling back on fuser's default ENOSYS, so clients see this as
    // a deliberately read-only mount, not as an unimplemented operation.
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(libc::EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(libc::EROFS);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
compile_error!("arsenal requires a FUSE-capable operating system");
