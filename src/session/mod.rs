//! A single jailed SFTP session.
//!
//! `SftpSession` owns one authenticated `ssh2` session and confines every
//! path it is given to a configured subtree of the remote filesystem. All
//! calls on a given session are serialized through `inner`'s mutex, for the
//! full duration of the underlying SFTP round trip.

use std::collections::HashMap;
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use ssh2::{OpenFlags, OpenType, Session, Sftp};
use thiserror::Error;

mod attrs;
pub use attrs::{Attrs, DirEntry, VfsAttrs};

/// Errors a session can report. Taxonomy order matches the precedence used
/// when mapping to errno at the filesystem adapter boundary.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("permission denied")]
    PermissionDenied,
    #[error("not found")]
    NotFound,
    #[error("transport error: {0}")]
    TransportError(String),
}

impl From<ssh2::Error> for SessionError {
    fn from(e: ssh2::Error) -> Self {
        use ssh2::ErrorCode;
        match e.code() {
            ErrorCode::SFTP(code) if code == libssh2_sys::LIBSSH2_FX_NO_SUCH_FILE => {
                SessionError::NotFound
            }
            ErrorCode::SFTP(code) if code == libssh2_sys::LIBSSH2_FX_PERMISSION_DENIED => {
                SessionError::PermissionDenied
            }
            _ => SessionError::TransportError(e.to_string()),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::TransportError(e.to_string())
    }
}

/// Flags accepted by `open`. Only read, and read+append, combinations pass
/// validation — the surface is read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode {
    pub append: bool,
}

impl OpenMode {
    /// Translate kernel-style POSIX open flags into an `OpenMode`, rejecting
    /// anything that implies a write.
    pub fn from_posix(flags: i32) -> Result<OpenMode, SessionError> {
        const O_ACCMODE: i32 = libc::O_ACCMODE;
        let access = flags & O_ACCMODE;
        if access != libc::O_RDONLY {
            return Err(SessionError::InvalidArgument);
        }
        let disallowed = libc::O_CREAT | libc::O_EXCL | libc::O_NOCTTY | libc::O_TRUNC;
        if flags & disallowed != 0 {
            return Err(SessionError::InvalidArgument);
        }
        Ok(OpenMode {
            append: flags & libc::O_APPEND != 0,
        })
    }
}

/// A cursor over an open remote file, as seen by the session.
struct OpenFile {
    file: ssh2::File,
    offset: u64,
}

struct OpenDir {
    file: ssh2::File,
}

struct Inner {
    sftp: Sftp,
    files: HashMap<u64, OpenFile>,
    dirs: HashMap<u64, OpenDir>,
}

/// One authenticated connection to a remote SFTP endpoint, confined to a
/// jail prefix and reporting paths rewritten to sit under a local mount
/// point.
pub struct SftpSession {
    // Kept alive alongside `inner.sftp` — dropping it tears down the TCP
    // connection and the SSH session in field declaration order.
    _tcp: TcpStream,
    _ssh: Session,
    inner: Mutex<Inner>,
    next_handle: AtomicU64,
    jail_prefix: String,
    mount_point: String,
}

/// Everything needed to establish a session, as read from configuration.
pub struct VolumeDescriptor {
    pub name: String,
    pub root: String,
    pub address: String,
    pub port: u16,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub username: String,
    pub passphrase: Option<String>,
}

/// Join `path` onto `prefix`, treating `path` as rooted at the jail
/// regardless of leading slashes.
fn join_jail(prefix: &str, path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if prefix.ends_with('/') {
        format!("{prefix}{trimmed}")
    } else {
        format!("{prefix}/{trimmed}")
    }
}

/// Whether a resolved remote path still sits under `prefix`. A bare prefix
/// match is not enough — `/jail-evil` must not be considered contained by
/// jail prefix `/jail` — so containment also requires the next byte (if any)
/// to be a path separator.
fn within_jail(prefix: &str, resolved: &str) -> bool {
    match resolved.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

impl SftpSession {
    /// Connect, authenticate, and jail a new session to `descriptor.root`.
    /// `mount_point` is the local path under which the caller will expose
    /// this tree; it is substituted for the jail prefix in `realpath`
    /// results so user-land always sees local paths.
    pub fn connect(descriptor: &VolumeDescriptor, mount_point: &str) -> Result<Self, SessionError> {
        let addr = format!("{}:{}", descriptor.address, descriptor.port);
        let tcp = TcpStream::connect(&addr)
            .map_err(|e| SessionError::TransportError(e.to_string()))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))
            .map_err(|e| SessionError::TransportError(e.to_string()))?;

        let mut ssh = Session::new().map_err(SessionError::from)?;
        ssh.set_tcp_stream(tcp.try_clone().map_err(|e| SessionError::TransportError(e.to_string()))?);
        ssh.handshake().map_err(SessionError::from)?;

        let private = descriptor
            .private_key
            .as_deref()
            .ok_or(SessionError::InvalidArgument)?;
        let public = descriptor.public_key.as_deref();
        ssh.userauth_pubkey_file(
            &descriptor.username,
            public.map(Path::new),
            Path::new(private),
            descriptor.passphrase.as_deref(),
        )
        .map_err(SessionError::from)?;
        if !ssh.authenticated() {
            return Err(SessionError::PermissionDenied);
        }

        ssh.set_blocking(true);
        let sftp = ssh.sftp().map_err(SessionError::from)?;

        let jail_prefix = if descriptor.root.is_empty() {
            "/".to_string()
        } else {
            descriptor.root.clone()
        };

        Ok(SftpSession {
            _tcp: tcp,
            _ssh: ssh,
            inner: Mutex::new(Inner {
                sftp,
                files: HashMap::new(),
                dirs: HashMap::new(),
            }),
            next_handle: AtomicU64::new(1),
            jail_prefix,
            mount_point: mount_point.to_string(),
        })
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Form the jailed form of a local path, verify (via `realpath`) that it
    /// does not resolve outside the jail, and return the jailed (not the
    /// resolved) path for the caller to operate on.
    fn jail(&self, inner: &Inner, path: &str) -> Result<String, SessionError> {
        let joined = join_jail(&self.jail_prefix, path);
        let resolved = inner
            .sftp
            .realpath(Path::new(&joined))
            .map_err(SessionError::from)?;
        let resolved = resolved.to_string_lossy().into_owned();
        if !within_jail(&self.jail_prefix, &resolved) {
            return Err(SessionError::PermissionDenied);
        }
        Ok(joined)
    }

    fn rewrite_to_mount(&self, remote_path: &str) -> String {
        match remote_path.strip_prefix(&self.jail_prefix) {
            Some(rest) => format!("{}{}", self.mount_point, rest),
            None => remote_path.to_string(),
        }
    }
}

impl crate::tree::RemoteSession for SftpSession {
    fn stat(&self, path: &str) -> Result<Attrs, SessionError> {
        let inner = self.inner.lock();
        let jailed = self.jail(&inner, path)?;
        let stat = inner.sftp.stat(Path::new(&jailed)).map_err(SessionError::from)?;
        Ok(Attrs::from_filestat(&stat))
    }

    fn lstat(&self, path: &str) -> Result<Attrs, SessionError> {
        let inner = self.inner.lock();
        let jailed = self.jail(&inner, path)?;
        let stat = inner.sftp.lstat(Path::new(&jailed)).map_err(SessionError::from)?;
        Ok(Attrs::from_filestat(&stat))
    }

    fn readlink(&self, path: &str) -> Result<String, SessionError> {
        let inner = self.inner.lock();
        let jailed = self.jail(&inner, path)?;
        let target = inner.sftp.readlink(Path::new(&jailed)).map_err(SessionError::from)?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn realpath(&self, path: &str) -> Result<String, SessionError> {
        let inner = self.inner.lock();
        let jailed = self.jail(&inner, path)?;
        let resolved = inner.sftp.realpath(Path::new(&jailed)).map_err(SessionError::from)?;
        let resolved = resolved.to_string_lossy().into_owned();
        if !within_jail(&self.jail_prefix, &resolved) {
            return Err(SessionError::PermissionDenied);
        }
        Ok(self.rewrite_to_mount(&resolved))
    }

    fn open(&self, path: &str, mode: OpenMode) -> Result<u64, SessionError> {
        let mut inner = self.inner.lock();
        let jailed = self.jail(&inner, path)?;
        let mut flags = OpenFlags::READ;
        if mode.append {
            flags |= OpenFlags::APPEND;
        }
        let file = inner
            .sftp
            .open_mode(Path::new(&jailed), flags, 0, OpenType::File)
            .map_err(SessionError::from)?;
        let handle = self.alloc_handle();
        inner.files.insert(handle, OpenFile { file, offset: 0 });
        Ok(handle)
    }

    fn fstat(&self, handle: u64) -> Result<Attrs, SessionError> {
        let mut inner = self.inner.lock();
        let open = inner.files.get_mut(&handle).ok_or(SessionError::InvalidArgument)?;
        let stat = open.file.stat().map_err(SessionError::from)?;
        Ok(Attrs::from_filestat(&stat))
    }

    fn read(&self, handle: u64, buf: &mut [u8], offset: u64) -> Result<usize, SessionError> {
        use std::io::{Read, Seek, SeekFrom};
        let mut inner = self.inner.lock();
        let open = inner.files.get_mut(&handle).ok_or(SessionError::InvalidArgument)?;
        if offset != open.offset {
            open.file
                .seek(SeekFrom::Start(offset))
                .map_err(SessionError::from)?;
        }
        let n = match open.file.read(buf) {
            Ok(n) => n,
            Err(e) => return Err(SessionError::from(e)),
        };
        open.offset = offset + n as u64;
        Ok(n)
    }

    fn close(&self, handle: u64) {
        let mut inner = self.inner.lock();
        if let Some(mut open) = inner.files.remove(&handle) {
            let _ = open.file.close();
        }
    }

    fn opendir(&self, path: &str) -> Result<u64, SessionError> {
        let mut inner = self.inner.lock();
        let jailed = self.jail(&inner, path)?;
        let dir = inner.sftp.opendir(Path::new(&jailed)).map_err(SessionError::from)?;
        let handle = self.alloc_handle();
        inner.dirs.insert(handle, OpenDir { file: dir });
        Ok(handle)
    }

    fn readdir(&self, handle: u64) -> Result<Option<DirEntry>, SessionError> {
        use ssh2::ErrorCode;
        let mut inner = self.inner.lock();
        let dir = inner.dirs.get_mut(&handle).ok_or(SessionError::InvalidArgument)?;
        loop {
            match dir.file.readdir() {
                Ok((name, stat)) => {
                    let name = name.to_string_lossy().into_owned();
                    if name == "." || name == ".." {
                        continue;
                    }
                    return Ok(Some(DirEntry {
                        name,
                        attrs: Attrs::from_filestat(&stat),
                    }));
                }
                Err(ref e) if e.code() == ErrorCode::Session(libssh2_sys::LIBSSH2_ERROR_FILE) => {
                    return Ok(None)
                }
                Err(e) => return Err(SessionError::from(e)),
            }
        }
    }

    fn closedir(&self, handle: u64) {
        let mut inner = self.inner.lock();
        if let Some(mut dir) = inner.dirs.remove(&handle) {
            let _ = dir.file.close();
        }
    }

    fn statvfs(&self, path: &str) -> Result<VfsAttrs, SessionError> {
        let mut inner = self.inner.lock();
        let jailed = self.jail(&inner, path)?;
        let mut dir = inner
            .sftp
            .opendir(Path::new(&jailed))
            .map_err(SessionError::from)?;
        let raw = dir.statvfs().map_err(SessionError::from)?;
        let _ = dir.close();
        Ok(VfsAttrs::from_raw(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_mode_rejects_write() {
        assert!(OpenMode::from_posix(libc::O_WRONLY).is_err());
        assert!(OpenMode::from_posix(libc::O_RDWR).is_err());
        assert!(OpenMode::from_posix(libc::O_RDONLY | libc::O_CREAT).is_err());
    }

    #[test]
    fn open_mode_accepts_rdonly_and_append() {
        let m = OpenMode::from_posix(libc::O_RDONLY).unwrap();
        assert!(!m.append);
        let m = OpenMode::from_posix(libc::O_RDONLY | libc::O_APPEND).unwrap();
        assert!(m.append);
    }

    #[test]
    fn join_jail_roots_path_under_prefix() {
        assert_eq!(join_jail("/home/alice", "/docs/a.txt"), "/home/alice/docs/a.txt");
        assert_eq!(join_jail("/home/alice/", "/docs/a.txt"), "/home/alice/docs/a.txt");
        assert_eq!(join_jail("/home/alice", "docs/a.txt"), "/home/alice/docs/a.txt");
    }

    #[test]
    fn within_jail_accepts_prefix_and_subpaths() {
        assert!(within_jail("/home/alice", "/home/alice"));
        assert!(within_jail("/home/alice", "/home/alice/docs/a.txt"));
        assert!(within_jail("/", "/anything"));
    }

    #[test]
    fn within_jail_rejects_escape_via_symlink_resolution() {
        // A symlink inside the jail that resolves outside it must be
        // rejected even though the server itself followed it without error.
        // `realpath` has already normalised away any `..` components by the
        // time its result reaches this check.
        assert!(!within_jail("/home/alice", "/etc/passwd"));
        assert!(!within_jail("/home/alice", "/home/bob/secret"));
    }

    #[test]
    fn within_jail_rejects_sibling_with_matching_prefix_bytes() {
        // "/jail-evil" must not be considered contained by jail "/jail".
        assert!(!within_jail("/jail", "/jail-evil/x"));
    }
}
