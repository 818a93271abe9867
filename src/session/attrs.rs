//! Translating SFTP attribute structures into the local representation.

use ssh2::{FileStat, FileType};

/// Local stat-equivalent attributes, assembled from whichever fields the
/// remote server actually reported.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attrs {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    /// The remote protocol has no ctime; policy is `ctime := mtime`.
    pub ctime: i64,
}

impl Attrs {
    pub fn from_filestat(stat: &FileStat) -> Attrs {
        let mut mode = type_bits(stat);
        if let Some(perm) = stat.perm {
            mode |= perm & 0o7777;
        }
        let mtime = stat.mtime.unwrap_or(0) as i64;
        Attrs {
            size: stat.size.unwrap_or(0),
            uid: stat.uid.unwrap_or(0),
            gid: stat.gid.unwrap_or(0),
            mode,
            atime: stat.atime.unwrap_or(0) as i64,
            mtime,
            ctime: mtime,
        }
    }
}

fn type_bits(stat: &FileStat) -> u32 {
    match stat.file_type() {
        FileType::NamedPipe => libc::S_IFIFO,
        FileType::CharDevice => libc::S_IFCHR,
        FileType::Directory => libc::S_IFDIR,
        FileType::BlockDevice => libc::S_IFBLK,
        FileType::RegularFile => libc::S_IFREG,
        FileType::Symlink => libc::S_IFLNK,
        FileType::Socket => libc::S_IFSOCK,
        FileType::Other(_) => 0,
    }
}

/// One entry returned while walking a remote directory.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attrs: Attrs,
}

/// Filesystem-wide space/inode usage, as reported by `statvfs`/`fstatvfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VfsAttrs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
}

impl VfsAttrs {
    pub fn from_raw(raw: &libssh2_sys::LIBSSH2_SFTP_STATVFS) -> VfsAttrs {
        VfsAttrs {
            blocks: raw.f_blocks,
            bfree: raw.f_bfree,
            bavail: raw.f_bavail,
            files: raw.f_files,
            ffree: raw.f_ffree,
            favail: raw.f_favail,
        }
    }

    pub fn accumulate(&mut self, other: &VfsAttrs) {
        self.blocks += other.blocks;
        self.bfree += other.bfree;
        self.bavail += other.bavail;
        self.files += other.files;
        self.ffree += other.ffree;
        self.favail += other.favail;
    }
}
