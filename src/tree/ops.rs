//! Concrete `TreeOp` implementations, one per filesystem operation, each
//! carrying its own acceptance predicate.

use std::sync::Arc;

use crate::session::{Attrs, DirEntry, OpenMode, SessionError, VfsAttrs};

use super::{RemoteSession, TreeOp};

/// `stat`/`lstat` accept a successful result only if the reported size is
/// non-zero. This means a genuinely empty file is invisible through a
/// `Distribute` node — a quirk inherited and preserved rather than fixed.
pub struct StatOp<'a> {
    pub path: &'a str,
    pub follow_symlink: bool,
}

impl<'a> TreeOp for StatOp<'a> {
    type Output = Result<Attrs, SessionError>;

    fn invoke(&mut self, session: &Arc<dyn RemoteSession>) -> Self::Output {
        if self.follow_symlink {
            session.stat(self.path)
        } else {
            session.lstat(self.path)
        }
    }

    fn acceptable(&self, result: &Self::Output) -> bool {
        matches!(result, Ok(attrs) if attrs.size != 0)
    }
}

pub struct ReadlinkOp<'a> {
    pub path: &'a str,
}

impl<'a> TreeOp for ReadlinkOp<'a> {
    type Output = Result<String, SessionError>;

    fn invoke(&mut self, session: &Arc<dyn RemoteSession>) -> Self::Output {
        session.readlink(self.path)
    }

    fn acceptable(&self, result: &Self::Output) -> bool {
        result.is_ok()
    }
}

pub struct RealpathOp<'a> {
    pub path: &'a str,
}

impl<'a> TreeOp for RealpathOp<'a> {
    type Output = Result<String, SessionError>;

    fn invoke(&mut self, session: &Arc<dyn RemoteSession>) -> Self::Output {
        session.realpath(self.path)
    }

    fn acceptable(&self, result: &Self::Output) -> bool {
        result.is_ok()
    }
}

/// A file handle bound to the specific session that accepted it. `read`
/// and `close` go directly to this session, bypassing the tree.
pub struct BoundHandle {
    pub session: Arc<dyn RemoteSession>,
    pub handle: u64,
}

/// `open` against a single session just opens; the handle is returned as-is
/// regardless of size. The zero-size-means-absent filter is an acceptance
/// policy, not part of the open call itself, so a bare `Volume` or `Mirror`
/// hands back a zero-size file's handle untouched — only `Distribute`, via
/// `acceptable`, fstats the result and closes it before trying the next
/// sibling.
pub struct OpenOp<'a> {
    pub path: &'a str,
    pub mode: OpenMode,
}

impl<'a> OpenOp<'a> {
    pub fn new(path: &'a str, mode: OpenMode) -> Self {
        OpenOp { path, mode }
    }
}

impl<'a> TreeOp for OpenOp<'a> {
    type Output = Result<BoundHandle, SessionError>;

    fn invoke(&mut self, session: &Arc<dyn RemoteSession>) -> Self::Output {
        let handle = session.open(self.path, self.mode)?;
        Ok(BoundHandle {
            session: Arc::clone(session),
            handle,
        })
    }

    fn acceptable(&self, result: &Self::Output) -> bool {
        let Ok(bound) = result else { return false };
        match bound.session.fstat(bound.handle) {
            Ok(attrs) if attrs.size != 0 => true,
            Ok(_) => {
                bound.session.close(bound.handle);
                false
            }
            Err(_) => {
                bound.session.close(bound.handle);
                false
            }
        }
    }
}

/// `opendir` accepts any non-error handle.
pub struct OpendirOp<'a> {
    pub path: &'a str,
    pub accepted: Option<BoundHandle>,
}

impl<'a> OpendirOp<'a> {
    pub fn new(path: &'a str) -> Self {
        OpendirOp {
            path,
            accepted: None,
        }
    }
}

impl<'a> TreeOp for OpendirOp<'a> {
    type Output = Result<(), SessionError>;

    fn invoke(&mut self, session: &Arc<dyn RemoteSession>) -> Self::Output {
        let handle = session.opendir(self.path)?;
        self.accepted = Some(BoundHandle {
            session: Arc::clone(session),
            handle,
        });
        Ok(())
    }

    fn acceptable(&self, result: &Self::Output) -> bool {
        result.is_ok()
    }
}

/// `statvfs` sums usage across every sibling it reaches; it never reports
/// acceptance, so a `Distribute` visits every child and a `Mirror` still
/// only visits the one child its cursor selects.
pub struct StatvfsOp<'a> {
    pub path: &'a str,
    pub accumulator: VfsAttrs,
    pub saw_any: bool,
}

impl<'a> StatvfsOp<'a> {
    pub fn new(path: &'a str) -> Self {
        StatvfsOp {
            path,
            accumulator: VfsAttrs::default(),
            saw_any: false,
        }
    }
}

impl<'a> TreeOp for StatvfsOp<'a> {
    type Output = Result<VfsAttrs, SessionError>;

    fn invoke(&mut self, session: &Arc<dyn RemoteSession>) -> Self::Output {
        let result = session.statvfs(self.path);
        if let Ok(ref attrs) = result {
            self.accumulator.accumulate(attrs);
            self.saw_any = true;
        }
        result
    }

    fn acceptable(&self, _result: &Self::Output) -> bool {
        false
    }
}

/// Drain a directory handle into a plain list of entries. Not a `TreeOp`:
/// by the time a caller has a handle, traversal has already bound it to one
/// session.
pub fn read_all_entries(
    session: &Arc<dyn RemoteSession>,
    handle: u64,
) -> Result<Vec<DirEntry>, SessionError> {
    let mut entries = Vec::new();
    loop {
        match session.readdir(handle)? {
            Some(entry) => entries.push(entry),
            None => return Ok(entries),
        }
    }
}
