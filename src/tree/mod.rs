//! The aggregation tree and the generic traversal engine used to dispatch
//! a filesystem operation down it.
//!
//! A `Node` is either a leaf `Volume` (one session) or an interior `Mirror`
//! (redundant replicas, round-robin) / `Distribute` (disjoint namespaces,
//! probed in declaration order until one accepts). Each operation against
//! the tree is expressed as a `TreeOp` value: `invoke` performs the call
//! against one session, `acceptable` decides whether a `Distribute` should
//! stop probing or try the next child.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::session::{Attrs, DirEntry, OpenMode, SessionError, VfsAttrs};

pub mod ops;

#[cfg(test)]
mod tests;

/// The operations a leaf session must support. Implemented by
/// `crate::session::SftpSession`; a hand-written mock implements it for
/// tests so traversal logic can be exercised without real network I/O.
pub trait RemoteSession: Send + Sync {
    fn stat(&self, path: &str) -> Result<Attrs, SessionError>;
    fn lstat(&self, path: &str) -> Result<Attrs, SessionError>;
    fn readlink(&self, path: &str) -> Result<String, SessionError>;
    fn realpath(&self, path: &str) -> Result<String, SessionError>;
    fn open(&self, path: &str, mode: OpenMode) -> Result<u64, SessionError>;
    fn fstat(&self, handle: u64) -> Result<Attrs, SessionError>;
    fn read(&self, handle: u64, buf: &mut [u8], offset: u64) -> Result<usize, SessionError>;
    fn close(&self, handle: u64);
    fn opendir(&self, path: &str) -> Result<u64, SessionError>;
    fn readdir(&self, handle: u64) -> Result<Option<DirEntry>, SessionError>;
    fn closedir(&self, handle: u64);
    fn statvfs(&self, path: &str) -> Result<VfsAttrs, SessionError>;
}

/// A node in the aggregation tree.
pub enum Node {
    Volume {
        name: String,
        session: Arc<dyn RemoteSession>,
    },
    Mirror {
        children: Vec<Node>,
        cursor: AtomicUsize,
    },
    Distribute {
        children: Vec<Node>,
    },
}

impl Node {
    pub fn mirror(children: Vec<Node>) -> Node {
        Node::Mirror {
            children,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn distribute(children: Vec<Node>) -> Node {
        Node::Distribute { children }
    }

    pub fn volume(name: String, session: Arc<dyn RemoteSession>) -> Node {
        Node::Volume { name, session }
    }
}

/// An operation that can be dispatched down the tree. `invoke` is called
/// against exactly one session at a time; `acceptable` tells `Distribute`
/// whether to keep probing siblings. Ops that hand back a session-bound
/// resource (e.g. an open file handle) can clone the `Arc` they were given
/// to remember which session ultimately accepted.
pub trait TreeOp {
    type Output;

    fn invoke(&mut self, session: &Arc<dyn RemoteSession>) -> Self::Output;
    fn acceptable(&self, result: &Self::Output) -> bool;
}

/// Walk `node`, dispatching `op` per the node's aggregation semantics.
///
/// - `Volume`: invoke once against the owned session.
/// - `Mirror`: invoke against exactly one child, chosen round-robin.
/// - `Distribute`: invoke against children in order until one is acceptable;
///   if none is, the last child's result is returned.
pub fn traverse<O: TreeOp>(node: &Node, op: &mut O) -> O::Output {
    match node {
        Node::Volume { session, .. } => op.invoke(session),
        Node::Mirror { children, cursor } => {
            let i = cursor.fetch_add(1, Ordering::Relaxed) % children.len();
            traverse(&children[i], op)
        }
        Node::Distribute { children } => {
            let mut last = None;
            for child in children {
                let result = traverse(child, op);
                if op.acceptable(&result) {
                    return result;
                }
                last = Some(result);
            }
            // An interior node is guaranteed to have at least one child
            // (enforced at load time), so `last` is always populated here.
            last.expect("distribute node has no children")
        }
    }
}
