use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::{Attrs, DirEntry, OpenMode, SessionError, VfsAttrs};

use super::ops::{OpenOp, OpendirOp, ReadlinkOp, StatOp, StatvfsOp};
use super::{traverse, Node, RemoteSession};

/// A fake session whose behaviour is fully scripted, so traversal and
/// jailing logic can be exercised without a real SFTP server.
struct MockSession {
    name: &'static str,
    sizes: HashMap<&'static str, u64>,
    links: HashMap<&'static str, &'static str>,
    next_handle: AtomicU64,
    open_sizes: Mutex<HashMap<u64, u64>>,
}

impl MockSession {
    fn new(name: &'static str, sizes: &[(&'static str, u64)]) -> Self {
        MockSession {
            name,
            sizes: sizes.iter().cloned().collect(),
            links: HashMap::new(),
            next_handle: AtomicU64::new(1),
            open_sizes: Mutex::new(HashMap::new()),
        }
    }

    fn with_link(mut self, path: &'static str, target: &'static str) -> Self {
        self.links.insert(path, target);
        self
    }
}

impl RemoteSession for MockSession {
    fn stat(&self, path: &str) -> Result<Attrs, SessionError> {
        match self.sizes.get(path) {
            Some(&size) => Ok(Attrs {
                size,
                ..Attrs::default()
            }),
            None => Err(SessionError::NotFound),
        }
    }

    fn lstat(&self, path: &str) -> Result<Attrs, SessionError> {
        self.stat(path)
    }

    fn readlink(&self, path: &str) -> Result<String, SessionError> {
        self.links
            .get(path)
            .map(|target| target.to_string())
            .ok_or(SessionError::NotFound)
    }

    fn realpath(&self, path: &str) -> Result<String, SessionError> {
        Ok(format!("/{}{}", self.name, path))
    }

    fn open(&self, path: &str, _mode: OpenMode) -> Result<u64, SessionError> {
        let size = *self.sizes.get(path).ok_or(SessionError::NotFound)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.open_sizes.lock().insert(handle, size);
        Ok(handle)
    }

    fn fstat(&self, handle: u64) -> Result<Attrs, SessionError> {
        let size = *self
            .open_sizes
            .lock()
            .get(&handle)
            .ok_or(SessionError::InvalidArgument)?;
        Ok(Attrs {
            size,
            ..Attrs::default()
        })
    }

    fn read(&self, _handle: u64, _buf: &mut [u8], _offset: u64) -> Result<usize, SessionError> {
        Ok(0)
    }

    fn close(&self, handle: u64) {
        self.open_sizes.lock().remove(&handle);
    }

    fn opendir(&self, path: &str) -> Result<u64, SessionError> {
        if self.sizes.keys().any(|k| k.starts_with(path)) || path == "/" {
            Ok(self.next_handle.fetch_add(1, Ordering::Relaxed))
        } else {
            Err(SessionError::NotFound)
        }
    }

    fn readdir(&self, _handle: u64) -> Result<Option<DirEntry>, SessionError> {
        Ok(None)
    }

    fn closedir(&self, _handle: u64) {}

    fn statvfs(&self, _path: &str) -> Result<VfsAttrs, SessionError> {
        Ok(VfsAttrs {
            blocks: 10,
            bfree: 5,
            bavail: 5,
            files: 100,
            ffree: 50,
            favail: 50,
        })
    }
}

fn volume(name: &'static str, sizes: &[(&'static str, u64)]) -> Node {
    Node::volume(name.to_string(), Arc::new(MockSession::new(name, sizes)))
}

#[test]
fn mirror_round_robins_across_children() {
    let tree = Node::mirror(vec![
        volume("a", &[("/f", 1)]),
        volume("b", &[("/f", 1)]),
        volume("c", &[("/f", 1)]),
    ]);

    let mut hits = HashMap::new();
    for _ in 0..9 {
        let mut op = StatOp {
            path: "/f",
            follow_symlink: true,
        };
        let result = traverse(&tree, &mut op).unwrap();
        *hits.entry(result.size).or_insert(0) += 1;
    }
    // Every call goes to exactly one child and every child answers
    // identically here, so this just proves the cursor actually advances
    // (no child is ever skipped) by checking total call count elsewhere;
    // the deterministic distribution test below is the meaningful one.
    assert_eq!(hits.values().sum::<i32>(), 9);
}

#[test]
fn mirror_distributes_evenly_over_n_calls() {
    struct CountingSession(AtomicU64);
    impl RemoteSession for CountingSession {
        fn stat(&self, _path: &str) -> Result<Attrs, SessionError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(Attrs {
                size: 1,
                ..Attrs::default()
            })
        }
        fn lstat(&self, p: &str) -> Result<Attrs, SessionError> {
            self.stat(p)
        }
        fn readlink(&self, _p: &str) -> Result<String, SessionError> {
            unimplemented!()
        }
        fn realpath(&self, _p: &str) -> Result<String, SessionError> {
            unimplemented!()
        }
        fn open(&self, _p: &str, _m: OpenMode) -> Result<u64, SessionError> {
            unimplemented!()
        }
        fn fstat(&self, _h: u64) -> Result<Attrs, SessionError> {
            unimplemented!()
        }
        fn read(&self, _h: u64, _b: &mut [u8], _o: u64) -> Result<usize, SessionError> {
            unimplemented!()
        }
        fn close(&self, _h: u64) {}
        fn opendir(&self, _p: &str) -> Result<u64, SessionError> {
            unimplemented!()
        }
        fn readdir(&self, _h: u64) -> Result<Option<DirEntry>, SessionError> {
            unimplemented!()
        }
        fn closedir(&self, _h: u64) {}
        fn statvfs(&self, _p: &str) -> Result<VfsAttrs, SessionError> {
            unimplemented!()
        }
    }

    let counters: Vec<Arc<CountingSession>> = (0..4)
        .map(|_| Arc::new(CountingSession(AtomicU64::new(0))))
        .collect();
    let children: Vec<Node> = counters
        .iter()
        .enumerate()
        .map(|(i, c)| -> Node { Node::volume(format!("v{i}"), Arc::clone(c)) })
        .collect();
    let tree = Node::mirror(children);

    for _ in 0..17 {
        let mut op = StatOp {
            path: "/f",
            follow_symlink: true,
        };
        traverse(&tree, &mut op).unwrap();
    }

    let counts: Vec<u64> = counters.iter().map(|c| c.0.load(Ordering::Relaxed)).collect();
    assert_eq!(counts.iter().sum::<u64>(), 17);
    let (min, max) = (
        *counts.iter().min().unwrap(),
        *counts.iter().max().unwrap(),
    );
    assert!(max - min <= 1, "counts not balanced: {counts:?}");
}

#[test]
fn distribute_picks_lowest_indexed_acceptable_child() {
    let tree = Node::distribute(vec![
        volume("a", &[]),
        volume("b", &[("/f", 7)]),
        volume("c", &[("/f", 7)]),
    ]);

    let mut op = StatOp {
        path: "/f",
        follow_symlink: true,
    };
    let result = traverse(&tree, &mut op).unwrap();
    assert_eq!(result.size, 7);
}

#[test]
fn distribute_skips_zero_size_entries() {
    let tree = Node::distribute(vec![volume("a", &[("/f", 0)]), volume("b", &[("/f", 3)])]);

    let mut op = StatOp {
        path: "/f",
        follow_symlink: true,
    };
    let result = traverse(&tree, &mut op).unwrap();
    assert_eq!(result.size, 3);
}

#[test]
fn distribute_returns_last_result_if_none_accept() {
    let tree = Node::distribute(vec![volume("a", &[]), volume("b", &[])]);

    let mut op = StatOp {
        path: "/missing",
        follow_symlink: true,
    };
    let result = traverse(&tree, &mut op);
    assert!(result.is_err());
}

#[test]
fn open_skips_zero_size_and_binds_to_accepting_session() {
    let tree = Node::distribute(vec![
        volume("a", &[("/f", 0)]),
        volume("b", &[("/f", 5)]),
    ]);

    let mut op = OpenOp::new("/f", OpenMode::default());
    let bound = traverse(&tree, &mut op).expect("expected a bound handle");
    assert_eq!(bound.session.fstat(bound.handle).unwrap().size, 5);
}

#[test]
fn open_under_bare_volume_returns_zero_size_handle_unfiltered() {
    // Outside of Distribute, the zero-size-means-absent filter never
    // applies: `acceptable` is only consulted by Distribute's retry loop.
    let tree = volume("a", &[("/empty", 0)]);

    let mut op = OpenOp::new("/empty", OpenMode::default());
    let bound = traverse(&tree, &mut op).expect("zero-size open should succeed under a bare volume");
    assert_eq!(bound.session.fstat(bound.handle).unwrap().size, 0);
}

#[test]
fn open_under_mirror_returns_zero_size_handle_unfiltered() {
    let tree = Node::mirror(vec![
        volume("a", &[("/empty", 0)]),
        volume("b", &[("/empty", 0)]),
    ]);

    let mut op = OpenOp::new("/empty", OpenMode::default());
    let bound = traverse(&tree, &mut op).expect("zero-size open should succeed under a mirror");
    assert_eq!(bound.session.fstat(bound.handle).unwrap().size, 0);
}

#[test]
fn readlink_resolves_raw_link_text_via_session() {
    // Exercises the session-level `readlink` primitive directly (the kernel
    // upcall is wired to `RealpathOp` instead, but `ReadlinkOp` still stands
    // in for the raw primitive itself).
    let tree = Node::volume(
        "a".to_string(),
        Arc::new(MockSession::new("a", &[]).with_link("/link", "target")),
    );

    let mut op = ReadlinkOp { path: "/link" };
    let result = traverse(&tree, &mut op);
    assert_eq!(result.unwrap(), "target");
}

#[test]
fn readlink_propagates_not_found_for_unconfigured_path() {
    let tree = volume("a", &[]);

    let mut op = ReadlinkOp { path: "/missing" };
    let result = traverse(&tree, &mut op);
    assert!(matches!(result, Err(SessionError::NotFound)));
}

#[test]
fn opendir_accepts_first_non_error_child() {
    let tree = Node::distribute(vec![volume("a", &[]), volume("b", &[("/f", 1)])]);

    let mut op = OpendirOp::new("/");
    let result = traverse(&tree, &mut op);
    assert!(result.is_ok());
    assert!(op.accepted.is_some());
}

#[test]
fn statvfs_sums_across_all_distribute_children() {
    let tree = Node::distribute(vec![
        volume("a", &[]),
        volume("b", &[]),
        volume("c", &[]),
    ]);

    let mut op = StatvfsOp::new("/");
    traverse(&tree, &mut op);
    assert_eq!(op.accumulator.blocks, 30);
    assert_eq!(op.accumulator.files, 300);
}

#[test]
fn statvfs_fresh_accumulator_per_call() {
    let tree = Node::distribute(vec![volume("a", &[])]);

    let mut first = StatvfsOp::new("/");
    traverse(&tree, &mut first);
    let mut second = StatvfsOp::new("/");
    traverse(&tree, &mut second);

    assert_eq!(first.accumulator.blocks, second.accumulator.blocks);
}
