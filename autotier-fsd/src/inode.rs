//! Bridges path-based dispatch (§4.6 describes every operation in terms of a
//! visible path `P`) to the inode numbers the kernel driver actually passes.
//! The facade is path-based internally; this table is the only place u64
//! inode numbers exist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const ROOT_INODE: u64 = 1;

struct Inner {
    path_to_ino: HashMap<PathBuf, u64>,
    ino_to_path: HashMap<u64, PathBuf>,
    lookup_counts: HashMap<u64, u64>,
    next_ino: u64,
}

/// Maps visible paths to stable inode numbers and back. A path's inode is
/// allocated on first lookup and retired once its kernel lookup count drops
/// to zero via `forget`, mirroring the kernel's own reference counting.
pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut path_to_ino = HashMap::new();
        let mut ino_to_path = HashMap::new();
        path_to_ino.insert(PathBuf::from("/"), ROOT_INODE);
        ino_to_path.insert(ROOT_INODE, PathBuf::from("/"));
        Self {
            inner: Mutex::new(Inner {
                path_to_ino,
                ino_to_path,
                lookup_counts: HashMap::from([(ROOT_INODE, 1)]),
                next_ino: ROOT_INODE + 1,
            }),
        }
    }

    /// Returns the existing inode for `path`, allocating one and bumping its
    /// lookup count if this is the first time the path has been seen.
    pub fn intern(&self, path: &Path) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&ino) = inner.path_to_ino.get(path) {
            *inner.lookup_counts.entry(ino).or_insert(0) += 1;
            return ino;
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        inner.path_to_ino.insert(path.to_path_buf(), ino);
        inner.ino_to_path.insert(ino, path.to_path_buf());
        inner.lookup_counts.insert(ino, 1);
        ino
    }

    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inner.lock().unwrap().ino_to_path.get(&ino).cloned()
    }

    pub fn ino_of(&self, path: &Path) -> Option<u64> {
        self.inner.lock().unwrap().path_to_ino.get(path).copied()
    }

    /// Rewrites every entry whose path is `old` or under `old/`, used after a
    /// directory rename (§4.6) so outstanding inode numbers stay valid.
    pub fn reparent(&self, old: &Path, new: &Path) {
        let mut inner = self.inner.lock().unwrap();
        let affected: Vec<PathBuf> = inner
            .path_to_ino
            .keys()
            .filter(|p| *p == old || p.starts_with(old))
            .cloned()
            .collect();
        for path in affected {
            let ino = inner.path_to_ino.remove(&path).unwrap();
            let rebased = if path == old {
                new.to_path_buf()
            } else {
                new.join(path.strip_prefix(old).unwrap())
            };
            inner.path_to_ino.insert(rebased.clone(), ino);
            inner.ino_to_path.insert(ino, rebased);
        }
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.lookup_counts.get_mut(&ino) {
            *count = count.saturating_sub(nlookup);
            if *count == 0 && ino != ROOT_INODE {
                if let Some(path) = inner.ino_to_path.remove(&ino) {
                    inner.path_to_ino.remove(&path);
                }
                inner.lookup_counts.remove(&ino);
            }
        }
    }

    pub fn forget_path(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ino) = inner.path_to_ino.remove(path) {
            inner.ino_to_path.remove(&ino);
            inner.lookup_counts.remove(&ino);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_inode_resolves_to_root_path() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INODE), Some(PathBuf::from("/")));
    }

    #[test]
    fn intern_assigns_stable_inode_per_path() {
        let table = InodeTable::new();
        let a = table.intern(Path::new("/a.bin"));
        let b = table.intern(Path::new("/a.bin"));
        assert_eq!(a, b);
    }

    #[test]
    fn forget_retires_inode_when_count_reaches_zero() {
        let table = InodeTable::new();
        let ino = table.intern(Path::new("/a.bin"));
        table.forget(ino, 1);
        assert_eq!(table.path_of(ino), None);
    }

    #[test]
    fn reparent_rewrites_subtree_paths() {
        let table = InodeTable::new();
        let a = table.intern(Path::new("/d/a"));
        let b = table.intern(Path::new("/d/b"));
        table.reparent(Path::new("/d"), Path::new("/e"));
        assert_eq!(table.path_of(a), Some(PathBuf::from("/e/a")));
        assert_eq!(table.path_of(b), Some(PathBuf::from("/e/b")));
        assert_eq!(table.ino_of(Path::new("/d/a")), None);
    }
}
