//! Transient object built during a tiering pass: backend path, size, timestamps,
//! owning tier, and the attached [`FileMeta`]. Dropping a `FileView` flushes its
//! FileMeta back to the MetaStore (§3).
//!
//! Per the design notes, raw pointers to `Tier` are replaced with a stable index
//! into the tier vector, which is fixed after config load.

use std::sync::Arc;

use autotier_core::FileMeta;

use crate::metastore::MetaStore;

pub struct FileView {
    pub rel_path: String,
    pub size: u64,
    pub atime_us: i64,
    pub mtime_us: i64,
    pub ctime_us: i64,
    /// index into the engine's tier vector, fastest-first.
    pub tier_index: usize,
    pub meta: FileMeta,
    metastore: Arc<MetaStore>,
    dirty: bool,
}

impl FileView {
    pub fn new(
        rel_path: String,
        size: u64,
        atime_us: i64,
        mtime_us: i64,
        ctime_us: i64,
        tier_index: usize,
        meta: FileMeta,
        metastore: Arc<MetaStore>,
    ) -> Self {
        Self {
            rel_path,
            size,
            atime_us,
            mtime_us,
            ctime_us,
            tier_index,
            meta,
            metastore,
            dirty: false,
        }
    }

    pub fn ctime_secs(&self) -> f64 {
        self.ctime_us as f64 / 1_000_000.0
    }

    pub fn atime_secs(&self) -> f64 {
        self.atime_us as f64 / 1_000_000.0
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Drop for FileView {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.metastore.put(&self.rel_path, &self.meta) {
                tracing::warn!(path = %self.rel_path, error = %e, "failed to flush FileMeta on FileView drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn drop_flushes_dirty_meta() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(&dir.path().join("db")).unwrap());
        {
            let mut view = FileView::new(
                "a/b".into(),
                10,
                0,
                0,
                0,
                0,
                FileMeta::new("/fast"),
                store.clone(),
            );
            view.meta.popularity = 42.0;
            view.mark_dirty();
        }
        let got = store.get("a/b").unwrap().unwrap();
        assert_eq!(got.popularity, 42.0);
    }

    #[test]
    fn drop_skips_flush_when_not_dirty() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(&dir.path().join("db")).unwrap());
        {
            let _view = FileView::new("a/b".into(), 10, 0, 0, 0, 0, FileMeta::new("/fast"), store.clone());
        }
        assert!(store.get("a/b").unwrap().is_none());
    }
}
