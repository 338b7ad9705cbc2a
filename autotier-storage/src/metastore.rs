//! Persistent ordered key-value mapping from relative path to [`FileMeta`].
//!
//! Backed by `sled`, an embedded ordered KV store, matching the contract's
//! "opaque ordered KV store with prefix iteration and atomic batch writes".

use std::path::Path;
use std::sync::Mutex;

use autotier_core::{AutotierError, FileMeta, Result};

/// One atomic multi-key update: a set of deletes and a set of puts, applied together.
#[derive(Debug, Default)]
pub struct MetaBatch {
    puts: Vec<(String, FileMeta)>,
    deletes: Vec<String>,
}

impl MetaBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: impl Into<String>, meta: FileMeta) -> Self {
        self.puts.push((key.into(), meta));
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.deletes.push(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// All writes funnel through this single process-wide lock so multi-key directory
/// renames stay observable atomically (§4.1); reads are lock-free.
pub struct MetaStore {
    db: sled::Db,
    write_lock: Mutex<()>,
}

impl MetaStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let db = sled::open(db_path)
            .map_err(|e| AutotierError::Fatal(format!("opening metastore at {}: {e}", db_path.display())))?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<FileMeta>> {
        match self.db.get(key.as_bytes()).map_err(sled_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, meta: &FileMeta) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        self.db.insert(key.as_bytes(), encode(meta)?).map_err(sled_err)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        self.db.remove(key.as_bytes()).map_err(sled_err)?;
        Ok(())
    }

    /// Applies a batch of puts and deletes atomically under the write lock.
    pub fn apply(&self, batch: MetaBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap();
        let mut sled_batch = sled::Batch::default();
        for key in &batch.deletes {
            sled_batch.remove(key.as_bytes());
        }
        for (key, meta) in &batch.puts {
            sled_batch.insert(key.as_bytes(), encode(meta)?);
        }
        self.db.apply_batch(sled_batch).map_err(sled_err)?;
        Ok(())
    }

    /// Lazily iterates every entry whose key starts with `prefix`, in key order.
    pub fn scan_prefix<'a>(&'a self, prefix: &str) -> impl Iterator<Item = Result<(String, FileMeta)>> + 'a {
        self.db.scan_prefix(prefix.as_bytes()).map(|res| {
            let (k, v) = res.map_err(sled_err)?;
            let key = String::from_utf8_lossy(&k).into_owned();
            let meta = decode(&v)?;
            Ok((key, meta))
        })
    }

    pub fn iterate_all(&self) -> impl Iterator<Item = Result<(String, FileMeta)>> + '_ {
        self.scan_prefix("")
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(sled_err)?;
        Ok(())
    }
}

fn sled_err(e: sled::Error) -> AutotierError {
    AutotierError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

fn encode(meta: &FileMeta) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(meta)?)
}

fn decode(raw: &[u8]) -> Result<FileMeta> {
    Ok(serde_json::from_slice(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, MetaStore) {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(&dir.path().join("db")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, store) = store();
        let meta = FileMeta::new("/fast");
        store.put("a/b", &meta).unwrap();
        let got = store.get("a/b").unwrap().unwrap();
        assert_eq!(got.tier_path, "/fast");
    }

    #[test]
    fn get_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn batch_put_and_delete_apply_atomically() {
        let (_dir, store) = store();
        store.put("old", &FileMeta::new("/fast")).unwrap();
        let batch = MetaBatch::new()
            .delete("old")
            .put("new", FileMeta::new("/fast"));
        store.apply(batch).unwrap();
        assert!(store.get("old").unwrap().is_none());
        assert!(store.get("new").unwrap().is_some());
    }

    #[test]
    fn scan_prefix_returns_subtree_in_order() {
        let (_dir, store) = store();
        store.put("d/a", &FileMeta::new("/fast")).unwrap();
        store.put("d/b", &FileMeta::new("/fast")).unwrap();
        store.put("d2/c", &FileMeta::new("/fast")).unwrap();
        let keys: Vec<String> = store
            .scan_prefix("d/")
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec!["d/a".to_string(), "d/b".to_string()]);
    }
}
