//! Process-wide multiset of open backend paths, consulted before migrating a file.

use std::collections::HashMap;
use std::sync::Mutex;

/// Guarded by its own mutex (§5); the tiering engine checks membership with a
/// single `is_open` call per file rather than holding this lock across I/O.
#[derive(Default)]
pub struct OpenFileSet {
    counts: Mutex<HashMap<String, u32>>,
}

impl OpenFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before the backend `open`/`create` call.
    pub fn register(&self, backend_path: &str) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(backend_path.to_string()).or_insert(0) += 1;
    }

    /// Called after the backend `close`. Erases the entry on reaching zero.
    pub fn release(&self, backend_path: &str) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(backend_path) {
            *count -= 1;
            if *count == 0 {
                counts.remove(backend_path);
            }
        }
    }

    pub fn is_open(&self, backend_path: &str) -> bool {
        self.counts.lock().unwrap().contains_key(backend_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_is_open() {
        let set = OpenFileSet::new();
        assert!(!set.is_open("/fast/a"));
        set.register("/fast/a");
        assert!(set.is_open("/fast/a"));
    }

    #[test]
    fn release_erases_on_zero() {
        let set = OpenFileSet::new();
        set.register("/fast/a");
        set.register("/fast/a");
        set.release("/fast/a");
        assert!(set.is_open("/fast/a"));
        set.release("/fast/a");
        assert!(!set.is_open("/fast/a"));
    }
}
