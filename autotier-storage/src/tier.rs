//! One backend directory: path, quota, live usage counter, pending-move queue.
//!
//! The move protocol (§4.2) is copy-then-rename with an ENOSPC retry loop,
//! grounded on the same "stream in chunks, retry on a transient provider error"
//! shape as the retrying object-store wrapper this module's sibling crates use
//! elsewhere in the workspace, but specialized to local POSIX renames instead of
//! a generic retry-any-operation wrapper.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use autotier_core::{AutotierError, Quota, Result};

const HIDE_PREFIX: &str = ".";
const HIDE_SUFFIX: &str = ".autotier.hide";
pub const CONFLICT_SUFFIX: &str = ".autotier_conflict";
pub const CONFLICT_ORIG_SUFFIX: &str = ".autotier_conflict_orig";

pub fn hidden_name(file_name: &str) -> String {
    format!("{HIDE_PREFIX}{file_name}{HIDE_SUFFIX}")
}

pub fn is_hidden_move_name(file_name: &str) -> bool {
    file_name.starts_with(HIDE_PREFIX) && file_name.ends_with(HIDE_SUFFIX)
}

/// One file the simulation decided must move into this tier this pass.
#[derive(Debug, Clone)]
pub struct QueuedMove {
    pub rel_path: String,
    pub source_tier_path: PathBuf,
    pub size: u64,
}

#[derive(Debug)]
pub enum MoveOutcome {
    Moved,
    Conflict,
    Skipped,
}

pub struct Tier {
    pub id: String,
    pub path: PathBuf,
    pub quota: Quota,
    usage: AtomicU64,
    sim_usage: AtomicU64,
    incoming: Mutex<Vec<QueuedMove>>,
}

impl Tier {
    pub fn new(id: impl Into<String>, path: PathBuf, quota: Quota) -> Self {
        Self {
            id: id.into(),
            path,
            quota,
            usage: AtomicU64::new(0),
            sim_usage: AtomicU64::new(0),
            incoming: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity_bytes(&self) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(&self.path).map_err(nix_err)?;
        Ok(stat.blocks() as u64 * stat.fragment_size())
    }

    pub fn quota_bytes(&self) -> Result<u64> {
        Ok(self.quota.resolve(self.capacity_bytes()?))
    }

    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    pub fn add_usage(&self, delta: u64) {
        self.usage.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn sub_usage(&self, delta: u64) {
        self.usage.fetch_sub(delta.min(self.usage()), Ordering::SeqCst);
    }

    pub fn swap_usage(&self, old: u64, new: u64) {
        self.sub_usage(old);
        self.add_usage(new);
    }

    pub fn reset_sim_usage(&self) {
        self.sim_usage.store(0, Ordering::SeqCst);
    }

    pub fn sim_usage(&self) -> u64 {
        self.sim_usage.load(Ordering::SeqCst)
    }

    pub fn add_sim_usage(&self, delta: u64) {
        self.sim_usage.fetch_add(delta, Ordering::SeqCst);
    }

    /// `true` when adding `file_size` would exceed this tier's quota.
    pub fn full_test(&self, file_size: u64) -> Result<bool> {
        Ok(self.sim_usage() + file_size > self.quota_bytes()?)
    }

    pub fn enqueue(&self, item: QueuedMove) {
        self.incoming.lock().unwrap().push(item);
    }

    pub fn drain_queue(&self) -> Vec<QueuedMove> {
        std::mem::take(&mut self.incoming.lock().unwrap())
    }

    pub fn backend_path(&self, rel_path: &str) -> PathBuf {
        self.path.join(rel_path)
    }

    /// Executes the copy-then-rename protocol moving `rel_path` from
    /// `source_tier_path` into this tier. Skips (returns `Skipped`) when the
    /// caller already knows the file is open; the check itself happens in the
    /// engine, which has access to the process-wide [`OpenFileSet`].
    ///
    /// [`OpenFileSet`]: crate::openfiles::OpenFileSet
    pub fn move_file(&self, rel_path: &str, source_tier_path: &Path, buffer_size: usize) -> Result<MoveOutcome> {
        let src_path = source_tier_path.join(rel_path);
        let dst_path = self.path.join(rel_path);

        let dst_parent = dst_path.parent().unwrap_or(&self.path);
        if !dst_parent.exists() {
            fs::create_dir_all(dst_parent)?;
        }

        let file_name = dst_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AutotierError::InvalidConfig(format!("non-utf8 path: {rel_path}")))?;
        let hidden_dst = dst_parent.join(hidden_name(file_name));

        let src_meta = fs::metadata(&src_path)?;
        copy_with_enospc_retry(&src_path, &hidden_dst, buffer_size)?;
        copy_ownership_and_perms(&src_meta, &hidden_dst)?;

        if dst_path.exists() {
            let conflict_orig = src_path.with_file_name(format!("{file_name}{CONFLICT_ORIG_SUFFIX}"));
            let conflict_dst = dst_path.with_file_name(format!("{file_name}{CONFLICT_SUFFIX}"));
            fs::rename(&src_path, &conflict_orig)?;
            fs::rename(&dst_path, &conflict_dst)?;
            fs::remove_file(&hidden_dst)?;
            return Ok(MoveOutcome::Conflict);
        }

        fs::remove_file(&src_path)?;
        fs::rename(&hidden_dst, &dst_path)?;
        restore_times(&dst_path, &src_meta)?;
        Ok(MoveOutcome::Moved)
    }
}

/// Streams `src` to `dst` in `buffer_size` chunks. On a short write or ENOSPC,
/// seeks both descriptors back to the last confirmed offset, yields the thread,
/// and retries; any other error propagates immediately.
fn copy_with_enospc_retry(src: &Path, dst: &Path, buffer_size: usize) -> Result<()> {
    let mut src_file = File::open(src)?;
    let mut dst_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode_0755()
        .open(dst)?;

    let mut buf = vec![0u8; buffer_size.max(4096)];
    let mut offset: u64 = 0;

    loop {
        src_file.seek(SeekFrom::Start(offset))?;
        let n = src_file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        match dst_file.write(&buf[..n]) {
            Ok(written) if written == n => {
                offset += written as u64;
            }
            Ok(written) => {
                // short write: advance past the bytes actually written, then retry.
                offset += written as u64;
                src_file.seek(SeekFrom::Start(offset))?;
                dst_file.seek(SeekFrom::Start(offset))?;
                std::thread::yield_now();
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                dst_file.seek(SeekFrom::Start(offset))?;
                std::thread::yield_now();
            }
            Err(e) => return Err(e.into()),
        }
    }
    dst_file.flush()?;
    Ok(())
}

trait OpenOptionsExt755 {
    fn mode_0755(&mut self) -> &mut Self;
}

impl OpenOptionsExt755 for OpenOptions {
    fn mode_0755(&mut self) -> &mut Self {
        use std::os::unix::fs::OpenOptionsExt;
        self.mode(0o755)
    }
}

fn copy_ownership_and_perms(src_meta: &fs::Metadata, dst: &Path) -> Result<()> {
    fs::set_permissions(dst, src_meta.permissions())?;
    nix::unistd::chown(
        dst,
        Some(nix::unistd::Uid::from_raw(src_meta.uid())),
        Some(nix::unistd::Gid::from_raw(src_meta.gid())),
    )
    .map_err(nix_err)?;
    Ok(())
}

fn nix_err(e: nix::Error) -> AutotierError {
    AutotierError::Io(std::io::Error::from_raw_os_error(e as i32))
}

/// Restores the source's atime/mtime onto the moved file, undoing the bump to
/// "now" that the copy-then-rename left behind (§4.2 step 5).
fn restore_times(path: &Path, src_meta: &fs::Metadata) -> Result<()> {
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;

    let atime = TimeSpec::new(src_meta.atime(), src_meta.atime_nsec());
    let mtime = TimeSpec::new(src_meta.mtime(), src_meta.mtime_nsec());
    utimensat(None, path, &atime, &mtime, UtimensatFlags::NoFollowSymlink).map_err(nix_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotier_core::Quota;
    use tempfile::tempdir;

    fn make_tier(dir: &Path, id: &str, quota: Quota) -> Tier {
        fs::create_dir_all(dir).unwrap();
        Tier::new(id, dir.to_path_buf(), quota)
    }

    #[test]
    fn full_test_respects_quota() {
        let dir = tempdir().unwrap();
        let tier = make_tier(dir.path(), "t", Quota::Bytes(100));
        tier.add_sim_usage(90);
        assert!(!tier.full_test(5).unwrap());
        assert!(tier.full_test(20).unwrap());
    }

    #[test]
    fn move_file_moves_bytes_and_cleans_up_source() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        fs::write(src_dir.path().join("a.bin"), b"hello world").unwrap();
        let tier = make_tier(dst_dir.path(), "slow", Quota::Bytes(1_000_000));

        let outcome = tier.move_file("a.bin", src_dir.path(), 4096).unwrap();
        assert!(matches!(outcome, MoveOutcome::Moved));
        assert!(!src_dir.path().join("a.bin").exists());
        let contents = fs::read(dst_dir.path().join("a.bin")).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[test]
    fn move_file_detects_conflict() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        fs::write(src_dir.path().join("a.bin"), b"source").unwrap();
        fs::write(dst_dir.path().join("a.bin"), b"already here").unwrap();
        let tier = make_tier(dst_dir.path(), "slow", Quota::Bytes(1_000_000));

        let outcome = tier.move_file("a.bin", src_dir.path(), 4096).unwrap();
        assert!(matches!(outcome, MoveOutcome::Conflict));
        assert!(dst_dir.path().join("a.bin.autotier_conflict").exists());
        assert!(src_dir.path().join("a.bin.autotier_conflict_orig").exists());
    }

    #[test]
    fn hidden_name_matches_hide_pattern() {
        let name = hidden_name("a.bin");
        assert_eq!(name, ".a.bin.autotier.hide");
        assert!(is_hidden_move_name(&name));
        assert!(!is_hidden_move_name("a.bin"));
    }
}
