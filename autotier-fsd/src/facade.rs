//! Dispatches every kernel-facing operation to the tier that owns it (§4.6).
//!
//! A visible path is either a directory (lstat on the fastest tier says so)
//! or a file (looked up in MetaStore). Directory operations replicate to
//! every tier; file operations route to the single backend the file's
//! FileMeta names. Create-like operations always land on the fastest tier.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use autotier_core::{AutotierError, FileMeta, Result};
use autotier_storage::{MetaStore, OpenFileSet, Tier};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};

use crate::inode::{InodeTable, ROOT_INODE};

const TTL: Duration = Duration::from_secs(1);

struct OpenDescriptor {
    backend_path: PathBuf,
    tier_index: usize,
    size_at_open: u64,
    is_dir: bool,
}

/// Implements [`fuser::Filesystem`] over a tier list and a shared MetaStore.
/// Owns no backend I/O policy beyond the dispatch rules in §4.6; the move
/// protocol itself lives in `autotier_storage::Tier`.
pub struct FsFacade {
    tiers: Vec<Arc<Tier>>,
    metastore: Arc<MetaStore>,
    openfiles: Arc<OpenFileSet>,
    inodes: InodeTable,
    copy_buffer_size: usize,
    strict_period: bool,
    request_pass: Box<dyn Fn() + Send + Sync>,
    run_pass_blocking: Box<dyn Fn() + Send + Sync>,
    descriptors: Mutex<HashMap<u64, OpenDescriptor>>,
    next_fh: AtomicU64,
}

impl FsFacade {
    pub fn new(
        tiers: Vec<Arc<Tier>>,
        metastore: Arc<MetaStore>,
        openfiles: Arc<OpenFileSet>,
        copy_buffer_size: usize,
        strict_period: bool,
        request_pass: impl Fn() + Send + Sync + 'static,
        run_pass_blocking: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            tiers,
            metastore,
            openfiles,
            inodes: InodeTable::new(),
            copy_buffer_size,
            strict_period,
            request_pass: Box::new(request_pass),
            run_pass_blocking: Box::new(run_pass_blocking),
            descriptors: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn fastest_tier(&self) -> &Arc<Tier> {
        &self.tiers[0]
    }

    fn key_for(&self, path: &Path) -> String {
        autotier_core::normalize_key(&path.to_string_lossy()).to_string()
    }

    /// A directory's existence is judged by lstat on the fastest tier, per
    /// the open question in §9: autotier keeps no per-directory metadata.
    fn is_directory(&self, path: &Path) -> bool {
        backend_path_for(self.fastest_tier(), path)
            .symlink_metadata()
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    fn resolve_file(&self, path: &Path) -> Result<(usize, PathBuf, FileMeta)> {
        let key = self.key_for(path);
        let meta = self
            .metastore
            .get(&key)?
            .ok_or_else(|| AutotierError::NotFound(key.clone()))?;
        let tier_index = self
            .tiers
            .iter()
            .position(|t| t.path == Path::new(&meta.tier_path))
            .ok_or_else(|| AutotierError::Fatal(format!("unknown tier path {}", meta.tier_path)))?;
        let backend = backend_path_for(&self.tiers[tier_index], path);
        Ok((tier_index, backend, meta))
    }

    fn attr_from_metadata(&self, ino: u64, metadata: &fs::Metadata) -> FileAttr {
        let kind = if metadata.is_dir() {
            FileType::Directory
        } else if metadata.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::RegularFile
        };
        FileAttr {
            ino,
            size: metadata.len(),
            blocks: metadata.blocks(),
            atime: system_time_from_secs(metadata.atime(), metadata.atime_nsec()),
            mtime: system_time_from_secs(metadata.mtime(), metadata.mtime_nsec()),
            ctime: system_time_from_secs(metadata.ctime(), metadata.ctime_nsec()),
            crtime: UNIX_EPOCH,
            kind,
            perm: (metadata.permissions().mode() & 0o7777) as u16,
            nlink: metadata.nlink() as u32,
            uid: metadata.uid(),
            gid: metadata.gid(),
            rdev: metadata.rdev() as u32,
            blksize: 4096,
            flags: 0,
        }
    }

    fn path_for(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let parent_path = self.inodes.path_of(parent)?;
        Some(parent_path.join(name))
    }

    /// Runs `f` against every tier in order, returning the first error.
    fn replicate_dirs(&self, mut f: impl FnMut(&Tier) -> std::io::Result<()>) -> Result<()> {
        for tier in &self.tiers {
            f(tier).map_err(AutotierError::Io)?;
        }
        Ok(())
    }

    fn request_tiering_pass_on_quota_exceeded(&self, tier_index: usize) {
        if self.strict_period {
            return;
        }
        let tier = &self.tiers[tier_index];
        if let Ok(quota) = tier.quota_bytes() {
            if tier.usage() > quota {
                (self.request_pass)();
            }
        }
    }

    fn allocate_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }
}

fn backend_path_for(tier: &Tier, path: &Path) -> PathBuf {
    tier.backend_path(autotier_core::normalize_key(&path.to_string_lossy()))
}

fn write_once(backend: &Path, offset: i64, data: &[u8]) -> std::io::Result<usize> {
    let mut file = fs::OpenOptions::new().write(true).open(backend)?;
    file.seek(SeekFrom::Start(offset as u64))?;
    file.write_all(data)?;
    Ok(data.len())
}

fn system_time_from_secs(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn errno_of(err: AutotierError) -> i32 {
    err.errno()
}

impl Filesystem for FsFacade {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.path_for(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let backend = if self.is_directory(&path) {
            backend_path_for(self.fastest_tier(), &path)
        } else {
            match self.resolve_file(&path) {
                Ok((_, backend, _)) => backend,
                Err(e) => {
                    reply.error(errno_of(e));
                    return;
                }
            }
        };
        match backend.symlink_metadata() {
            Ok(metadata) => {
                let ino = self.inodes.intern(&path);
                reply.entry(&TTL, &self.attr_from_metadata(ino, &metadata), 0);
            }
            Err(_) => reply.error(libc::ENOENT),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let backend = if ino == ROOT_INODE || self.is_directory(&path) {
            backend_path_for(self.fastest_tier(), &path)
        } else {
            match self.resolve_file(&path) {
                Ok((_, backend, _)) => backend,
                Err(e) => {
                    reply.error(errno_of(e));
                    return;
                }
            }
        };
        match backend.symlink_metadata() {
            Ok(metadata) => reply.attr(&TTL, &self.attr_from_metadata(ino, &metadata)),
            Err(_) => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let result = if self.is_directory(&path) {
            self.replicate_dirs(|tier| {
                let backend = backend_path_for(tier, &path);
                apply_attrs(&backend, mode, uid, gid, size)
            })
        } else {
            self.resolve_file(&path).and_then(|(_, backend, _)| {
                apply_attrs(&backend, mode, uid, gid, size).map_err(AutotierError::Io)
            })
        };
        match result {
            Ok(()) => {
                let backend = if self.is_directory(&path) {
                    backend_path_for(self.fastest_tier(), &path)
                } else {
                    match self.resolve_file(&path) {
                        Ok((_, b, _)) => b,
                        Err(e) => {
                            reply.error(errno_of(e));
                            return;
                        }
                    }
                };
                match backend.symlink_metadata() {
                    Ok(metadata) => reply.attr(&TTL, &self.attr_from_metadata(ino, &metadata)),
                    Err(_) => reply.error(libc::ENOENT),
                }
            }
            Err(e) => reply.error(errno_of(e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let backend = match self.resolve_file(&path) {
            Ok((_, backend, _)) => backend,
            Err(e) => {
                reply.error(errno_of(e));
                return;
            }
        };
        match fs::read_link(&backend) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.path_for(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let backend = backend_path_for(self.fastest_tier(), &path);
        let result = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&backend)
            .and_then(|f| {
                let mut perms = f.metadata()?.permissions();
                perms.set_mode(mode & 0o7777);
                f.set_permissions(perms)
            });
        if let Err(e) = result {
            reply.error(e.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        let key = self.key_for(&path);
        if let Err(e) = self
            .metastore
            .put(&key, &FileMeta::new(&self.fastest_tier().path.to_string_lossy()))
        {
            reply.error(errno_of(e));
            return;
        }
        match backend.symlink_metadata() {
            Ok(metadata) => {
                let ino = self.inodes.intern(&path);
                reply.entry(&TTL, &self.attr_from_metadata(ino, &metadata), 0);
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(path) = self.path_for(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let result = self.replicate_dirs(|tier| {
            let backend = backend_path_for(tier, &path);
            fs::create_dir(&backend)?;
            fs::set_permissions(&backend, fs::Permissions::from_mode(mode & 0o7777))
        });
        match result {
            Ok(()) => match backend_path_for(self.fastest_tier(), &path).symlink_metadata() {
                Ok(metadata) => {
                    let ino = self.inodes.intern(&path);
                    reply.entry(&TTL, &self.attr_from_metadata(ino, &metadata), 0);
                }
                Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
            },
            Err(e) => reply.error(errno_of(e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.path_for(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let key = self.key_for(&path);
        match self.resolve_file(&path) {
            Ok((_, backend, _)) => match fs::remove_file(&backend) {
                Ok(()) => {
                    if let Err(e) = self.metastore.delete(&key) {
                        reply.error(errno_of(e));
                        return;
                    }
                    self.inodes.forget_path(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
            },
            Err(e) => reply.error(errno_of(e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.path_for(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let result = self.replicate_dirs(|tier| fs::remove_dir(backend_path_for(tier, &path)));
        match result {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(e)),
        }
    }

    fn symlink(&mut self, _req: &Request, parent: u64, name: &OsStr, link: &Path, reply: ReplyEntry) {
        let Some(path) = self.path_for(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let backend = backend_path_for(self.fastest_tier(), &path);
        if let Err(e) = std::os::unix::fs::symlink(link, &backend) {
            reply.error(e.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        let key = self.key_for(&path);
        if let Err(e) = self
            .metastore
            .put(&key, &FileMeta::new(&self.fastest_tier().path.to_string_lossy()))
        {
            reply.error(errno_of(e));
            return;
        }
        match backend.symlink_metadata() {
            Ok(metadata) => {
                let ino = self.inodes.intern(&path);
                reply.entry(&TTL, &self.attr_from_metadata(ino, &metadata), 0);
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn link(&mut self, _req: &Request, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let (Some(old_path), Some(new_path)) = (self.inodes.path_of(ino), self.path_for(newparent, newname)) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (tier_index, old_backend, _) = match self.resolve_file(&old_path) {
            Ok(v) => v,
            Err(e) => {
                reply.error(errno_of(e));
                return;
            }
        };
        let new_backend = backend_path_for(&self.tiers[tier_index], &new_path);
        if let Err(e) = fs::hard_link(&old_backend, &new_backend) {
            reply.error(e.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        let key = self.key_for(&new_path);
        if let Err(e) = self
            .metastore
            .put(&key, &FileMeta::new(&self.tiers[tier_index].path.to_string_lossy()))
        {
            reply.error(errno_of(e));
            return;
        }
        match new_backend.symlink_metadata() {
            Ok(metadata) => {
                let new_ino = self.inodes.intern(&new_path);
                reply.entry(&TTL, &self.attr_from_metadata(new_ino, &metadata), 0);
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    /// Directory rename replicates across every tier and rewrites every
    /// MetaStore key under the old prefix atomically; file rename moves only
    /// the owning tier's backend entry then rewrites one key (§4.6).
    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old_path), Some(new_path)) = (self.path_for(parent, name), self.path_for(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };

        if self.is_directory(&old_path) {
            let result = self.replicate_dirs(|tier| {
                fs::rename(backend_path_for(tier, &old_path), backend_path_for(tier, &new_path))
            });
            if let Err(e) = result {
                reply.error(errno_of(e));
                return;
            }
            let old_prefix = self.key_for(&old_path);
            let new_prefix = self.key_for(&new_path);
            let rewrite = (|| -> Result<()> {
                let mut batch = autotier_storage::MetaBatch::new();
                for entry in self.metastore.scan_prefix(&format!("{old_prefix}/")) {
                    let (key, meta) = entry?;
                    let suffix = key.strip_prefix(&format!("{old_prefix}/")).unwrap();
                    batch = batch.delete(key.clone()).put(format!("{new_prefix}/{suffix}"), meta);
                }
                if let Some(meta) = self.metastore.get(&old_prefix)? {
                    batch = batch.delete(old_prefix.clone()).put(new_prefix.clone(), meta);
                }
                self.metastore.apply(batch)
            })();
            if let Err(e) = rewrite {
                reply.error(errno_of(e));
                return;
            }
            self.inodes.reparent(&old_path, &new_path);
            reply.ok();
            return;
        }

        let (tier_index, old_backend, meta) = match self.resolve_file(&old_path) {
            Ok(v) => v,
            Err(e) => {
                reply.error(errno_of(e));
                return;
            }
        };
        let new_backend = backend_path_for(&self.tiers[tier_index], &new_path);
        if new_backend.exists() {
            reply.error(libc::EEXIST);
            return;
        }
        if let Err(e) = fs::rename(&old_backend, &new_backend) {
            reply.error(e.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        let batch = autotier_storage::MetaBatch::new()
            .delete(self.key_for(&old_path))
            .put(self.key_for(&new_path), meta);
        if let Err(e) = self.metastore.apply(batch) {
            reply.error(errno_of(e));
            return;
        }
        self.inodes.reparent(&old_path, &new_path);
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (tier_index, backend, _) = match self.resolve_file(&path) {
            Ok(v) => v,
            Err(e) => {
                reply.error(errno_of(e));
                return;
            }
        };
        let size = fs::metadata(&backend).map(|m| m.len()).unwrap_or(0);
        self.openfiles.register(&backend.to_string_lossy());
        let fh = self.allocate_fh();
        self.descriptors.lock().unwrap().insert(
            fh,
            OpenDescriptor {
                backend_path: backend,
                tier_index,
                size_at_open: size,
                is_dir: false,
            },
        );
        reply.opened(fh, flags as u32 & 0x0000_ffff);
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let backend = {
            let descriptors = self.descriptors.lock().unwrap();
            match descriptors.get(&fh) {
                Some(d) => d.backend_path.clone(),
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        let result = (|| -> std::io::Result<Vec<u8>> {
            let mut file = fs::File::open(&backend)?;
            file.seek(SeekFrom::Start(offset as u64))?;
            let mut buf = vec![0u8; size as usize];
            let n = file.read(&mut buf)?;
            buf.truncate(n);
            Ok(buf)
        })();
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let (backend, tier_index) = {
            let descriptors = self.descriptors.lock().unwrap();
            match descriptors.get(&fh) {
                Some(d) => (d.backend_path.clone(), d.tier_index),
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        let _ = tier_index;
        match write_once(&backend, offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) if e.raw_os_error() == Some(libc::ENOSPC) && !self.strict_period => {
                (self.run_pass_blocking)();
                match write_once(&backend, offset, data) {
                    Ok(n) => reply.written(n as u32),
                    Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::ENOSPC)),
                }
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    /// Computes the size delta since `open` and folds it into the owning
    /// tier's live usage counter; a resulting quota breach asks the tiering
    /// thread for a pass unless strict-period mode is on (§4.6).
    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let descriptor = self.descriptors.lock().unwrap().remove(&fh);
        if let Some(descriptor) = descriptor {
            self.openfiles.release(&descriptor.backend_path.to_string_lossy());
            let new_size = fs::metadata(&descriptor.backend_path).map(|m| m.len()).unwrap_or(0);
            let tier = &self.tiers[descriptor.tier_index];
            if new_size >= descriptor.size_at_open {
                tier.add_usage(new_size - descriptor.size_at_open);
            } else {
                tier.sub_usage(descriptor.size_at_open - new_size);
            }
            self.request_tiering_pass_on_quota_exceeded(descriptor.tier_index);
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let backend = self.descriptors.lock().unwrap().get(&fh).map(|d| d.backend_path.clone());
        match backend {
            Some(path) => match fs::File::open(&path).and_then(|f| f.sync_all()) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fh = self.allocate_fh();
        self.descriptors.lock().unwrap().insert(
            fh,
            OpenDescriptor {
                backend_path: backend_path_for(self.fastest_tier(), &path),
                tier_index: 0,
                size_at_open: 0,
                is_dir: true,
            },
        );
        reply.opened(fh, flags as u32 & 0x0000_ffff);
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let backend = backend_path_for(self.fastest_tier(), &path);
        let entries = match fs::read_dir(&backend) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        };
        let mut names: Vec<(String, bool)> = vec![(".".into(), true), ("..".into(), true)];
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if autotier_storage::is_hidden_move_name(&name) {
                continue;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            names.push((name, is_dir));
        }
        for (i, (name, is_dir)) in names.iter().enumerate().skip(offset as usize) {
            let child_path = if name == "." || name == ".." {
                path.clone()
            } else {
                path.join(name)
            };
            let child_ino = if name == "." {
                ino
            } else if name == ".." {
                path.parent()
                    .and_then(|p| self.inodes.ino_of(p))
                    .unwrap_or(ROOT_INODE)
            } else {
                self.inodes.intern(&child_path)
            };
            let kind = if *is_dir { FileType::Directory } else { FileType::RegularFile };
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.descriptors.lock().unwrap().remove(&fh);
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let mut blocks = 0u64;
        let mut bfree = 0u64;
        let mut files = 0u64;
        for tier in &self.tiers {
            if let Ok(quota) = tier.quota_bytes() {
                blocks += quota / 4096;
                bfree += quota.saturating_sub(tier.usage()) / 4096;
            }
            files += 1;
        }
        reply.statfs(blocks, bfree, bfree, files, 0, 4096, 255, 4096);
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let result = if self.is_directory(&path) {
            self.replicate_dirs(|tier| xattr_set(&backend_path_for(tier, &path), name, value))
        } else {
            self.resolve_file(&path)
                .map_err(|e| e)
                .and_then(|(_, backend, _)| xattr_set(&backend, name, value).map_err(AutotierError::Io))
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(e)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let backend = if self.is_directory(&path) {
            backend_path_for(self.fastest_tier(), &path)
        } else {
            match self.resolve_file(&path) {
                Ok((_, b, _)) => b,
                Err(e) => {
                    reply.error(errno_of(e));
                    return;
                }
            }
        };
        match xattr_get(&backend, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else {
                    reply.data(&value);
                }
            }
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let backend = if self.is_directory(&path) {
            backend_path_for(self.fastest_tier(), &path)
        } else {
            match self.resolve_file(&path) {
                Ok((_, b, _)) => b,
                Err(e) => {
                    reply.error(errno_of(e));
                    return;
                }
            }
        };
        match xattr_list(&backend) {
            Ok(list) => {
                if size == 0 {
                    reply.size(list.len() as u32);
                } else {
                    reply.data(&list);
                }
            }
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let result = if self.is_directory(&path) {
            self.replicate_dirs(|tier| xattr_remove(&backend_path_for(tier, &path), name))
        } else {
            self.resolve_file(&path)
                .and_then(|(_, backend, _)| xattr_remove(&backend, name).map_err(AutotierError::Io))
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let backend = if ino == ROOT_INODE || self.is_directory(&path) {
            backend_path_for(self.fastest_tier(), &path)
        } else {
            match self.resolve_file(&path) {
                Ok((_, b, _)) => b,
                Err(e) => {
                    reply.error(errno_of(e));
                    return;
                }
            }
        };
        let mode = if mask == libc::F_OK { 0 } else { mask };
        match nix::unistd::access(&backend, access_flags(mode)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as i32),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.path_for(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let backend = backend_path_for(self.fastest_tier(), &path);
        let file = match fs::OpenOptions::new().create_new(true).write(true).open(&backend) {
            Ok(f) => f,
            Err(e) => {
                reply.error(e.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        };
        if let Ok(mut perms) = file.metadata().map(|m| m.permissions()) {
            perms.set_mode(mode & 0o7777);
            let _ = file.set_permissions(perms);
        }
        let key = self.key_for(&path);
        if let Err(e) = self
            .metastore
            .put(&key, &FileMeta::new(&self.fastest_tier().path.to_string_lossy()))
        {
            reply.error(errno_of(e));
            return;
        }
        self.openfiles.register(&backend.to_string_lossy());
        let fh = self.allocate_fh();
        self.descriptors.lock().unwrap().insert(
            fh,
            OpenDescriptor {
                backend_path: backend.clone(),
                tier_index: 0,
                size_at_open: 0,
                is_dir: false,
            },
        );
        match backend.symlink_metadata() {
            Ok(metadata) => {
                let ino = self.inodes.intern(&path);
                reply.created(&TTL, &self.attr_from_metadata(ino, &metadata), 0, fh, flags as u32);
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
}

fn apply_attrs(
    backend: &Path,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
) -> std::io::Result<()> {
    if let Some(mode) = mode {
        fs::set_permissions(backend, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    if uid.is_some() || gid.is_some() {
        let uid = uid.map(nix::unistd::Uid::from_raw);
        let gid = gid.map(nix::unistd::Gid::from_raw);
        nix::unistd::chown(backend, uid, gid).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    }
    if let Some(size) = size {
        let file = fs::OpenOptions::new().write(true).open(backend)?;
        file.set_len(size)?;
    }
    Ok(())
}

fn access_flags(mode: i32) -> nix::unistd::AccessFlags {
    let mut flags = nix::unistd::AccessFlags::empty();
    if mode == 0 {
        return nix::unistd::AccessFlags::F_OK;
    }
    if mode & libc::R_OK != 0 {
        flags |= nix::unistd::AccessFlags::R_OK;
    }
    if mode & libc::W_OK != 0 {
        flags |= nix::unistd::AccessFlags::W_OK;
    }
    if mode & libc::X_OK != 0 {
        flags |= nix::unistd::AccessFlags::X_OK;
    }
    flags
}

fn xattr_set(path: &Path, name: &OsStr, value: &[u8]) -> std::io::Result<()> {
    xattr::set(path, name, value)
}

fn xattr_get(path: &Path, name: &OsStr) -> std::result::Result<Vec<u8>, i32> {
    match xattr::get(path, name) {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(libc::ENODATA),
        Err(e) => Err(e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

fn xattr_list(path: &Path) -> std::result::Result<Vec<u8>, i32> {
    let list = xattr::list(path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
    let mut buf = Vec::new();
    for name in list {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }
    Ok(buf)
}

fn xattr_remove(path: &Path, name: &OsStr) -> std::io::Result<()> {
    xattr::remove(path, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotier_core::Quota;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, FsFacade) {
        let root = tempdir().unwrap();
        let fast_path = root.path().join("fast");
        let slow_path = root.path().join("slow");
        fs::create_dir_all(&fast_path).unwrap();
        fs::create_dir_all(&slow_path).unwrap();
        let tiers = vec![
            Arc::new(Tier::new("fast", fast_path, Quota::Bytes(1024))),
            Arc::new(Tier::new("slow", slow_path, Quota::Bytes(1024))),
        ];
        let metastore = Arc::new(MetaStore::open(&root.path().join("run/db")).unwrap());
        let openfiles = Arc::new(OpenFileSet::new());
        let facade = FsFacade::new(tiers, metastore, openfiles, 4096, false, || {}, || {});
        (root, facade)
    }

    #[test]
    fn key_for_strips_leading_slash() {
        let (_root, facade) = setup();
        assert_eq!(facade.key_for(Path::new("/a/b.bin")), "a/b.bin");
    }

    #[test]
    fn is_directory_true_for_fastest_tier_dir_and_false_for_missing_path() {
        let (root, facade) = setup();
        fs::create_dir_all(root.path().join("fast/sub")).unwrap();
        assert!(facade.is_directory(Path::new("/sub")));
        assert!(!facade.is_directory(Path::new("/nope")));
    }

    #[test]
    fn resolve_file_routes_to_the_tier_named_in_metastore() {
        let (root, facade) = setup();
        let slow = &facade.tiers[1];
        fs::write(slow.path.join("a.bin"), b"hi").unwrap();
        facade
            .metastore
            .put("a.bin", &FileMeta::new(slow.path.to_string_lossy().as_ref()))
            .unwrap();
        let (tier_index, backend, _) = facade.resolve_file(Path::new("/a.bin")).unwrap();
        assert_eq!(tier_index, 1);
        assert_eq!(backend, root.path().join("slow/a.bin"));
    }

    #[test]
    fn resolve_file_errors_when_key_absent() {
        let (_root, facade) = setup();
        assert!(facade.resolve_file(Path::new("/missing.bin")).is_err());
    }

    #[test]
    fn replicate_dirs_stops_at_first_error() {
        let (_root, facade) = setup();
        let mut calls = 0;
        let result = facade.replicate_dirs(|_tier| {
            calls += 1;
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn request_tiering_pass_on_quota_exceeded_fires_only_over_quota() {
        let root = tempdir().unwrap();
        let fast_path = root.path().join("fast");
        fs::create_dir_all(&fast_path).unwrap();
        let tiers = vec![Arc::new(Tier::new("fast", fast_path, Quota::Bytes(100)))];
        let metastore = Arc::new(MetaStore::open(&root.path().join("run/db")).unwrap());
        let openfiles = Arc::new(OpenFileSet::new());
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();
        let facade = FsFacade::new(
            tiers,
            metastore,
            openfiles,
            4096,
            false,
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );
        facade.tiers[0].add_usage(50);
        facade.request_tiering_pass_on_quota_exceeded(0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        facade.tiers[0].add_usage(100);
        facade.request_tiering_pass_on_quota_exceeded(0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn request_tiering_pass_is_suppressed_during_strict_period() {
        let root = tempdir().unwrap();
        let fast_path = root.path().join("fast");
        fs::create_dir_all(&fast_path).unwrap();
        let tiers = vec![Arc::new(Tier::new("fast", fast_path, Quota::Bytes(10)))];
        let metastore = Arc::new(MetaStore::open(&root.path().join("run/db")).unwrap());
        let openfiles = Arc::new(OpenFileSet::new());
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();
        let facade = FsFacade::new(
            tiers,
            metastore,
            openfiles,
            4096,
            true,
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );
        facade.tiers[0].add_usage(1000);
        facade.request_tiering_pass_on_quota_exceeded(0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn allocate_fh_is_monotonic_and_unique() {
        let (_root, facade) = setup();
        let a = facade.allocate_fh();
        let b = facade.allocate_fh();
        assert_ne!(a, b);
    }

    #[test]
    fn backend_path_for_joins_tier_root_and_normalized_key() {
        let (root, facade) = setup();
        let path = backend_path_for(&facade.tiers[0], Path::new("/a/b.bin"));
        assert_eq!(path, root.path().join("fast/a/b.bin"));
    }

    #[test]
    fn access_flags_maps_f_ok_and_rwx() {
        assert_eq!(access_flags(0), nix::unistd::AccessFlags::F_OK);
        let rw = access_flags(libc::R_OK | libc::W_OK);
        assert!(rw.contains(nix::unistd::AccessFlags::R_OK));
        assert!(rw.contains(nix::unistd::AccessFlags::W_OK));
        assert!(!rw.contains(nix::unistd::AccessFlags::X_OK));
    }

    #[test]
    fn system_time_from_secs_roundtrips_positive_epoch() {
        let t = system_time_from_secs(1_000, 500);
        assert_eq!(t, UNIX_EPOCH + Duration::new(1_000, 500));
    }
}
