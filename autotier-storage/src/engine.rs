//! Periodic crawl -> popularity -> sort -> simulate -> execute pass, and the
//! inter-process tiering lock. Grounded on the teacher's `TieringManager`
//! (policy-driven aging between Hot/Warm/Cold) generalized from three fixed
//! tiers to an ordered list of N, and on the ENOSPC move protocol lifted into
//! [`crate::tier`].

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use autotier_core::{calc_popularity, AutotierError, FileMeta, PopularityConstants, Result};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::fileview::FileView;
use crate::metastore::{MetaBatch, MetaStore};
use crate::openfiles::OpenFileSet;
use crate::tier::{is_hidden_move_name, MoveOutcome, QueuedMove, Tier};

const LOCK_FILE_NAME: &str = "autotier.lock";
const CONFLICTS_LOG_NAME: &str = "conflicts.log";

#[derive(Debug, Clone)]
pub enum AdHocWork {
    Oneshot,
    Pin { tier_id: String, paths: Vec<String> },
    Unpin { paths: Vec<String> },
}

#[derive(Debug, Default)]
pub struct PassReport {
    pub files_seen: usize,
    pub files_moved: usize,
    pub conflicts: usize,
    pub busy_skips: usize,
}

struct SleepState {
    stop: bool,
    adhoc: VecDeque<AdHocWork>,
}

pub struct TieringEngine {
    tiers: Vec<Arc<Tier>>,
    metastore: Arc<MetaStore>,
    openfiles: Arc<OpenFileSet>,
    constants: PopularityConstants,
    run_path: PathBuf,
    copy_buffer_size: usize,
    period_secs: i64,
    strict_period: bool,
    sleep: Mutex<SleepState>,
    condvar: Condvar,
    last_pass: Mutex<Instant>,
    running: AtomicBool,
}

impl TieringEngine {
    pub fn new(
        tiers: Vec<Arc<Tier>>,
        metastore: Arc<MetaStore>,
        openfiles: Arc<OpenFileSet>,
        constants: PopularityConstants,
        run_path: PathBuf,
        copy_buffer_size: usize,
        period_secs: i64,
        strict_period: bool,
    ) -> Self {
        Self {
            tiers,
            metastore,
            openfiles,
            constants,
            run_path,
            copy_buffer_size,
            period_secs,
            strict_period,
            sleep: Mutex::new(SleepState {
                stop: false,
                adhoc: VecDeque::new(),
            }),
            condvar: Condvar::new(),
            last_pass: Mutex::new(Instant::now()),
            running: AtomicBool::new(false),
        }
    }

    pub fn tiers(&self) -> &[Arc<Tier>] {
        &self.tiers
    }

    pub fn strict_period(&self) -> bool {
        self.strict_period
    }

    pub fn enqueue_adhoc(&self, work: AdHocWork) {
        let mut state = self.sleep.lock().unwrap();
        state.adhoc.push_back(work);
        self.condvar.notify_all();
    }

    pub fn stop(&self) {
        let mut state = self.sleep.lock().unwrap();
        state.stop = true;
        self.condvar.notify_all();
    }

    /// The periodic loop a background thread runs. Sleeps until the next
    /// deadline or until woken by ad-hoc work or a stop request.
    pub fn run_loop(&self) {
        loop {
            let mut adhoc = Vec::new();
            {
                let mut state = self.sleep.lock().unwrap();
                if state.stop {
                    return;
                }
                if state.adhoc.is_empty() {
                    let timeout = if self.period_secs > 0 {
                        Duration::from_secs(self.period_secs as u64)
                    } else {
                        Duration::from_secs(3600)
                    };
                    let (guard, _timeout_result) =
                        self.condvar.wait_timeout(state, timeout).unwrap();
                    state = guard;
                }
                if state.stop {
                    return;
                }
                adhoc.extend(state.adhoc.drain(..));
            }

            for work in &adhoc {
                if let Err(e) = self.apply_adhoc(work) {
                    tracing::warn!(error = %e, "ad-hoc request failed");
                }
            }

            if self.period_secs < 0 && adhoc.is_empty() {
                continue;
            }

            match self.run_pass() {
                Ok(report) => {
                    tracing::info!(
                        files_seen = report.files_seen,
                        files_moved = report.files_moved,
                        conflicts = report.conflicts,
                        "tiering pass complete"
                    );
                }
                Err(AutotierError::Busy) => {
                    tracing::debug!("tiering pass skipped: another pass is already running");
                }
                Err(e) => tracing::warn!(error = %e, "tiering pass failed"),
            }
        }
    }

    fn apply_adhoc(&self, work: &AdHocWork) -> Result<()> {
        match work {
            AdHocWork::Oneshot => Ok(()),
            AdHocWork::Pin { tier_id, paths } => self.pin(tier_id, paths),
            AdHocWork::Unpin { paths } => self.unpin(paths),
        }
    }

    fn pin(&self, tier_id: &str, paths: &[String]) -> Result<()> {
        let tier = self
            .tiers
            .iter()
            .find(|t| t.id == tier_id)
            .ok_or_else(|| AutotierError::NotFound(format!("tier {tier_id}")))?;
        for key in paths {
            let mut meta = self
                .metastore
                .get(key)?
                .ok_or_else(|| AutotierError::NotFound(key.clone()))?;
            meta.pinned = true;
            meta.tier_path = tier.path.display().to_string();
            self.metastore.put(key, &meta)?;
        }
        Ok(())
    }

    fn unpin(&self, paths: &[String]) -> Result<()> {
        for key in paths {
            let mut meta = self
                .metastore
                .get(key)?
                .ok_or_else(|| AutotierError::NotFound(key.clone()))?;
            meta.pinned = false;
            self.metastore.put(key, &meta)?;
        }
        Ok(())
    }

    /// One full crawl-sort-simulate-move cycle (§4.4).
    pub fn run_pass(&self) -> Result<PassReport> {
        let _lock = TierLock::acquire(&self.run_path)?;
        self.running.store(true, Ordering::SeqCst);

        let period_secs = {
            let mut last = self.last_pass.lock().unwrap();
            let elapsed = last.elapsed().as_secs_f64();
            *last = Instant::now();
            if elapsed > 0.0 {
                elapsed
            } else {
                self.period_secs.unsigned_abs() as f64
            }
        };

        let (mut views, pinned) = self.crawl()?;
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        for view in views.iter_mut() {
            view.meta.popularity = calc_popularity(
                &self.constants,
                view.meta.access_count,
                view.meta.popularity,
                view.ctime_secs(),
                now_secs,
                period_secs,
            );
            view.meta.access_count = 0;
            view.mark_dirty();
        }

        views.par_sort_by(|a, b| {
            b.meta
                .popularity
                .partial_cmp(&a.meta.popularity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.atime_us.cmp(&a.atime_us))
        });

        self.simulate_placement(&views, &pinned);

        let report = self.execute_moves(&mut views)?;

        drop(views);
        self.running.store(false, Ordering::SeqCst);
        Ok(report)
    }

    fn crawl(&self) -> Result<(Vec<FileView>, Vec<(usize, u64)>)> {
        let mut views = Vec::new();
        let mut pinned = Vec::new();

        for (index, tier) in self.tiers.iter().enumerate() {
            let mut real_usage: u64 = 0;
            for entry in WalkDir::new(&tier.path).into_iter().filter_map(|e| e.ok()) {
                if entry.path_is_symlink() || entry.file_type().is_dir() {
                    continue;
                }
                let file_name = entry.file_name().to_string_lossy();
                if is_hidden_move_name(&file_name) {
                    continue;
                }
                let rel_path = match entry.path().strip_prefix(&tier.path) {
                    Ok(p) => p.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"),
                    Err(_) => continue,
                };
                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let size = metadata.len();
                real_usage += size;

                let meta = match self.metastore.get(&rel_path)? {
                    Some(m) => m,
                    None => {
                        let fresh = FileMeta::new(tier.path.display().to_string());
                        self.metastore.put(&rel_path, &fresh)?;
                        fresh
                    }
                };

                if meta.pinned {
                    pinned.push((index, size));
                    continue;
                }

                let view = FileView::new(
                    rel_path,
                    size,
                    micros(metadata.atime(), metadata.atime_nsec()),
                    micros(metadata.mtime(), metadata.mtime_nsec()),
                    micros(metadata.ctime(), metadata.ctime_nsec()),
                    index,
                    meta,
                    self.metastore.clone(),
                );
                views.push(view);
            }
            tier.swap_usage(tier.usage(), real_usage);
        }

        Ok((views, pinned))
    }

    fn simulate_placement(&self, views: &[FileView], pinned: &[(usize, u64)]) {
        for tier in &self.tiers {
            tier.reset_sim_usage();
        }
        for (tier_index, size) in pinned {
            self.tiers[*tier_index].add_sim_usage(*size);
        }

        let mut cursor = 0usize;
        for view in views {
            while cursor < self.tiers.len() - 1
                && self.tiers[cursor].full_test(view.size).unwrap_or(true)
            {
                cursor += 1;
            }
            self.tiers[cursor].add_sim_usage(view.size);
            if view.tier_index != cursor {
                self.tiers[cursor].enqueue(QueuedMove {
                    rel_path: view.rel_path.clone(),
                    source_tier_path: self.tiers[view.tier_index].path.clone(),
                    size: view.size,
                });
            }
        }
    }

    fn execute_moves(&self, views: &mut [FileView]) -> Result<PassReport> {
        let results: Vec<(String, PathBuf, MoveOutcome)> = self
            .tiers
            .par_iter()
            .flat_map(|tier| {
                let queue = tier.drain_queue();
                queue
                    .into_iter()
                    .filter_map(|item| self.move_one(tier, item))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut report = PassReport {
            files_seen: views.len(),
            ..Default::default()
        };

        let mut batch = MetaBatch::new();
        for (rel_path, new_tier_path, outcome) in results {
            match outcome {
                MoveOutcome::Moved => {
                    report.files_moved += 1;
                    if let Some(view) = views.iter_mut().find(|v| v.rel_path == rel_path) {
                        view.meta.tier_path = new_tier_path.display().to_string();
                        view.mark_dirty();
                    } else {
                        batch = batch.put(
                            rel_path,
                            FileMeta {
                                tier_path: new_tier_path.display().to_string(),
                                access_count: 0,
                                popularity: 0.0,
                                pinned: false,
                            },
                        );
                    }
                }
                MoveOutcome::Conflict => {
                    report.conflicts += 1;
                    self.log_conflict(&rel_path)?;
                }
                MoveOutcome::Skipped => {
                    report.busy_skips += 1;
                }
            }
        }
        self.metastore.apply(batch)?;

        metrics::counter!("autotier_files_seen_total").increment(report.files_seen as u64);
        metrics::counter!("autotier_files_moved_total").increment(report.files_moved as u64);
        metrics::counter!("autotier_conflicts_total").increment(report.conflicts as u64);
        metrics::counter!("autotier_busy_skips_total").increment(report.busy_skips as u64);
        for tier in &self.tiers {
            metrics::gauge!("autotier_tier_usage_bytes", "tier" => tier.id.clone()).set(tier.usage() as f64);
        }

        Ok(report)
    }

    fn move_one(&self, tier: &Arc<Tier>, item: QueuedMove) -> Option<(String, PathBuf, MoveOutcome)> {
        let source_backend_path = item.source_tier_path.join(&item.rel_path);
        if self.openfiles.is_open(&source_backend_path.to_string_lossy()) {
            tracing::warn!(path = %item.rel_path, "skipping move: file is open");
            return Some((item.rel_path, tier.path.clone(), MoveOutcome::Skipped));
        }
        match tier.move_file(&item.rel_path, &item.source_tier_path, self.copy_buffer_size) {
            Ok(outcome @ MoveOutcome::Moved) => {
                tier.add_usage(item.size);
                Some((item.rel_path, tier.path.clone(), outcome))
            }
            Ok(outcome) => Some((item.rel_path, tier.path.clone(), outcome)),
            Err(e) => {
                tracing::warn!(path = %item.rel_path, error = %e, "move failed, leaving file in place");
                None
            }
        }
    }

    fn log_conflict(&self, rel_path: &str) -> Result<()> {
        let log_path = self.run_path.join(CONFLICTS_LOG_NAME);
        let mut f = OpenOptions::new().create(true).append(true).open(log_path)?;
        writeln!(f, "{rel_path}")?;
        Ok(())
    }
}

fn micros(secs: i64, nanos: i64) -> i64 {
    secs * 1_000_000 + nanos / 1_000
}

/// RAII guard over the inter-process tiering lock file (§4.4 step 1): exclusive
/// create, removed on drop.
struct TierLock {
    path: PathBuf,
}

impl TierLock {
    fn acquire(run_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(run_path)?;
        let path = run_path.join(LOCK_FILE_NAME);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(AutotierError::Busy),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TierLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotier_core::Quota;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Vec<Arc<Tier>>, Arc<MetaStore>, Arc<OpenFileSet>, PathBuf) {
        let root = tempdir().unwrap();
        let fast_path = root.path().join("fast");
        let slow_path = root.path().join("slow");
        fs::create_dir_all(&fast_path).unwrap();
        fs::create_dir_all(&slow_path).unwrap();
        let tiers = vec![
            Arc::new(Tier::new("fast", fast_path, Quota::Bytes(100 * 1024 * 1024))),
            Arc::new(Tier::new("slow", slow_path, Quota::Bytes(10 * 1024 * 1024 * 1024))),
        ];
        let run_path = root.path().join("run");
        let metastore = Arc::new(MetaStore::open(&run_path.join("db")).unwrap());
        let openfiles = Arc::new(OpenFileSet::new());
        (root, tiers, metastore, openfiles, run_path)
    }

    #[test]
    fn two_tier_promotion_moves_hot_file_to_fast_tier() {
        let (root, tiers, metastore, openfiles, run_path) = setup();
        let fast = &tiers[0];
        let slow = &tiers[1];

        let a_size = 50 * 1024 * 1024;
        let b_size = 30 * 1024 * 1024;
        fs::write(slow.path.join("a.bin"), vec![0u8; a_size]).unwrap();
        fs::write(fast.path.join("b.bin"), vec![0u8; b_size]).unwrap();
        metastore
            .put(
                "a.bin",
                &FileMeta {
                    tier_path: slow.path.display().to_string(),
                    access_count: 0,
                    popularity: 1000.0,
                    pinned: false,
                },
            )
            .unwrap();
        metastore
            .put(
                "b.bin",
                &FileMeta {
                    tier_path: fast.path.display().to_string(),
                    access_count: 0,
                    popularity: 10.0,
                    pinned: false,
                },
            )
            .unwrap();

        let engine = TieringEngine::new(
            tiers.clone(),
            metastore.clone(),
            openfiles,
            PopularityConstants::default(),
            run_path,
            1024 * 1024,
            1800,
            false,
        );

        // popularity is recomputed from access_count during the pass, so seed
        // it artificially high by pre-setting access_count instead for a's file
        // would be overwritten; this test instead checks placement given the
        // existing popularity values survive one pass with zero accesses, which
        // decays both toward zero but preserves their relative order.
        let report = engine.run_pass().unwrap();
        assert_eq!(report.files_seen, 2);

        assert!(root.path().join("fast/a.bin").exists());
        assert!(root.path().join("slow/b.bin").exists());
    }

    #[test]
    fn pinned_file_never_moves() {
        let (_root, tiers, metastore, openfiles, run_path) = setup();
        let slow = &tiers[1];
        fs::write(slow.path.join("keep.bin"), vec![0u8; 2 * 1024 * 1024]).unwrap();
        metastore
            .put(
                "keep.bin",
                &FileMeta {
                    tier_path: slow.path.display().to_string(),
                    access_count: 0,
                    popularity: 1_000_000.0,
                    pinned: true,
                },
            )
            .unwrap();

        let engine = TieringEngine::new(
            tiers.clone(),
            metastore.clone(),
            openfiles,
            PopularityConstants::default(),
            run_path,
            1024 * 1024,
            1800,
            false,
        );
        engine.run_pass().unwrap();
        assert!(slow.path.join("keep.bin").exists());
        assert!(!tiers[0].path.join("keep.bin").exists());
    }

    #[test]
    fn concurrent_pass_returns_busy() {
        let (_root, tiers, metastore, openfiles, run_path) = setup();
        let engine = TieringEngine::new(
            tiers,
            metastore,
            openfiles,
            PopularityConstants::default(),
            run_path.clone(),
            1024 * 1024,
            1800,
            false,
        );
        let _lock = TierLock::acquire(&run_path).unwrap();
        assert!(matches!(engine.run_pass(), Err(AutotierError::Busy)));
    }
}
