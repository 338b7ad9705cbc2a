//! Serves administrative commands over two named pipes under `run_path`
//! (§4.5). Pin/unpin/oneshot are enqueued as ad-hoc work for the tiering
//! thread; everything else executes synchronously here.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use autotier_core::{AutotierError, Result};
use autotier_storage::{AdHocWork, MetaStore, Tier};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::adhoc::{Request, Response, StatusFormat};

const REQUEST_PIPE: &str = "request.pipe";
const RESPONSE_PIPE: &str = "response.pipe";
const CONFLICTS_LOG: &str = "conflicts.log";

pub struct ControlServer {
    run_path: PathBuf,
    tiers: Vec<Arc<Tier>>,
    metastore: Arc<MetaStore>,
    engine_adhoc: Box<dyn Fn(AdHocWork) + Send + Sync>,
    config_dump: String,
    stop: AtomicBool,
}

impl ControlServer {
    pub fn new(
        run_path: PathBuf,
        tiers: Vec<Arc<Tier>>,
        metastore: Arc<MetaStore>,
        config_dump: String,
        engine_adhoc: impl Fn(AdHocWork) + Send + Sync + 'static,
    ) -> Result<Self> {
        std::fs::create_dir_all(&run_path)?;
        ensure_fifo(&run_path.join(REQUEST_PIPE))?;
        ensure_fifo(&run_path.join(RESPONSE_PIPE))?;
        Ok(Self {
            run_path,
            tiers,
            metastore,
            engine_adhoc: Box::new(engine_adhoc),
            config_dump,
            stop: AtomicBool::new(false),
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Blocking loop: opens the request pipe for read, handles one line at a
    /// time, writes the response to the response pipe. A signal delivered to
    /// this thread interrupts the blocking open/read with EINTR, at which
    /// point the stop flag is checked.
    pub fn serve(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let request_path = self.run_path.join(REQUEST_PIPE);
            let file = match OpenOptions::new().read(true).open(&request_path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open request pipe");
                    continue;
                }
            };
            let reader = BufReader::new(file);
            for line in reader.lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(_) => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = self.handle_line(&line);
                self.write_response(&response);
            }
        }
    }

    fn write_response(&self, response: &Response) {
        let response_path = self.run_path.join(RESPONSE_PIPE);
        match OpenOptions::new().write(true).open(&response_path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", response.encode());
            }
            Err(e) => tracing::warn!(error = %e, "failed to open response pipe"),
        }
    }

    fn handle_line(&self, line: &str) -> Response {
        let request = match Request::parse(line) {
            Ok(r) => r,
            Err(e) => return Response::err(e.to_string()),
        };
        match self.dispatch(request) {
            Ok(resp) => resp,
            Err(e) => Response::err(e.to_string()),
        }
    }

    fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Oneshot => {
                (self.engine_adhoc)(AdHocWork::Oneshot);
                Ok(Response::ok(vec![]))
            }
            Request::Pin { tier_id, paths } => {
                if !self.tiers.iter().any(|t| t.id == tier_id) {
                    return Err(AutotierError::NotFound(format!("tier {tier_id}")));
                }
                for path in &paths {
                    if self.metastore.get(path)?.is_none() {
                        return Err(AutotierError::NotFound(path.clone()));
                    }
                }
                (self.engine_adhoc)(AdHocWork::Pin { tier_id, paths });
                Ok(Response::ok(vec![]))
            }
            Request::Unpin { paths } => {
                for path in &paths {
                    if self.metastore.get(path)?.is_none() {
                        return Err(AutotierError::NotFound(path.clone()));
                    }
                }
                (self.engine_adhoc)(AdHocWork::Unpin { paths });
                Ok(Response::ok(vec![]))
            }
            Request::Status(format) => self.cmd_status(format),
            Request::Config => Ok(Response::ok(vec![self.config_dump.clone()])),
            Request::ListPins => self.cmd_list_pins(),
            Request::ListPopularity => self.cmd_list_popularity(),
            Request::WhichTier { paths } => self.cmd_which_tier(&paths),
        }
    }

    fn cmd_status(&self, format: StatusFormat) -> Result<Response> {
        let mut rows = Vec::new();
        let mut combined_usage = 0u64;
        let mut combined_quota = 0u64;
        for tier in &self.tiers {
            let usage = tier.usage();
            let quota = tier.quota_bytes()?;
            combined_usage += usage;
            combined_quota += quota;
            rows.push((tier.id.clone(), tier.path.display().to_string(), usage, quota));
        }
        let conflicts = self.read_conflicts_log()?;

        match format {
            StatusFormat::Json => {
                let payload = serde_json::json!({
                    "tiers": rows.iter().map(|(id, path, usage, quota)| serde_json::json!({
                        "id": id, "path": path, "usage": usage, "quota": quota,
                    })).collect::<Vec<_>>(),
                    "combined": { "usage": combined_usage, "quota": combined_quota },
                    "conflicts": conflicts,
                });
                Ok(Response::ok(vec![payload.to_string()]))
            }
            StatusFormat::Table => {
                let id_width = rows.iter().map(|r| r.0.len()).max().unwrap_or(2).max(4);
                let path_width = rows.iter().map(|r| r.1.len()).max().unwrap_or(4).max(4);
                let mut lines = vec![format!(
                    "{:id_width$}  {:path_width$}  {:>12}  {:>12}",
                    "ID", "PATH", "USAGE", "QUOTA"
                )];
                for (id, path, usage, quota) in &rows {
                    lines.push(format!(
                        "{id:id_width$}  {path:path_width$}  {usage:>12}  {quota:>12}"
                    ));
                }
                lines.push(format!("combined: usage={combined_usage} quota={combined_quota}"));
                if !conflicts.is_empty() {
                    lines.push(format!("conflicts: {}", conflicts.join(", ")));
                }
                Ok(Response::ok(lines))
            }
        }
    }

    fn cmd_list_pins(&self) -> Result<Response> {
        let mut lines = Vec::new();
        for entry in self.metastore.iterate_all() {
            let (key, meta) = entry?;
            if meta.pinned {
                lines.push(format!("{key} -> {}", meta.tier_path));
            }
        }
        Ok(Response::ok(lines))
    }

    fn cmd_list_popularity(&self) -> Result<Response> {
        let mut lines = Vec::new();
        for entry in self.metastore.iterate_all() {
            let (key, meta) = entry?;
            lines.push(format!("{key} {:.4}", meta.popularity));
        }
        Ok(Response::ok(lines))
    }

    fn cmd_which_tier(&self, paths: &[String]) -> Result<Response> {
        let mut lines = Vec::new();
        for path in paths {
            match self.metastore.get(path)? {
                Some(meta) => lines.push(format!("{path}\t{}", meta.tier_path)),
                None => lines.push(format!("{path}\tnot found")),
            }
        }
        Ok(Response::ok(lines))
    }

    fn read_conflicts_log(&self) -> Result<Vec<String>> {
        let path = self.run_path.join(CONFLICTS_LOG);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(content.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }
}

fn ensure_fifo(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| AutotierError::Io(std::io::Error::from_raw_os_error(e as i32)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotier_core::{FileMeta, Quota};
    use tempfile::tempdir;

    fn server() -> (tempfile::TempDir, ControlServer) {
        let dir = tempdir().unwrap();
        let run_path = dir.path().join("run");
        let metastore = Arc::new(MetaStore::open(&run_path.join("db")).unwrap());
        let tiers = vec![
            Arc::new(Tier::new("fast", dir.path().join("fast"), Quota::Bytes(100))),
            Arc::new(Tier::new("slow", dir.path().join("slow"), Quota::Bytes(1000))),
        ];
        std::fs::create_dir_all(dir.path().join("fast")).unwrap();
        std::fs::create_dir_all(dir.path().join("slow")).unwrap();
        let srv = ControlServer::new(run_path, tiers, metastore, "dumped config".into(), |_| {}).unwrap();
        (dir, srv)
    }

    #[test]
    fn unknown_command_returns_err() {
        let (_d, srv) = server();
        let resp = srv.handle_line("bogus");
        assert!(!resp.ok);
    }

    #[test]
    fn config_dumps_effective_config() {
        let (_d, srv) = server();
        let resp = srv.handle_line("config");
        assert!(resp.ok);
        assert_eq!(resp.lines, vec!["dumped config".to_string()]);
    }

    #[test]
    fn pin_unknown_tier_errors() {
        let (_d, srv) = server();
        let resp = srv.handle_line("pin nonexistent a.bin");
        assert!(!resp.ok);
    }

    #[test]
    fn which_tier_reports_not_found_for_missing_key() {
        let (_d, srv) = server();
        let resp = srv.handle_line("which-tier missing.bin");
        assert!(resp.ok);
        assert_eq!(resp.lines, vec!["missing.bin\tnot found".to_string()]);
    }

    #[test]
    fn which_tier_resolves_known_key() {
        let (_d, srv) = server();
        srv.metastore.put("a.bin", &FileMeta::new("/fast")).unwrap();
        let resp = srv.handle_line("which-tier a.bin");
        assert_eq!(resp.lines, vec!["a.bin\t/fast".to_string()]);
    }

    #[test]
    fn status_table_lists_tiers_and_combined_line() {
        let (_d, srv) = server();
        let resp = srv.handle_line("status");
        assert!(resp.ok);
        assert!(resp.lines.iter().any(|l| l.contains("fast")));
        assert!(resp.lines.iter().any(|l| l.starts_with("combined:")));
    }
}
