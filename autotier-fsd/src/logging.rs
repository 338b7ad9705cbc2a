//! Log sink selection (§10.2, out of scope for the spec proper but required
//! to run the daemon at all). Before the mount succeeds, diagnostics go to
//! stdout; once mounted, the daemon switches to syslog so a detached daemon
//! keeps logging somewhere a user can find it.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink {
    Stdout,
    Syslog,
}

/// Translates the config's `Log Level` (0 quiet, 1 normal, 2 debug) into a
/// tracing filter directive, honoring `RUST_LOG` if set.
fn filter_for_level(log_level: i64) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let directive = match log_level {
        ..=0 => "warn",
        1 => "info",
        _ => "debug",
    };
    EnvFilter::new(directive)
}

pub fn init_stdout(log_level: i64) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for_level(log_level))
        .try_init();
}

/// Re-homes subsequent log output to syslog. Called once the kernel mount is
/// established (§7: "once mounted, it switches to syslog").
pub fn switch_to_syslog(log_level: i64) -> anyhow::Result<()> {
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: "autotierfs".into(),
        pid: std::process::id(),
    };
    let logger = syslog::unix(formatter)?;
    let writer = SyslogWriter::new(logger);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for_level(log_level))
        .with_writer(writer)
        .try_init();
    Ok(())
}

#[derive(Clone)]
struct SyslogWriter {
    logger: std::sync::Arc<std::sync::Mutex<syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>>>,
}

impl SyslogWriter {
    fn new(logger: syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>) -> Self {
        Self {
            logger: std::sync::Arc::new(std::sync::Mutex::new(logger)),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SyslogWriter {
    type Writer = SyslogLineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLineWriter {
            logger: self.logger.clone(),
        }
    }
}

struct SyslogLineWriter {
    logger: std::sync::Arc<std::sync::Mutex<syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>>>,
}

impl std::io::Write for SyslogLineWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        if let Ok(mut logger) = self.logger.lock() {
            let _ = logger.info(line.trim_end());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_for_level_maps_quiet_to_warn() {
        assert_eq!(filter_for_level(0).to_string(), "warn");
    }

    #[test]
    fn filter_for_level_maps_debug() {
        assert_eq!(filter_for_level(2).to_string(), "debug");
    }
}
