use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use ini::Ini;

use crate::error::{AutotierError, Result};

/// `<number>%` or `<number><SI-or-IEC unit>`, per §6.1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quota {
    Percent(f64),
    Bytes(u64),
}

impl Quota {
    pub fn resolve(&self, capacity_bytes: u64) -> u64 {
        match self {
            Quota::Percent(pct) => ((*pct / 100.0) * capacity_bytes as f64) as u64,
            Quota::Bytes(b) => *b,
        }
    }

    pub fn parse(s: &str) -> Result<Quota> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let value: f64 = pct
                .trim()
                .parse()
                .map_err(|_| AutotierError::InvalidConfig(format!("bad percent quota: {s}")))?;
            return Ok(Quota::Percent(value));
        }
        Ok(Quota::Bytes(parse_bytes(s)?))
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quota::Percent(p) => write!(f, "{p}%"),
            Quota::Bytes(b) => write!(f, "{b}B"),
        }
    }
}

/// Parses an SI (`KB`, `MB`, `GB`, `TB`, base 1000) or IEC (`KiB`, `MiB`, `GiB`, `TiB`,
/// base 1024) byte quantity, falling back to a bare integer.
fn parse_bytes(s: &str) -> Result<u64> {
    const UNITS: &[(&str, u64)] = &[
        ("TiB", 1024u64.pow(4)),
        ("GiB", 1024u64.pow(3)),
        ("MiB", 1024u64.pow(2)),
        ("KiB", 1024),
        ("TB", 1_000_000_000_000),
        ("GB", 1_000_000_000),
        ("MB", 1_000_000),
        ("KB", 1_000),
        ("B", 1),
    ];
    let trimmed = s.trim();
    for (suffix, multiplier) in UNITS {
        if let Some(num) = trimmed.strip_suffix(suffix) {
            let value: f64 = num
                .trim()
                .parse()
                .map_err(|_| AutotierError::InvalidConfig(format!("bad byte quantity: {s}")))?;
            return Ok((value * *multiplier as f64) as u64);
        }
    }
    trimmed
        .parse()
        .map_err(|_| AutotierError::InvalidConfig(format!("bad byte quantity: {s}")))
}

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub log_level: u8,
    /// Seconds between passes; negative = event-driven only.
    pub tier_period_secs: i64,
    pub strict_period: bool,
    pub copy_buffer_size: u64,
    pub metadata_path: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: 1,
            tier_period_secs: 1800,
            strict_period: false,
            copy_buffer_size: 1024 * 1024,
            metadata_path: PathBuf::from("/var/lib/autotier"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TierConfigEntry {
    pub id: String,
    pub path: PathBuf,
    pub quota: Quota,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    /// Ordered fastest-first, by file position, per §6.1.
    pub tiers: Vec<TierConfigEntry>,
    pub config_path: PathBuf,
}

impl Config {
    /// Loads the config at `path`, writing the commented template and re-reading it
    /// if the file is missing, as the original daemon does on first run.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            write_template(path)?;
        }
        let ini = Ini::load_from_file(path)
            .map_err(|e| AutotierError::InvalidConfig(format!("{}: {e}", path.display())))?;

        let mut global = GlobalConfig::default();
        let mut tiers = Vec::new();

        for (section, props) in ini.iter() {
            let Some(section) = section else { continue };
            if section.eq_ignore_ascii_case("global") {
                for (key, value) in props.iter() {
                    match key {
                        "Log Level" => {
                            global.log_level = value.trim().parse().map_err(|_| {
                                AutotierError::InvalidConfig(format!("bad Log Level: {value}"))
                            })?;
                        }
                        "Tier Period" => {
                            global.tier_period_secs = value.trim().parse().map_err(|_| {
                                AutotierError::InvalidConfig(format!("bad Tier Period: {value}"))
                            })?;
                        }
                        "Strict Period" => {
                            global.strict_period = parse_bool(value)?;
                        }
                        "Copy Buffer Size" => {
                            global.copy_buffer_size = parse_bytes(value)?;
                        }
                        "Metadata Path" => {
                            global.metadata_path = PathBuf::from(value);
                        }
                        other => {
                            tracing_warn_unknown_key("Global", other);
                        }
                    }
                }
            } else {
                let mut tier_path = None;
                let mut quota = None;
                for (key, value) in props.iter() {
                    match key {
                        "Path" => tier_path = Some(PathBuf::from(value)),
                        "Quota" => quota = Some(Quota::parse(value)?),
                        other => tracing_warn_unknown_key(section, other),
                    }
                }
                let tier_path = tier_path.ok_or_else(|| {
                    AutotierError::InvalidConfig(format!("tier section [{section}] missing Path"))
                })?;
                let quota = quota.ok_or_else(|| {
                    AutotierError::InvalidConfig(format!("tier section [{section}] missing Quota"))
                })?;
                tiers.push(TierConfigEntry {
                    id: section.to_string(),
                    path: tier_path,
                    quota,
                });
            }
        }

        if tiers.len() < 2 {
            return Err(AutotierError::InvalidConfig(
                "at least two tiers are required".to_string(),
            ));
        }

        Ok(Config {
            global,
            tiers,
            config_path: path.to_path_buf(),
        })
    }

    /// The per-config working directory, suffixed with a hash of the config path so
    /// multiple mounts sharing a `Metadata Path` do not collide.
    pub fn run_path(&self) -> PathBuf {
        self.global
            .metadata_path
            .join(format!("{:x}", hash_path(&self.config_path)))
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        out.push_str("[Global]\n");
        out.push_str(&format!("Log Level = {}\n", self.global.log_level));
        out.push_str(&format!("Tier Period = {}\n", self.global.tier_period_secs));
        out.push_str(&format!("Strict Period = {}\n", self.global.strict_period));
        out.push_str(&format!(
            "Copy Buffer Size = {}\n",
            self.global.copy_buffer_size
        ));
        out.push_str(&format!(
            "Metadata Path = {}\n",
            self.global.metadata_path.display()
        ));
        for tier in &self.tiers {
            out.push_str(&format!("\n[{}]\n", tier.id));
            out.push_str(&format!("Path = {}\n", tier.path.display()));
            out.push_str(&format!("Quota = {}\n", tier.quota));
        }
        out
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(AutotierError::InvalidConfig(format!(
            "expected boolean, got {other}"
        ))),
    }
}

fn tracing_warn_unknown_key(section: &str, key: &str) {
    tracing::warn!(section, key, "unknown config key ignored");
}

fn hash_path(path: &Path) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

/// Commented template written on first run, content preserved from the original
/// daemon's `init_config_file` rather than reworded.
fn write_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    write!(
        f,
        "{}",
        r#"# autotier config
# Lines beginning with '#' are comments.

[Global]
# 0 = quiet, 1 = normal, 2 = debug
Log Level = 1
# seconds between tiering passes; negative disables periodic tiering
Tier Period = 1800
# if true, out-of-space writes never trigger an out-of-period pass
Strict Period = false
# bytes moved per read/write chunk during a tier move
Copy Buffer Size = 1MiB
# base directory for the lock file, pipes, and metadata store
Metadata Path = /var/lib/autotier

# One [Tier <name>] section per backend directory, ordered fastest first.
# Quota accepts a percentage of capacity or an absolute SI/IEC byte quantity.

[Tier 1]
Path = /mnt/fast-tier
Quota = 100GiB

[Tier 2]
Path = /mnt/slow-tier
Quota = 80%
"#
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_byte_units() {
        assert_eq!(parse_bytes("1MiB").unwrap(), 1024 * 1024);
        assert_eq!(parse_bytes("1MB").unwrap(), 1_000_000);
        assert_eq!(parse_bytes("512").unwrap(), 512);
    }

    #[test]
    fn parses_quota_percent_and_bytes() {
        assert_eq!(Quota::parse("80%").unwrap(), Quota::Percent(80.0));
        assert_eq!(Quota::parse("10GiB").unwrap(), Quota::Bytes(10 * 1024u64.pow(3)));
    }

    #[test]
    fn missing_config_writes_template_then_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autotier.conf");
        let cfg = Config::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.tiers.len(), 2);
        assert_eq!(cfg.tiers[0].id, "Tier 1");
    }

    #[test]
    fn rejects_single_tier_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autotier.conf");
        std::fs::write(
            &path,
            "[Global]\nLog Level = 1\n\n[Tier 1]\nPath = /mnt/a\nQuota = 10%\n",
        )
        .unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn dump_round_trips_tier_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autotier.conf");
        let cfg = Config::load(&path).unwrap();
        let dumped = cfg.dump();
        assert!(dumped.find("Tier 1").unwrap() < dumped.find("Tier 2").unwrap());
    }
}
