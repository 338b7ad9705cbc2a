use std::path::PathBuf;

/// Error kinds shared across every autotier crate, per the error-handling design:
/// kernel-facing code translates these to errno, the admin tool prints them as `ERR`.
#[derive(Debug, thiserror::Error)]
pub enum AutotierError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded on tier {tier}: {used} + {requested} > {quota}")]
    QuotaExceeded {
        tier: String,
        used: u64,
        requested: u64,
        quota: u64,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("busy: a tiering pass is already running")]
    Busy,

    #[error("conflict: {0} already exists at destination with different content")]
    Conflict(PathBuf),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AutotierError {
    /// Maps an error kind to the errno the facade returns to the kernel driver.
    pub fn errno(&self) -> i32 {
        match self {
            AutotierError::NotFound(_) => libc_enoent(),
            AutotierError::QuotaExceeded { .. } => libc_enospc(),
            AutotierError::Conflict(_) => libc_eexist(),
            AutotierError::Io(e) => e.raw_os_error().unwrap_or(libc_eio()),
            AutotierError::Busy => libc_ebusy(),
            AutotierError::InvalidConfig(_) | AutotierError::Fatal(_) | AutotierError::Serialization(_) => libc_eio(),
        }
    }
}

// Kept as free functions rather than a `libc` dependency in this crate: autotier-core
// has no other use for libc, and the numeric values are part of the POSIX ABI, not an
// implementation detail any platform changes.
fn libc_enoent() -> i32 {
    2
}
fn libc_eio() -> i32 {
    5
}
fn libc_ebusy() -> i32 {
    16
}
fn libc_eexist() -> i32 {
    17
}
fn libc_enospc() -> i32 {
    28
}

pub type Result<T> = std::result::Result<T, AutotierError>;
