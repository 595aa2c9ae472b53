use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Durability mode of the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalMode {
    /// No log is written at all. Writes are acknowledged immediately and
    /// lost across restart.
    None,
    /// Rows are written and synced every `sync_interval` bytes.
    #[default]
    Write,
    /// Additionally fdatasync after every frame before acknowledging.
    Fsync,
}

impl FromStr for WalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(WalMode::None),
            "write" => Ok(WalMode::Write),
            "fsync" => Ok(WalMode::Fsync),
            other => Err(format!("unknown wal_mode {other:?}")),
        }
    }
}

impl WalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalMode::None => "none",
            WalMode::Write => "write",
            WalMode::Fsync => "fsync",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub snap_dir: PathBuf,
    pub wal_dir: PathBuf,
    pub wal_mode: WalMode,
    /// Rows written to one xlog before it is rotated. Must be > 1.
    pub rows_per_wal: u64,
    /// Bytes per second budget for checkpoint writing, 0 = unlimited.
    pub snap_io_rate_limit: u64,
    /// Bytes written between periodic syncs of the current xlog.
    pub sync_interval: u64,
    /// Drop synced pages from the page cache.
    pub free_cache: bool,
    /// Disable zstd compression of xlog frames.
    pub no_compression: bool,
    /// Poll period of the hot-standby / relay directory watcher.
    pub wal_dir_rescan_delay: Duration,
    /// Skip corrupted frames during recovery instead of aborting.
    pub force_recovery: bool,
    /// Grace period before collected xlogs are unlinked.
    pub retention_period: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            snap_dir: PathBuf::from("."),
            wal_dir: PathBuf::from("."),
            wal_mode: WalMode::Write,
            rows_per_wal: 500_000,
            snap_io_rate_limit: 0,
            sync_interval: 1024 * 1024,
            free_cache: false,
            no_compression: false,
            wal_dir_rescan_delay: Duration::from_millis(100),
            force_recovery: false,
            retention_period: Duration::ZERO,
        }
    }
}

impl WalConfig {
    pub fn with_dirs(snap_dir: impl Into<PathBuf>, wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            snap_dir: snap_dir.into(),
            wal_dir: wal_dir.into(),
            ..Self::default()
        }
    }
}
