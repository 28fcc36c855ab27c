//! Centralized configuration for LayerVault.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - LayerConfig::from_env() reads LV_* variables, `with_*` setters override them.
//!
//! Layout derived from the config:
//! - <root>/<snapshotter>/metadata.db — metadata store
//! - <root>/<snapshotter>/LOCK        — cross-process lock of that store
//! - <root>/<snapshotter>/...         — backend storage units

use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_ROOT: &str = "/var/lib/layervault";
pub const DEFAULT_SNAPSHOTTER: &str = "naive";

// ENV helper
fn env_flag(v: &str) -> bool {
    let s = v.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "on" || s == "yes"
}

/// Top-level configuration (process-wide, passed explicitly to drivers).
#[derive(Clone, Debug)]
pub struct LayerConfig {
    /// State root; each backend gets its own subdirectory.
    /// Env: LV_ROOT (default /var/lib/layervault)
    pub root: PathBuf,

    /// Backend selected by the CLI/composition root.
    /// Env: LV_SNAPSHOTTER (default "naive")
    pub snapshotter: String,

    /// fsync metadata.db (and its directory) on every committed write transaction.
    /// Env: LV_META_FSYNC (default true)
    pub metadata_fsync: bool,

    /// Path or name of the btrfs tool.
    /// Env: LV_BTRFS_BIN (default "btrfs")
    pub btrfs_bin: String,

    /// Path or name of the zfs tool.
    /// Env: LV_ZFS_BIN (default "zfs")
    pub zfs_bin: String,

    /// Poll slice (ms) while a writer waits for the single writer slot; the
    /// context is re-checked between slices.
    /// Env: LV_WRITER_WAIT_MS (default 10)
    pub writer_wait_ms: u64,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            metadata_fsync: true,
            btrfs_bin: "btrfs".to_string(),
            zfs_bin: "zfs".to_string(),
            writer_wait_ms: 10,
        }
    }
}

impl LayerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("LV_ROOT") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.root = PathBuf::from(s);
            }
        }

        if let Ok(v) = std::env::var("LV_SNAPSHOTTER") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.snapshotter = s.to_ascii_lowercase();
            }
        }

        if let Ok(v) = std::env::var("LV_META_FSYNC") {
            cfg.metadata_fsync = env_flag(&v);
        }

        if let Ok(v) = std::env::var("LV_BTRFS_BIN") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.btrfs_bin = s.to_string();
            }
        }

        if let Ok(v) = std::env::var("LV_ZFS_BIN") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.zfs_bin = s.to_string();
            }
        }

        if let Ok(v) = std::env::var("LV_WRITER_WAIT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.writer_wait_ms = n.max(1);
            }
        }

        cfg
    }

    pub fn with_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.root = root.as_ref().to_path_buf();
        self
    }

    pub fn with_snapshotter<S: Into<String>>(mut self, name: S) -> Self {
        self.snapshotter = name.into();
        self
    }

    pub fn with_metadata_fsync(mut self, on: bool) -> Self {
        self.metadata_fsync = on;
        self
    }

    pub fn with_btrfs_bin<S: Into<String>>(mut self, bin: S) -> Self {
        self.btrfs_bin = bin.into();
        self
    }

    pub fn with_zfs_bin<S: Into<String>>(mut self, bin: S) -> Self {
        self.zfs_bin = bin.into();
        self
    }

    pub fn with_writer_wait_ms(mut self, ms: u64) -> Self {
        self.writer_wait_ms = ms.max(1);
        self
    }

    /// Root directory of the named backend: <root>/<name>.
    pub fn backend_root(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> Self {
        self
    }
}

impl fmt::Display for LayerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LayerConfig {{ \
             root: {}, \
             snapshotter: {}, \
             metadata_fsync: {}, \
             btrfs_bin: {}, \
             zfs_bin: {}, \
             writer_wait_ms: {} \
             }}",
            self.root.display(),
            self.snapshotter,
            self.metadata_fsync,
            self.btrfs_bin,
            self.zfs_bin,
            self.writer_wait_ms,
        )
    }
}
