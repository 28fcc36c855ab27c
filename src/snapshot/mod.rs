//! Snapshot model: kinds and their transitions, Info/Usage records, and the
//! `Snapshotter` trait every backend implements.
//!
//! Переходы:
//!   (none) --prepare--> Active --commit--> Committed --remove--> (removed)
//!   (none) --view-----> View -------------------------remove--> (removed)
//! Родителем может быть только Committed. Active/View — всегда листья.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::mount::Mount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Active,
    View,
    Committed,
}

impl Kind {
    #[inline]
    pub fn is_readonly(self) -> bool {
        !matches!(self, Kind::Active)
    }

    /// Only committed snapshots may be used as a parent.
    #[inline]
    pub fn can_be_parent(self) -> bool {
        matches!(self, Kind::Committed)
    }

    /// Only active snapshots may be committed.
    #[inline]
    pub fn can_commit(self) -> bool {
        matches!(self, Kind::Active)
    }

    /// Kinds a caller may create directly (prepare/view).
    #[inline]
    pub fn is_creatable(self) -> bool {
        !matches!(self, Kind::Committed)
    }

    /// Subdirectory that holds storage units of this kind.
    pub fn storage_dir(self) -> &'static str {
        match self {
            Kind::Active => "active",
            Kind::View => "view",
            Kind::Committed => "snapshots",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Active => "active",
            Kind::View => "view",
            Kind::Committed => "committed",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Kind::Active),
            "view" => Ok(Kind::View),
            "committed" => Ok(Kind::Committed),
            other => Err(Error::InvalidArgument(format!("unknown snapshot kind '{}'", other))),
        }
    }
}

/// User-visible snapshot record. `name` is the key for active/view snapshots and
/// the committed name otherwise; `parent` is empty for roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(default)]
    pub parent: String,
    pub kind: Kind,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub created_unix_ms: u64,
    #[serde(default)]
    pub updated_unix_ms: u64,
}

impl Info {
    pub fn is_readonly(&self) -> bool {
        self.kind.is_readonly()
    }

    pub fn has_parent(&self) -> bool {
        !self.parent.is_empty()
    }
}

/// Disk usage of one snapshot. `inodes` is -1 when the backend cannot count them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub size: i64,
    pub inodes: i64,
}

impl Usage {
    pub fn new(size: i64, inodes: i64) -> Self {
        Self { size, inodes }
    }
}

/// Resolved active/view record handed to a backend: internal id plus the ids of
/// the whole committed parent chain, nearest parent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub kind: Kind,
    pub id: String,
    pub parent_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub labels: BTreeMap<String, String>,
}

impl SnapshotOptions {
    pub fn with_label(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.labels.insert(k.into(), v.into());
        self
    }
}

/// Backend-independent snapshot operations.
///
/// Keys and committed names share one namespace. All calls take a `Context`;
/// a cancelled context aborts before any metadata is committed.
pub trait Snapshotter: Send + Sync {
    /// Backend name ("naive", "overlay", "btrfs", "zfs").
    fn name(&self) -> &str;

    fn stat(&self, ctx: &Context, key: &str) -> Result<Info>;

    /// Update mutable fields (labels). See `MetaStore::update` for field paths.
    fn update(&self, ctx: &Context, info: Info, fieldpaths: &[&str]) -> Result<Info>;

    fn usage(&self, ctx: &Context, key: &str) -> Result<Usage>;

    /// Mount descriptors of an existing active/view snapshot. Allocates nothing.
    fn mounts(&self, ctx: &Context, key: &str) -> Result<Vec<Mount>>;

    fn prepare_with(
        &self,
        ctx: &Context,
        key: &str,
        parent: &str,
        opts: &SnapshotOptions,
    ) -> Result<Vec<Mount>>;

    fn view_with(
        &self,
        ctx: &Context,
        key: &str,
        parent: &str,
        opts: &SnapshotOptions,
    ) -> Result<Vec<Mount>>;

    fn commit_with(&self, ctx: &Context, name: &str, key: &str, opts: &SnapshotOptions)
        -> Result<()>;

    fn remove(&self, ctx: &Context, key: &str) -> Result<()>;

    /// Visit every committed snapshot (sorted by name). Stops on the first error.
    fn walk(&self, ctx: &Context, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()>;

    fn prepare(&self, ctx: &Context, key: &str, parent: &str) -> Result<Vec<Mount>> {
        self.prepare_with(ctx, key, parent, &SnapshotOptions::default())
    }

    fn view(&self, ctx: &Context, key: &str, parent: &str) -> Result<Vec<Mount>> {
        self.view_with(ctx, key, parent, &SnapshotOptions::default())
    }

    fn commit(&self, ctx: &Context, name: &str, key: &str) -> Result<()> {
        self.commit_with(ctx, name, key, &SnapshotOptions::default())
    }
}
