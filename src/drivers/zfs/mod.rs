//! zfs — storage units are datasets under the dataset mounted at the backend root.
//!
//!   <dataset>/<id>             active, view or committed dataset (mountpoint=legacy)
//!   <dataset>/<id>@snapshot    point-in-time image of a committed snapshot
//!   <dataset>/staging-<rand>   dataset being allocated (swept on open)
//!   <dataset>/rm-<id>          dataset being removed
//!
//! Children are clones of the parent's `@snapshot`; views are clones with
//! `readonly=on`. Usage is the dataset's `used` property.

pub mod cli;

use anyhow::Context as _;
use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::LayerConfig;
use crate::context::Context;
use crate::drivers::{
    active_for_commit, check_no_children, check_same_id, check_same_parent, resolve_parent,
    REMOVED_PREFIX,
};
use crate::errors::{Error, Result};
use crate::metrics::{
    record_cleanup_failure, record_commit, record_prepare, record_remove, record_storage_restore,
    record_view,
};
use crate::mount::{self, Mount};
use crate::snapshot::{Info, Kind, Snapshot, SnapshotOptions, Snapshotter, Usage};
use crate::storage::MetaStore;
use crate::util::random_hex;

pub use cli::ZfsCli;

pub const NAME: &str = "zfs";
pub const SNAPSHOT_SUFFIX: &str = "snapshot";
const STAGING_PREFIX: &str = "staging-";

/// Dataset primitives the driver needs. Names are full dataset names
/// (`pool/a/b`, `pool/a/b@snap`).
pub trait DatasetOps: Send + Sync {
    fn create(&self, name: &str) -> anyhow::Result<()>;
    fn clone_from(&self, snapshot: &str, name: &str, readonly: bool) -> anyhow::Result<()>;
    fn snapshot(&self, snapshot: &str) -> anyhow::Result<()>;
    fn destroy(&self, name: &str, recursive: bool) -> anyhow::Result<()>;
    fn rename(&self, from: &str, to: &str) -> anyhow::Result<()>;
    fn used_bytes(&self, name: &str) -> anyhow::Result<u64>;
    /// Direct child filesystems of `parent`.
    fn children(&self, parent: &str) -> anyhow::Result<Vec<String>>;
}

// Destroys a dataset (or snapshot) on drop unless disarmed.
struct DatasetGuard<'a, O: DatasetOps> {
    ops: &'a O,
    name: Option<String>,
}

impl<'a, O: DatasetOps> DatasetGuard<'a, O> {
    fn new(ops: &'a O, name: String) -> Self {
        Self {
            ops,
            name: Some(name),
        }
    }

    fn retarget(&mut self, name: String) {
        self.name = Some(name);
    }

    fn disarm(mut self) {
        self.name = None;
    }
}

impl<O: DatasetOps> Drop for DatasetGuard<'_, O> {
    fn drop(&mut self) {
        if let Some(n) = self.name.take() {
            debug!("zfs: cleanup {}", n);
            if let Err(e) = self.ops.destroy(&n, false) {
                warn!("zfs: failed to destroy {}: {:#}", n, e);
                record_cleanup_failure();
            }
        }
    }
}

pub struct ZfsSnapshotter<O: DatasetOps = ZfsCli> {
    root: PathBuf,
    dataset: String,
    ops: O,
    store: MetaStore,
}

impl ZfsSnapshotter<ZfsCli> {
    /// Open on the ZFS dataset mounted at `root`.
    pub fn new(root: &Path, cfg: &LayerConfig) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let mi = mount::lookup(root)?;
        if mi.fstype != "zfs" {
            return Err(Error::Unsupported(format!(
                "{} is on {} ({}), a zfs dataset is required",
                root.display(),
                mi.fstype,
                mi.mountpoint.display()
            )));
        }
        Self::with_ops(root, &mi.source, ZfsCli::new(cfg.zfs_bin.clone()), cfg)
    }
}

impl<O: DatasetOps> ZfsSnapshotter<O> {
    pub fn with_ops(root: &Path, dataset: &str, ops: O, cfg: &LayerConfig) -> Result<Self> {
        let store = MetaStore::open(root, cfg)?;
        let me = Self {
            root: root.to_path_buf(),
            dataset: dataset.trim_end_matches('/').to_string(),
            ops,
            store,
        };
        me.sweep()?;
        info!("zfs: ready at {} (dataset {})", root.display(), me.dataset);
        Ok(me)
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dataset_name(&self, id: &str) -> String {
        format!("{}/{}", self.dataset, id)
    }

    fn snapshot_name(&self, id: &str) -> String {
        format!("{}/{}@{}", self.dataset, id, SNAPSHOT_SUFFIX)
    }

    fn destroy_unit(&self, name: &str) {
        if let Err(e) = self.ops.destroy(name, true) {
            warn!("zfs: failed to destroy {}: {:#}", name, e);
            record_cleanup_failure();
        }
    }

    fn sweep(&self) -> Result<()> {
        let prefix = format!("{}/", self.dataset);
        let tx = self.store.transaction(&Context::background(), false)?;
        for child in self.ops.children(&self.dataset)? {
            let leaf = child.strip_prefix(&prefix).unwrap_or(&child);
            let victim = if leaf.starts_with(STAGING_PREFIX) {
                true
            } else if let Some(id) = leaf.strip_prefix(REMOVED_PREFIX) {
                if tx.has_id(id) {
                    warn!("zfs: keeping {}: snapshot id {} still has a record", child, id);
                    false
                } else {
                    true
                }
            } else {
                false
            };
            if victim {
                debug!("zfs: sweep leftover {}", child);
                self.destroy_unit(&child);
            }
        }
        Ok(())
    }

    fn mounts_for(&self, snap: &Snapshot) -> Vec<Mount> {
        let mut m = Mount::new(NAME, self.dataset_name(&snap.id));
        if snap.kind.is_readonly() {
            m = m.with_option("ro");
        }
        vec![m]
    }

    fn create(
        &self,
        ctx: &Context,
        kind: Kind,
        key: &str,
        parent: &str,
        opts: &SnapshotOptions,
    ) -> Result<Vec<Mount>> {
        ctx.err()?;
        let parent_id = resolve_parent(&self.store, ctx, parent)?;

        let staging = format!("{}/{}{}", self.dataset, STAGING_PREFIX, random_hex(6));
        match &parent_id {
            None => self.ops.create(&staging),
            Some(pid) => self
                .ops
                .clone_from(&self.snapshot_name(pid), &staging, kind.is_readonly()),
        }
        .with_context(|| format!("zfs: allocate dataset for {:?}", key))?;
        let mut guard = DatasetGuard::new(&self.ops, staging.clone());

        let mut tx = self.store.transaction(ctx, true)?;
        let snap = tx.create_snapshot(kind, key, parent, opts)?;
        check_same_parent(key, parent_id.as_ref(), &snap.parent_ids)?;

        let target = self.dataset_name(&snap.id);
        self.ops
            .rename(&staging, &target)
            .with_context(|| format!("zfs: rename {} -> {}", staging, target))?;
        guard.retarget(target);

        tx.commit()?;
        guard.disarm();
        Ok(self.mounts_for(&snap))
    }
}

impl<O: DatasetOps> Snapshotter for ZfsSnapshotter<O> {
    fn name(&self) -> &str {
        NAME
    }

    fn stat(&self, ctx: &Context, key: &str) -> Result<Info> {
        self.store.stat(ctx, key)
    }

    fn update(&self, ctx: &Context, info: Info, fieldpaths: &[&str]) -> Result<Info> {
        self.store.update(ctx, info, fieldpaths)
    }

    fn usage(&self, ctx: &Context, key: &str) -> Result<Usage> {
        let id = {
            let tx = self.store.transaction(ctx, false)?;
            tx.get_info(key)?.0
        };
        let name = self.dataset_name(&id);
        let used = self
            .ops
            .used_bytes(&name)
            .with_context(|| format!("zfs: usage of {}", name))?;
        Ok(Usage::new(used as i64, -1))
    }

    fn mounts(&self, ctx: &Context, key: &str) -> Result<Vec<Mount>> {
        let tx = self.store.transaction(ctx, false)?;
        let snap = tx.get_active(key)?;
        Ok(self.mounts_for(&snap))
    }

    fn prepare_with(
        &self,
        ctx: &Context,
        key: &str,
        parent: &str,
        opts: &SnapshotOptions,
    ) -> Result<Vec<Mount>> {
        let m = self.create(ctx, Kind::Active, key, parent, opts)?;
        record_prepare();
        Ok(m)
    }

    fn view_with(
        &self,
        ctx: &Context,
        key: &str,
        parent: &str,
        opts: &SnapshotOptions,
    ) -> Result<Vec<Mount>> {
        let m = self.create(ctx, Kind::View, key, parent, opts)?;
        record_view();
        Ok(m)
    }

    fn commit_with(&self, ctx: &Context, name: &str, key: &str, opts: &SnapshotOptions) -> Result<()> {
        let snap = active_for_commit(&self.store, ctx, key)?;
        let used = self
            .ops
            .used_bytes(&self.dataset_name(&snap.id))
            .with_context(|| format!("zfs: usage of {:?}", key))?;

        let mut tx = self.store.transaction(ctx, true)?;
        let id = tx.commit_active(key, name, Usage::new(used as i64, -1), opts)?;
        check_same_id(key, &snap.id, &id)?;

        let image = self.snapshot_name(&id);
        self.ops
            .snapshot(&image)
            .with_context(|| format!("zfs: snapshot {}", image))?;
        let guard = DatasetGuard::new(&self.ops, image);

        tx.commit()?;
        guard.disarm();
        record_commit();
        Ok(())
    }

    fn remove(&self, ctx: &Context, key: &str) -> Result<()> {
        let mut tx = self.store.transaction(ctx, true)?;
        check_no_children(&tx, key)?;
        let (id, _kind) = tx.remove(key)?;

        let name = self.dataset_name(&id);
        let removed = format!("{}/{}{}", self.dataset, REMOVED_PREFIX, id);
        self.ops
            .rename(&name, &removed)
            .with_context(|| format!("zfs: rename {} -> {}", name, removed))?;

        if let Err(e) = tx.commit() {
            match self.ops.rename(&removed, &name) {
                Ok(()) => record_storage_restore(),
                Err(re) => {
                    error!("zfs: failed to restore {} from {}: {:#}", name, removed, re);
                    record_cleanup_failure();
                }
            }
            return Err(e);
        }

        // -r: вместе с @snapshot
        self.destroy_unit(&removed);
        record_remove();
        Ok(())
    }

    fn walk(&self, ctx: &Context, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        self.store.walk(ctx, f)
    }
}
