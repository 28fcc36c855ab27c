//! btrfs — storage units are subvolumes, clone is a subvolume snapshot.
//!
//! Layout under the backend root (must live on a btrfs mount):
//!   active/<id>     writable subvolumes
//!   view/<id>       read-only snapshots of the parent
//!   snapshots/<id>  read-only committed snapshots
//!   staging/        subvolumes being allocated (swept on open)
//!
//! Mounts: `btrfs` on the filesystem device with `subvolid=<n>`, plus `ro` for
//! anything that is not active.
//!
//! Usage comes from quota groups (level-0 qgroup id == subvolume id):
//! - root of a chain:            referenced bytes;
//! - leaf (no committed child):  exclusive bytes;
//! - interior:                   referenced - usage(parent), clamped at 0.
//! Without quotas enabled `usage` is Unsupported.

pub mod cli;

use anyhow::Context as _;
use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::LayerConfig;
use crate::context::Context;
use crate::drivers::{
    check_no_children, check_same_parent, ensure_layout, is_committed_leaf, orphaned_leftovers,
    resolve_parent, REMOVED_PREFIX, STAGING_DIR,
};
use crate::errors::{Error, Result};
use crate::metrics::{
    record_cleanup_failure, record_commit, record_prepare, record_remove, record_storage_restore,
    record_usage_clamped, record_view,
};
use crate::mount::{self, Mount};
use crate::snapshot::{Info, Kind, Snapshot, SnapshotOptions, Snapshotter, Usage};
use crate::storage::{MetaStore, Transaction};
use crate::util::random_hex;

pub use cli::BtrfsCli;

pub const NAME: &str = "btrfs";

const UNIT_DIRS: [&str; 3] = ["active", "view", "snapshots"];

/// Byte counters of one level-0 quota group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QGroupUsage {
    pub referenced: i64,
    pub exclusive: i64,
}

/// Subvolume primitives the driver needs. `BtrfsCli` shells out to `btrfs`;
/// tests plug in an in-process fake.
pub trait SubvolumeOps: Send + Sync {
    fn create(&self, path: &Path) -> anyhow::Result<()>;
    fn snapshot(&self, src: &Path, dst: &Path, readonly: bool) -> anyhow::Result<()>;
    fn delete(&self, path: &Path) -> anyhow::Result<()>;
    fn subvolume_id(&self, path: &Path) -> anyhow::Result<u64>;
    /// None when quotas are not enabled on the filesystem.
    fn qgroup(&self, path: &Path) -> anyhow::Result<Option<QGroupUsage>>;
}

// Deletes a subvolume on drop unless disarmed.
struct SubvolGuard<'a, O: SubvolumeOps> {
    ops: &'a O,
    path: Option<PathBuf>,
}

impl<'a, O: SubvolumeOps> SubvolGuard<'a, O> {
    fn new(ops: &'a O, path: PathBuf) -> Self {
        Self {
            ops,
            path: Some(path),
        }
    }

    fn retarget(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl<O: SubvolumeOps> Drop for SubvolGuard<'_, O> {
    fn drop(&mut self) {
        if let Some(p) = self.path.take() {
            debug!("btrfs: cleanup subvolume {}", p.display());
            if let Err(e) = self.ops.delete(&p) {
                warn!("btrfs: failed to delete subvolume {}: {:#}", p.display(), e);
                record_cleanup_failure();
            }
        }
    }
}

pub struct BtrfsSnapshotter<O: SubvolumeOps = BtrfsCli> {
    root: PathBuf,
    device: String,
    ops: O,
    store: MetaStore,
}

impl BtrfsSnapshotter<BtrfsCli> {
    /// Open on a real btrfs mount; the device is taken from the mount table.
    pub fn new(root: &Path, cfg: &LayerConfig) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let mi = mount::lookup(root)?;
        if mi.fstype != "btrfs" {
            return Err(Error::Unsupported(format!(
                "{} is on {} ({}), btrfs is required",
                root.display(),
                mi.fstype,
                mi.mountpoint.display()
            )));
        }
        Self::with_ops(root, &mi.source, BtrfsCli::new(cfg.btrfs_bin.clone()), cfg)
    }
}

impl<O: SubvolumeOps> BtrfsSnapshotter<O> {
    pub fn with_ops(root: &Path, device: &str, ops: O, cfg: &LayerConfig) -> Result<Self> {
        ensure_layout(root, &UNIT_DIRS)?;
        ensure_layout(root, &[STAGING_DIR])?;
        let store = MetaStore::open(root, cfg)?;
        let me = Self {
            root: root.to_path_buf(),
            device: device.to_string(),
            ops,
            store,
        };
        me.sweep()?;
        info!("btrfs: ready at {} (device {})", root.display(), device);
        Ok(me)
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    fn unit_path(&self, kind: Kind, id: &str) -> PathBuf {
        self.root.join(kind.storage_dir()).join(id)
    }

    fn delete_unit(&self, path: &Path) {
        if let Err(e) = self.ops.delete(path) {
            warn!("btrfs: failed to delete subvolume {}: {:#}", path.display(), e);
            record_cleanup_failure();
        }
    }

    fn sweep(&self) -> Result<()> {
        for p in orphaned_leftovers(NAME, &self.store, &self.root, &UNIT_DIRS)? {
            debug!("btrfs: sweep leftover {}", p.display());
            self.delete_unit(&p);
        }
        Ok(())
    }

    fn mounts_for(&self, snap: &Snapshot) -> Result<Vec<Mount>> {
        let path = self.unit_path(snap.kind, &snap.id);
        let sid = self
            .ops
            .subvolume_id(&path)
            .with_context(|| format!("btrfs: subvolume id of {}", path.display()))?;
        let mut m = Mount::new(NAME, self.device.clone()).with_option(format!("subvolid={}", sid));
        if snap.kind != Kind::Active {
            m = m.with_option("ro");
        }
        Ok(vec![m])
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

        let staging = self.root.join(STAGING_DIR).join(random_hex(8));
        match &parent_id {
            None => self.ops.create(&staging),
            Some(pid) => self.ops.snapshot(
                &self.unit_path(Kind::Committed, pid),
                &staging,
                kind.is_readonly(),
            ),
        }
        .with_context(|| format!("btrfs: allocate subvolume for {:?}", key))?;
        let mut guard = SubvolGuard::new(&self.ops, staging.clone());

        let mut tx = self.store.transaction(ctx, true)?;
        let snap = tx.create_snapshot(kind, key, parent, opts)?;
        check_same_parent(key, parent_id.as_ref(), &snap.parent_ids)?;

        let target = self.unit_path(kind, &snap.id);
        fs::rename(&staging, &target)
            .with_context(|| format!("rename {} -> {}", staging.display(), target.display()))?;
        guard.retarget(target);

        let mounts = self.mounts_for(&snap)?;
        tx.commit()?;
        guard.disarm();
        Ok(mounts)
    }

    fn usage_of(&self, tx: &Transaction, key: &str) -> Result<i64> {
        let (id, info, _) = tx.get_info(key)?;
        let path = self.unit_path(info.kind, &id);
        let q = self
            .ops
            .qgroup(&path)
            .with_context(|| format!("btrfs: qgroup of {}", path.display()))?
            .ok_or_else(|| {
                Error::Unsupported(format!(
                    "btrfs quotas are not enabled on {}",
                    self.root.display()
                ))
            })?;

        if !info.has_parent() {
            return Ok(q.referenced);
        }
        if is_committed_leaf(tx, key, info.kind) {
            return Ok(q.exclusive);
        }
        let parent = self.usage_of(tx, &info.parent)?;
        let v = q.referenced - parent;
        if v < 0 {
            warn!(
                "btrfs: usage of {:?} is negative (referenced {} - parent {}), clamped to 0",
                key, q.referenced, parent
            );
            record_usage_clamped();
            return Ok(0);
        }
        Ok(v)
    }
}

impl<O: SubvolumeOps> Snapshotter for BtrfsSnapshotter<O> {
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
        let tx = self.store.transaction(ctx, false)?;
        let size = self.usage_of(&tx, key)?;
        Ok(Usage::new(size, -1))
    }

    fn mounts(&self, ctx: &Context, key: &str) -> Result<Vec<Mount>> {
        let tx = self.store.transaction(ctx, false)?;
        let snap = tx.get_active(key)?;
        self.mounts_for(&snap)
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
        let mut tx = self.store.transaction(ctx, true)?;
        // usage считается по qgroup на лету, в записи — нули
        let id = tx.commit_active(key, name, Usage::default(), opts)?;

        let source = self.unit_path(Kind::Active, &id);
        let target = self.unit_path(Kind::Committed, &id);
        self.ops
            .snapshot(&source, &target, true)
            .with_context(|| format!("btrfs: snapshot {} -> {}", source.display(), target.display()))?;
        let guard = SubvolGuard::new(&self.ops, target);

        tx.commit()?;
        guard.disarm();

        // коммит уже виден; активный subvolume больше никому не нужен
        self.delete_unit(&source);
        record_commit();
        Ok(())
    }

    fn remove(&self, ctx: &Context, key: &str) -> Result<()> {
        let mut tx = self.store.transaction(ctx, true)?;
        check_no_children(&tx, key)?;
        let (id, kind) = tx.remove(key)?;

        let source = self.unit_path(kind, &id);
        let removed = self
            .root
            .join(kind.storage_dir())
            .join(format!("{}{}", REMOVED_PREFIX, id));

        self.ops
            .snapshot(&source, &removed, true)
            .with_context(|| format!("btrfs: relocate {} -> {}", source.display(), removed.display()))?;
        if let Err(e) = self.ops.delete(&source) {
            self.delete_unit(&removed);
            return Err(e
                .context(format!("btrfs: delete subvolume {}", source.display()))
                .into());
        }

        if let Err(e) = tx.commit() {
            match self.ops.snapshot(&removed, &source, kind.is_readonly()) {
                Ok(()) => {
                    record_storage_restore();
                    self.delete_unit(&removed);
                }
                Err(re) => {
                    // rm-<id> остаётся: это единственная копия данных
                    error!(
                        "btrfs: failed to restore {} from {}: {:#}",
                        source.display(),
                        removed.display(),
                        re
                    );
                    record_cleanup_failure();
                }
            }
            return Err(e);
        }

        self.delete_unit(&removed);
        record_remove();
        Ok(())
    }

    fn walk(&self, ctx: &Context, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        self.store.walk(ctx, f)
    }
}
