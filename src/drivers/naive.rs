//! naive — storage units are plain directories, clone is a full copy.
//!
//! Layout under the backend root:
//!   active/<id>     writable snapshots
//!   view/<id>       read-only snapshots (their own copy of the parent)
//!   snapshots/<id>  committed snapshots
//!   staging/        copies in progress (swept on open)
//!
//! Commit publishes the record first and then moves `active/<id>` to
//! `snapshots/<id>`; until the move is done a committed record may still live
//! under `active/`.
//!
//! Works on any filesystem and without privileges, which also makes it the
//! reference backend for tests.

use anyhow::Context as _;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::LayerConfig;
use crate::context::Context;
use crate::drivers::{
    active_for_commit, check_same_id, check_same_parent, ensure_layout, remove_dir_unit,
    resolve_parent, sweep_dirs, UnitLock, STAGING_DIR,
};
use crate::errors::Result;
use crate::metrics::{record_cleanup_failure, record_commit, record_prepare, record_view};
use crate::mount::Mount;
use crate::snapshot::{Info, Kind, Snapshot, SnapshotOptions, Snapshotter, Usage};
use crate::storage::MetaStore;
use crate::util::fs::{copy_tree, disk_usage, CleanupGuard};
use crate::util::random_hex;

pub const NAME: &str = "naive";

const UNIT_DIRS: [&str; 3] = ["active", "view", "snapshots"];

pub struct NaiveSnapshotter {
    root: PathBuf,
    store: MetaStore,
    layout: UnitLock,
}

impl NaiveSnapshotter {
    pub fn new(root: &Path, cfg: &LayerConfig) -> Result<Self> {
        ensure_layout(root, &UNIT_DIRS)?;
        ensure_layout(root, &[STAGING_DIR])?;
        let store = MetaStore::open(root, cfg)?;
        settle_committed(&store, root)?;
        sweep_dirs(NAME, &store, root, &UNIT_DIRS)?;
        info!("naive: ready at {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            store,
            layout: UnitLock::default(),
        })
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    fn unit_path(&self, kind: Kind, id: &str) -> PathBuf {
        self.root.join(kind.storage_dir()).join(id)
    }

    // вызывать под self.layout
    fn storage_of(&self, kind: Kind, id: &str) -> PathBuf {
        let p = self.unit_path(kind, id);
        if kind == Kind::Committed && !p.exists() {
            let pending = self.unit_path(Kind::Active, id);
            if pending.exists() {
                return pending;
            }
        }
        p
    }

    fn mounts_for(&self, snap: &Snapshot) -> Vec<Mount> {
        let rw = if snap.kind == Kind::Active { "rw" } else { "ro" };
        vec![Mount::new("bind", self.unit_path(snap.kind, &snap.id).to_string_lossy())
            .with_option("rbind")
            .with_option(rw)]
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

        // копия делается до write-транзакции: писатель не ждёт на I/O
        let staging = self.root.join(STAGING_DIR).join(random_hex(8));
        let mut guard = CleanupGuard::new(staging.clone(), NAME);
        let parent_id = {
            let _g = self.layout.read();
            let parent_id = resolve_parent(&self.store, ctx, parent)?;
            match &parent_id {
                Some(pid) => copy_tree(&self.storage_of(Kind::Committed, pid), &staging)
                    .with_context(|| format!("naive: clone parent {:?}", parent))?,
                None => fs::create_dir(&staging)
                    .with_context(|| format!("create {}", staging.display()))?,
            }
            parent_id
        };

        let mut tx = self.store.transaction(ctx, true)?;
        let snap = tx.create_snapshot(kind, key, parent, opts)?;
        check_same_parent(key, parent_id.as_ref(), &snap.parent_ids)?;

        let target = self.unit_path(kind, &snap.id);
        fs::rename(&staging, &target)
            .with_context(|| format!("rename {} -> {}", staging.display(), target.display()))?;
        guard.retarget(target);

        tx.commit()?;
        guard.disarm();
        Ok(self.mounts_for(&snap))
    }
}

impl Snapshotter for NaiveSnapshotter {
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
        let _g = self.layout.read();
        let tx = self.store.transaction(ctx, false)?;
        let (id, info, _) = tx.get_info(key)?;
        if info.kind == Kind::Committed {
            return tx.get_usage(key);
        }
        drop(tx);
        let du = disk_usage(&self.unit_path(info.kind, &id))?;
        Ok(Usage::new(du.size as i64, du.inodes as i64))
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
        // usage считается до write-транзакции (обход дерева может быть долгим)
        let snap = active_for_commit(&self.store, ctx, key)?;
        let du = disk_usage(&self.unit_path(snap.kind, &snap.id))?;
        let usage = Usage::new(du.size as i64, du.inodes as i64);

        let mut tx = self.store.transaction(ctx, true)?;
        let id = tx.commit_active(key, name, usage, opts)?;
        check_same_id(key, &snap.id, &id)?;

        tx.commit()?;

        // запись уже committed; каталог догоняет её под layout-локом
        let src = self.unit_path(Kind::Active, &id);
        let dst = self.unit_path(Kind::Committed, &id);
        {
            let _g = self.layout.write();
            if let Err(e) = fs::rename(&src, &dst) {
                // storage_of найдёт его в active/, следующий open доведёт перенос
                warn!("naive: failed to move {} -> {}: {}", src.display(), dst.display(), e);
                record_cleanup_failure();
            }
        }
        record_commit();
        Ok(())
    }

    fn remove(&self, ctx: &Context, key: &str) -> Result<()> {
        remove_dir_unit(NAME, &self.store, &self.layout, ctx, key, |kind, id| {
            self.storage_of(kind, id)
        })
    }

    fn walk(&self, ctx: &Context, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        self.store.walk(ctx, f)
    }
}

/// Finish commits whose record was published but whose directory is still under
/// `active/`.
fn settle_committed(store: &MetaStore, root: &Path) -> Result<()> {
    let tx = store.transaction(&Context::background(), false)?;
    let mut names = Vec::new();
    tx.walk_info(&mut |i: &Info| {
        names.push(i.name.clone());
        Ok(())
    })?;
    for name in names {
        let (id, _, _) = tx.get_info(&name)?;
        let src = root.join(Kind::Active.storage_dir()).join(&id);
        let dst = root.join(Kind::Committed.storage_dir()).join(&id);
        if src.is_dir() && !dst.exists() {
            fs::rename(&src, &dst)
                .with_context(|| format!("rename {} -> {}", src.display(), dst.display()))?;
            info!("naive: settled committed snapshot {:?} ({})", name, id);
        }
    }
    Ok(())
}
