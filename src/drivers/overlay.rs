//! overlay — upper directories stacked over the committed chain.
//!
//! Every snapshot owns `snapshots/<id>/{fs,work}`. Committing only flips the
//! metadata record: the upper `fs` of an active snapshot becomes a lower layer.

use anyhow::Context as _;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::LayerConfig;
use crate::context::Context;
use crate::drivers::{
    active_for_commit, check_same_id, check_same_parent, ensure_layout, remove_dir_unit,
    resolve_parent, sweep_dirs, UnitLock, STAGING_DIR,
};
use crate::errors::Result;
use crate::metrics::{record_commit, record_prepare, record_view};
use crate::mount::Mount;
use crate::snapshot::{Info, Kind, Snapshot, SnapshotOptions, Snapshotter, Usage};
use crate::storage::MetaStore;
use crate::util::fs::{disk_usage, CleanupGuard};
use crate::util::random_hex;

pub const NAME: &str = "overlay";

const SNAPSHOTS_DIR: &str = "snapshots";

pub struct OverlaySnapshotter {
    root: PathBuf,
    store: MetaStore,
    layout: UnitLock,
}

impl OverlaySnapshotter {
    pub fn new(root: &Path, cfg: &LayerConfig) -> Result<Self> {
        ensure_layout(root, &[SNAPSHOTS_DIR, STAGING_DIR])?;
        let store = MetaStore::open(root, cfg)?;
        sweep_dirs(NAME, &store, root, &[SNAPSHOTS_DIR])?;
        info!("overlay: ready at {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            store,
            layout: UnitLock::default(),
        })
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    fn unit_path(&self, id: &str) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(id)
    }

    fn upper_path(&self, id: &str) -> PathBuf {
        self.unit_path(id).join("fs")
    }

    fn work_path(&self, id: &str) -> PathBuf {
        self.unit_path(id).join("work")
    }

    fn mounts_for(&self, snap: &Snapshot) -> Vec<Mount> {
        if snap.parent_ids.is_empty() {
            let rw = if snap.kind == Kind::Active { "rw" } else { "ro" };
            return vec![Mount::new("bind", self.upper_path(&snap.id).to_string_lossy())
                .with_option("rbind")
                .with_option(rw)];
        }

        if snap.kind == Kind::View && snap.parent_ids.len() == 1 {
            return vec![Mount::new("bind", self.upper_path(&snap.parent_ids[0]).to_string_lossy())
                .with_option("ro")
                .with_option("rbind")];
        }

        let lower: Vec<String> = snap
            .parent_ids
            .iter()
            .map(|p| self.upper_path(p).to_string_lossy().into_owned())
            .collect();
        let lowerdir = format!("lowerdir={}", lower.join(":"));

        let mut m = Mount::new("overlay", "overlay");
        if snap.kind == Kind::Active {
            m = m
                .with_option(format!("workdir={}", self.work_path(&snap.id).display()))
                .with_option(format!("upperdir={}", self.upper_path(&snap.id).display()));
        }
        vec![m.with_option(lowerdir)]
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
        let mut guard = CleanupGuard::new(staging.clone(), NAME);
        for sub in ["fs", "work"] {
            let p = staging.join(sub);
            fs::create_dir_all(&p).with_context(|| format!("create {}", p.display()))?;
        }

        let mut tx = self.store.transaction(ctx, true)?;
        let snap = tx.create_snapshot(kind, key, parent, opts)?;
        check_same_parent(key, parent_id.as_ref(), &snap.parent_ids)?;

        let target = self.unit_path(&snap.id);
        fs::rename(&staging, &target)
            .with_context(|| format!("rename {} -> {}", staging.display(), target.display()))?;
        guard.retarget(target);

        tx.commit()?;
        guard.disarm();
        Ok(self.mounts_for(&snap))
    }
}

impl Snapshotter for OverlaySnapshotter {
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
        let du = disk_usage(&self.upper_path(&id))?;
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
        let snap = active_for_commit(&self.store, ctx, key)?;
        let du = disk_usage(&self.upper_path(&snap.id))?;

        let mut tx = self.store.transaction(ctx, true)?;
        let id = tx.commit_active(key, name, Usage::new(du.size as i64, du.inodes as i64), opts)?;
        check_same_id(key, &snap.id, &id)?;
        tx.commit()?;
        record_commit();
        Ok(())
    }

    fn remove(&self, ctx: &Context, key: &str) -> Result<()> {
        remove_dir_unit(NAME, &self.store, &self.layout, ctx, key, |_kind, id| {
            self.unit_path(id)
        })
    }

    fn walk(&self, ctx: &Context, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        self.store.walk(ctx, f)
    }
}
