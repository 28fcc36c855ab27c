//! Metadata store: transactional registry of snapshot records.
//!
//! - One store per backend root, persisted to `<root>/metadata.db` (см. codec.rs),
//!   guarded across processes by `<root>/LOCK`.
//! - Read transactions work on an immutable `Arc<MetaState>` taken at begin:
//!   they never block and never see a half-applied write.
//! - Write transactions are serialized by a single writer slot. The writer edits a
//!   private copy; `commit()` persists it atomically and publishes it. Drop without
//!   commit is a rollback.
//! - The store does not touch storage units: backends reconcile those using the
//!   id/kind values returned here.

pub mod codec;
pub mod state;

use anyhow::{anyhow, Context as _};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use crate::config::LayerConfig;
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::lock::{try_acquire_store_lock, LockGuard};
use crate::metrics::{record_meta_commit, record_meta_rollback};
use crate::snapshot::{Info, Kind, Snapshot, SnapshotOptions, Usage};
use crate::util::fs::write_atomic;
use crate::util::now_unix_ms;

use self::state::{MetaState, SnapshotRecord};

pub const METADATA_FILE: &str = "metadata.db";

struct StoreInner {
    root: PathBuf,
    path: PathBuf,
    fsync: bool,
    writer_wait: Duration,
    committed: RwLock<Arc<MetaState>>,
    writer_busy: Mutex<bool>,
    writer_cv: Condvar,
    _lock: LockGuard,
}

impl StoreInner {
    fn current(&self) -> Arc<MetaState> {
        match self.committed.read() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    fn publish(&self, st: MetaState) {
        let mut g = match self.committed.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        *g = Arc::new(st);
    }

    fn acquire_writer(&self, ctx: &Context) -> Result<()> {
        let mut busy = match self.writer_busy.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        while *busy {
            ctx.err()?;
            busy = match self.writer_cv.wait_timeout(busy, self.writer_wait) {
                Ok((g, _)) => g,
                Err(p) => p.into_inner().0,
            };
        }
        // контекст мог истечь, пока ждали
        ctx.err()?;
        *busy = true;
        Ok(())
    }

    fn release_writer(&self) {
        let mut busy = match self.writer_busy.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        *busy = false;
        drop(busy);
        self.writer_cv.notify_one();
    }
}

/// Handle to an open metadata store. Cheap to clone.
#[derive(Clone)]
pub struct MetaStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl MetaStore {
    /// Open (or create) the store under `root`. Fails if another store instance
    /// holds the root's lock.
    pub fn open(root: &Path, cfg: &LayerConfig) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let lock = try_acquire_store_lock(root)?;

        let path = root.join(METADATA_FILE);
        let state = if path.exists() {
            let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            codec::decode(&bytes).with_context(|| format!("open {}", path.display()))?
        } else {
            let st = MetaState::default();
            let bytes = codec::encode(&st)?;
            write_atomic(&path, &bytes, cfg.metadata_fsync)?;
            st
        };

        info!(
            "metastore: opened {} (snapshots={}, next_id={})",
            path.display(),
            state.snapshots.len(),
            state.next_id
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                root: root.to_path_buf(),
                path,
                fsync: cfg.metadata_fsync,
                writer_wait: Duration::from_millis(cfg.writer_wait_ms.max(1)),
                committed: RwLock::new(Arc::new(state)),
                writer_busy: Mutex::new(false),
                writer_cv: Condvar::new(),
                _lock: lock,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Begin a transaction. A writable transaction waits for the writer slot
    /// (honouring `ctx`); a read-only one starts immediately.
    pub fn transaction(&self, ctx: &Context, writable: bool) -> Result<Transaction> {
        ctx.err()?;
        if writable {
            self.inner.acquire_writer(ctx)?;
        }
        let base = self.inner.current();
        let work = if writable { Some((*base).clone()) } else { None };
        Ok(Transaction {
            store: self.inner.clone(),
            ctx: ctx.clone(),
            base,
            work,
            writable,
            dirty: false,
            done: false,
        })
    }

    // ---- helpers shared by all backends ----

    pub fn stat(&self, ctx: &Context, key: &str) -> Result<Info> {
        let tx = self.transaction(ctx, false)?;
        let (_, info, _) = tx.get_info(key)?;
        Ok(info)
    }

    pub fn update(&self, ctx: &Context, info: Info, fieldpaths: &[&str]) -> Result<Info> {
        let mut tx = self.transaction(ctx, true)?;
        let out = tx.update_info(info, fieldpaths)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn walk(&self, ctx: &Context, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        let tx = self.transaction(ctx, false)?;
        tx.walk_info(f)
    }
}

/// Scoped read or read-write handle. Must be committed explicitly; dropping it
/// rolls back and frees the writer slot.
pub struct Transaction {
    store: Arc<StoreInner>,
    ctx: Context,
    base: Arc<MetaState>,
    work: Option<MetaState>,
    writable: bool,
    dirty: bool,
    done: bool,
}

impl Transaction {
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn state(&self) -> &MetaState {
        match &self.work {
            Some(w) => w,
            None => &self.base,
        }
    }

    fn state_mut(&mut self) -> Result<&mut MetaState> {
        let st = self
            .work
            .as_mut()
            .ok_or_else(|| Error::FailedPrecondition("write on a read-only transaction".into()))?;
        self.dirty = true;
        Ok(st)
    }

    fn record(&self, key: &str) -> Result<&SnapshotRecord> {
        self.state()
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("snapshot {:?}", key)))
    }

    /// Resolve an active, view or committed entry: (id, info, parent chain ids).
    pub fn get_info(&self, key: &str) -> Result<(String, Info, Vec<String>)> {
        let rec = self.record(key)?;
        let parents = self.state().parent_ids(key)?;
        Ok((rec.id.to_string(), rec.info(key), parents))
    }

    /// Resolve an active or view entry. Committed entries are FailedPrecondition.
    pub fn get_active(&self, key: &str) -> Result<Snapshot> {
        let rec = self.record(key)?;
        if rec.kind == Kind::Committed {
            return Err(Error::FailedPrecondition(format!(
                "snapshot {:?} is committed, not active or view",
                key
            )));
        }
        Ok(Snapshot {
            kind: rec.kind,
            id: rec.id.to_string(),
            parent_ids: self.state().parent_ids(key)?,
        })
    }

    /// Usage captured at commit time (zeros for active/view).
    pub fn get_usage(&self, key: &str) -> Result<Usage> {
        Ok(self.record(key)?.usage())
    }

    /// Visit every committed record, sorted by name.
    pub fn walk_info(&self, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        for (name, rec) in &self.state().snapshots {
            if rec.kind != Kind::Committed {
                continue;
            }
            self.ctx.err()?;
            f(&rec.info(name))?;
        }
        Ok(())
    }

    /// Snapshots of any kind whose parent is `key`.
    pub fn children(&self, key: &str) -> Vec<Info> {
        let st = self.state();
        st.children(key)
            .into_iter()
            .filter_map(|name| st.get(name).map(|r| r.info(name)))
            .collect()
    }

    /// True if some record (any kind) carries internal id `id`.
    pub fn has_id(&self, id: &str) -> bool {
        self.state().snapshots.values().any(|r| r.id.to_string() == id)
    }

    pub fn has_children(&self, key: &str) -> bool {
        !self.state().children(key).is_empty()
    }

    pub fn create_active(&mut self, key: &str, parent: &str, readonly: bool) -> Result<Snapshot> {
        let kind = if readonly { Kind::View } else { Kind::Active };
        self.create_snapshot(kind, key, parent, &SnapshotOptions::default())
    }

    /// Create an active or view record. The parent, when given, must be committed.
    pub fn create_snapshot(
        &mut self,
        kind: Kind,
        key: &str,
        parent: &str,
        opts: &SnapshotOptions,
    ) -> Result<Snapshot> {
        if !self.is_writable() {
            return Err(Error::FailedPrecondition("write on a read-only transaction".into()));
        }
        if key.is_empty() {
            return Err(Error::InvalidArgument("snapshot key must not be empty".into()));
        }
        if !kind.is_creatable() {
            return Err(Error::InvalidArgument(format!(
                "snapshot type {} cannot be created directly",
                kind
            )));
        }
        if self.state().get(key).is_some() {
            return Err(Error::AlreadyExists(format!("snapshot {:?}", key)));
        }
        if !parent.is_empty() {
            match self.state().get(parent) {
                None => return Err(Error::NotFound(format!("parent snapshot {:?}", parent))),
                Some(p) if !p.kind.can_be_parent() => {
                    return Err(Error::InvalidArgument(format!(
                        "parent {:?} is {}, only committed snapshots can be parents",
                        parent, p.kind
                    )))
                }
                Some(_) => {}
            }
        }

        let now = now_unix_ms();
        let st = self.state_mut()?;
        let id = st.alloc_id();
        st.snapshots.insert(
            key.to_string(),
            SnapshotRecord {
                id,
                kind,
                parent: parent.to_string(),
                labels: opts.labels.clone(),
                created_unix_ms: now,
                updated_unix_ms: now,
                size: 0,
                inodes: 0,
            },
        );
        let parent_ids = st.parent_ids(key)?;
        debug!("metastore: create {} {:?} id={} parent={:?}", kind, key, id, parent);

        Ok(Snapshot {
            kind,
            id: id.to_string(),
            parent_ids,
        })
    }

    /// Turn the active record `key` into the committed record `name`, keeping its
    /// id and parent. Returns the id.
    pub fn commit_active(
        &mut self,
        key: &str,
        name: &str,
        usage: Usage,
        opts: &SnapshotOptions,
    ) -> Result<String> {
        if !self.is_writable() {
            return Err(Error::FailedPrecondition("write on a read-only transaction".into()));
        }
        if name.is_empty() {
            return Err(Error::InvalidArgument("committed name must not be empty".into()));
        }
        if self.state().get(name).is_some() {
            return Err(Error::AlreadyExists(format!("snapshot {:?}", name)));
        }
        match self.state().get(key) {
            None => return Err(Error::NotFound(format!("active snapshot {:?}", key))),
            Some(r) if r.kind == Kind::Committed => {
                return Err(Error::NotFound(format!("active snapshot {:?}", key)))
            }
            Some(r) if !r.kind.can_commit() => {
                return Err(Error::FailedPrecondition(format!(
                    "snapshot {:?} is a {}, only active snapshots can be committed",
                    key, r.kind
                )))
            }
            Some(_) => {}
        }

        let now = now_unix_ms();
        let st = self.state_mut()?;
        let mut rec = st
            .snapshots
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("active snapshot {:?}", key)))?;
        rec.kind = Kind::Committed;
        rec.labels.extend(opts.labels.clone());
        rec.updated_unix_ms = now;
        rec.size = usage.size;
        rec.inodes = usage.inodes;
        let id = rec.id;
        st.snapshots.insert(name.to_string(), rec);
        debug!("metastore: commit {:?} -> {:?} id={}", key, name, id);
        Ok(id.to_string())
    }

    /// Delete a record and return its (id, kind). Snapshots that are still a parent
    /// of anything are refused.
    pub fn remove(&mut self, key: &str) -> Result<(String, Kind)> {
        if !self.is_writable() {
            return Err(Error::FailedPrecondition("write on a read-only transaction".into()));
        }
        let kind = self.record(key)?.kind;
        let children = self.state().children(key);
        if !children.is_empty() {
            return Err(Error::FailedPrecondition(format!(
                "cannot remove snapshot {:?}: still parent of {}",
                key,
                children.join(", ")
            )));
        }
        let st = self.state_mut()?;
        let rec = st
            .snapshots
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("snapshot {:?}", key)))?;
        debug!("metastore: remove {:?} id={} kind={}", key, rec.id, kind);
        Ok((rec.id.to_string(), kind))
    }

    /// Update mutable fields of `info.name`.
    ///
    /// Field paths: `labels` (replace all labels), `labels.<k>` (set or, if absent in
    /// `info.labels`, delete one label). An empty list replaces the labels and
    /// requires kind/parent to match the stored record.
    pub fn update_info(&mut self, info: Info, fieldpaths: &[&str]) -> Result<Info> {
        if !self.is_writable() {
            return Err(Error::FailedPrecondition("write on a read-only transaction".into()));
        }
        let cur = self.record(&info.name)?.clone();

        let mut labels = cur.labels.clone();
        if fieldpaths.is_empty() {
            if info.kind != cur.kind || info.parent != cur.parent {
                return Err(Error::InvalidArgument(format!(
                    "snapshot {:?}: kind and parent are immutable",
                    info.name
                )));
            }
            labels = info.labels.clone();
        } else {
            for path in fieldpaths {
                if *path == "labels" {
                    labels = info.labels.clone();
                } else if let Some(k) = path.strip_prefix("labels.") {
                    if k.is_empty() {
                        return Err(Error::InvalidArgument("empty label key in field path".into()));
                    }
                    match info.labels.get(k) {
                        Some(v) => {
                            labels.insert(k.to_string(), v.clone());
                        }
                        None => {
                            labels.remove(k);
                        }
                    }
                } else {
                    return Err(Error::InvalidArgument(format!(
                        "cannot update {:?} field on snapshot {:?}",
                        path, info.name
                    )));
                }
            }
        }

        let now = now_unix_ms();
        let name = info.name;
        let st = self.state_mut()?;
        let rec = st
            .snapshots
            .get_mut(&name)
            .ok_or_else(|| Error::NotFound(format!("snapshot {:?}", name)))?;
        rec.labels = labels;
        rec.updated_unix_ms = now;
        Ok(rec.info(&name))
    }

    /// Persist and publish. A cancelled context rolls back instead.
    pub fn commit(mut self) -> Result<()> {
        if !self.writable {
            self.done = true;
            return Ok(());
        }
        self.ctx.err()?;

        if self.dirty {
            let st = self
                .work
                .take()
                .ok_or_else(|| Error::Internal(anyhow!("metastore: transaction state missing")))?;
            let bytes = codec::encode(&st)?;
            if let Err(e) = write_atomic(&self.store.path, &bytes, self.store.fsync) {
                // вернуть состояние, чтобы Drop корректно отработал как rollback
                self.work = Some(st);
                return Err(Error::Internal(e.context("metastore: persist transaction")));
            }
            self.store.publish(st);
            record_meta_commit(bytes.len());
            debug!("metastore: committed ({} bytes)", bytes.len());
        }
        self.done = true;
        Ok(())
    }

    pub fn rollback(self) {
        // Drop делает всю работу
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.writable {
            return;
        }
        if !self.done {
            record_meta_rollback();
            debug!("metastore: transaction rolled back");
        }
        self.store.release_writer();
    }
}
