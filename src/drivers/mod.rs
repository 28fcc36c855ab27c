//! Snapshotter backends.
//!
//! Все драйверы делят одно устройство:
//! - идентичность, родители и жизненный цикл живут в `storage::MetaStore`;
//! - драйвер владеет только storage units (каталоги, subvolumes, datasets),
//!   названными по внутреннему id;
//! - выделение (copy/clone) делается в `staging/` до открытия write-транзакции,
//!   разрушение (remove) — после её commit;
//! - у каталоговых бэкендов (naive, overlay) storage двигается только после того,
//!   как новая запись опубликована, под `UnitLock::write`.

pub mod btrfs;
pub mod naive;
pub mod overlay;
pub mod zfs;

use anyhow::Context as _;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::metrics::{record_cleanup_failure, record_remove};
use crate::snapshot::{Info, Kind, Snapshot};
use crate::storage::{MetaStore, Transaction};
use crate::util::fs::remove_tree;

pub use btrfs::{BtrfsSnapshotter, QGroupUsage, SubvolumeOps};
pub use naive::NaiveSnapshotter;
pub use overlay::OverlaySnapshotter;
pub use zfs::{DatasetOps, ZfsSnapshotter};

pub const STAGING_DIR: &str = "staging";
pub const REMOVED_PREFIX: &str = "rm-";

/// Orders storage moves of directory backends against readers that resolve unit
/// paths. A reader takes `read()` before its read transaction and holds it while it
/// uses the path; a writer moves storage under `write()` only after its metadata
/// commit was published. A reader therefore never sees a record whose storage has
/// already moved.
#[derive(Debug, Default)]
pub(crate) struct UnitLock(RwLock<()>);

impl UnitLock {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ()> {
        match self.0.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ()> {
        match self.0.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

/// Create `<root>/<dir>` for every entry of `dirs`.
pub(crate) fn ensure_layout(root: &Path, dirs: &[&str]) -> Result<()> {
    for d in dirs {
        let p = root.join(d);
        fs::create_dir_all(&p).with_context(|| format!("create {}", p.display()))?;
    }
    Ok(())
}

/// Entries of `dir` left behind by an interrupted operation: everything in a
/// staging directory, `rm-*` entries elsewhere.
pub(crate) fn leftovers(dir: &Path, everything: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read_dir {}", dir.display()))?;
        let name = entry.file_name();
        if everything || name.to_string_lossy().starts_with(REMOVED_PREFIX) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Leftovers that are safe to destroy: all of `staging/`, plus `rm-<id>` entries in
/// `dirs` whose id no longer has a record. An `rm-<id>` with a live record is the
/// only copy of that snapshot after a failed restore and is kept.
pub(crate) fn orphaned_leftovers(
    component: &str,
    store: &MetaStore,
    root: &Path,
    dirs: &[&str],
) -> Result<Vec<PathBuf>> {
    let mut victims = leftovers(&root.join(STAGING_DIR), true)?;
    let tx = store.transaction(&Context::background(), false)?;
    for d in dirs {
        for p in leftovers(&root.join(d), false)? {
            let id = p
                .file_name()
                .map(|n| n.to_string_lossy().trim_start_matches(REMOVED_PREFIX).to_string())
                .unwrap_or_default();
            if tx.has_id(&id) {
                warn!(
                    "{}: keeping {}: snapshot id {} still has a record",
                    component,
                    p.display(),
                    id
                );
                continue;
            }
            victims.push(p);
        }
    }
    Ok(victims)
}

/// Unit directories in `dirs` without a record: storage of a snapshot whose removal
/// was published but not carried out, or of one whose creation never was.
pub(crate) fn untracked_units(store: &MetaStore, root: &Path, dirs: &[&str]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let tx = store.transaction(&Context::background(), false)?;
    for d in dirs {
        for p in leftovers(&root.join(d), true)? {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !name.starts_with(REMOVED_PREFIX) && !tx.has_id(&name) {
                out.push(p);
            }
        }
    }
    Ok(out)
}

/// Remove leftovers of plain-directory backends (naive, overlay). Failures are
/// logged; the next open retries.
pub(crate) fn sweep_dirs(component: &str, store: &MetaStore, root: &Path, dirs: &[&str]) -> Result<()> {
    let mut victims = orphaned_leftovers(component, store, root, dirs)?;
    victims.extend(untracked_units(store, root, dirs)?);
    for p in victims {
        debug!("{}: sweep leftover {}", component, p.display());
        if let Err(e) = remove_tree(&p) {
            warn!("{}: failed to sweep {}: {:#}", component, p.display(), e);
            record_cleanup_failure();
        }
    }
    Ok(())
}

/// Resolve `parent` for a new snapshot in a short read transaction. Returns the
/// parent's id, or None for an empty parent.
pub(crate) fn resolve_parent(store: &MetaStore, ctx: &Context, parent: &str) -> Result<Option<String>> {
    if parent.is_empty() {
        return Ok(None);
    }
    let tx = store.transaction(ctx, false)?;
    let (id, info, _) = tx.get_info(parent).map_err(|e| match e {
        Error::NotFound(_) => Error::NotFound(format!("parent snapshot {:?}", parent)),
        other => other,
    })?;
    if !info.kind.can_be_parent() {
        return Err(Error::InvalidArgument(format!(
            "parent {:?} is {}, only committed snapshots can be parents",
            parent, info.kind
        )));
    }
    Ok(Some(id))
}

/// The record created inside the write transaction must hang off the same parent
/// that was cloned before it was opened.
pub(crate) fn check_same_parent(
    key: &str,
    resolved: Option<&String>,
    parent_ids: &[String],
) -> Result<()> {
    if parent_ids.first() != resolved {
        return Err(Error::FailedPrecondition(format!(
            "parent of {:?} changed while its storage was being prepared",
            key
        )));
    }
    Ok(())
}

/// Refuse to remove a snapshot that is still referenced by children.
pub(crate) fn check_no_children(tx: &Transaction, key: &str) -> Result<()> {
    let children = tx.children(key);
    if children.is_empty() {
        return Ok(());
    }
    let names: Vec<&str> = children.iter().map(|c: &Info| c.name.as_str()).collect();
    Err(Error::FailedPrecondition(format!(
        "cannot remove snapshot {:?}: still parent of {}",
        key,
        names.join(", ")
    )))
}

/// True if no committed snapshot uses `key` as its parent.
pub(crate) fn is_committed_leaf(tx: &Transaction, key: &str, kind: Kind) -> bool {
    kind != Kind::Committed || !tx.children(key).iter().any(|c| c.kind == Kind::Committed)
}

/// Resolve the active snapshot behind `key` before a commit. Committed keys are
/// reported as NotFound, like in `Transaction::commit_active`.
pub(crate) fn active_for_commit(store: &MetaStore, ctx: &Context, key: &str) -> Result<Snapshot> {
    let tx = store.transaction(ctx, false)?;
    match tx.get_active(key) {
        Ok(s) => Ok(s),
        Err(Error::FailedPrecondition(_)) => Err(Error::NotFound(format!("active snapshot {:?}", key))),
        Err(e) => Err(e),
    }
}

/// `commit_active` must convert the same record that was inspected before the
/// write transaction.
pub(crate) fn check_same_id(key: &str, expected: &str, got: &str) -> Result<()> {
    if expected != got {
        return Err(Error::FailedPrecondition(format!(
            "snapshot {:?} changed while committing",
            key
        )));
    }
    Ok(())
}

/// Removal for directory-backed units: drop the record and commit, then move the
/// unit to its `rm-<id>` sibling under the layout lock and destroy it. A failed
/// metadata commit leaves storage untouched. `locate(kind, id)` runs under the lock
/// and gives the unit path.
pub(crate) fn remove_dir_unit<F>(
    component: &str,
    store: &MetaStore,
    layout: &UnitLock,
    ctx: &Context,
    key: &str,
    locate: F,
) -> Result<()>
where
    F: Fn(Kind, &str) -> PathBuf,
{
    let mut tx = store.transaction(ctx, true)?;
    check_no_children(&tx, key)?;
    let (id, kind) = tx.remove(key)?;
    tx.commit()?;

    let removed = {
        let _g = layout.write();
        let path = locate(kind, &id);
        let removed = path.with_file_name(format!("{}{}", REMOVED_PREFIX, id));
        match fs::rename(&path, &removed) {
            Ok(()) => Some(removed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{}: storage of {:?} ({}) is already gone", component, key, path.display());
                None
            }
            Err(e) => {
                // запись уже удалена; каталог без записи подберёт sweep при следующем open
                warn!(
                    "{}: failed to move {} -> {}: {}",
                    component,
                    path.display(),
                    removed.display(),
                    e
                );
                record_cleanup_failure();
                None
            }
        }
    };

    if let Some(removed) = removed {
        if let Err(e) = remove_tree(&removed) {
            warn!("{}: failed to remove {}: {:#}", component, removed.display(), e);
            record_cleanup_failure();
        }
    }
    record_remove();
    Ok(())
}
