//! File-based locking: one metadata store per backend root.
//!
//! Cross-platform (fs2) advisory lock on <root>/LOCK, held for the whole lifetime
//! of a `MetaStore`. Inside the process the store serializes writers itself; the
//! file lock only keeps a second process (or a second store instance) away.
//!
//! Lock is released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "LOCK";

#[derive(Debug)]
pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // ошибка unlock здесь не важна: fd закрывается следом
        let _ = self.file.unlock();
    }
}

fn lock_file_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

fn open_lock_file(root: &Path) -> Result<std::fs::File> {
    let path = lock_file_path(root);
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    Ok(f)
}

/// Try to take the exclusive store lock. Returns Err if someone else holds it
/// (не ждём: второй экземпляр стора на том же корне — ошибка конфигурации).
pub fn try_acquire_store_lock(root: &Path) -> Result<LockGuard> {
    let file = open_lock_file(root)?;
    let path = lock_file_path(root);
    file.try_lock_exclusive().with_context(|| {
        format!(
            "metadata store is in use (try_lock_exclusive failed: {})",
            path.display()
        )
    })?;
    Ok(LockGuard { file, path })
}
