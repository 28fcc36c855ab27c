//! util/fs — файловые хелперы для драйверов и метастора.
//!
//! - write_atomic: tmp + (fsync) + rename + fsync каталога (best-effort).
//! - copy_tree: рекурсивная копия каталога (naive clone).
//! - disk_usage: размер/инод-счётчик дерева (уникальные иноды).
//! - remove_tree: удаление с восстановлением прав на read-only каталогах.
//! - CleanupGuard: RAII-удаление незакоммиченного storage unit.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::metrics::record_cleanup_failure;

/// Atomically replace `path` with `bytes` (tmp+rename). With `sync` the tmp file
/// and the parent directory are fsynced.
pub fn write_atomic(path: &Path, bytes: &[u8], sync: bool) -> Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("write_atomic: no file name in {}", path.display()))?;
    let tmp = path.with_file_name(format!("{}.tmp", name.to_string_lossy()));
    let _ = fs::remove_file(&tmp); // best-effort

    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("open tmp {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("write tmp {}", tmp.display()))?;
        if sync {
            f.sync_all()
                .with_context(|| format!("fsync tmp {}", tmp.display()))?;
        }
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;

    if sync {
        let _ = fsync_parent_dir(path);
    }
    Ok(())
}

// Best-effort fsync parent directory after rename (Unix only).
#[cfg(unix)]
pub fn fsync_parent_dir(p: &Path) -> std::io::Result<()> {
    use std::fs::File;
    if let Some(parent) = p.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
pub fn fsync_parent_dir(_p: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Recursively copy directory `src` into a new directory `dst`.
/// Regular files, directories and symlinks are copied with their permission bits;
/// special files are skipped.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).with_context(|| format!("stat {}", src.display()))?;
    if !meta.is_dir() {
        return Err(anyhow!("copy_tree: {} is not a directory", src.display()));
    }
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    copy_dir_contents(src, dst)?;
    // права каталога ставим последними: источник может быть read-only
    fs::set_permissions(dst, meta.permissions())
        .with_context(|| format!("chmod {}", dst.display()))?;
    Ok(())
}

fn copy_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src).with_context(|| format!("read_dir {}", src.display()))? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ft = entry.file_type()?;

        if ft.is_dir() {
            let perm = entry.metadata()?.permissions();
            fs::create_dir(&to).with_context(|| format!("mkdir {}", to.display()))?;
            copy_dir_contents(&from, &to)?;
            fs::set_permissions(&to, perm).with_context(|| format!("chmod {}", to.display()))?;
        } else if ft.is_symlink() {
            copy_symlink(&from, &to)?;
        } else if ft.is_file() {
            fs::copy(&from, &to)
                .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
        } else {
            debug!("copy_tree: skip special file {}", from.display());
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = fs::read_link(from).with_context(|| format!("readlink {}", from.display()))?;
    std::os::unix::fs::symlink(&target, to)
        .with_context(|| format!("symlink {} -> {}", to.display(), target.display()))?;
    Ok(())
}
#[cfg(not(unix))]
fn copy_symlink(from: &Path, _to: &Path) -> Result<()> {
    Err(anyhow!("symlinks are not supported here: {}", from.display()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub size: u64,
    pub inodes: u64,
}

/// Disk usage of a tree: allocated bytes (st_blocks*512 on Unix) and the number
/// of unique inodes, the root included. Hard links are counted once.
pub fn disk_usage(root: &Path) -> Result<DiskUsage> {
    use std::collections::HashSet;

    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    let mut du = DiskUsage::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(p) = stack.pop() {
        let meta = fs::symlink_metadata(&p).with_context(|| format!("stat {}", p.display()))?;
        if !seen.insert(inode_key(&meta)) {
            continue;
        }
        du.inodes += 1;
        du.size += allocated_bytes(&meta);

        if meta.is_dir() {
            for entry in fs::read_dir(&p).with_context(|| format!("read_dir {}", p.display()))? {
                stack.push(entry?.path());
            }
        }
    }
    Ok(du)
}

#[cfg(unix)]
fn inode_key(meta: &fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino())
}
#[cfg(not(unix))]
fn inode_key(_meta: &fs::Metadata) -> (u64, u64) {
    // без инодов дедупликация невозможна — каждый вход уникален
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    (0, NEXT.fetch_add(1, Ordering::Relaxed))
}

#[cfg(unix)]
fn allocated_bytes(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks() * 512
}
#[cfg(not(unix))]
fn allocated_bytes(meta: &fs::Metadata) -> u64 {
    meta.len()
}

/// Remove a file or a whole tree. Read-only directories inside the tree are made
/// writable and the removal is retried once.
pub fn remove_tree(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    if !meta.is_dir() {
        return fs::remove_file(path).with_context(|| format!("remove {}", path.display()));
    }
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            make_dirs_writable(path)?;
            fs::remove_dir_all(path).with_context(|| format!("remove_dir_all {}", path.display()))
        }
        Err(e) => Err(e).with_context(|| format!("remove_dir_all {}", path.display())),
    }
}

fn make_dirs_writable(dir: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(dir)?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mut perm = meta.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perm.set_mode(perm.mode() | 0o700);
    }
    #[cfg(not(unix))]
    perm.set_readonly(false);
    fs::set_permissions(dir, perm).with_context(|| format!("chmod {}", dir.display()))?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            make_dirs_writable(&entry.path())?;
        }
    }
    Ok(())
}

/// RAII: removes `path` on drop unless disarmed. Used for storage units that
/// exist on disk but are not (yet) referenced by a committed metadata record.
#[derive(Debug)]
pub struct CleanupGuard {
    path: Option<PathBuf>,
    what: &'static str,
}

impl CleanupGuard {
    pub fn new(path: PathBuf, what: &'static str) -> Self {
        Self {
            path: Some(path),
            what,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The unit moved (e.g. staging -> final location); follow it.
    pub fn retarget(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    /// Keep the unit: it is now owned by a committed record.
    pub fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(p) = self.path.take() {
            debug!("{}: cleanup {}", self.what, p.display());
            if let Err(e) = remove_tree(&p) {
                // основная ошибка уже возвращается вызывающему — здесь только лог
                warn!("{}: failed to remove {}: {:#}", self.what, p.display(), e);
                record_cleanup_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_root(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "lvtest-fs-{prefix}-{}-{}",
            std::process::id(),
            crate::util::random_hex(4)
        ))
    }

    #[test]
    fn copy_tree_copies_files_dirs_and_links() -> Result<()> {
        let root = tmp_root("copy");
        let src = root.join("src");
        fs::create_dir_all(src.join("a/b/c"))?;
        fs::write(src.join("foo"), b"foo\n")?;
        #[cfg(unix)]
        std::os::unix::fs::symlink("foo", src.join("link"))?;

        let dst = root.join("dst");
        copy_tree(&src, &dst)?;
        assert_eq!(fs::read(dst.join("foo"))?, b"foo\n");
        assert!(dst.join("a/b/c").is_dir());
        #[cfg(unix)]
        assert_eq!(fs::read_link(dst.join("link"))?, PathBuf::from("foo"));

        remove_tree(&root)?;
        assert!(!root.exists());
        Ok(())
    }

    #[test]
    fn disk_usage_counts_unique_inodes() -> Result<()> {
        let root = tmp_root("du");
        fs::create_dir_all(root.join("d"))?;
        fs::write(root.join("d/x"), vec![7u8; 10_000])?;
        fs::hard_link(root.join("d/x"), root.join("y"))?;

        let du = disk_usage(&root)?;
        // root, d, x (y is the same inode)
        assert_eq!(du.inodes, 3);
        assert!(du.size >= 10_000, "size {}", du.size);

        remove_tree(&root)?;
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn remove_tree_handles_readonly_dirs() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let root = tmp_root("ro");
        fs::create_dir_all(root.join("locked"))?;
        fs::write(root.join("locked/f"), b"x")?;
        fs::set_permissions(root.join("locked"), fs::Permissions::from_mode(0o555))?;
        remove_tree(&root)?;
        assert!(!root.exists());
        Ok(())
    }

    #[test]
    fn cleanup_guard_removes_unless_disarmed() -> Result<()> {
        let root = tmp_root("guard");
        fs::create_dir_all(root.join("gone"))?;
        fs::create_dir_all(root.join("kept"))?;
        {
            let _g = CleanupGuard::new(root.join("gone"), "test");
            let g2 = CleanupGuard::new(root.join("kept"), "test");
            g2.disarm();
        }
        assert!(!root.join("gone").exists());
        assert!(root.join("kept").exists());
        remove_tree(&root)?;
        Ok(())
    }

    #[test]
    fn write_atomic_replaces_content() -> Result<()> {
        let root = tmp_root("atomic");
        fs::create_dir_all(&root)?;
        let p = root.join("file.db");
        write_atomic(&p, b"one", true)?;
        write_atomic(&p, b"two", false)?;
        assert_eq!(fs::read(&p)?, b"two");
        assert!(!root.join("file.db.tmp").exists());
        remove_tree(&root)?;
        Ok(())
    }
}
