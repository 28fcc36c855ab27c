//! Explicit backend registry.
//!
//! Построен один раз в точке сборки (CLI, тесты) и передаётся по ссылке;
//! глобального состояния нет. Тесты регистрируют свои конструкторы (fakes)
//! рядом со встроенными.

use std::collections::BTreeMap;
use std::path::Path;

use log::debug;

use crate::config::LayerConfig;
use crate::drivers::{btrfs, naive, overlay, zfs};
use crate::drivers::{BtrfsSnapshotter, NaiveSnapshotter, OverlaySnapshotter, ZfsSnapshotter};
use crate::errors::{Error, Result};
use crate::snapshot::Snapshotter;

/// Builds a backend rooted at the given directory.
pub type Constructor = fn(&Path, &LayerConfig) -> Result<Box<dyn Snapshotter>>;

#[derive(Default, Clone)]
pub struct Registry {
    ctors: BTreeMap<String, Constructor>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("names", &self.names()).finish()
    }
}

fn open_naive(root: &Path, cfg: &LayerConfig) -> Result<Box<dyn Snapshotter>> {
    Ok(Box::new(NaiveSnapshotter::new(root, cfg)?))
}

fn open_overlay(root: &Path, cfg: &LayerConfig) -> Result<Box<dyn Snapshotter>> {
    Ok(Box::new(OverlaySnapshotter::new(root, cfg)?))
}

fn open_btrfs(root: &Path, cfg: &LayerConfig) -> Result<Box<dyn Snapshotter>> {
    Ok(Box::new(BtrfsSnapshotter::new(root, cfg)?))
}

fn open_zfs(root: &Path, cfg: &LayerConfig) -> Result<Box<dyn Snapshotter>> {
    Ok(Box::new(ZfsSnapshotter::new(root, cfg)?))
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with naive, overlay, btrfs and zfs.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        r.ctors.insert(naive::NAME.to_string(), open_naive);
        r.ctors.insert(overlay::NAME.to_string(), open_overlay);
        r.ctors.insert(btrfs::NAME.to_string(), open_btrfs);
        r.ctors.insert(zfs::NAME.to_string(), open_zfs);
        r
    }

    pub fn register(&mut self, name: &str, ctor: Constructor) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("backend name must not be empty".into()));
        }
        if self.ctors.contains_key(name) {
            return Err(Error::AlreadyExists(format!("snapshotter {:?}", name)));
        }
        self.ctors.insert(name.to_string(), ctor);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.ctors.keys().map(String::as_str).collect()
    }

    /// Open backend `name` at `cfg.backend_root(name)`.
    pub fn open(&self, name: &str, cfg: &LayerConfig) -> Result<Box<dyn Snapshotter>> {
        let ctor = self.ctors.get(name).ok_or_else(|| {
            Error::NotFound(format!(
                "snapshotter {:?} (registered: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        let root = cfg.backend_root(name);
        debug!("registry: open {} at {}", name, root.display());
        ctor(&root, cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nope(_root: &Path, _cfg: &LayerConfig) -> Result<Box<dyn Snapshotter>> {
        Err(Error::Unsupported("test backend".into()))
    }

    #[test]
    fn builtin_names_sorted() {
        let r = Registry::builtin();
        assert_eq!(r.names(), vec!["btrfs", "naive", "overlay", "zfs"]);
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut r = Registry::builtin();
        let err = r.register("naive", nope).unwrap_err();
        assert!(err.is_already_exists());
        r.register("custom", nope).unwrap();
        assert!(r.contains("custom"));
    }

    #[test]
    fn open_unknown_is_not_found() {
        let r = Registry::new();
        let err = r.open("naive", &LayerConfig::default()).err().unwrap();
        assert!(err.is_not_found());
    }
}
