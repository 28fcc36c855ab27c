use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use LayerVault::config::{DEFAULT_ROOT, DEFAULT_SNAPSHOTTER};
use LayerVault::storage::METADATA_FILE;
use LayerVault::{Context, Kind, LayerConfig, Registry, Snapshotter};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("lvtest-builder-{prefix}-{pid}-{t}-{id}"))
}

#[test]
fn builder_env_then_overrides() -> Result<()> {
    // Единственный тест в файле, который трогает LV_* переменные
    std::env::set_var("LV_ROOT", "/tmp/lv-from-env");
    std::env::set_var("LV_SNAPSHOTTER", " Overlay ");
    std::env::set_var("LV_META_FSYNC", "off");
    std::env::set_var("LV_WRITER_WAIT_MS", "0");
    std::env::set_var("LV_ZFS_BIN", "/sbin/zfs");

    let cfg = LayerConfig::from_env();
    assert_eq!(cfg.root, PathBuf::from("/tmp/lv-from-env"));
    assert_eq!(cfg.snapshotter, "overlay");
    assert!(!cfg.metadata_fsync);
    // 0 поднимается до 1: ожидание писателя не может быть пустым циклом
    assert_eq!(cfg.writer_wait_ms, 1);
    assert_eq!(cfg.zfs_bin, "/sbin/zfs");
    assert_eq!(cfg.btrfs_bin, "btrfs");

    // with_* поверх env
    let cfg = cfg
        .with_root("/srv/layers")
        .with_snapshotter("naive")
        .with_metadata_fsync(true)
        .with_btrfs_bin("/usr/local/bin/btrfs")
        .build();
    assert_eq!(cfg.backend_root("naive"), PathBuf::from("/srv/layers/naive"));
    assert!(cfg.metadata_fsync);
    assert_eq!(cfg.btrfs_bin, "/usr/local/bin/btrfs");

    let shown = cfg.to_string();
    assert!(shown.contains("root: /srv/layers"), "{shown}");
    assert!(shown.contains("snapshotter: naive"), "{shown}");

    for k in ["LV_ROOT", "LV_SNAPSHOTTER", "LV_META_FSYNC", "LV_WRITER_WAIT_MS", "LV_ZFS_BIN"] {
        std::env::remove_var(k);
    }
    Ok(())
}

#[test]
fn builder_defaults() {
    let cfg = LayerConfig::default();
    assert_eq!(cfg.root, PathBuf::from(DEFAULT_ROOT));
    assert_eq!(cfg.snapshotter, DEFAULT_SNAPSHOTTER);
    assert!(cfg.metadata_fsync);
    assert_eq!(cfg.writer_wait_ms, 10);
}

#[test]
fn builder_root_selects_backend_directory() -> Result<()> {
    // Каждый бэкенд живёт в <root>/<name>
    let root = unique_root("layout");
    let cfg = LayerConfig::default()
        .with_root(&root)
        .with_metadata_fsync(false)
        .build();

    let reg = Registry::builtin();
    let ctx = Context::background();
    {
        let naive = reg.open("naive", &cfg)?;
        naive.prepare(&ctx, "w", "")?;
        let overlay = reg.open("overlay", &cfg)?;
        overlay.prepare(&ctx, "w", "")?;
    }

    assert!(root.join("naive").join(METADATA_FILE).exists());
    assert!(root.join("overlay").join(METADATA_FILE).exists());
    assert!(root.join("naive").join("active").is_dir());
    assert!(root.join("overlay").join("snapshots").is_dir());

    // метаданные разных бэкендов не пересекаются
    let naive = reg.open("naive", &cfg)?;
    naive.commit(&ctx, "c", "w")?;
    let overlay = reg.open("overlay", &cfg)?;
    assert_eq!(overlay.stat(&ctx, "w")?.kind, Kind::Active);
    assert!(overlay.stat(&ctx, "c").unwrap_err().is_not_found());

    let _ = fs::remove_dir_all(&root);
    Ok(())
}
