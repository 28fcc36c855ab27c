// tests/metastore_txn.rs
//
// Запуск только этого файла:
//   cargo test --test metastore_txn -- --nocapture
//
// Метастор отдельно от бэкендов:
// - create/commit/remove и коды ошибок;
// - rollback на drop и на отменённом контексте;
// - изоляция читателей (снимок на момент begin);
// - персистентность, id не переиспользуются после reopen;
// - один стор на корень, ожидание writer slot уважает дедлайн.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;

use LayerVault::storage::METADATA_FILE;
use LayerVault::{Context, ErrorKind, Info, Kind, LayerConfig, MetaStore, SnapshotOptions, Usage};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("lvtest-meta-{prefix}-{pid}-{t}-{id}"))
}

fn cfg() -> LayerConfig {
    LayerConfig::default().with_metadata_fsync(false)
}

/// base (committed) <- mid (committed) <- work (active)
fn seed(store: &MetaStore, ctx: &Context) -> Result<()> {
    let mut tx = store.transaction(ctx, true)?;
    tx.create_active("base-a", "", false)?;
    tx.commit_active("base-a", "base", Usage::new(10, 1), &SnapshotOptions::default())?;
    tx.create_active("mid-a", "base", false)?;
    tx.commit_active("mid-a", "mid", Usage::default(), &SnapshotOptions::default())?;
    tx.create_active("work", "mid", false)?;
    tx.commit()?;
    Ok(())
}

#[test]
fn create_commit_and_resolve() -> Result<()> {
    let root = unique_root("basic");
    let store = MetaStore::open(&root, &cfg())?;
    let ctx = Context::background();

    let mut tx = store.transaction(&ctx, true)?;
    let a = tx.create_active("a", "", false)?;
    assert_eq!(a.kind, Kind::Active);
    assert!(a.parent_ids.is_empty());

    let opts = SnapshotOptions::default().with_label("origin", "test");
    let id = tx.commit_active("a", "layer-1", Usage::new(4096, 3), &opts)?;
    assert_eq!(id, a.id, "commit keeps the id");

    let b = tx.create_active("b", "layer-1", false)?;
    assert_eq!(b.parent_ids, vec![a.id.clone()]);
    let v = tx.create_active("v", "layer-1", true)?;
    assert_eq!(v.kind, Kind::View);
    tx.commit()?;

    let tx = store.transaction(&ctx, false)?;
    let (cid, info, parents) = tx.get_info("layer-1")?;
    assert_eq!(cid, a.id);
    assert_eq!(info.kind, Kind::Committed);
    assert_eq!(info.parent, "");
    assert!(parents.is_empty());
    assert_eq!(info.labels.get("origin").map(String::as_str), Some("test"));
    assert_eq!(tx.get_usage("layer-1")?, Usage::new(4096, 3));

    let (_, binfo, bparents) = tx.get_info("b")?;
    assert_eq!(binfo.parent, "layer-1");
    assert_eq!(bparents, vec![a.id.clone()]);

    // active/view резолвятся через get_active, committed — нет
    assert_eq!(tx.get_active("b")?.kind, Kind::Active);
    assert_eq!(tx.get_active("v")?.kind, Kind::View);
    assert_eq!(
        tx.get_active("layer-1").unwrap_err().kind(),
        ErrorKind::FailedPrecondition
    );
    assert_eq!(tx.get_active("nope").unwrap_err().kind(), ErrorKind::NotFound);

    let children: Vec<String> = tx.children("layer-1").into_iter().map(|i| i.name).collect();
    assert_eq!(children, vec!["b".to_string(), "v".to_string()]);
    assert!(tx.has_children("layer-1"));
    assert!(!tx.has_children("b"));

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn create_error_kinds() -> Result<()> {
    let root = unique_root("create-errs");
    let store = MetaStore::open(&root, &cfg())?;
    let ctx = Context::background();
    seed(&store, &ctx)?;

    let mut tx = store.transaction(&ctx, true)?;
    // ключи и имена делят одно пространство
    assert_eq!(tx.create_active("work", "", false).unwrap_err().kind(), ErrorKind::AlreadyExists);
    assert_eq!(tx.create_active("base", "", false).unwrap_err().kind(), ErrorKind::AlreadyExists);
    assert_eq!(tx.create_active("x", "missing", false).unwrap_err().kind(), ErrorKind::NotFound);
    // active нельзя использовать как родителя
    assert_eq!(tx.create_active("x", "work", false).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(tx.create_active("", "", false).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(
        tx.create_snapshot(Kind::Committed, "x", "", &SnapshotOptions::default())
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidArgument
    );
    drop(tx);

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn commit_active_error_kinds() -> Result<()> {
    let root = unique_root("commit-errs");
    let store = MetaStore::open(&root, &cfg())?;
    let ctx = Context::background();
    seed(&store, &ctx)?;

    let mut tx = store.transaction(&ctx, true)?;
    tx.create_active("ro", "base", true)?;
    let none = SnapshotOptions::default();

    assert_eq!(
        tx.commit_active("work", "base", Usage::default(), &none).unwrap_err().kind(),
        ErrorKind::AlreadyExists
    );
    assert_eq!(
        tx.commit_active("missing", "new", Usage::default(), &none).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        tx.commit_active("mid", "new", Usage::default(), &none).unwrap_err().kind(),
        ErrorKind::NotFound,
        "a committed key is not an active record"
    );
    assert_eq!(
        tx.commit_active("ro", "new", Usage::default(), &none).unwrap_err().kind(),
        ErrorKind::FailedPrecondition,
        "views can never be committed"
    );
    drop(tx);

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn remove_refuses_parents_and_missing() -> Result<()> {
    let root = unique_root("remove");
    let store = MetaStore::open(&root, &cfg())?;
    let ctx = Context::background();
    seed(&store, &ctx)?;

    let mut tx = store.transaction(&ctx, true)?;
    assert_eq!(tx.remove("mid").unwrap_err().kind(), ErrorKind::FailedPrecondition);
    assert_eq!(tx.remove("missing").unwrap_err().kind(), ErrorKind::NotFound);

    let (_, kind) = tx.remove("work")?;
    assert_eq!(kind, Kind::Active);
    let (_, kind) = tx.remove("mid")?;
    assert_eq!(kind, Kind::Committed);
    tx.commit()?;

    let tx = store.transaction(&ctx, false)?;
    assert!(tx.get_info("mid").unwrap_err().is_not_found());
    assert!(tx.get_info("base").is_ok());

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn update_info_field_paths() -> Result<()> {
    let root = unique_root("update");
    let store = MetaStore::open(&root, &cfg())?;
    let ctx = Context::background();
    seed(&store, &ctx)?;

    let mut info = store.stat(&ctx, "base")?;
    info.labels.insert("a".into(), "1".into());
    info.labels.insert("b".into(), "2".into());
    let out = store.update(&ctx, info.clone(), &[])?;
    assert_eq!(out.labels.len(), 2);
    assert!(out.updated_unix_ms >= info.updated_unix_ms);

    // labels.<k>: присутствующий ключ — set, отсутствующий — delete
    let mut patch = store.stat(&ctx, "base")?;
    patch.labels.clear();
    patch.labels.insert("c".into(), "3".into());
    let out = store.update(&ctx, patch, &["labels.c", "labels.a"])?;
    let keys: Vec<&str> = out.labels.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["b", "c"]);

    // immutable fields
    let mut bad = store.stat(&ctx, "base")?;
    bad.parent = "mid".into();
    assert_eq!(store.update(&ctx, bad.clone(), &[]).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(store.update(&ctx, bad.clone(), &["parent"]).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(store.update(&ctx, bad, &["kind"]).unwrap_err().kind(), ErrorKind::InvalidArgument);

    let ghost = Info {
        name: "ghost".into(),
        parent: String::new(),
        kind: Kind::Committed,
        labels: Default::default(),
        created_unix_ms: 0,
        updated_unix_ms: 0,
    };
    assert!(store.update(&ctx, ghost, &["labels"]).unwrap_err().is_not_found());

    // неудачные update ничего не поменяли
    let now = store.stat(&ctx, "base")?;
    assert_eq!(now.parent, "");
    assert_eq!(now.labels.len(), 2);

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn walk_is_sorted_committed_only_and_stops_on_error() -> Result<()> {
    let root = unique_root("walk");
    let store = MetaStore::open(&root, &cfg())?;
    let ctx = Context::background();
    seed(&store, &ctx)?;

    let mut seen = Vec::new();
    store.walk(&ctx, &mut |i| {
        seen.push((i.name.clone(), i.kind));
        Ok(())
    })?;
    assert_eq!(
        seen,
        vec![("base".to_string(), Kind::Committed), ("mid".to_string(), Kind::Committed)]
    );

    let mut calls = 0;
    let err = store
        .walk(&ctx, &mut |_| {
            calls += 1;
            Err(LayerVault::Error::Unsupported("stop".into()))
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert_eq!(calls, 1);

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn drop_and_cancel_roll_back() -> Result<()> {
    let root = unique_root("rollback");
    let store = MetaStore::open(&root, &cfg())?;
    let ctx = Context::background();

    {
        let mut tx = store.transaction(&ctx, true)?;
        tx.create_active("dropped", "", false)?;
        // drop без commit
    }
    assert!(store.stat(&ctx, "dropped").unwrap_err().is_not_found());

    let (cctx, cancel) = ctx.with_cancel();
    let mut tx = store.transaction(&cctx, true)?;
    tx.create_active("cancelled", "", false)?;
    cancel.cancel();
    assert_eq!(tx.commit().unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(store.stat(&ctx, "cancelled").unwrap_err().is_not_found());

    // writer slot освобождён — следующая транзакция проходит
    let mut tx = store.transaction(&ctx, true)?;
    tx.create_active("ok", "", false)?;
    tx.commit()?;
    assert_eq!(store.stat(&ctx, "ok")?.kind, Kind::Active);

    // отменённый контекст не открывает транзакций вовсе
    assert_eq!(store.transaction(&cctx, false).err().map(|e| e.kind()), Some(ErrorKind::Cancelled));

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn read_only_transactions_reject_writes() -> Result<()> {
    let root = unique_root("ro-tx");
    let store = MetaStore::open(&root, &cfg())?;
    let ctx = Context::background();

    let mut tx = store.transaction(&ctx, false)?;
    assert!(!tx.is_writable());
    assert_eq!(tx.create_active("x", "", false).unwrap_err().kind(), ErrorKind::FailedPrecondition);
    assert_eq!(tx.remove("x").unwrap_err().kind(), ErrorKind::FailedPrecondition);
    tx.commit()?;

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn readers_see_snapshot_taken_at_begin() -> Result<()> {
    let root = unique_root("isolation");
    let store = MetaStore::open(&root, &cfg())?;
    let ctx = Context::background();
    seed(&store, &ctx)?;

    let reader = store.transaction(&ctx, false)?;

    let mut w = store.transaction(&ctx, true)?;
    w.commit_active("work", "top", Usage::default(), &SnapshotOptions::default())?;
    // незакоммиченная запись не видна новому читателю
    assert!(store.stat(&ctx, "top").unwrap_err().is_not_found());
    w.commit()?;

    // старый читатель: состояние на момент begin
    assert_eq!(reader.get_info("work")?.1.kind, Kind::Active);
    assert!(reader.get_info("top").unwrap_err().is_not_found());
    // новый читатель видит commit
    assert_eq!(store.stat(&ctx, "top")?.kind, Kind::Committed);
    assert!(store.stat(&ctx, "work").unwrap_err().is_not_found());

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn writer_wait_honours_deadline() -> Result<()> {
    let root = unique_root("writer-wait");
    let store = MetaStore::open(&root, &cfg().with_writer_wait_ms(5))?;
    let ctx = Context::background();

    let held = store.transaction(&ctx, true)?;
    let short = ctx.with_timeout(Duration::from_millis(50));
    let err = store.transaction(&short, true).err().expect("writer slot is busy");
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

    // читатели не блокируются писателем
    let r = store.transaction(&ctx, false)?;
    assert!(!r.is_writable());
    drop(r);
    drop(held);

    // другой поток получает slot, как только он освободился
    let held = store.transaction(&ctx, true)?;
    let s2 = store.clone();
    let h = std::thread::spawn(move || -> LayerVault::Result<()> {
        let mut tx = s2.transaction(&Context::background(), true)?;
        tx.create_active("from-thread", "", false)?;
        tx.commit()
    });
    std::thread::sleep(Duration::from_millis(30));
    drop(held);
    h.join().expect("thread panicked")?;
    assert_eq!(store.stat(&ctx, "from-thread")?.kind, Kind::Active);

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn persistence_and_ids_never_reused() -> Result<()> {
    let root = unique_root("persist");
    let ctx = Context::background();
    let removed_id;
    {
        let store = MetaStore::open(&root, &cfg())?;
        seed(&store, &ctx)?;
        let mut tx = store.transaction(&ctx, true)?;
        let (id, _) = tx.remove("work")?;
        removed_id = id.parse::<u64>()?;
        tx.commit()?;
    }

    let store = MetaStore::open(&root, &cfg())?;
    assert_eq!(store.stat(&ctx, "mid")?.parent, "base");
    assert!(store.stat(&ctx, "work").unwrap_err().is_not_found());

    let mut tx = store.transaction(&ctx, true)?;
    let s = tx.create_active("again", "mid", false)?;
    assert!(s.id.parse::<u64>()? > removed_id, "id {} reused", s.id);
    tx.commit()?;

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn one_store_per_root_and_corruption_detected() -> Result<()> {
    let root = unique_root("exclusive");
    {
        let _store = MetaStore::open(&root, &cfg())?;
        let err = MetaStore::open(&root, &cfg()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    // испорченный файл метаданных — ошибка открытия, а не пустой стор
    let path = root.join(METADATA_FILE);
    let mut bytes = fs::read(&path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, &bytes)?;
    let err = MetaStore::open(&root, &cfg()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(format!("{:#}", err).contains("checksum"), "{err:#}");

    let _ = fs::remove_dir_all(&root);
    Ok(())
}
