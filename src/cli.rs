use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::LayerConfig;
use crate::context::Context;
use crate::metrics::{metrics_snapshot, MetricsSnapshot};
use crate::mount::Mount;
use crate::registry::Registry;
use crate::snapshot::{Info, SnapshotOptions, Snapshotter};

#[derive(Parser, Debug)]
#[command(
    name = "layervault",
    version,
    about = "Copy-on-write snapshot manager (naive, overlay, btrfs, zfs backends)",
    arg_required_else_help = true
)]
pub struct Cli {
    /// State root (overrides LV_ROOT).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Backend name (overrides LV_SNAPSHOTTER).
    #[arg(long, global = true)]
    snapshotter: Option<String>,

    /// JSON output.
    #[arg(long, global = true)]
    json: bool,

    /// Print this process' counters to stderr after the command.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create a writable snapshot KEY on top of committed PARENT.
    Prepare {
        key: String,
        parent: Option<String>,
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Create a read-only snapshot KEY of committed PARENT.
    View {
        key: String,
        parent: Option<String>,
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Commit active snapshot KEY as NAME.
    Commit {
        name: String,
        key: String,
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Print mounts of an active/view snapshot.
    Mounts { key: String },
    Stat { key: String },
    /// Set (K=V) or delete (K) one label.
    Label { key: String, label: String },
    Usage { key: String },
    Remove { key: String },
    /// List committed snapshots.
    List,
}

fn parse_label(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected K=V, got {:?}", s)),
    }
}

fn options(labels: Vec<(String, String)>) -> SnapshotOptions {
    SnapshotOptions {
        labels: labels.into_iter().collect(),
    }
}

fn print_mounts(mounts: &[Mount], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(mounts)?);
    } else {
        for m in mounts {
            println!("{}", m);
        }
    }
    Ok(())
}

fn print_info(info: &Info, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(info)?);
        return Ok(());
    }
    println!("name:    {}", info.name);
    println!("kind:    {}", info.kind);
    println!("parent:  {}", if info.parent.is_empty() { "-" } else { &info.parent });
    println!("created: {}", info.created_unix_ms);
    println!("updated: {}", info.updated_unix_ms);
    for (k, v) in &info.labels {
        println!("label:   {}={}", k, v);
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = LayerConfig::from_env();
    if let Some(root) = cli.root {
        cfg = cfg.with_root(root);
    }
    if let Some(name) = cli.snapshotter {
        cfg = cfg.with_snapshotter(name);
    }
    let cfg = cfg.build();

    let registry = Registry::builtin();
    let sn = registry.open(&cfg.snapshotter, &cfg)?;
    let ctx = Context::background();

    let res = exec(sn.as_ref(), &ctx, cli.cmd, cli.json);
    // счётчики печатаются и после ошибки: откаты тоже интересны
    if cli.metrics {
        eprintln!("{}", render_metrics(&metrics_snapshot(), cli.json)?);
    }
    res
}

fn render_metrics(m: &MetricsSnapshot, json: bool) -> Result<String> {
    if json {
        let v = serde_json::json!({
            "counters": m,
            "rollback_ratio": m.rollback_ratio(),
        });
        return Ok(serde_json::to_string_pretty(&v)?);
    }
    Ok(format!(
        "prepares={} views={} commits={} removes={}\n\
         meta_commits={} meta_rollbacks={} rollback_ratio={:.3} meta_bytes_written={}\n\
         cleanup_failures={} storage_restores={} usage_clamped={}",
        m.prepares_total,
        m.views_total,
        m.commits_total,
        m.removes_total,
        m.meta_commits,
        m.meta_rollbacks,
        m.rollback_ratio(),
        m.meta_bytes_written,
        m.storage_cleanup_failures,
        m.storage_restores,
        m.usage_clamped
    ))
}

fn exec(sn: &dyn Snapshotter, ctx: &Context, cmd: Cmd, json: bool) -> Result<()> {
    match cmd {
        Cmd::Prepare {
            key,
            parent,
            labels,
        } => {
            let mounts = sn.prepare_with(ctx, &key, parent.as_deref().unwrap_or(""), &options(labels))?;
            print_mounts(&mounts, json)?;
        }
        Cmd::View {
            key,
            parent,
            labels,
        } => {
            let mounts = sn.view_with(ctx, &key, parent.as_deref().unwrap_or(""), &options(labels))?;
            print_mounts(&mounts, json)?;
        }
        Cmd::Commit { name, key, labels } => {
            sn.commit_with(ctx, &name, &key, &options(labels))?;
            if !json {
                println!("committed {} -> {}", key, name);
            }
        }
        Cmd::Mounts { key } => {
            print_mounts(&sn.mounts(ctx, &key)?, json)?;
        }
        Cmd::Stat { key } => {
            print_info(&sn.stat(ctx, &key)?, json)?;
        }
        Cmd::Label { key, label } => {
            let mut info = sn.stat(ctx, &key)?;
            let (k, path) = match label.split_once('=') {
                Some((k, v)) => {
                    info.labels.insert(k.to_string(), v.to_string());
                    (k.to_string(), format!("labels.{}", k))
                }
                None => {
                    info.labels.remove(&label);
                    (label.clone(), format!("labels.{}", label))
                }
            };
            if k.is_empty() {
                return Err(anyhow!("label key must not be empty"));
            }
            let updated = sn.update(ctx, info, &[path.as_str()])?;
            print_info(&updated, json)?;
        }
        Cmd::Usage { key } => {
            let u = sn.usage(ctx, &key)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&u)?);
            } else {
                println!("size={} inodes={}", u.size, u.inodes);
            }
        }
        Cmd::Remove { key } => {
            sn.remove(ctx, &key)?;
            if !json {
                println!("removed {}", key);
            }
        }
        Cmd::List => {
            let mut all = Vec::new();
            sn.walk(ctx, &mut |info| {
                all.push(info.clone());
                Ok(())
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&all)?);
            } else {
                for i in &all {
                    let parent = if i.parent.is_empty() { "-" } else { i.parent.as_str() };
                    println!("{}\t{}\t{}", i.name, i.kind, parent);
                }
            }
        }
    }
    Ok(())
}
