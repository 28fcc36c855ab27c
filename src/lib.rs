#![allow(non_snake_case)]

// Базовые модули
pub mod errors;
pub mod context;
pub mod config;
pub mod lock;
pub mod metrics;
pub mod util;   // src/util/{mod,fs,tool}.rs
pub mod mount;

// Модель снапшотов и метаданные
pub mod snapshot; // src/snapshot/mod.rs
pub mod storage;  // src/storage/{mod,state,codec}.rs

// Бэкенды и их реестр
pub mod drivers;  // src/drivers/{mod,naive,overlay}.rs, btrfs/, zfs/
pub mod registry;

pub mod cli;

// Удобные реэкспорты
pub use config::LayerConfig;
pub use context::{CancelHandle, Context};
pub use errors::{Error, ErrorKind, Result};
pub use mount::Mount;
pub use registry::Registry;
pub use snapshot::{Info, Kind, Snapshot, SnapshotOptions, Snapshotter, Usage};
pub use storage::{MetaStore, Transaction};

pub use drivers::{
    BtrfsSnapshotter, DatasetOps, NaiveSnapshotter, OverlaySnapshotter, QGroupUsage,
    SubvolumeOps, ZfsSnapshotter,
};
