//! `DatasetOps` over the `zfs` command-line tool.

use anyhow::{anyhow, Context as _, Result};

use super::DatasetOps;
use crate::util::tool::run_tool;

#[derive(Debug, Clone)]
pub struct ZfsCli {
    bin: String,
}

impl ZfsCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        run_tool(&self.bin, args)
    }
}

impl DatasetOps for ZfsCli {
    fn create(&self, name: &str) -> Result<()> {
        self.run(&["create", "-o", "mountpoint=legacy", name])?;
        Ok(())
    }

    fn clone_from(&self, snapshot: &str, name: &str, readonly: bool) -> Result<()> {
        let mut args = vec!["clone", "-o", "mountpoint=legacy"];
        if readonly {
            args.extend(["-o", "readonly=on"]);
        }
        args.extend([snapshot, name]);
        self.run(&args)?;
        Ok(())
    }

    fn snapshot(&self, snapshot: &str) -> Result<()> {
        self.run(&["snapshot", snapshot])?;
        Ok(())
    }

    fn destroy(&self, name: &str, recursive: bool) -> Result<()> {
        if recursive {
            self.run(&["destroy", "-r", name])?;
        } else {
            self.run(&["destroy", name])?;
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.run(&["rename", from, to])?;
        Ok(())
    }

    fn used_bytes(&self, name: &str) -> Result<u64> {
        let out = self.run(&["get", "-Hp", "-o", "value", "used", name])?;
        parse_used(&out).with_context(|| format!("used property of {}", name))
    }

    fn children(&self, parent: &str) -> Result<Vec<String>> {
        let out = self.run(&["list", "-H", "-o", "name", "-t", "filesystem", "-d", "1", parent])?;
        Ok(parse_children(&out, parent))
    }
}

/// `zfs get -Hp -o value used`: one integer (bytes).
pub fn parse_used(out: &str) -> Result<u64> {
    let s = out.trim();
    s.parse::<u64>()
        .map_err(|e| anyhow!("unexpected used value {:?}: {}", s, e))
}

/// `zfs list -H -o name -d 1 <parent>` lists the parent itself first; keep only
/// direct children.
pub fn parse_children(out: &str, parent: &str) -> Vec<String> {
    let prefix = format!("{}/", parent);
    out.lines()
        .map(str::trim)
        .filter(|l| l.starts_with(&prefix) && !l[prefix.len()..].contains('/'))
        .map(str::to_string)
        .collect()
}
