//! `SubvolumeOps` over the `btrfs` command-line tool.

use anyhow::{anyhow, Context as _, Result};
use std::path::Path;

use super::{QGroupUsage, SubvolumeOps};
use crate::util::tool::{run_tool, tool_stderr};

#[derive(Debug, Clone)]
pub struct BtrfsCli {
    bin: String,
}

impl BtrfsCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        run_tool(&self.bin, args)
    }
}

fn path_str(p: &Path) -> Result<&str> {
    p.to_str()
        .ok_or_else(|| anyhow!("non-UTF-8 path: {}", p.display()))
}

impl SubvolumeOps for BtrfsCli {
    fn create(&self, path: &Path) -> Result<()> {
        self.run(&["subvolume", "create", path_str(path)?])?;
        Ok(())
    }

    fn snapshot(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()> {
        let (src, dst) = (path_str(src)?, path_str(dst)?);
        if readonly {
            self.run(&["subvolume", "snapshot", "-r", src, dst])?;
        } else {
            self.run(&["subvolume", "snapshot", src, dst])?;
        }
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.run(&["subvolume", "delete", path_str(path)?])?;
        Ok(())
    }

    fn subvolume_id(&self, path: &Path) -> Result<u64> {
        let out = self.run(&["inspect-internal", "rootid", path_str(path)?])?;
        parse_rootid(&out).with_context(|| format!("subvolume id of {}", path.display()))
    }

    fn qgroup(&self, path: &Path) -> Result<Option<QGroupUsage>> {
        let id = self.subvolume_id(path)?;
        match self.run(&["qgroup", "show", "--raw", "-f", path_str(path)?]) {
            Ok(out) => parse_qgroup_show(&out, id)
                .map(Some)
                .ok_or_else(|| anyhow!("qgroup 0/{} not listed for {}", id, path.display())),
            Err(e) if tool_stderr(&e).map_or(false, quotas_disabled) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn quotas_disabled(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("quotas not enabled") || s.contains("quota not enabled")
}

/// Output of `btrfs inspect-internal rootid`: a single decimal number.
pub fn parse_rootid(out: &str) -> Result<u64> {
    let s = out.trim();
    s.parse::<u64>()
        .map_err(|e| anyhow!("unexpected rootid output {:?}: {}", s, e))
}

/// Find the level-0 qgroup `0/<subvol_id>` in `btrfs qgroup show --raw` output:
///
/// ```text
/// qgroupid         rfer         excl
/// --------         ----         ----
/// 0/256           16384        16384
/// ```
pub fn parse_qgroup_show(out: &str, subvol_id: u64) -> Option<QGroupUsage> {
    let want = format!("0/{}", subvol_id);
    for line in out.lines() {
        let mut it = line.split_whitespace();
        if it.next() != Some(want.as_str()) {
            continue;
        }
        let referenced = it.next()?.parse::<i64>().ok()?;
        let exclusive = it.next()?.parse::<i64>().ok()?;
        return Some(QGroupUsage {
            referenced,
            exclusive,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW: &str = "\
qgroupid         rfer         excl
--------         ----         ----
0/5             16384        16384
0/256         1073741824      4096
0/2560            8192         8192
1/100            12345        12345
";

    #[test]
    fn qgroup_rows_are_matched_exactly() {
        let q = parse_qgroup_show(SHOW, 256).unwrap();
        assert_eq!(q.referenced, 1_073_741_824);
        assert_eq!(q.exclusive, 4096);

        let q = parse_qgroup_show(SHOW, 2560).unwrap();
        assert_eq!(q.referenced, 8192);

        assert!(parse_qgroup_show(SHOW, 25).is_none());
        assert!(parse_qgroup_show(SHOW, 100).is_none(), "level-1 groups are not subvolumes");
    }

    #[test]
    fn rootid_parse() {
        assert_eq!(parse_rootid("257\n").unwrap(), 257);
        assert!(parse_rootid("ERROR: not a btrfs filesystem").is_err());
    }

    #[test]
    fn quota_errors_detected() {
        assert!(quotas_disabled("ERROR: can't list qgroups: quotas not enabled"));
        assert!(!quotas_disabled("ERROR: cannot access '/x': No such file or directory"));
    }
}
