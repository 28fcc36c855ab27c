//! Mount descriptors and mount-table lookup.
//!
//! `Mount` — то, что снапшоттер возвращает из prepare/view/mounts: тип ФС, источник
//! (устройство, датасет, каталог) и опции. Сам mount(2) выполняет вызывающая сторона.
//!
//! `lookup()` читает /proc/self/mountinfo и находит точку монтирования, содержащую путь
//! (нужно btrfs-драйверу: проверить тип ФС и узнать устройство для `Source`).

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Filesystem type ("bind", "overlay", "btrfs", "zfs").
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    pub fn new(mount_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            mount_type: mount_type.into(),
            source: source.into(),
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, opt: impl Into<String>) -> Self {
        self.options.push(opt.into());
        self
    }

    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

impl std::fmt::Display for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "type={} source={} options={}",
            self.mount_type,
            self.source,
            self.options.join(",")
        )
    }
}

/// One line of /proc/self/mountinfo (только нужные поля).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub source: String,
}

/// Parse mountinfo text. Lines that do not match the format are skipped.
///
/// Format: `id parent major:minor root mountpoint opts [optional...] - fstype source superopts`
pub fn parse_mountinfo(text: &str) -> Vec<MountInfo> {
    let mut out = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            continue;
        }
        let Some(sep) = fields.iter().position(|f| *f == "-") else {
            continue;
        };
        if sep < 6 || fields.len() < sep + 3 {
            continue;
        }
        out.push(MountInfo {
            mountpoint: PathBuf::from(unescape_octal(fields[4])),
            fstype: fields[sep + 1].to_string(),
            source: unescape_octal(fields[sep + 2]),
        });
    }
    out
}

// mountinfo кодирует пробел/таб/перевод строки/бэкслэш как \ooo
fn unescape_octal(s: &str) -> String {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'\\' && i + 3 < b.len() {
            let oct = &b[i + 1..i + 4];
            if oct.iter().all(|c| (b'0'..=b'7').contains(c)) {
                let v = (oct[0] - b'0') as u32 * 64 + (oct[1] - b'0') as u32 * 8 + (oct[2] - b'0') as u32;
                if v <= 0xff {
                    out.push(v as u8);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(b[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Find the mount that contains `path` (longest mountpoint prefix wins; on equal
/// mountpoints the later entry, i.e. the topmost mount, wins).
pub fn lookup_in(entries: &[MountInfo], path: &Path) -> Option<MountInfo> {
    let mut best: Option<&MountInfo> = None;
    for e in entries {
        if !path.starts_with(&e.mountpoint) {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => e.mountpoint.as_os_str().len() >= b.mountpoint.as_os_str().len(),
        };
        if better {
            best = Some(e);
        }
    }
    best.cloned()
}

/// Mount containing `path`, from /proc/self/mountinfo.
pub fn lookup(path: &Path) -> Result<MountInfo> {
    let abs = std::fs::canonicalize(path)
        .with_context(|| format!("canonicalize {}", path.display()))?;
    let text = std::fs::read_to_string("/proc/self/mountinfo")
        .context("read /proc/self/mountinfo")?;
    let entries = parse_mountinfo(&text);
    lookup_in(&entries, &abs).ok_or_else(|| anyhow!("no mount found for {}", abs.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 0:21 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
35 22 0:31 / /var/lib/layervault rw,relatime shared:12 - btrfs /dev/sdb1 rw,space_cache
36 35 0:32 / /var/lib/layervault/zfs rw - zfs tank/lv rw,xattr
40 22 0:40 / /mnt/with\\040space rw - tmpfs tmpfs rw
garbage line
";

    #[test]
    fn parses_fields_and_escapes() {
        let v = parse_mountinfo(SAMPLE);
        assert_eq!(v.len(), 4);
        assert_eq!(v[1].fstype, "btrfs");
        assert_eq!(v[1].source, "/dev/sdb1");
        assert_eq!(v[3].mountpoint, PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn longest_prefix_wins() {
        let v = parse_mountinfo(SAMPLE);
        let m = lookup_in(&v, Path::new("/var/lib/layervault/btrfs/active/3")).unwrap();
        assert_eq!(m.fstype, "btrfs");
        let m = lookup_in(&v, Path::new("/var/lib/layervault/zfs")).unwrap();
        assert_eq!(m.fstype, "zfs");
        let m = lookup_in(&v, Path::new("/etc")).unwrap();
        assert_eq!(m.fstype, "ext4");
        // component-wise prefix, not string prefix
        let m = lookup_in(&v, Path::new("/var/lib/layervaultX")).unwrap();
        assert_eq!(m.fstype, "ext4");
    }

    #[test]
    fn mount_readonly_flag_and_json() {
        let m = Mount::new("bind", "/x").with_option("rbind").with_option("ro");
        assert!(m.is_readonly());
        let js = serde_json::to_string(&m).unwrap();
        assert!(js.contains("\"type\":\"bind\""), "{js}");
    }
}
