//! In-memory state of the metadata store: one record per snapshot, keyed by
//! key/name (one namespace), plus the id counter.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::snapshot::{Info, Kind, Usage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: u64,
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
    // usage, снятый при commit (для active/view — нули)
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub inodes: i64,
}

impl SnapshotRecord {
    pub fn info(&self, name: &str) -> Info {
        Info {
            name: name.to_string(),
            parent: self.parent.clone(),
            kind: self.kind,
            labels: self.labels.clone(),
            created_unix_ms: self.created_unix_ms,
            updated_unix_ms: self.updated_unix_ms,
        }
    }

    pub fn usage(&self) -> Usage {
        Usage::new(self.size, self.inodes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaState {
    /// Next id to hand out. Never decreases, so ids are never reused.
    pub next_id: u64,
    pub snapshots: BTreeMap<String, SnapshotRecord>,
}

impl Default for MetaState {
    fn default() -> Self {
        Self {
            next_id: 1,
            snapshots: BTreeMap::new(),
        }
    }
}

impl MetaState {
    pub fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn get(&self, key: &str) -> Option<&SnapshotRecord> {
        self.snapshots.get(key)
    }

    /// Ids of the committed ancestors of `key`, nearest parent first.
    pub fn parent_ids(&self, key: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut cur = match self.snapshots.get(key) {
            Some(r) => r.parent.clone(),
            None => return Err(anyhow!("snapshot {:?} missing from state", key)),
        };
        while !cur.is_empty() {
            let rec = self
                .snapshots
                .get(&cur)
                .ok_or_else(|| anyhow!("dangling parent {:?} in chain of {:?}", cur, key))?;
            out.push(rec.id.to_string());
            if out.len() > self.snapshots.len() {
                return Err(anyhow!("parent cycle in chain of {:?}", key));
            }
            cur = rec.parent.clone();
        }
        Ok(out)
    }

    /// Names of all snapshots (any kind) whose parent is `key`, sorted.
    pub fn children(&self, key: &str) -> Vec<&str> {
        self.snapshots
            .iter()
            .filter(|(_, r)| r.parent == key)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Structural check after decode: unique ids below `next_id`, parents exist and
    /// are committed.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::with_capacity(self.snapshots.len());
        for (name, rec) in &self.snapshots {
            if name.is_empty() {
                return Err(anyhow!("empty snapshot name in state"));
            }
            if rec.id == 0 || rec.id >= self.next_id {
                return Err(anyhow!(
                    "snapshot {:?}: id {} outside allocated range (next_id {})",
                    name,
                    rec.id,
                    self.next_id
                ));
            }
            if !ids.insert(rec.id) {
                return Err(anyhow!("duplicate id {} (snapshot {:?})", rec.id, name));
            }
            if !rec.parent.is_empty() {
                match self.snapshots.get(&rec.parent) {
                    Some(p) if p.kind == Kind::Committed => {}
                    Some(_) => {
                        return Err(anyhow!(
                            "snapshot {:?}: parent {:?} is not committed",
                            name,
                            rec.parent
                        ))
                    }
                    None => {
                        return Err(anyhow!(
                            "snapshot {:?}: parent {:?} does not exist",
                            name,
                            rec.parent
                        ))
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: u64, kind: Kind, parent: &str) -> SnapshotRecord {
        SnapshotRecord {
            id,
            kind,
            parent: parent.to_string(),
            labels: BTreeMap::new(),
            created_unix_ms: 1,
            updated_unix_ms: 1,
            size: 0,
            inodes: 0,
        }
    }

    #[test]
    fn chain_and_children() -> Result<()> {
        let mut st = MetaState::default();
        st.next_id = 5;
        st.snapshots.insert("base".into(), rec(1, Kind::Committed, ""));
        st.snapshots.insert("mid".into(), rec(2, Kind::Committed, "base"));
        st.snapshots.insert("work".into(), rec(4, Kind::Active, "mid"));
        st.snapshots.insert("ro".into(), rec(3, Kind::View, "base"));
        st.validate()?;

        assert_eq!(st.parent_ids("work")?, vec!["2".to_string(), "1".to_string()]);
        assert!(st.parent_ids("base")?.is_empty());
        assert_eq!(st.children("base"), vec!["mid", "ro"]);
        assert!(st.children("work").is_empty());
        Ok(())
    }

    #[test]
    fn validate_rejects_bad_states() {
        let mut st = MetaState::default();
        st.next_id = 3;
        st.snapshots.insert("a".into(), rec(1, Kind::Active, ""));
        st.snapshots.insert("b".into(), rec(2, Kind::Active, "a"));
        assert!(st.validate().is_err(), "active parent must be rejected");

        let mut st = MetaState::default();
        st.snapshots.insert("a".into(), rec(1, Kind::Committed, ""));
        assert!(st.validate().is_err(), "id >= next_id must be rejected");

        let mut st = MetaState::default();
        st.next_id = 3;
        st.snapshots.insert("a".into(), rec(1, Kind::Committed, ""));
        st.snapshots.insert("b".into(), rec(1, Kind::Committed, ""));
        assert!(st.validate().is_err(), "duplicate ids must be rejected");
    }

    #[test]
    fn alloc_is_monotonic() {
        let mut st = MetaState::default();
        assert_eq!(st.alloc_id(), 1);
        assert_eq!(st.alloc_id(), 2);
        assert_eq!(st.next_id, 3);
    }
}
