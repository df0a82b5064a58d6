use crate::types::{Change, ChangeKind, KeyStamp, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Atomic data operations - the lowest level instructions that mutate
/// CoreState. A commit is a list of these applied at one version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StoreOp {
    Put { key: String, value: Value },

    Remove { key: String },

    /// Remove every key
    Truncate,

    /// Swap the whole map, removing keys absent from `data`
    Replace { data: BTreeMap<String, Value> },
}

/// Core state: data plus the version metadata that defines a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreState {
    data: BTreeMap<String, Value>,

    /// Version at which each key was last written or removed
    stamps: BTreeMap<String, KeyStamp>,

    version: u64,

    last_updated: Timestamp,
}

impl CoreState {
    pub fn new(created_at: Timestamp) -> Self {
        Self {
            last_updated: created_at,
            ..Default::default()
        }
    }

    pub fn is_noop(&self, op: &StoreOp) -> bool {
        match op {
            StoreOp::Put { .. } => false,
            StoreOp::Remove { key } => !self.data.contains_key(key),
            StoreOp::Truncate => false,
            StoreOp::Replace { .. } => false,
        }
    }

    /// Execute an operation as part of the commit at `version`
    pub fn execute(
        &mut self,
        op: StoreOp,
        version: u64,
        timestamp: Timestamp,
        kind: ChangeKind,
    ) -> Vec<Change> {
        match op {
            StoreOp::Put { key, value } => {
                let previous = self.data.insert(key.clone(), value.clone());
                self.mark(&key, version, false);
                vec![Change {
                    key,
                    kind,
                    previous,
                    value: Some(value),
                    timestamp,
                }]
            }
            StoreOp::Remove { key } => {
                let previous = self.data.remove(&key);
                self.mark(&key, version, true);
                vec![Change {
                    key,
                    kind,
                    previous,
                    value: None,
                    timestamp,
                }]
            }
            StoreOp::Truncate => {
                let data = std::mem::take(&mut self.data);
                data.into_iter()
                    .map(|(key, previous)| {
                        self.mark(&key, version, true);
                        Change {
                            key,
                            kind,
                            previous: Some(previous),
                            value: None,
                            timestamp,
                        }
                    })
                    .collect()
            }
            StoreOp::Replace { data } => {
                let old = std::mem::replace(&mut self.data, data);
                let mut changes = Vec::new();
                for (key, previous) in &old {
                    if !self.data.contains_key(key) {
                        changes.push(Change {
                            key: key.clone(),
                            kind,
                            previous: Some(previous.clone()),
                            value: None,
                            timestamp,
                        });
                    }
                }
                for (key, value) in &self.data {
                    let previous = old.get(key);
                    if previous != Some(value) {
                        changes.push(Change {
                            key: key.clone(),
                            kind,
                            previous: previous.cloned(),
                            value: Some(value.clone()),
                            timestamp,
                        });
                    }
                }
                for change in &changes {
                    let deleted = change.value.is_none();
                    self.stamps.insert(change.key.clone(), KeyStamp { version, deleted });
                }
                changes
            }
        }
    }

    fn mark(&mut self, key: &str, version: u64, deleted: bool) {
        self.stamps
            .insert(key.to_string(), KeyStamp { version, deleted });
    }

    pub fn stamp(&mut self, version: u64, last_updated: Timestamp) {
        self.version = version;
        self.last_updated = last_updated;
    }

    /// Keys touched at or after `since`, oldest first
    pub fn changes_since(&self, since: u64) -> Vec<(String, KeyStamp)> {
        let mut changed: Vec<(String, KeyStamp)> = self
            .stamps
            .iter()
            .filter(|(_, stamp)| stamp.version >= since)
            .map(|(key, stamp)| (key.clone(), *stamp))
            .collect();
        changed.sort_by(|a, b| a.1.version.cmp(&b.1.version).then_with(|| a.0.cmp(&b.0)));
        changed
    }

    /// Keys whose last change was a removal
    pub fn removed_keys(&self) -> Vec<String> {
        self.stamps
            .iter()
            .filter(|(_, stamp)| stamp.deleted)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn stamp_of(&self, key: &str) -> Option<KeyStamp> {
        self.stamps.get(key).copied()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_updated(&self) -> Timestamp {
        self.last_updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replace_reports_only_differences() {
        let mut core = CoreState::new(0);
        core.execute(
            StoreOp::Put {
                key: "a".into(),
                value: json!(1),
            },
            1,
            10,
            ChangeKind::Set,
        );
        core.execute(
            StoreOp::Put {
                key: "b".into(),
                value: json!(2),
            },
            1,
            10,
            ChangeKind::Set,
        );
        let data = BTreeMap::from([("a".to_string(), json!(1)), ("c".to_string(), json!(3))]);
        let changes = core.execute(StoreOp::Replace { data }, 2, 20, ChangeKind::Replace);
        let keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(core.stamp_of("a").unwrap().version, 1);
        assert!(core.stamp_of("b").unwrap().deleted);
    }

    #[test]
    fn changes_since_orders_by_version() {
        let mut core = CoreState::new(0);
        for (v, key) in [(3, "x"), (1, "y"), (2, "z")] {
            core.execute(
                StoreOp::Put {
                    key: key.into(),
                    value: json!(v),
                },
                v,
                0,
                ChangeKind::Set,
            );
        }
        let keys: Vec<String> = core.changes_since(2).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["z".to_string(), "x".to_string()]);
    }

    #[test]
    fn removed_keys_follow_latest_stamp() {
        let mut core = CoreState::new(0);
        let put = |key: &str| StoreOp::Put {
            key: key.into(),
            value: json!(1),
        };
        core.execute(put("a"), 1, 0, ChangeKind::Set);
        core.execute(put("b"), 1, 0, ChangeKind::Set);
        core.execute(StoreOp::Remove { key: "a".into() }, 2, 0, ChangeKind::Delete);
        core.execute(StoreOp::Remove { key: "b".into() }, 3, 0, ChangeKind::Delete);
        core.execute(put("b"), 4, 0, ChangeKind::Set);
        assert_eq!(core.removed_keys(), vec!["a".to_string()]);
    }
}
