use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type NodeId = String;

/// Unix timestamp in milliseconds
pub type Timestamp = i64;

pub fn now_ms() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// The `{version, lastUpdated}` pair a peer last observed for a namespace
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SyncPoint {
    pub version: u64,
    pub last_updated: Timestamp,
}

impl SyncPoint {
    pub fn new(version: u64, last_updated: Timestamp) -> Self {
        Self {
            version,
            last_updated,
        }
    }

    /// Strictly newer by version, then by timestamp
    pub fn is_newer_than(&self, other: &SyncPoint) -> bool {
        (self.version, self.last_updated) > (other.version, other.last_updated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub holder: String,
    pub expires_at: Timestamp,
}

impl LockInfo {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Store version at which a key was last written or removed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyStamp {
    pub version: u64,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreMetadata {
    pub version: u64,
    pub last_updated: Timestamp,
    pub lock_count: usize,
}

impl StoreMetadata {
    pub fn sync_point(&self) -> SyncPoint {
        SyncPoint::new(self.version, self.last_updated)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Set,
    Delete,
    Clear,
    /// Folded in from a peer
    Merge,
    /// Wholesale replacement from a peer
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    pub key: String,
    pub kind: ChangeKind,
    pub previous: Option<Value>,
    pub value: Option<Value>,
    pub timestamp: Timestamp,
}

/// Emitted once per committed mutation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub namespace: String,
    pub version: u64,
    pub changes: Vec<Change>,
}

/// Result of a multi-key write: locked keys are reported, not fatal
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: Vec<String>,
    pub rejected: Vec<String>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// A key on which two replicas disagree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub key: String,
    pub local_value: Value,
    pub remote_value: Value,
}

impl Conflict {
    pub fn new(key: impl Into<String>, local_value: Value, remote_value: Value) -> Self {
        Self {
            key: key.into(),
            local_value,
            remote_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_point_ordering() {
        let a = SyncPoint::new(3, 100);
        assert!(a.is_newer_than(&SyncPoint::new(2, 500)));
        assert!(a.is_newer_than(&SyncPoint::new(3, 99)));
        assert!(!a.is_newer_than(&SyncPoint::new(3, 100)));
        assert!(!a.is_newer_than(&SyncPoint::new(4, 0)));
    }

    #[test]
    fn sync_point_wire_names() {
        let json = serde_json::to_value(SyncPoint::new(1, 2)).unwrap();
        assert_eq!(json, serde_json::json!({"version": 1, "lastUpdated": 2}));
    }
}
