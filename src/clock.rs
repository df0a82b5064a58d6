use crate::error::{Error, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causal relation between two clocks.
///
/// There is no `Equal`: identical clocks are reported as `Concurrent`, since
/// merging treats simultaneity and equality the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    Before,
    After,
    Concurrent,
}

/// Per-node logical counters.
///
/// Serializes as a plain `node id -> counter` map. The owner is local
/// bookkeeping and does not travel over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<NodeId, u64>", into = "BTreeMap<NodeId, u64>")]
pub struct VectorClock {
    counters: BTreeMap<NodeId, u64>,
    owner: Option<NodeId>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose `increment(None)` bumps `owner`
    pub fn for_node(owner: impl Into<NodeId>) -> Self {
        Self {
            counters: BTreeMap::new(),
            owner: Some(owner.into()),
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn increment(&mut self, node_id: Option<&str>) -> Result<u64> {
        let node = node_id
            .or(self.owner.as_deref())
            .ok_or(Error::MissingNodeId)?
            .to_string();
        let counter = self.counters.entry(node).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    /// Point-wise max. Counters never decrease.
    pub fn merge(&mut self, other: &VectorClock) -> &mut Self {
        for (node, &counter) in &other.counters {
            let entry = self.counters.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
        self
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut has_less = false;
        let mut has_greater = false;

        for node in self.counters.keys().chain(other.counters.keys()) {
            let mine = self.get(node);
            let theirs = other.get(node);
            if mine < theirs {
                has_less = true;
            } else if mine > theirs {
                has_greater = true;
            }
            if has_less && has_greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (has_less, has_greater) {
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            _ => ClockOrdering::Concurrent,
        }
    }

    pub fn get(&self, node_id: &str) -> u64 {
        self.counters.get(node_id).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &BTreeMap<NodeId, u64> {
        &self.counters
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl From<BTreeMap<NodeId, u64>> for VectorClock {
    fn from(counters: BTreeMap<NodeId, u64>) -> Self {
        Self {
            counters,
            owner: None,
        }
    }
}

impl From<VectorClock> for BTreeMap<NodeId, u64> {
    fn from(clock: VectorClock) -> Self {
        clock.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries
            .iter()
            .map(|(n, c)| (n.to_string(), *c))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    #[test]
    fn increment_defaults_to_owner() {
        let mut vc = VectorClock::for_node("a");
        assert_eq!(vc.increment(None).unwrap(), 1);
        assert_eq!(vc.increment(None).unwrap(), 2);
        assert_eq!(vc.increment(Some("b")).unwrap(), 1);
        assert_eq!(vc.get("a"), 2);
    }

    #[test]
    fn increment_without_node_fails() {
        let mut vc = VectorClock::new();
        assert_eq!(vc.increment(None), Err(Error::MissingNodeId));
    }

    #[test]
    fn compare_orders() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("a", 2)]);
        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(b.compare(&a), ClockOrdering::After);

        let c = clock(&[("a", 1), ("b", 1)]);
        let d = clock(&[("a", 2), ("b", 0)]);
        assert_eq!(c.compare(&d), ClockOrdering::Concurrent);
        assert_eq!(d.compare(&c), ClockOrdering::Concurrent);
    }

    #[test]
    fn equal_clocks_are_concurrent() {
        let a = clock(&[("a", 3), ("b", 1)]);
        assert_eq!(a.compare(&a.clone()), ClockOrdering::Concurrent);
        assert_eq!(VectorClock::new().compare(&VectorClock::new()), ClockOrdering::Concurrent);
    }

    #[test]
    fn merge_never_regresses() {
        let cases = [
            (clock(&[("a", 1)]), clock(&[("a", 2)])),
            (clock(&[("a", 5), ("b", 1)]), clock(&[("b", 4)])),
            (clock(&[]), clock(&[("c", 1)])),
            (clock(&[("a", 2)]), clock(&[("a", 2)])),
        ];
        for (c1, c2) in cases {
            let mut merged = c1.clone();
            merged.merge(&c2);
            assert_ne!(merged.compare(&c2), ClockOrdering::Before);
            assert_ne!(merged.compare(&c1), ClockOrdering::Before);
            for node in c1.counters().keys() {
                assert!(merged.get(node) >= c1.get(node));
            }
        }
    }

    #[test]
    fn merge_ignores_lower_counters() {
        let mut local = clock(&[("a", 7), ("b", 3)]);
        local.merge(&clock(&[("a", 2), ("b", 1), ("c", 4)]));
        assert_eq!(local.get("a"), 7);
        assert_eq!(local.get("b"), 3);
        assert_eq!(local.get("c"), 4);

        // and the other way round: stale entries are raised, never lowered
        let mut stale = clock(&[("a", 2), ("b", 1)]);
        stale.merge(&clock(&[("a", 7), ("b", 3)]));
        assert_eq!(stale, clock(&[("a", 7), ("b", 3)]));
    }

    #[test]
    fn compare_is_antisymmetric() {
        let a = clock(&[("a", 1), ("b", 2)]);
        let b = clock(&[("a", 1), ("b", 3)]);
        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(b.compare(&a), ClockOrdering::After);
    }

    #[test]
    fn round_trips_through_plain_map() {
        let mut vc = VectorClock::for_node("n1");
        vc.increment(None).unwrap();
        vc.increment(Some("n2")).unwrap();
        let json = serde_json::to_value(&vc).unwrap();
        assert_eq!(json, serde_json::json!({"n1": 1, "n2": 1}));
        let back: VectorClock = serde_json::from_value(json).unwrap();
        assert_eq!(back.counters(), vc.counters());
    }
}
