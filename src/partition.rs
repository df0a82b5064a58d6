use crate::error::{Error, Result};
use crate::types::NodeId;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Maps a key to a partition index; the result is taken modulo the
/// partition count
pub type PartitionFn = Arc<dyn Fn(&str) -> usize + Send + Sync>;

#[derive(Clone)]
pub enum PartitionStrategy {
    /// CRC-32 of the key
    Hash,
    /// Bands of the alphabet by first character; non-letters go to 0
    KeyRange,
    Custom(PartitionFn),
}

impl fmt::Debug for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStrategy::Hash => f.write_str("Hash"),
            PartitionStrategy::KeyRange => f.write_str("KeyRange"),
            PartitionStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FromStr for PartitionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hash" => Ok(PartitionStrategy::Hash),
            "key-range" | "key_range" | "range" => Ok(PartitionStrategy::KeyRange),
            _ => Err(Error::UnsupportedPartitionStrategy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub strategy: PartitionStrategy,
    pub partition_count: usize,
    /// Nodes holding each namespace, counted from its owner
    pub replication_factor: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            strategy: PartitionStrategy::Hash,
            partition_count: 16,
            replication_factor: 2,
        }
    }
}

impl PartitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(Error::InvalidPartitioning(
                "partition_count must be positive".into(),
            ));
        }
        if self.replication_factor == 0 {
            return Err(Error::InvalidPartitioning(
                "replication_factor must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn partition_of(&self, key: &str) -> usize {
        let count = self.partition_count.max(1);
        match &self.strategy {
            PartitionStrategy::Hash => crc32fast::hash(key.as_bytes()) as usize % count,
            PartitionStrategy::KeyRange => match key.chars().next() {
                Some(c) if c.is_ascii_alphabetic() => {
                    let offset = (c.to_ascii_lowercase() as u8 - b'a') as usize;
                    offset * count / 26
                }
                _ => 0,
            },
            PartitionStrategy::Custom(f) => f(key) % count,
        }
    }
}

/// Ownership view over a fixed node list
pub struct PartitionMap<'a> {
    config: &'a PartitionConfig,
    nodes: Vec<&'a NodeId>,
}

impl<'a> PartitionMap<'a> {
    /// `nodes` is sorted so every node derives the same mapping
    pub fn new(config: &'a PartitionConfig, nodes: impl IntoIterator<Item = &'a NodeId>) -> Self {
        let mut nodes: Vec<&NodeId> = nodes.into_iter().collect();
        nodes.sort();
        nodes.dedup();
        Self { config, nodes }
    }

    pub fn responsible_node(&self, key: &str) -> Option<&'a NodeId> {
        if self.nodes.is_empty() {
            return None;
        }
        let partition = self.config.partition_of(key);
        Some(self.nodes[partition % self.nodes.len()])
    }

    /// Owner first, then the following nodes on the ring
    pub fn replicas(&self, key: &str) -> Vec<&'a NodeId> {
        if self.nodes.is_empty() {
            return Vec::new();
        }
        let n = self.nodes.len();
        let start = self.config.partition_of(key) % n;
        (0..self.config.replication_factor.min(n))
            .map(|i| self.nodes[(start + i) % n])
            .collect()
    }

    pub fn is_replica(&self, key: &str, node: &str) -> bool {
        self.replicas(key).iter().any(|n| n.as_str() == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hash_is_stable() {
        let config = PartitionConfig::default();
        let p = config.partition_of("user:42");
        assert_eq!(p, config.partition_of("user:42"));
        assert!(p < config.partition_count);
    }

    #[test]
    fn key_range_bands() {
        let config = PartitionConfig {
            strategy: PartitionStrategy::KeyRange,
            partition_count: 2,
            replication_factor: 1,
        };
        assert_eq!(config.partition_of("apple"), 0);
        assert_eq!(config.partition_of("Zebra"), 1);
        assert_eq!(config.partition_of("9lives"), 0);
        assert_eq!(config.partition_of(""), 0);
    }

    #[test]
    fn custom_strategy_is_wrapped() {
        let config = PartitionConfig {
            strategy: PartitionStrategy::Custom(Arc::new(|key: &str| key.len())),
            partition_count: 4,
            replication_factor: 1,
        };
        assert_eq!(config.partition_of("abcdef"), 2);
    }

    #[test]
    fn responsible_node_is_index_mod_count() {
        let config = PartitionConfig {
            strategy: PartitionStrategy::Custom(Arc::new(|key: &str| key.len())),
            partition_count: 8,
            replication_factor: 2,
        };
        let nodes = ids(&["c", "a", "b"]);
        let map = PartitionMap::new(&config, &nodes);
        // partition 4 over [a, b, c]
        assert_eq!(map.responsible_node("abcd").unwrap(), "b");
        let replicas: Vec<&str> = map.replicas("abcd").iter().map(|s| s.as_str()).collect();
        assert_eq!(replicas, vec!["b", "c"]);
        assert!(map.is_replica("abcd", "c"));
        assert!(!map.is_replica("abcd", "a"));
    }

    #[test]
    fn validates_and_parses() {
        let bad = PartitionConfig {
            partition_count: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(matches!(
            "hash".parse::<PartitionStrategy>(),
            Ok(PartitionStrategy::Hash)
        ));
        assert!(matches!(
            "custom".parse::<PartitionStrategy>(),
            Err(Error::UnsupportedPartitionStrategy(_))
        ));
    }
}
