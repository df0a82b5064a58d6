use crate::consistency::ConsistencyModel;
use crate::resolver::ConflictStrategy;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_SYNC_INTERVAL_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BATCH_SIZE: usize = 100;
/// Version gap above which a full key set is sent instead of a subset
const DEFAULT_FULL_SYNC_THRESHOLD: u64 = 10;

/// Everything a [`DistributedStateManager`](crate::DistributedStateManager)
/// needs, passed in explicitly at construction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
    pub node_id: NodeId,
    pub default_model: ConsistencyModel,
    pub default_strategy: ConflictStrategy,
    pub sync_interval_ms: u64,
    pub request_timeout_ms: u64,
    /// Cap on keys in an incremental sync subset
    pub batch_size: usize,
    pub full_sync_threshold: u64,
    /// Per-namespace consistency overrides applied when a store is created
    pub namespace_models: BTreeMap<String, ConsistencyModel>,
    pub namespace_strategies: BTreeMap<String, ConflictStrategy>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            default_model: ConsistencyModel::Eventual,
            default_strategy: ConflictStrategy::LastWriteWins,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            full_sync_threshold: DEFAULT_FULL_SYNC_THRESHOLD,
            namespace_models: BTreeMap::new(),
            namespace_strategies: BTreeMap::new(),
        }
    }
}

impl ManagerConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: ConsistencyModel) -> Self {
        self.default_model = model;
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn model_for(&self, namespace: &str) -> ConsistencyModel {
        self.namespace_models
            .get(namespace)
            .copied()
            .unwrap_or(self.default_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_partial_config() {
        let config: ManagerConfig = serde_json::from_str(
            r#"{
                "nodeId": "node-a",
                "defaultModel": "causal",
                "defaultStrategy": "merge",
                "namespaceModels": {"ledger": "strong"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.default_model, ConsistencyModel::Causal);
        assert_eq!(config.default_strategy, ConflictStrategy::Merge);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.model_for("ledger"), ConsistencyModel::Strong);
        assert_eq!(config.model_for("profile"), ConsistencyModel::Causal);
        assert_eq!(config.sync_interval(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_unknown_model_name() {
        let err = serde_json::from_str::<ManagerConfig>(r#"{"defaultModel": "quantum"}"#);
        assert!(err.is_err());
    }
}
