use crate::error::Error;
use crate::resolver::ConflictStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How a namespace reconciles with peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyModel {
    #[default]
    Eventual,
    Causal,
    /// Declarative only: remote state replaces local state outright. A real
    /// consensus backend has to be supplied by the integrator.
    Strong,
}

impl ConsistencyModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyModel::Eventual => "eventual",
            ConsistencyModel::Causal => "causal",
            ConsistencyModel::Strong => "strong",
        }
    }

    pub fn config(&self) -> ModelConfig {
        ModelConfig::for_model(*self)
    }
}

impl fmt::Display for ConsistencyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsistencyModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eventual" => Ok(ConsistencyModel::Eventual),
            "causal" => Ok(ConsistencyModel::Causal),
            "strong" => Ok(ConsistencyModel::Strong),
            _ => Err(Error::UnsupportedModel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventualConfig {
    pub sync_interval: Duration,
    pub conflict_strategy: ConflictStrategy,
    /// Peers contacted per gossip round
    pub gossip_factor: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalConfig {
    pub use_vector_clocks: bool,
    pub wait_for_dependencies: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quorum {
    Majority,
    All,
    Count(usize),
}

impl Quorum {
    pub fn required(&self, cluster_size: usize) -> usize {
        match self {
            Quorum::Majority => cluster_size / 2 + 1,
            Quorum::All => cluster_size,
            Quorum::Count(n) => (*n).min(cluster_size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrongConfig {
    pub quorum: Quorum,
    pub leader_election: bool,
    pub timeout: Duration,
}

/// Tunables relevant to one consistency model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "lowercase")]
pub enum ModelConfig {
    Eventual(EventualConfig),
    Causal(CausalConfig),
    Strong(StrongConfig),
}

impl ModelConfig {
    pub fn for_model(model: ConsistencyModel) -> Self {
        match model {
            ConsistencyModel::Eventual => ModelConfig::Eventual(EventualConfig {
                sync_interval: Duration::from_secs(5),
                conflict_strategy: ConflictStrategy::LastWriteWins,
                gossip_factor: 3,
            }),
            ConsistencyModel::Causal => ModelConfig::Causal(CausalConfig {
                use_vector_clocks: true,
                wait_for_dependencies: true,
            }),
            ConsistencyModel::Strong => ModelConfig::Strong(StrongConfig {
                quorum: Quorum::Majority,
                leader_election: true,
                timeout: Duration::from_secs(5),
            }),
        }
    }

    pub fn from_name(name: &str) -> Result<Self, Error> {
        Ok(Self::for_model(name.parse()?))
    }

    pub fn model(&self) -> ConsistencyModel {
        match self {
            ModelConfig::Eventual(_) => ConsistencyModel::Eventual,
            ModelConfig::Causal(_) => ConsistencyModel::Causal,
            ModelConfig::Strong(_) => ConsistencyModel::Strong,
        }
    }

    pub fn uses_vector_clocks(&self) -> bool {
        matches!(
            self,
            ModelConfig::Causal(CausalConfig {
                use_vector_clocks: true,
                ..
            })
        )
    }
}
