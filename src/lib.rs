//! statesync - Namespaced key/value state replicated across cooperating nodes
//!
//! Each node holds one versioned store per namespace and periodically pulls
//! newer state from its peers. How a namespace reconciles is decided by its
//! consistency model.
//!
//! # Key Features
//!
//! - **Per-namespace consistency**: eventual, causal or strong
//! - **Pluggable conflict resolution**: last-write-wins, local/remote wins,
//!   structural merge, custom resolvers and a manual queue
//! - **Incremental sync**: peers exchange changed keys when they are close,
//!   full snapshots when they are far apart
//! - **Key locks with expiry** and change notifications per store
//! - **Optional partitioning** of namespaces and keys across nodes
//! - **Transport-agnostic**: you provide the network through [`Transport`]
//!
//! # Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use statesync::{ConsistencyModel, StateStore};
//!
//! let store = StateStore::new("profile", ConsistencyModel::Eventual);
//! assert!(store.set("name", json!("ada"), None));
//! assert_eq!(store.get("name"), Some(json!("ada")));
//! assert_eq!(store.metadata().version, 1);
//! ```
//!
//! # Architecture
//!
//! Every mutation of a [`StateStore`] becomes a list of [`ops::StoreOp`]s
//! committed at one version. A [`DistributedStateManager`] owns the stores,
//! tracks peers and runs the sync loop; it sends a [`sync::SyncRequest`] with
//! its `{version, lastUpdated}` per namespace and folds the
//! [`sync::SyncResponse`] in according to each store's model.
//!
//! # Non-goals
//!
//! statesync intentionally does NOT provide:
//! - A consensus protocol: STRONG namespaces adopt remote state wholesale
//! - Persistence or durability
//! - Authentication or access control
//! - A network transport (an in-process [`LocalBus`] is included for testing)

pub mod bus;
pub mod clock;
pub mod config;
pub mod consistency;
pub mod error;
pub mod manager;
pub mod merge;
pub mod ops;
pub mod partition;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod transport;
pub mod types;

pub use bus::{LocalBus, LocalTransport};
pub use clock::{ClockOrdering, VectorClock};
pub use config::ManagerConfig;
pub use consistency::{ConsistencyModel, ModelConfig};
pub use error::{Error, Result};
pub use manager::{
    DistributedStateManager, ManagerStatus, NodeStatus, PeerNode, PeerSyncResult, SyncMode,
    SyncReport,
};
pub use partition::{PartitionConfig, PartitionStrategy};
pub use resolver::{
    ConflictResolver, ConflictStrategy, CustomResolver, ResolutionContext, ResolutionOutcome,
    ResolverTarget,
};
pub use store::StateStore;
pub use transport::{PublishOptions, SyncHandler, Transport};
pub use types::{ChangeEvent, Conflict, SyncPoint};
