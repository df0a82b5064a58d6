use crate::sync::{SyncRequest, SyncResponse};
use crate::types::NodeId;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use tokio::sync::mpsc;

pub const TOPIC_SYNC_REQUEST: &str = "state:syncRequest";
pub const TOPIC_SYNC_RESPONSE: &str = "state:syncResponse";
pub const TOPIC_NODE_CONNECTED: &str = "node:connected";
pub const TOPIC_NODE_DISCONNECTED: &str = "node:disconnected";

/// Routing hints passed with every publish
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_nodes: Vec<NodeId>,
}

impl PublishOptions {
    pub fn broadcast() -> Self {
        Self {
            broadcast: true,
            target_nodes: Vec::new(),
        }
    }

    pub fn to(node: impl Into<NodeId>) -> Self {
        Self {
            broadcast: false,
            target_nodes: vec![node.into()],
        }
    }
}

/// A message delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
    pub source: NodeId,
}

/// Payload of the `node:*` membership topics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    pub node_id: NodeId,
}

/// The messaging layer between nodes. The manager only depends on this trait;
/// you provide the network.
pub trait Transport: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Value, options: PublishOptions) -> Result<()>;

    fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Envelope>>;

    /// Direct request/response, used for peers added in direct mode
    fn request(
        &self,
        peer: &str,
        request: SyncRequest,
    ) -> impl Future<Output = Result<SyncResponse>> + Send;
}

/// Serving side of the direct request path. Implemented by the manager so
/// an in-process transport can call straight into a peer.
pub trait SyncHandler: Send + Sync {
    fn handle_sync_request(&self, request: SyncRequest) -> Result<SyncResponse>;
}
