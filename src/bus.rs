use crate::sync::{SyncRequest, SyncResponse};
use crate::transport::{
    Envelope, NodeEvent, PublishOptions, SyncHandler, Transport, TOPIC_NODE_CONNECTED,
    TOPIC_NODE_DISCONNECTED,
};
use crate::types::NodeId;
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Default)]
struct BusState {
    /// (node, topic) -> subscriber channels
    subscriptions: HashMap<(NodeId, String), Vec<mpsc::UnboundedSender<Envelope>>>,
    handlers: HashMap<NodeId, Weak<dyn SyncHandler>>,
    unreachable: HashSet<NodeId>,
}

/// In-process message hub connecting any number of nodes. Used by tests and
/// the cluster simulator; a node can be cut off with [`LocalBus::set_reachable`].
#[derive(Clone, Default)]
pub struct LocalBus {
    state: Arc<RwLock<BusState>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<BusState> {
        self.state.read().expect("Failed to lock bus state")
    }

    fn write(&self) -> RwLockWriteGuard<BusState> {
        self.state.write().expect("Failed to lock bus state")
    }

    /// A transport endpoint for `node_id`
    pub fn transport(&self, node_id: impl Into<NodeId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            node_id: node_id.into(),
            bus: self.clone(),
        })
    }

    /// Route direct requests for `node_id` to `handler`. Only a weak
    /// reference is kept.
    pub fn register_handler<H: SyncHandler + 'static>(&self, node_id: impl Into<NodeId>, handler: &Arc<H>) {
        let weak: Weak<dyn SyncHandler> = Arc::downgrade(handler) as Weak<dyn SyncHandler>;
        self.write().handlers.insert(node_id.into(), weak);
    }

    /// An unreachable node neither sends nor receives
    pub fn set_reachable(&self, node_id: &str, reachable: bool) {
        let mut state = self.write();
        if reachable {
            state.unreachable.remove(node_id);
        } else {
            state.unreachable.insert(node_id.to_string());
        }
    }

    pub fn is_reachable(&self, node_id: &str) -> bool {
        !self.read().unreachable.contains(node_id)
    }

    /// Announce `node_id` to every other node
    pub fn connect(&self, node_id: &str) -> Result<usize> {
        let payload = serde_json::to_value(NodeEvent {
            node_id: node_id.to_string(),
        })?;
        self.route(node_id, TOPIC_NODE_CONNECTED, payload, &PublishOptions::broadcast())
    }

    pub fn disconnect(&self, node_id: &str) -> Result<usize> {
        let payload = serde_json::to_value(NodeEvent {
            node_id: node_id.to_string(),
        })?;
        self.route(node_id, TOPIC_NODE_DISCONNECTED, payload, &PublishOptions::broadcast())
    }

    /// Deliver to subscribers other than `source`. Returns the number of
    /// channels reached.
    fn route(
        &self,
        source: &str,
        topic: &str,
        payload: Value,
        options: &PublishOptions,
    ) -> Result<usize> {
        let mut state = self.write();
        if state.unreachable.contains(source) {
            bail!("node {source} is unreachable");
        }
        let everyone = options.broadcast || options.target_nodes.is_empty();
        let unreachable = state.unreachable.clone();
        let mut delivered = 0;
        for ((node, sub_topic), senders) in state.subscriptions.iter_mut() {
            if sub_topic != topic || node == source || unreachable.contains(node) {
                continue;
            }
            if !everyone && !options.target_nodes.contains(node) {
                continue;
            }
            senders.retain(|sender| {
                let envelope = Envelope {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    source: source.to_string(),
                };
                sender.send(envelope).is_ok()
            });
            delivered += senders.len();
        }
        trace!(topic, source, delivered, "Routed message");
        Ok(delivered)
    }

    fn handler_for(&self, source: &str, peer: &str) -> Result<Arc<dyn SyncHandler>> {
        let state = self.read();
        if state.unreachable.contains(source) {
            bail!("node {source} is unreachable");
        }
        if state.unreachable.contains(peer) {
            bail!("node {peer} is unreachable");
        }
        state
            .handlers
            .get(peer)
            .and_then(Weak::upgrade)
            .with_context(|| format!("no sync handler registered for node {peer}"))
    }
}

/// One node's endpoint on a [`LocalBus`]
pub struct LocalTransport {
    node_id: NodeId,
    bus: LocalBus,
}

impl LocalTransport {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }
}

impl Transport for LocalTransport {
    fn publish(&self, topic: &str, payload: Value, options: PublishOptions) -> Result<()> {
        self.bus.route(&self.node_id, topic, payload, &options)?;
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.bus
            .write()
            .subscriptions
            .entry((self.node_id.clone(), topic.to_string()))
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    async fn request(&self, peer: &str, request: SyncRequest) -> Result<SyncResponse> {
        let handler = self.bus.handler_for(&self.node_id, peer)?;
        // Let other tasks run, as a real round trip would
        tokio::task::yield_now().await;
        handler.handle_sync_request(request)
    }
}
