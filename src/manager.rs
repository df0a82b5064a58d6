use crate::config::ManagerConfig;
use crate::consistency::{ConsistencyModel, ModelConfig};
use crate::error::Error;
use crate::partition::{PartitionConfig, PartitionMap};
use crate::resolver::{ConflictResolver, ResolutionEvent};
use crate::store::StateStore;
use crate::sync::{ApplyReport, SyncCursor, SyncRequest, SyncResponse};
use crate::transport::{
    Envelope, NodeEvent, PublishOptions, SyncHandler, Transport, TOPIC_NODE_CONNECTED,
    TOPIC_NODE_DISCONNECTED, TOPIC_SYNC_REQUEST, TOPIC_SYNC_RESPONSE,
};
use crate::types::{now_ms, NodeId, Timestamp};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Connected,
    Syncing,
    Disconnected,
}

/// How sync requests reach a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Request/response through [`Transport::request`]
    Direct,
    /// Published on `state:syncRequest`, answered asynchronously
    #[default]
    PubSub,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub mode: SyncMode,
    pub connected_at: Timestamp,
    pub last_sync: Option<Timestamp>,
}

#[derive(Debug, Clone)]
pub enum PeerSyncResult {
    /// Direct exchange completed and was applied
    Synced(ApplyReport),
    /// Request published; the response arrives on the inbound pump
    Dispatched { request_id: String },
    Failed { error: String },
}

impl PeerSyncResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, PeerSyncResult::Failed { .. })
    }
}

/// Per-peer outcome of one sync pass. A failed peer never aborts the others.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub results: BTreeMap<NodeId, PeerSyncResult>,
}

impl SyncReport {
    pub fn failed(&self) -> Vec<&NodeId> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_failure())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.results.values().all(|result| !result.is_failure())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceStatus {
    pub name: String,
    pub model: ConsistencyModel,
    pub version: u64,
    pub last_updated: Timestamp,
    pub keys: usize,
    pub locks: usize,
}

/// Snapshot for debugging/monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub node_id: NodeId,
    pub partitioned: bool,
    pub namespaces: Vec<NamespaceStatus>,
    pub nodes: Vec<PeerNode>,
    pub pending_conflicts: usize,
    pub in_flight: usize,
}

struct InFlight {
    peer: NodeId,
    sent_at: Timestamp,
}

struct Inbound {
    requests: mpsc::UnboundedReceiver<Envelope>,
    responses: mpsc::UnboundedReceiver<Envelope>,
    connected: mpsc::UnboundedReceiver<Envelope>,
    disconnected: mpsc::UnboundedReceiver<Envelope>,
}

#[derive(Default)]
struct ManagerState {
    stores: BTreeMap<String, StateStore>,
    nodes: BTreeMap<NodeId, PeerNode>,
    partitioning: Option<PartitionConfig>,
    in_flight: HashMap<String, InFlight>,
    /// Paging position per (peer, namespace)
    cursors: HashMap<(NodeId, String), SyncCursor>,
    gossip_cursor: usize,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns one store per namespace and keeps them in sync with peer nodes
pub struct DistributedStateManager<T: Transport> {
    config: ManagerConfig,
    transport: Arc<T>,
    resolver: ConflictResolver,
    state: RwLock<ManagerState>,
    shutdown: watch::Sender<bool>,
}

impl<T: Transport> DistributedStateManager<T> {
    pub fn new(config: ManagerConfig, transport: Arc<T>) -> Self {
        let resolver = ConflictResolver::new(config.default_strategy);
        for (namespace, strategy) in &config.namespace_strategies {
            resolver.set_namespace_strategy(namespace, *strategy);
        }
        info!(
            node = config.node_id,
            model = %config.default_model,
            "Creating state manager"
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            transport,
            resolver,
            state: RwLock::new(ManagerState::default()),
            shutdown,
        }
    }

    fn read(&self) -> RwLockReadGuard<ManagerState> {
        self.state.read().expect("Failed to lock manager state")
    }

    fn write(&self) -> RwLockWriteGuard<ManagerState> {
        self.state.write().expect("Failed to lock manager state")
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The store for `namespace`, created on first use with the configured
    /// model for that namespace
    pub fn get_store(&self, namespace: &str) -> StateStore {
        self.get_store_with_model(namespace, self.config.model_for(namespace))
    }

    /// An existing store keeps the model it was created with
    pub fn get_store_with_model(&self, namespace: &str, model: ConsistencyModel) -> StateStore {
        if let Some(store) = self.read().stores.get(namespace) {
            return store.clone();
        }
        let store = self
            .write()
            .stores
            .entry(namespace.to_string())
            .or_insert_with(|| {
                info!(namespace, %model, "Creating store");
                StateStore::new(namespace, model)
            })
            .clone();
        if store.model() != model {
            warn!(
                namespace,
                requested = %model,
                actual = %store.model(),
                "Store already exists with a different model"
            );
        }
        store
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.read().stores.keys().cloned().collect()
    }

    pub(crate) fn stores_snapshot(&self) -> Vec<(String, StateStore)> {
        self.read()
            .stores
            .iter()
            .filter(|(_, store)| !store.is_closed())
            .map(|(name, store)| (name.clone(), store.clone()))
            .collect()
    }

    /// Register or reconnect a peer. Returns false for our own id and for a
    /// peer that is already connected.
    pub fn add_node(&self, node_id: impl Into<NodeId>, mode: SyncMode) -> bool {
        let node_id = node_id.into();
        if node_id == self.config.node_id {
            return false;
        }
        let mut state = self.write();
        match state.nodes.get_mut(&node_id) {
            Some(node) if node.status != NodeStatus::Disconnected => false,
            Some(node) => {
                info!("Node {node_id} reconnected");
                node.status = NodeStatus::Connected;
                node.mode = mode;
                node.connected_at = now_ms();
                true
            }
            None => {
                info!(?mode, "Node {node_id} connected");
                state.nodes.insert(
                    node_id.clone(),
                    PeerNode {
                        id: node_id,
                        status: NodeStatus::Connected,
                        mode,
                        connected_at: now_ms(),
                        last_sync: None,
                    },
                );
                true
            }
        }
    }

    pub fn remove_node(&self, node_id: &str) -> bool {
        let mut state = self.write();
        let removed = state.nodes.remove(node_id).is_some();
        if removed {
            state.in_flight.retain(|_, request| request.peer != node_id);
            state.cursors.retain(|(peer, _), _| peer != node_id);
            info!("Node {node_id} removed");
        }
        removed
    }

    /// Keep the peer on record but stop syncing with it
    pub fn disconnect_node(&self, node_id: &str) -> bool {
        self.set_status(node_id, NodeStatus::Disconnected)
    }

    pub fn nodes(&self) -> Vec<PeerNode> {
        self.read().nodes.values().cloned().collect()
    }

    pub fn node(&self, node_id: &str) -> Option<PeerNode> {
        self.read().nodes.get(node_id).cloned()
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.read()
            .nodes
            .values()
            .filter(|node| node.status != NodeStatus::Disconnected)
            .map(|node| node.id.clone())
            .collect()
    }

    fn set_status(&self, node_id: &str, status: NodeStatus) -> bool {
        let mut state = self.write();
        let Some(node) = state.nodes.get_mut(node_id) else {
            return false;
        };
        if node.status != status {
            debug!(from = ?node.status, to = ?status, "Node {node_id} status changed");
            node.status = status;
        }
        true
    }

    pub(crate) fn mark_synced(&self, node_id: &str) {
        let mut state = self.write();
        if let Some(node) = state.nodes.get_mut(node_id) {
            node.last_sync = Some(now_ms());
            if node.status == NodeStatus::Syncing {
                node.status = NodeStatus::Connected;
            }
        }
    }

    pub(crate) fn record_cursor(&self, peer: &str, namespace: &str, cursor: Option<SyncCursor>) {
        let key = (peer.to_string(), namespace.to_string());
        let mut state = self.write();
        match cursor {
            Some(cursor) => {
                state.cursors.insert(key, cursor);
            }
            None => {
                state.cursors.remove(&key);
            }
        }
    }

    pub fn configure_partitioning(&self, config: PartitionConfig) -> Result<(), Error> {
        config.validate()?;
        info!(
            strategy = ?config.strategy,
            partitions = config.partition_count,
            replicas = config.replication_factor,
            "Partitioning configured"
        );
        self.write().partitioning = Some(config);
        Ok(())
    }

    pub fn disable_partitioning(&self) {
        self.write().partitioning = None;
    }

    /// Node owning `key` among this node and its connected peers. Without
    /// partitioning every node holds everything, so the answer is this node.
    pub fn get_responsible_node(&self, namespace: &str, key: &str) -> Option<NodeId> {
        let state = self.read();
        let Some(partitioning) = &state.partitioning else {
            return Some(self.config.node_id.clone());
        };
        let members = Self::members(&state, &self.config.node_id);
        let map = PartitionMap::new(partitioning, &members);
        let owner = map.responsible_node(key).cloned();
        trace!(namespace, key, ?owner, "Resolved responsible node");
        owner
    }

    /// Whether `node` holds a replica of `namespace`
    pub(crate) fn is_replica_for(&self, namespace: &str, node: &str) -> bool {
        let state = self.read();
        let Some(partitioning) = &state.partitioning else {
            return true;
        };
        let members = Self::members(&state, &self.config.node_id);
        PartitionMap::new(partitioning, &members).is_replica(namespace, node)
    }

    fn members(state: &ManagerState, own_id: &NodeId) -> Vec<NodeId> {
        std::iter::once(own_id.clone())
            .chain(
                state
                    .nodes
                    .values()
                    .filter(|node| node.status != NodeStatus::Disconnected)
                    .map(|node| node.id.clone()),
            )
            .collect()
    }

    fn build_sync_request(&self, peer: &str) -> SyncRequest {
        let sync_points = self
            .stores_snapshot()
            .into_iter()
            .filter(|(namespace, _)| self.is_replica_for(namespace, peer))
            .map(|(namespace, store)| {
                let point = store.read().sync_point();
                (namespace, point)
            })
            .collect::<BTreeMap<_, _>>();
        let cursors = {
            let state = self.read();
            sync_points
                .keys()
                .filter_map(|namespace| {
                    let key = (peer.to_string(), namespace.clone());
                    state
                        .cursors
                        .get(&key)
                        .map(|cursor| (namespace.clone(), cursor.clone()))
                })
                .collect()
        };
        SyncRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            source_node_id: self.config.node_id.clone(),
            target_node_id: peer.to_string(),
            timestamp: now_ms(),
            sync_points,
            cursors,
        }
    }

    /// Pull from `only` or from every connected peer
    #[tracing::instrument(skip(self), fields(node = %self.config.node_id))]
    pub async fn sync_with_nodes(&self, only: Option<&[NodeId]>) -> SyncReport {
        let targets = match only {
            Some(ids) => ids.to_vec(),
            None => self.connected_peers(),
        };

        let mut report = SyncReport::default();
        for peer in targets {
            let result = match self.node(&peer) {
                None => PeerSyncResult::Failed {
                    error: format!("unknown node {peer}"),
                },
                Some(node) if node.status == NodeStatus::Disconnected => PeerSyncResult::Failed {
                    error: format!("node {peer} is disconnected"),
                },
                Some(node) => self.sync_with_peer(node).await,
            };
            report.results.insert(peer, result);
        }
        report
    }

    async fn sync_with_peer(&self, peer: PeerNode) -> PeerSyncResult {
        self.set_status(&peer.id, NodeStatus::Syncing);
        let request = self.build_sync_request(&peer.id);
        debug!(
            "Requesting {} namespaces from node {}",
            request.sync_points.len(),
            peer.id
        );

        let result = match peer.mode {
            SyncMode::Direct => self
                .request_direct(&peer.id, request)
                .await
                .map(|response| PeerSyncResult::Synced(self.apply_sync_response(response))),
            SyncMode::PubSub => self
                .dispatch(&peer.id, request)
                .map(|request_id| PeerSyncResult::Dispatched { request_id }),
        };

        match result {
            Ok(result) => {
                let mut state = self.write();
                if let Some(node) = state.nodes.get_mut(&peer.id) {
                    if node.status == NodeStatus::Syncing {
                        node.status = NodeStatus::Connected;
                    }
                }
                result
            }
            Err(e) => {
                warn!("Sync with node {} failed: {e:#}", peer.id);
                self.set_status(&peer.id, NodeStatus::Disconnected);
                PeerSyncResult::Failed {
                    error: format!("{e:#}"),
                }
            }
        }
    }

    async fn request_direct(&self, peer: &str, request: SyncRequest) -> Result<SyncResponse> {
        let limit = self.config.request_timeout();
        match timeout(limit, self.transport.request(peer, request)).await {
            Ok(response) => response,
            Err(_) => Err(anyhow!("sync request timed out after {limit:?}")),
        }
    }

    fn dispatch(&self, peer: &str, request: SyncRequest) -> Result<String> {
        let request_id = request.request_id.clone();
        let payload = serde_json::to_value(&request).context("Failed to encode sync request")?;
        self.write().in_flight.insert(
            request_id.clone(),
            InFlight {
                peer: peer.to_string(),
                sent_at: now_ms(),
            },
        );
        if let Err(e) = self
            .transport
            .publish(TOPIC_SYNC_REQUEST, payload, PublishOptions::to(peer))
        {
            self.write().in_flight.remove(&request_id);
            return Err(e);
        }
        Ok(request_id)
    }

    /// Drop pub/sub requests unanswered for longer than `request_timeout`
    /// and mark their peers unreachable
    fn expire_in_flight(&self) -> Vec<(NodeId, String)> {
        let limit = self.config.request_timeout();
        let limit_ms = i64::try_from(limit.as_millis()).unwrap_or(i64::MAX);
        let now = now_ms();
        let expired: Vec<(NodeId, String)> = {
            let mut state = self.write();
            let ids: Vec<String> = state
                .in_flight
                .iter()
                .filter(|(_, request)| now.saturating_sub(request.sent_at) >= limit_ms)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.in_flight.remove(&id).map(|request| (request.peer, id)))
                .collect()
        };
        for (peer, request_id) in &expired {
            warn!("Sync request {request_id} to node {peer} timed out after {limit:?}");
            self.set_status(peer, NodeStatus::Disconnected);
        }
        expired
    }

    /// One tick of the periodic loop: time out unanswered pub/sub requests,
    /// then pull from peers. Under eventual consistency only `gossip_factor`
    /// peers are contacted per round, rotating through the list.
    pub async fn sync_round(&self) -> SyncReport {
        let expired = self.expire_in_flight();

        let peers = self.connected_peers();
        let selected = match self.config.default_model.config() {
            ModelConfig::Eventual(cfg) if cfg.gossip_factor > 0 && peers.len() > cfg.gossip_factor => {
                let mut state = self.write();
                let start = state.gossip_cursor % peers.len();
                state.gossip_cursor = start + cfg.gossip_factor;
                (0..cfg.gossip_factor)
                    .map(|i| peers[(start + i) % peers.len()].clone())
                    .collect()
            }
            _ => peers,
        };
        let mut report = if selected.is_empty() {
            SyncReport::default()
        } else {
            self.sync_with_nodes(Some(&selected)).await
        };
        for (peer, request_id) in expired {
            report
                .results
                .entry(peer)
                .or_insert_with(|| PeerSyncResult::Failed {
                    error: format!("sync request {request_id} timed out"),
                });
        }
        report
    }

    /// Dispatch one inbound pub/sub message
    pub fn handle_message(&self, envelope: Envelope) -> Result<()> {
        match envelope.topic.as_str() {
            TOPIC_SYNC_REQUEST => {
                let request: SyncRequest = serde_json::from_value(envelope.payload)
                    .context("Malformed sync request")?;
                if request.target_node_id != self.config.node_id {
                    trace!("Ignoring sync request for {}", request.target_node_id);
                    return Ok(());
                }
                let peer = request.source_node_id.clone();
                let response = self.handle_sync_request(request)?;
                let payload =
                    serde_json::to_value(&response).context("Failed to encode sync response")?;
                self.transport
                    .publish(TOPIC_SYNC_RESPONSE, payload, PublishOptions::to(peer))
            }
            TOPIC_SYNC_RESPONSE => {
                let response: SyncResponse = serde_json::from_value(envelope.payload)
                    .context("Malformed sync response")?;
                if response.target_node_id != self.config.node_id {
                    trace!("Ignoring sync response for {}", response.target_node_id);
                    return Ok(());
                }
                match self.write().in_flight.remove(&response.request_id) {
                    Some(request) => trace!(
                        elapsed_ms = now_ms() - request.sent_at,
                        "Response from {} matched request",
                        request.peer
                    ),
                    None => debug!(
                        "Unsolicited sync response {} from {}",
                        response.request_id, response.source_node_id
                    ),
                }
                self.apply_sync_response(response);
                Ok(())
            }
            TOPIC_NODE_CONNECTED => {
                let event: NodeEvent = serde_json::from_value(envelope.payload)
                    .context("Malformed node event")?;
                self.add_node(event.node_id, SyncMode::PubSub);
                Ok(())
            }
            TOPIC_NODE_DISCONNECTED => {
                let event: NodeEvent = serde_json::from_value(envelope.payload)
                    .context("Malformed node event")?;
                self.disconnect_node(&event.node_id);
                Ok(())
            }
            other => {
                debug!("Ignoring message on topic {other}");
                Ok(())
            }
        }
    }

    /// Subscribe to the sync topics and spawn the periodic sync loop and the
    /// inbound message pump. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.read().tasks.is_empty() {
            warn!("State manager already started");
            return Ok(());
        }
        let inbound = Inbound {
            requests: self.transport.subscribe(TOPIC_SYNC_REQUEST)?,
            responses: self.transport.subscribe(TOPIC_SYNC_RESPONSE)?,
            connected: self.transport.subscribe(TOPIC_NODE_CONNECTED)?,
            disconnected: self.transport.subscribe(TOPIC_NODE_DISCONNECTED)?,
        };

        let pump = tokio::spawn(self.clone().inbound_pump(inbound, self.shutdown.subscribe()));
        let ticker = tokio::spawn(self.clone().periodic_sync(self.shutdown.subscribe()));
        self.write().tasks.extend([pump, ticker]);
        info!(
            interval = ?self.config.sync_interval(),
            "State manager started"
        );
        Ok(())
    }

    async fn periodic_sync(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let report = self.sync_round().await;
                    let failed = report.failed();
                    if !failed.is_empty() {
                        warn!("Sync round failed for {} peers: {failed:?}", failed.len());
                    }
                }
            }
        }
        debug!("Periodic sync stopped");
    }

    async fn inbound_pump(self: Arc<Self>, mut inbound: Inbound, mut shutdown: watch::Receiver<bool>) {
        loop {
            let envelope = tokio::select! {
                _ = shutdown.changed() => break,
                Some(envelope) = inbound.requests.recv() => envelope,
                Some(envelope) = inbound.responses.recv() => envelope,
                Some(envelope) = inbound.connected.recv() => envelope,
                Some(envelope) = inbound.disconnected.recv() => envelope,
                else => break,
            };
            if let Err(e) = self.handle_message(envelope) {
                warn!("Failed to handle inbound message: {e:#}");
            }
        }
        debug!("Inbound pump stopped");
    }

    /// Stop background tasks, drop in-flight requests and close every store
    pub async fn destroy(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut self.write().tasks);
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Background task ended abnormally: {e}");
                }
            }
        }

        let (stores, dropped) = {
            let mut state = self.write();
            let dropped = state.in_flight.drain().count();
            state.cursors.clear();
            state.nodes.clear();
            (std::mem::take(&mut state.stores), dropped)
        };
        if dropped > 0 {
            info!("Dropping {dropped} in-flight sync requests");
        }
        for store in stores.values() {
            store.close();
        }
        info!(node = self.config.node_id, "State manager destroyed");
    }

    /// Settle the `index`-th queued manual conflict of `namespace` and write
    /// the chosen value into its store. A key locked by a local writer stays
    /// queued.
    pub fn resolve_manual_conflict(
        &self,
        namespace: &str,
        index: usize,
        value: serde_json::Value,
    ) -> Result<ResolutionEvent, Error> {
        let store = self.get_store(namespace);
        let (_, event) =
            self.resolver
                .resolve_manual_conflict_in(namespace, index, value, |pending, value| {
                    store.set(&pending.conflict.key, value.clone(), None)
                })?;
        Ok(event)
    }

    pub fn status(&self) -> ManagerStatus {
        let namespaces = self
            .stores_snapshot()
            .into_iter()
            .map(|(name, store)| {
                let metadata = store.metadata();
                NamespaceStatus {
                    name,
                    model: store.model(),
                    version: metadata.version,
                    last_updated: metadata.last_updated,
                    keys: store.size(),
                    locks: metadata.lock_count,
                }
            })
            .collect();
        let state = self.read();
        ManagerStatus {
            node_id: self.config.node_id.clone(),
            partitioned: state.partitioning.is_some(),
            namespaces,
            nodes: state.nodes.values().cloned().collect(),
            pending_conflicts: self.resolver.pending_manual_conflicts().len(),
            in_flight: state.in_flight.len(),
        }
    }
}

impl<T: Transport> SyncHandler for DistributedStateManager<T> {
    fn handle_sync_request(&self, request: SyncRequest) -> Result<SyncResponse> {
        DistributedStateManager::handle_sync_request(self, request)
    }
}
