use crate::clock::ClockOrdering;
use crate::consistency::ConsistencyModel;
use crate::manager::DistributedStateManager;
use crate::merge::clock_of;
use crate::resolver::{ResolutionContext, ResolutionOutcome};
use crate::store::{StateStore, StoreState};
use crate::transport::Transport;
use crate::types::{now_ms, Conflict, KeyStamp, NodeId, SyncPoint, Timestamp};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, trace};

/// Pull request: "here is what I have, send me what is newer"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub request_id: String,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub timestamp: Timestamp,
    /// Requester's metadata per namespace it wants kept in sync
    pub sync_points: BTreeMap<String, SyncPoint>,
    /// Where to resume a paged namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cursors: BTreeMap<String, SyncCursor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub request_id: String,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub timestamp: Timestamp,
    /// Only namespaces strictly newer than the requester's sync point
    pub states: BTreeMap<String, NamespaceState>,
}

/// The responder's view of one namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceState {
    pub version: u64,
    pub last_updated: Timestamp,
    pub data: BTreeMap<String, Value>,
    /// `data` is the complete key set rather than a changed subset
    #[serde(default)]
    pub full: bool,
    /// Keys removed since the requester's sync point, or every removal the
    /// responder still knows of for a full state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    /// Set when one version held more changed keys than a batch. The
    /// requester keeps its sync point and asks again from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<SyncCursor>,
}

impl NamespaceState {
    pub fn sync_point(&self) -> SyncPoint {
        SyncPoint::new(self.version, self.last_updated)
    }

    pub fn is_page(&self) -> bool {
        self.next.is_some()
    }
}

/// Position in the responder's `(version, key)` change order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub version: u64,
    pub key: String,
}

impl SyncCursor {
    /// Whether the change `(version, key)` comes after this cursor
    fn precedes(&self, version: u64, key: &str) -> bool {
        (self.version, self.key.as_str()) < (version, key)
    }
}

/// What one response did to the local stores
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Namespaces whose data changed
    pub updated: Vec<String>,
    /// Namespaces where only the sync point moved, or nothing happened
    pub unchanged: Vec<String>,
    /// Conflict batches, per namespace
    pub resolutions: BTreeMap<String, ResolutionOutcome>,
}

/// Limits for building a namespace state
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubsetLimits {
    pub batch_size: usize,
    pub full_sync_threshold: u64,
}

/// Build the answer for one namespace, or None when the requester is
/// already current.
///
/// A full key set goes out for a requester that has nothing, one that is more
/// than `full_sync_threshold` versions behind, and for STRONG namespaces.
/// Otherwise the keys stamped at or after the requester's version are sent,
/// oldest first and capped at `batch_size`. A truncated subset reports the
/// last version it fully covers so the requester asks again from there. When
/// even that would not move the requester forward, the subset is a page and
/// carries a cursor instead.
pub(crate) fn namespace_state(
    store: &StateStore,
    since: SyncPoint,
    cursor: Option<&SyncCursor>,
    limits: SubsetLimits,
) -> Option<NamespaceState> {
    let state = store.read();
    let local = state.sync_point();
    if !local.is_newer_than(&since) {
        return None;
    }

    let gap = local.version.saturating_sub(since.version);
    let full = since.version == 0
        || gap > limits.full_sync_threshold
        || state.model() == ConsistencyModel::Strong;
    if full {
        return Some(full_state(&state));
    }

    let changed: Vec<(String, KeyStamp)> = state
        .changes_since(since.version)
        .into_iter()
        .filter(|(key, stamp)| cursor.map_or(true, |cursor| cursor.precedes(stamp.version, key)))
        .collect();
    let mut point = local;
    let mut next = None;
    let mut window = changed.as_slice();
    if changed.len() > limits.batch_size {
        window = &changed[..limits.batch_size];
        let covered = changed[limits.batch_size].1.version.saturating_sub(1);
        if covered > since.version {
            point.version = covered;
        } else {
            let (key, stamp) = &window[window.len() - 1];
            debug!(
                namespace = state.namespace(),
                version = stamp.version,
                "Changed set does not fit one batch, paging"
            );
            point = since;
            next = Some(SyncCursor {
                version: stamp.version,
                key: key.clone(),
            });
        }
    }

    let mut data = BTreeMap::new();
    let mut removed = Vec::new();
    for (key, stamp) in window {
        match state.get(key) {
            Some(value) if !stamp.deleted => {
                data.insert(key.clone(), value);
            }
            _ => removed.push(key.clone()),
        }
    }
    Some(NamespaceState {
        version: point.version,
        last_updated: point.last_updated,
        data,
        full: false,
        removed,
        next,
    })
}

fn full_state(state: &StoreState) -> NamespaceState {
    let point = state.sync_point();
    NamespaceState {
        version: point.version,
        last_updated: point.last_updated,
        data: state.data().clone(),
        full: true,
        removed: state.removed_keys(),
        next: None,
    }
}

/// Removals reported by the remote, except for keys written locally after
/// the remote's version. Keys the remote merely lacks are never removed.
fn reported_removals(state: &StoreState, remote: &NamespaceState) -> Vec<String> {
    remote
        .removed
        .iter()
        .filter(|key| {
            state
                .stamp_of(key)
                .map_or(true, |stamp| stamp.version <= remote.version)
        })
        .cloned()
        .collect()
}

enum Applied {
    Updated(Option<ResolutionOutcome>),
    Unchanged(Option<ResolutionOutcome>),
}

impl<T: Transport> DistributedStateManager<T> {
    /// Answer a peer's pull request with every namespace that is strictly
    /// newer than the requester's sync point
    #[tracing::instrument(skip(self, request), fields(from = %request.source_node_id, id = %request.request_id))]
    pub fn handle_sync_request(&self, request: SyncRequest) -> Result<SyncResponse> {
        if request.target_node_id != *self.node_id() {
            bail!(
                "sync request {} addressed to {}, not {}",
                request.request_id,
                request.target_node_id,
                self.node_id()
            );
        }

        let limits = SubsetLimits {
            batch_size: self.config().batch_size.max(1),
            full_sync_threshold: self.config().full_sync_threshold,
        };
        let mut states = BTreeMap::new();
        for (namespace, store) in self.stores_snapshot() {
            let since = match request.sync_points.get(&namespace) {
                Some(point) => *point,
                None => {
                    let version = store.read().sync_point().version;
                    if version == 0 || !self.is_replica_for(&namespace, &request.source_node_id) {
                        continue;
                    }
                    SyncPoint::default()
                }
            };
            let cursor = request.cursors.get(&namespace);
            if let Some(state) = namespace_state(&store, since, cursor, limits) {
                trace!(
                    namespace,
                    version = state.version,
                    keys = state.data.len(),
                    full = state.full,
                    page = state.is_page(),
                    "Serving namespace"
                );
                states.insert(namespace, state);
            }
        }

        info!(
            "Returning {} namespaces to node {}",
            states.len(),
            request.source_node_id
        );
        Ok(SyncResponse {
            request_id: request.request_id,
            source_node_id: self.node_id().clone(),
            target_node_id: request.source_node_id,
            timestamp: now_ms(),
            states,
        })
    }

    /// Fold a peer's response into local stores, one namespace at a time,
    /// according to each store's consistency model
    #[tracing::instrument(skip(self, response), fields(from = %response.source_node_id, id = %response.request_id))]
    pub fn apply_sync_response(&self, response: SyncResponse) -> ApplyReport {
        let source = response.source_node_id;
        let mut report = ApplyReport::default();

        for (namespace, remote) in response.states {
            self.record_cursor(&source, &namespace, remote.next.clone());
            let store = self.get_store(&namespace);
            let model = store.model();
            let applied = match model {
                _ if remote.is_page() => self.apply_page(&store, &namespace, remote, &source),
                ConsistencyModel::Strong => self.apply_strong(&store, remote),
                ConsistencyModel::Eventual => {
                    self.apply_eventual(&store, &namespace, remote, &source)
                }
                ConsistencyModel::Causal => self.apply_causal(&store, &namespace, remote, &source),
            };
            let outcome = match applied {
                Applied::Updated(outcome) => {
                    debug!(namespace, %model, "Applied remote state");
                    report.updated.push(namespace.clone());
                    outcome
                }
                Applied::Unchanged(outcome) => {
                    report.unchanged.push(namespace.clone());
                    outcome
                }
            };
            if let Some(outcome) = outcome {
                report.resolutions.insert(namespace, outcome);
            }
        }

        self.mark_synced(&source);
        report
    }

    fn apply_strong(&self, store: &StateStore, remote: NamespaceState) -> Applied {
        let mut state = store.write();
        if !remote.sync_point().is_newer_than(&state.sync_point()) {
            return Applied::Unchanged(None);
        }
        let point = remote.sync_point();
        match state.replace_data(remote.data, point.version, point.last_updated) {
            Some(_) => Applied::Updated(None),
            None => {
                state.adopt_sync_point(point);
                Applied::Unchanged(None)
            }
        }
    }

    fn apply_eventual(
        &self,
        store: &StateStore,
        namespace: &str,
        remote: NamespaceState,
        source: &NodeId,
    ) -> Applied {
        let mut state = store.write();
        let local = state.sync_point();
        let point = remote.sync_point();

        if remote.version > local.version {
            let removed = reported_removals(&state, &remote);
            return match state.update_data(remote.data, removed, Some(point)) {
                Some(_) => Applied::Updated(None),
                None => {
                    state.adopt_sync_point(point);
                    Applied::Unchanged(None)
                }
            };
        }

        if remote.version == local.version && remote.last_updated != local.last_updated {
            // Same version written independently on both sides
            return self.merge_keywise(&mut state, namespace, remote, source, None);
        }

        Applied::Unchanged(None)
    }

    fn apply_causal(
        &self,
        store: &StateStore,
        namespace: &str,
        remote: NamespaceState,
        source: &NodeId,
    ) -> Applied {
        let mut state = store.write();
        let local = state.sync_point();
        if !remote.sync_point().is_newer_than(&local) {
            return Applied::Unchanged(None);
        }
        let version = local.version.max(remote.version);
        let stamp = SyncPoint::new(version, now_ms().max(local.last_updated));
        self.merge_keywise(&mut state, namespace, remote, source, Some(stamp))
    }

    /// One page of a version too large for a batch. Data is folded in while
    /// the sync point stays put until the last page arrives.
    fn apply_page(
        &self,
        store: &StateStore,
        namespace: &str,
        remote: NamespaceState,
        source: &NodeId,
    ) -> Applied {
        let mut state = store.write();
        let keep = state.sync_point();
        if state.model() == ConsistencyModel::Causal {
            return self.merge_keywise(&mut state, namespace, remote, source, Some(keep));
        }
        let removed = reported_removals(&state, &remote);
        match state.update_data(remote.data, removed, Some(keep)) {
            Some(_) => Applied::Updated(None),
            None => Applied::Unchanged(None),
        }
    }

    /// Diff remote against local key by key. Keys only the remote has are
    /// taken as is; differing keys go to the resolver unless their vector
    /// clocks already order them.
    ///
    /// With `stamp` the commit adopts that metadata, otherwise it is a
    /// normal local bump.
    fn merge_keywise(
        &self,
        state: &mut StoreState,
        namespace: &str,
        remote: NamespaceState,
        source: &NodeId,
        stamp: Option<SyncPoint>,
    ) -> Applied {
        let local = state.sync_point();
        let use_clocks = state.model().config().uses_vector_clocks();
        let removed = reported_removals(state, &remote);
        let remote_point = remote.sync_point();

        let mut delta = BTreeMap::new();
        let mut conflicts = Vec::new();
        for (key, remote_value) in remote.data {
            match state.get(&key) {
                None => {
                    let newer_tombstone = state
                        .stamp_of(&key)
                        .is_some_and(|stamp| stamp.deleted && stamp.version > remote.version);
                    if !newer_tombstone {
                        delta.insert(key, remote_value);
                    }
                }
                Some(local_value) if local_value == remote_value => {}
                Some(local_value) => {
                    let ordering = match (clock_of(&local_value), clock_of(&remote_value)) {
                        (Some(ours), Some(theirs)) if use_clocks => Some(ours.compare(&theirs)),
                        _ => None,
                    };
                    match ordering {
                        Some(ClockOrdering::Before) => {
                            delta.insert(key, remote_value);
                        }
                        Some(ClockOrdering::After) => {}
                        _ => conflicts.push(Conflict::new(key, local_value, remote_value)),
                    }
                }
            }
        }

        let outcome = if conflicts.is_empty() {
            None
        } else {
            info!(
                namespace,
                "Resolving {} conflicts with node {source}",
                conflicts.len()
            );
            let ctx = ResolutionContext {
                local_timestamp: Some(local.last_updated),
                remote_timestamp: Some(remote_point.last_updated),
                source_node: Some(source.clone()),
            };
            let outcome = self.resolver().resolve(namespace, conflicts, &ctx);
            for (key, value) in &outcome.resolved {
                if state.get(key).as_ref() != Some(value) {
                    delta.insert(key.clone(), value.clone());
                }
            }
            Some(outcome)
        };

        match state.update_data(delta, removed, stamp) {
            Some(_) => Applied::Updated(outcome),
            None => {
                let adopted = match stamp {
                    Some(stamp) => SyncPoint::new(stamp.version, remote_point.last_updated),
                    None => remote_point,
                };
                state.adopt_sync_point(adopted);
                Applied::Unchanged(outcome)
            }
        }
    }
}
