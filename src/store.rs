use crate::consistency::ConsistencyModel;
use crate::ops::{CoreState, StoreOp};
use crate::types::{
    now_ms, BatchOutcome, ChangeEvent, ChangeKind, KeyStamp, LockInfo, StoreMetadata, SyncPoint,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

enum WatchPattern {
    All,
    Exact(String),
    Prefix(String),
}

impl WatchPattern {
    fn matches(&self, key: &str) -> bool {
        match self {
            WatchPattern::All => true,
            WatchPattern::Exact(watch_key) => watch_key == key,
            WatchPattern::Prefix(prefix) => key.starts_with(prefix),
        }
    }
}

struct Watcher {
    pattern: WatchPattern,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

/// Mutable state of one namespace - all protected by a single RwLock so a
/// reader never sees a version bump without its data change
pub(crate) struct StoreState {
    namespace: String,
    model: ConsistencyModel,
    core: CoreState,
    locks: HashMap<String, LockInfo>,
    lock_timers: HashMap<String, AbortHandle>,
    watchers: Vec<Watcher>,
    closed: bool,
}

impl StoreState {
    fn new(namespace: String, model: ConsistencyModel) -> Self {
        Self {
            namespace,
            model,
            core: CoreState::new(now_ms()),
            locks: HashMap::new(),
            lock_timers: HashMap::new(),
            watchers: Vec::new(),
            closed: false,
        }
    }

    fn notify_watchers(&mut self, event: &ChangeEvent) {
        self.watchers.retain(|watcher| {
            let changes: Vec<_> = event
                .changes
                .iter()
                .filter(|change| watcher.pattern.matches(&change.key))
                .cloned()
                .collect();
            if changes.is_empty() {
                return true;
            }
            let filtered = ChangeEvent {
                namespace: event.namespace.clone(),
                version: event.version,
                changes,
            };
            watcher.sender.send(filtered).is_ok()
        });
    }

    fn watch(&mut self, pattern: WatchPattern) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if !self.closed {
            self.watchers.push(Watcher { pattern, sender });
        }
        receiver
    }

    /// Apply ops as one commit. This is the ONLY path that mutates data.
    ///
    /// Without `stamp` the version is bumped by one and the timestamp moves
    /// forward; with `stamp` the caller's metadata is adopted.
    fn commit(
        &mut self,
        ops: Vec<StoreOp>,
        kind: ChangeKind,
        stamp: Option<SyncPoint>,
    ) -> Option<ChangeEvent> {
        let ops: Vec<StoreOp> = ops
            .into_iter()
            .filter(|op| {
                let noop = self.core.is_noop(op);
                if noop {
                    trace!("Skipping noop op: {op:?}");
                }
                !noop
            })
            .collect();
        if ops.is_empty() {
            return None;
        }

        let (version, timestamp) = match stamp {
            Some(point) => (point.version, point.last_updated),
            None => (
                self.core.version() + 1,
                now_ms().max(self.core.last_updated()),
            ),
        };

        let mut changes = Vec::new();
        for op in ops {
            changes.extend(self.core.execute(op, version, timestamp, kind));
        }
        self.core.stamp(version, timestamp);

        let event = ChangeEvent {
            namespace: self.namespace.clone(),
            version,
            changes,
        };
        self.notify_watchers(&event);
        Some(event)
    }

    /// Whether `key` is held by someone other than `holder`. Expired locks
    /// are reaped on the way.
    fn is_locked_against(&mut self, key: &str, holder: Option<&str>) -> bool {
        self.reap_lock(key);
        match self.locks.get(key) {
            Some(lock) => holder != Some(lock.holder.as_str()),
            None => false,
        }
    }

    fn reap_lock(&mut self, key: &str) -> bool {
        let expired = self
            .locks
            .get(key)
            .is_some_and(|lock| lock.is_expired(now_ms()));
        if expired {
            self.locks.remove(key);
            if let Some(timer) = self.lock_timers.remove(key) {
                timer.abort();
            }
            debug!(namespace = self.namespace, key, "Reaped expired lock");
        }
        expired
    }

    fn reap_all_locks(&mut self) {
        let keys: Vec<String> = self.locks.keys().cloned().collect();
        for key in keys {
            self.reap_lock(&key);
        }
    }

    fn writable(&self) -> bool {
        if self.closed {
            warn!(namespace = self.namespace, "Store is closed, rejecting mutation");
        }
        !self.closed
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.core.data().get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: Value, holder: Option<&str>) -> bool {
        if !self.writable() {
            return false;
        }
        if self.is_locked_against(key, holder) {
            debug!(namespace = self.namespace, key, "Set rejected: key is locked");
            return false;
        }
        let op = StoreOp::Put {
            key: key.to_string(),
            value,
        };
        self.commit(vec![op], ChangeKind::Set, None).is_some()
    }

    pub fn delete(&mut self, key: &str, holder: Option<&str>) -> bool {
        if !self.writable() {
            return false;
        }
        if self.is_locked_against(key, holder) {
            debug!(namespace = self.namespace, key, "Delete rejected: key is locked");
            return false;
        }
        let op = StoreOp::Remove {
            key: key.to_string(),
        };
        self.commit(vec![op], ChangeKind::Delete, None).is_some()
    }

    pub fn set_multiple(
        &mut self,
        entries: BTreeMap<String, Value>,
        holder: Option<&str>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if !self.writable() {
            outcome.rejected = entries.into_keys().collect();
            return outcome;
        }

        let mut ops = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if self.is_locked_against(&key, holder) {
                outcome.rejected.push(key);
            } else {
                outcome.applied.push(key.clone());
                ops.push(StoreOp::Put { key, value });
            }
        }
        if !outcome.rejected.is_empty() {
            debug!(
                namespace = self.namespace,
                rejected = ?outcome.rejected,
                "Batch write partially rejected"
            );
        }
        self.commit(ops, ChangeKind::Set, None);
        outcome
    }

    pub fn clear(&mut self, force: bool) -> bool {
        if !self.writable() {
            return false;
        }
        self.reap_all_locks();
        if !self.locks.is_empty() {
            if !force {
                debug!(
                    namespace = self.namespace,
                    locks = self.locks.len(),
                    "Clear refused: locks are held"
                );
                return false;
            }
            self.release_all_locks();
        }
        self.commit(vec![StoreOp::Truncate], ChangeKind::Clear, None);
        true
    }

    /// Returns the expiry on success
    fn acquire_lock(&mut self, key: &str, holder: &str, ttl: Duration) -> Option<i64> {
        if !self.writable() || self.is_locked_against(key, Some(holder)) {
            return None;
        }
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_ms().saturating_add(ttl_ms);
        self.locks.insert(
            key.to_string(),
            LockInfo {
                holder: holder.to_string(),
                expires_at,
            },
        );
        debug!(namespace = self.namespace, key, holder, expires_at, "Lock acquired");
        Some(expires_at)
    }

    fn unlock(&mut self, key: &str, holder: &str) -> bool {
        self.reap_lock(key);
        match self.locks.get(key) {
            Some(lock) if lock.holder == holder => {
                self.locks.remove(key);
                if let Some(timer) = self.lock_timers.remove(key) {
                    timer.abort();
                }
                true
            }
            _ => false,
        }
    }

    /// Timer callback: release only if the lock was not refreshed meanwhile
    fn release_timed_out_lock(&mut self, key: &str, holder: &str, expires_at: i64) {
        let current = self
            .locks
            .get(key)
            .is_some_and(|lock| lock.holder == holder && lock.expires_at == expires_at);
        if current {
            self.locks.remove(key);
            self.lock_timers.remove(key);
            debug!(namespace = self.namespace, key, holder, "Lock expired");
        }
    }

    fn release_all_locks(&mut self) {
        self.locks.clear();
        for (_, timer) in self.lock_timers.drain() {
            timer.abort();
        }
    }

    pub fn is_locked(&mut self, key: &str) -> bool {
        self.reap_lock(key);
        self.locks.contains_key(key)
    }

    /// Fold a remote delta in. Keys absent from `delta` are kept.
    pub fn update_data(
        &mut self,
        delta: BTreeMap<String, Value>,
        removed: Vec<String>,
        stamp: Option<SyncPoint>,
    ) -> Option<ChangeEvent> {
        if !self.writable() {
            return None;
        }
        let stamp = stamp.map(|point| self.monotonic(point));
        let ops = delta
            .into_iter()
            .map(|(key, value)| StoreOp::Put { key, value })
            .chain(removed.into_iter().map(|key| StoreOp::Remove { key }))
            .collect();
        self.commit(ops, ChangeKind::Merge, stamp)
    }

    /// Replace the whole map and adopt the caller's metadata
    pub fn replace_data(
        &mut self,
        data: BTreeMap<String, Value>,
        version: u64,
        last_updated: i64,
    ) -> Option<ChangeEvent> {
        if !self.writable() {
            return None;
        }
        let stamp = self.monotonic(SyncPoint::new(version, last_updated));
        self.commit(vec![StoreOp::Replace { data }], ChangeKind::Replace, Some(stamp))
    }

    /// Adopt newer metadata without touching data
    pub fn adopt_sync_point(&mut self, point: SyncPoint) {
        if point.is_newer_than(&self.sync_point()) {
            self.core.stamp(point.version, point.last_updated);
        }
    }

    /// Versions never go backwards, even when a caller supplies an older one
    fn monotonic(&self, point: SyncPoint) -> SyncPoint {
        if point.version >= self.core.version() {
            point
        } else {
            SyncPoint::new(self.core.version() + 1, point.last_updated)
        }
    }

    pub fn sync_point(&self) -> SyncPoint {
        SyncPoint::new(self.core.version(), self.core.last_updated())
    }

    pub fn changes_since(&self, since: u64) -> Vec<(String, KeyStamp)> {
        self.core.changes_since(since)
    }

    pub fn stamp_of(&self, key: &str) -> Option<KeyStamp> {
        self.core.stamp_of(key)
    }

    pub fn removed_keys(&self) -> Vec<String> {
        self.core.removed_keys()
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        self.core.data()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn model(&self) -> ConsistencyModel {
        self.model
    }

    pub fn metadata(&self) -> StoreMetadata {
        StoreMetadata {
            version: self.core.version(),
            last_updated: self.core.last_updated(),
            lock_count: self.locks.len(),
        }
    }

    fn close(&mut self) {
        self.release_all_locks();
        self.watchers.clear();
        self.closed = true;
        info!(namespace = self.namespace, "Store closed");
    }
}

/// Versioned key/value map for one namespace.
///
/// Cloning gives another handle to the same store.
#[derive(Clone)]
pub struct StateStore {
    state: Arc<RwLock<StoreState>>,
}

impl StateStore {
    pub fn new(namespace: impl Into<String>, model: ConsistencyModel) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::new(namespace.into(), model))),
        }
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<StoreState> {
        self.state.write().expect("Failed to lock store state")
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<StoreState> {
        self.state.read().expect("Failed to lock store state")
    }

    pub fn namespace(&self) -> String {
        self.read().namespace().to_string()
    }

    pub fn model(&self) -> ConsistencyModel {
        self.read().model()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key)
    }

    /// Write `key`. Returns false when another holder has it locked.
    pub fn set(&self, key: &str, value: Value, lock_holder: Option<&str>) -> bool {
        self.write().set(key, value, lock_holder)
    }

    /// Returns false when the key is absent or locked by another holder
    pub fn delete(&self, key: &str, lock_holder: Option<&str>) -> bool {
        self.write().delete(key, lock_holder)
    }

    /// One version bump and one change event for all writable keys
    pub fn set_multiple(
        &self,
        entries: BTreeMap<String, Value>,
        lock_holder: Option<&str>,
    ) -> BatchOutcome {
        self.write().set_multiple(entries, lock_holder)
    }

    pub fn clear(&self, force: bool) -> bool {
        self.write().clear(force)
    }

    /// Take or refresh a lock on `key`. The lock is released after `ttl` by a
    /// timer when a tokio runtime is available, and reaped lazily otherwise.
    pub fn lock(&self, key: &str, holder: &str, ttl: Duration) -> bool {
        let mut state = self.write();
        let Some(expires_at) = state.acquire_lock(key, holder, ttl) else {
            return false;
        };

        if let Ok(handle) = Handle::try_current() {
            let weak = Arc::downgrade(&self.state);
            let (key_owned, holder_owned) = (key.to_string(), holder.to_string());
            let task = handle.spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(state) = weak.upgrade() {
                    if let Ok(mut state) = state.write() {
                        state.release_timed_out_lock(&key_owned, &holder_owned, expires_at);
                    }
                }
            });
            if let Some(previous) = state
                .lock_timers
                .insert(key.to_string(), task.abort_handle())
            {
                previous.abort();
            }
        }
        true
    }

    pub fn unlock(&self, key: &str, holder: &str) -> bool {
        self.write().unlock(key, holder)
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.write().is_locked(key)
    }

    pub fn on_change(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        self.write().watch(WatchPattern::All)
    }

    pub fn watch_key(&self, key: &str) -> mpsc::UnboundedReceiver<ChangeEvent> {
        self.write().watch(WatchPattern::Exact(key.to_string()))
    }

    pub fn watch_prefix(&self, prefix: &str) -> mpsc::UnboundedReceiver<ChangeEvent> {
        self.write().watch(WatchPattern::Prefix(prefix.to_string()))
    }

    /// Fold `delta` in and drop `removed`, adopting `stamp` when given
    pub fn update_data(
        &self,
        delta: BTreeMap<String, Value>,
        removed: Vec<String>,
        stamp: Option<SyncPoint>,
    ) -> Option<ChangeEvent> {
        self.write().update_data(delta, removed, stamp)
    }

    pub fn replace_data(
        &self,
        data: BTreeMap<String, Value>,
        version: u64,
        last_updated: i64,
    ) -> Option<ChangeEvent> {
        self.write().replace_data(data, version, last_updated)
    }

    pub fn metadata(&self) -> StoreMetadata {
        let mut state = self.write();
        state.reap_all_locks();
        state.metadata()
    }

    pub fn size(&self) -> usize {
        self.read().data().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().data().keys().cloned().collect()
    }

    pub fn lock_count(&self) -> usize {
        let mut state = self.write();
        state.reap_all_locks();
        state.locks.len()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.read().data().clone()
    }

    /// Keys written or removed at or after version `since`, oldest first
    pub fn changes_since(&self, since: u64) -> Vec<(String, KeyStamp)> {
        self.read().changes_since(since)
    }

    /// Release listeners, timers and locks. Later mutations are rejected.
    pub fn close(&self) {
        self.write().close();
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("StateStore")
            .field("namespace", &state.namespace)
            .field("model", &state.model)
            .field("version", &state.core.version())
            .field("keys", &state.core.data().len())
            .finish()
    }
}
