use crate::error::Error;
use crate::merge::{kind_of, merge_values, ValueKind};
use crate::types::{now_ms, Conflict, NodeId, Timestamp};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Fields checked, in order, for a value's own write time
const TIMESTAMP_FIELDS: [&str; 5] = [
    "timestamp",
    "updatedAt",
    "updated_at",
    "lastModified",
    "_timestamp",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    RemoteWins,
    LocalWins,
    Merge,
    Custom,
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::RemoteWins => "remote-wins",
            ConflictStrategy::LocalWins => "local-wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Custom => "custom",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "last-write-wins" | "lww" => Ok(ConflictStrategy::LastWriteWins),
            "remote-wins" => Ok(ConflictStrategy::RemoteWins),
            "local-wins" => Ok(ConflictStrategy::LocalWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "custom" => Ok(ConflictStrategy::Custom),
            "manual" => Ok(ConflictStrategy::Manual),
            _ => Err(Error::UnsupportedStrategy(s.to_string())),
        }
    }
}

/// Caller-supplied hints for a resolution batch
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    pub local_timestamp: Option<Timestamp>,
    pub remote_timestamp: Option<Timestamp>,
    pub source_node: Option<NodeId>,
}

/// A compiled resolver for the `custom` strategy
pub trait CustomResolver: Send + Sync {
    fn resolve(
        &self,
        namespace: &str,
        conflict: &Conflict,
        ctx: &ResolutionContext,
    ) -> anyhow::Result<Value>;
}

impl<F> CustomResolver for F
where
    F: Fn(&str, &Conflict, &ResolutionContext) -> anyhow::Result<Value> + Send + Sync,
{
    fn resolve(
        &self,
        namespace: &str,
        conflict: &Conflict,
        ctx: &ResolutionContext,
    ) -> anyhow::Result<Value> {
        self(namespace, conflict, ctx)
    }
}

/// Where a custom resolver is registered. Lookup order is kind, namespace,
/// then fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolverTarget {
    Kind(ValueKind),
    Namespace(String),
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingConflict {
    pub namespace: String,
    pub conflict: Conflict,
    pub detected_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolutionEvent {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    pub resolved_at: Timestamp,
}

/// Per-key outcome of a batch. Every input key appears in `resolved`; keys
/// that failed or were deferred carry their local value there.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionOutcome {
    pub resolved: BTreeMap<String, Value>,
    pub failed: BTreeMap<String, String>,
    pub deferred: Vec<String>,
}

enum Resolved {
    Value(Value),
    Deferred(Value),
}

#[derive(Default)]
struct ResolverState {
    default_strategy: ConflictStrategy,
    namespace_strategies: HashMap<String, ConflictStrategy>,
    kind_resolvers: HashMap<ValueKind, Arc<dyn CustomResolver>>,
    namespace_resolvers: HashMap<String, Arc<dyn CustomResolver>>,
    fallback: Option<Arc<dyn CustomResolver>>,
    pending: Vec<PendingConflict>,
    listeners: Vec<mpsc::UnboundedSender<ResolutionEvent>>,
}

/// Turns batches of per-key conflicts into resolved values
pub struct ConflictResolver {
    state: RwLock<ResolverState>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::default())
    }
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            state: RwLock::new(ResolverState {
                default_strategy,
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<ResolverState> {
        self.state.read().expect("Failed to lock resolver state")
    }

    fn write(&self) -> RwLockWriteGuard<ResolverState> {
        self.state.write().expect("Failed to lock resolver state")
    }

    pub fn set_default_strategy(&self, strategy: ConflictStrategy) {
        self.write().default_strategy = strategy;
    }

    pub fn set_namespace_strategy(&self, namespace: &str, strategy: ConflictStrategy) {
        info!(namespace, %strategy, "Setting conflict strategy");
        self.write()
            .namespace_strategies
            .insert(namespace.to_string(), strategy);
    }

    pub fn strategy_for(&self, namespace: &str) -> ConflictStrategy {
        let state = self.read();
        state
            .namespace_strategies
            .get(namespace)
            .copied()
            .unwrap_or(state.default_strategy)
    }

    pub fn register_custom_resolver(
        &self,
        target: ResolverTarget,
        resolver: impl CustomResolver + 'static,
    ) {
        let resolver: Arc<dyn CustomResolver> = Arc::new(resolver);
        let mut state = self.write();
        match target {
            ResolverTarget::Kind(kind) => {
                state.kind_resolvers.insert(kind, resolver);
            }
            ResolverTarget::Namespace(namespace) => {
                state.namespace_resolvers.insert(namespace, resolver);
            }
            ResolverTarget::Fallback => state.fallback = Some(resolver),
        }
    }

    pub fn pending_manual_conflicts(&self) -> Vec<PendingConflict> {
        self.read().pending.clone()
    }

    /// Stream of manual resolutions
    pub fn on_resolution(&self) -> mpsc::UnboundedReceiver<ResolutionEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.write().listeners.push(sender);
        receiver
    }

    /// Settle a queued manual conflict with an operator-chosen value
    pub fn resolve_manual_conflict(
        &self,
        index: usize,
        value: Value,
    ) -> Result<(PendingConflict, ResolutionEvent), Error> {
        let pending = {
            let mut state = self.write();
            if index >= state.pending.len() {
                return Err(Error::NoSuchConflict(index));
            }
            state.pending.remove(index)
        };
        Ok(self.settle(pending, value))
    }

    /// Settle the `index`-th queued conflict of `namespace`. The conflict is
    /// taken off the queue before `commit` runs and put back if it returns
    /// false, so a concurrent caller never sees the same entry.
    pub fn resolve_manual_conflict_in(
        &self,
        namespace: &str,
        index: usize,
        value: Value,
        commit: impl FnOnce(&PendingConflict, &Value) -> bool,
    ) -> Result<(PendingConflict, ResolutionEvent), Error> {
        let (position, pending) = {
            let mut state = self.write();
            let position = state
                .pending
                .iter()
                .enumerate()
                .filter(|(_, pending)| pending.namespace == namespace)
                .nth(index)
                .map(|(position, _)| position)
                .ok_or(Error::NoSuchConflict(index))?;
            (position, state.pending.remove(position))
        };

        if !commit(&pending, &value) {
            let key = pending.conflict.key.clone();
            let mut state = self.write();
            let position = position.min(state.pending.len());
            state.pending.insert(position, pending);
            warn!(namespace, key, "Manual resolution rejected by the store");
            return Err(Error::WriteRejected {
                namespace: namespace.to_string(),
                key,
            });
        }
        Ok(self.settle(pending, value))
    }

    fn settle(&self, pending: PendingConflict, value: Value) -> (PendingConflict, ResolutionEvent) {
        let event = ResolutionEvent {
            namespace: pending.namespace.clone(),
            key: pending.conflict.key.clone(),
            value,
            resolved_at: now_ms(),
        };
        self.write()
            .listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
        info!(
            namespace = event.namespace,
            key = event.key,
            "Manual conflict resolved"
        );
        (pending, event)
    }

    /// Resolve a batch. A failing key keeps its local value and does not stop
    /// the rest of the batch.
    pub fn resolve(
        &self,
        namespace: &str,
        conflicts: Vec<Conflict>,
        ctx: &ResolutionContext,
    ) -> ResolutionOutcome {
        let strategy = self.strategy_for(namespace);
        debug!(
            namespace,
            %strategy,
            "Resolving {} conflicts",
            conflicts.len()
        );

        let mut outcome = ResolutionOutcome::default();
        for conflict in conflicts {
            let key = conflict.key.clone();
            match self.resolve_one(namespace, strategy, conflict.clone(), ctx) {
                Ok(Resolved::Value(value)) => {
                    outcome.resolved.insert(key, value);
                }
                Ok(Resolved::Deferred(local)) => {
                    outcome.deferred.push(key.clone());
                    outcome.resolved.insert(key, local);
                }
                Err(e) => {
                    error!(namespace, key, "Conflict resolution failed: {e:#}");
                    outcome.failed.insert(key.clone(), format!("{e:#}"));
                    outcome.resolved.insert(key, conflict.local_value);
                }
            }
        }
        outcome
    }

    fn resolve_one(
        &self,
        namespace: &str,
        strategy: ConflictStrategy,
        conflict: Conflict,
        ctx: &ResolutionContext,
    ) -> anyhow::Result<Resolved> {
        let value = match strategy {
            ConflictStrategy::LastWriteWins => last_write_wins(conflict, ctx),
            ConflictStrategy::RemoteWins => conflict.remote_value,
            ConflictStrategy::LocalWins => conflict.local_value,
            ConflictStrategy::Merge => merge_values(conflict.local_value, conflict.remote_value),
            ConflictStrategy::Custom => match self.custom_resolver_for(namespace, &conflict) {
                Some(resolver) => resolver.resolve(namespace, &conflict, ctx)?,
                None => {
                    warn!(
                        namespace,
                        key = conflict.key,
                        "No custom resolver registered, falling back to last-write-wins"
                    );
                    last_write_wins(conflict, ctx)
                }
            },
            ConflictStrategy::Manual => {
                let local = conflict.local_value.clone();
                info!(namespace, key = conflict.key, "Deferring conflict to manual queue");
                self.write().pending.push(PendingConflict {
                    namespace: namespace.to_string(),
                    conflict,
                    detected_at: now_ms(),
                });
                return Ok(Resolved::Deferred(local));
            }
        };
        Ok(Resolved::Value(value))
    }

    fn custom_resolver_for(
        &self,
        namespace: &str,
        conflict: &Conflict,
    ) -> Option<Arc<dyn CustomResolver>> {
        let kind = kind_of(&conflict.local_value);
        let state = self.read();
        state
            .kind_resolvers
            .get(&kind)
            .or_else(|| state.namespace_resolvers.get(namespace))
            .or(state.fallback.as_ref())
            .cloned()
    }
}

/// Remote wins ties and cases where either side has no usable timestamp
fn last_write_wins(conflict: Conflict, ctx: &ResolutionContext) -> Value {
    let local_ts = extract_timestamp(&conflict.local_value).or(ctx.local_timestamp);
    let remote_ts = extract_timestamp(&conflict.remote_value).or(ctx.remote_timestamp);
    match (local_ts, remote_ts) {
        (Some(local), Some(remote)) if local > remote => conflict.local_value,
        _ => conflict.remote_value,
    }
}

pub fn extract_timestamp(value: &Value) -> Option<Timestamp> {
    let obj = value.as_object()?;
    TIMESTAMP_FIELDS
        .iter()
        .find_map(|field| obj.get(*field).and_then(parse_timestamp))
}

fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use serde_json::json;

    fn conflict(key: &str, local: Value, remote: Value) -> Conflict {
        Conflict::new(key, local, remote)
    }

    #[test]
    fn lww_prefers_newer_remote() {
        let resolver = ConflictResolver::new(ConflictStrategy::LastWriteWins);
        let out = resolver.resolve(
            "ns",
            vec![conflict("k", json!({"timestamp": 100}), json!({"timestamp": 200}))],
            &ResolutionContext::default(),
        );
        assert_eq!(out.resolved["k"], json!({"timestamp": 200}));
    }

    #[test]
    fn lww_tie_goes_to_remote() {
        let resolver = ConflictResolver::default();
        let out = resolver.resolve(
            "ns",
            vec![conflict(
                "k",
                json!({"timestamp": 100, "v": "l"}),
                json!({"timestamp": 100, "v": "r"}),
            )],
            &ResolutionContext::default(),
        );
        assert_eq!(out.resolved["k"]["v"], "r");
    }

    #[test]
    fn lww_keeps_newer_local_and_uses_context() {
        let resolver = ConflictResolver::default();
        let out = resolver.resolve(
            "ns",
            vec![
                conflict(
                    "a",
                    json!({"updatedAt": "2024-01-02T00:00:00Z"}),
                    json!({"updatedAt": "2024-01-01T00:00:00Z"}),
                ),
                conflict("b", json!("local"), json!("remote")),
            ],
            &ResolutionContext {
                local_timestamp: Some(500),
                remote_timestamp: Some(400),
                source_node: None,
            },
        );
        assert_eq!(out.resolved["a"], json!({"updatedAt": "2024-01-02T00:00:00Z"}));
        assert_eq!(out.resolved["b"], json!("local"));
    }

    #[test]
    fn lww_without_timestamps_takes_remote() {
        let resolver = ConflictResolver::default();
        let out = resolver.resolve(
            "ns",
            vec![conflict("k", json!(1), json!(2))],
            &ResolutionContext::default(),
        );
        assert_eq!(out.resolved["k"], json!(2));
    }

    #[test]
    fn unconditional_strategies() {
        let resolver = ConflictResolver::default();
        resolver.set_namespace_strategy("remote", ConflictStrategy::RemoteWins);
        resolver.set_namespace_strategy("local", ConflictStrategy::LocalWins);
        let c = || vec![conflict("k", json!({"timestamp": 9}), json!({"timestamp": 1}))];
        let ctx = ResolutionContext::default();
        assert_eq!(
            resolver.resolve("remote", c(), &ctx).resolved["k"],
            json!({"timestamp": 1})
        );
        assert_eq!(
            resolver.resolve("local", c(), &ctx).resolved["k"],
            json!({"timestamp": 9})
        );
    }

    #[test]
    fn merge_strategy_unions_sequences() {
        let resolver = ConflictResolver::new(ConflictStrategy::Merge);
        let out = resolver.resolve(
            "ns",
            vec![conflict("tags", json!([1, 2, 3]), json!([2, 3, 4]))],
            &ResolutionContext::default(),
        );
        let mut got: Vec<i64> = out.resolved["tags"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        got.sort();
        assert_eq!(got, vec![1, 2, 3, 4]);
    }

    #[test]
    fn custom_dispatch_order() {
        let resolver = ConflictResolver::new(ConflictStrategy::Custom);
        resolver.register_custom_resolver(
            ResolverTarget::Fallback,
            |_: &str, _: &Conflict, _: &ResolutionContext| -> anyhow::Result<Value> { Ok(json!("fallback")) },
        );
        resolver.register_custom_resolver(
            ResolverTarget::Namespace("ns".into()),
            |_: &str, _: &Conflict, _: &ResolutionContext| -> anyhow::Result<Value> { Ok(json!("namespace")) },
        );
        resolver.register_custom_resolver(
            ResolverTarget::Kind(ValueKind::Counter),
            |_: &str, _: &Conflict, _: &ResolutionContext| -> anyhow::Result<Value> { Ok(json!("kind")) },
        );
        let ctx = ResolutionContext::default();

        let counter = json!({"_type": "counter", "value": 1});
        let out = resolver.resolve("ns", vec![conflict("a", counter.clone(), counter)], &ctx);
        assert_eq!(out.resolved["a"], json!("kind"));

        let out = resolver.resolve("ns", vec![conflict("a", json!(1), json!(2))], &ctx);
        assert_eq!(out.resolved["a"], json!("namespace"));

        let out = resolver.resolve("other", vec![conflict("a", json!(1), json!(2))], &ctx);
        assert_eq!(out.resolved["a"], json!("fallback"));
    }

    #[test]
    fn custom_without_resolver_falls_back_to_lww() {
        let resolver = ConflictResolver::new(ConflictStrategy::Custom);
        let out = resolver.resolve(
            "ns",
            vec![conflict("k", json!({"timestamp": 5}), json!({"timestamp": 3}))],
            &ResolutionContext::default(),
        );
        assert_eq!(out.resolved["k"], json!({"timestamp": 5}));
        assert!(out.failed.is_empty());
    }

    #[test]
    fn failing_key_keeps_local_and_batch_continues() {
        let resolver = ConflictResolver::new(ConflictStrategy::Custom);
        resolver.register_custom_resolver(
            ResolverTarget::Fallback,
            |_: &str, c: &Conflict, _: &ResolutionContext| -> anyhow::Result<Value> {
                if c.key == "bad" {
                    bail!("cannot resolve {}", c.key);
                }
                Ok(c.remote_value.clone())
            },
        );
        let out = resolver.resolve(
            "ns",
            vec![
                conflict("bad", json!("l1"), json!("r1")),
                conflict("good", json!("l2"), json!("r2")),
            ],
            &ResolutionContext::default(),
        );
        assert_eq!(out.resolved["bad"], json!("l1"));
        assert_eq!(out.resolved["good"], json!("r2"));
        assert!(out.failed["bad"].contains("cannot resolve bad"));
        assert_eq!(out.failed.len(), 1);
    }

    #[test]
    fn manual_queue_round_trip() {
        let resolver = ConflictResolver::new(ConflictStrategy::Manual);
        let mut events = resolver.on_resolution();
        let out = resolver.resolve(
            "ns",
            vec![
                conflict("a", json!("la"), json!("ra")),
                conflict("b", json!("lb"), json!("rb")),
            ],
            &ResolutionContext::default(),
        );
        assert_eq!(out.resolved["a"], json!("la"));
        assert_eq!(out.deferred, vec!["a".to_string(), "b".to_string()]);

        let pending = resolver.pending_manual_conflicts();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].conflict.remote_value, json!("rb"));

        let (settled, event) = resolver.resolve_manual_conflict(1, json!("chosen")).unwrap();
        assert_eq!(settled.conflict.key, "b");
        assert_eq!(event.value, json!("chosen"));
        assert_eq!(events.try_recv().unwrap().key, "b");
        assert_eq!(resolver.pending_manual_conflicts().len(), 1);

        assert_eq!(
            resolver.resolve_manual_conflict(5, json!(null)).unwrap_err(),
            Error::NoSuchConflict(5)
        );
    }

    #[test]
    fn strategy_names() {
        assert_eq!("last_write_wins".parse::<ConflictStrategy>(), Ok(ConflictStrategy::LastWriteWins));
        assert_eq!("MERGE".parse::<ConflictStrategy>(), Ok(ConflictStrategy::Merge));
        assert_eq!(
            "first-write-wins".parse::<ConflictStrategy>(),
            Err(Error::UnsupportedStrategy("first-write-wins".into()))
        );
    }
}
