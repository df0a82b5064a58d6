//! Type-aware merging of conflicting values.
//!
//! Values are plain JSON. Before merging, each side is classified once into a
//! [`MergeableValue`] and the merge is an exhaustive match over the pair.
//! The tagged encodings are:
//!
//! - `[..]` or `{"_type": "set", "values": [..]}`: sequence, merged as a
//!   deduplicated union
//! - `{"_type": "map", "entries": {..}}`: map, merged key-wise with the remote
//!   side winning collisions
//! - `{"_type": "counter", "value": n}`: counter, merged by max
//! - any object with a `vectorClock` field: clock-tagged payload
//! - any other object: deep-merged, remote wins leaves

use crate::clock::{ClockOrdering, VectorClock};
use serde_json::{Map, Number, Value};
use std::fmt;

pub const TYPE_TAG: &str = "_type";
pub const VECTOR_CLOCK_FIELD: &str = "vectorClock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    Sequence,
    Map,
    Counter,
    Clocked,
    Object,
    Scalar,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Sequence => "sequence",
            ValueKind::Map => "map",
            ValueKind::Counter => "counter",
            ValueKind::Clocked => "vector_clock",
            ValueKind::Object => "object",
            ValueKind::Scalar => "scalar",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeableValue {
    Sequence { items: Vec<Value>, tagged: bool },
    Map(Map<String, Value>),
    Counter(Number),
    Clocked {
        clock: VectorClock,
        payload: Map<String, Value>,
    },
    Object(Map<String, Value>),
    Scalar(Value),
}

impl MergeableValue {
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Array(items) => MergeableValue::Sequence {
                items,
                tagged: false,
            },
            Value::Object(mut obj) => {
                let tag = obj.get(TYPE_TAG).and_then(Value::as_str);
                match (tag, obj.get("values"), obj.get("entries"), obj.get("value")) {
                    (Some("set"), Some(Value::Array(items)), _, _) => {
                        return MergeableValue::Sequence {
                            items: items.clone(),
                            tagged: true,
                        };
                    }
                    (Some("map"), _, Some(Value::Object(entries)), _) => {
                        return MergeableValue::Map(entries.clone());
                    }
                    (Some("counter"), _, _, Some(Value::Number(n))) => {
                        return MergeableValue::Counter(n.clone());
                    }
                    _ => {}
                }
                if let Some(raw) = obj.get(VECTOR_CLOCK_FIELD) {
                    if let Ok(clock) = serde_json::from_value::<VectorClock>(raw.clone()) {
                        obj.remove(VECTOR_CLOCK_FIELD);
                        return MergeableValue::Clocked {
                            clock,
                            payload: obj,
                        };
                    }
                }
                MergeableValue::Object(obj)
            }
            scalar => MergeableValue::Scalar(scalar),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            MergeableValue::Sequence { .. } => ValueKind::Sequence,
            MergeableValue::Map(_) => ValueKind::Map,
            MergeableValue::Counter(_) => ValueKind::Counter,
            MergeableValue::Clocked { .. } => ValueKind::Clocked,
            MergeableValue::Object(_) => ValueKind::Object,
            MergeableValue::Scalar(_) => ValueKind::Scalar,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            MergeableValue::Sequence {
                items,
                tagged: false,
            } => Value::Array(items),
            MergeableValue::Sequence {
                items,
                tagged: true,
            } => {
                let mut obj = Map::new();
                obj.insert(TYPE_TAG.into(), Value::from("set"));
                obj.insert("values".into(), Value::Array(items));
                Value::Object(obj)
            }
            MergeableValue::Map(entries) => {
                let mut obj = Map::new();
                obj.insert(TYPE_TAG.into(), Value::from("map"));
                obj.insert("entries".into(), Value::Object(entries));
                Value::Object(obj)
            }
            MergeableValue::Counter(n) => {
                let mut obj = Map::new();
                obj.insert(TYPE_TAG.into(), Value::from("counter"));
                obj.insert("value".into(), Value::Number(n));
                Value::Object(obj)
            }
            MergeableValue::Clocked { clock, mut payload } => {
                // Serializing a BTreeMap of u64 cannot fail
                let clock = serde_json::to_value(clock).unwrap_or(Value::Null);
                payload.insert(VECTOR_CLOCK_FIELD.into(), clock);
                Value::Object(payload)
            }
            MergeableValue::Object(obj) => Value::Object(obj),
            MergeableValue::Scalar(v) => v,
        }
    }
}

/// Kind of a raw value without consuming it
pub fn kind_of(value: &Value) -> ValueKind {
    MergeableValue::classify(value.clone()).kind()
}

/// Extract the vector clock a value carries, if any
pub fn clock_of(value: &Value) -> Option<VectorClock> {
    value
        .get(VECTOR_CLOCK_FIELD)
        .and_then(|raw| serde_json::from_value(raw.clone()).ok())
}

/// Merge `remote` into `local`. Mismatched kinds resolve to the remote side.
pub fn merge_values(local: Value, remote: Value) -> Value {
    let local = MergeableValue::classify(local);
    let remote = MergeableValue::classify(remote);
    merge(local, remote).into_value()
}

fn merge(local: MergeableValue, remote: MergeableValue) -> MergeableValue {
    use MergeableValue::*;

    match (local, remote) {
        (
            Sequence { items: mut ours, tagged },
            Sequence {
                items: theirs,
                tagged: remote_tagged,
            },
        ) => {
            for item in theirs {
                if !ours.contains(&item) {
                    ours.push(item);
                }
            }
            dedup(&mut ours);
            Sequence {
                items: ours,
                tagged: tagged || remote_tagged,
            }
        }
        (Map(ours), Map(theirs)) => Map(deep_merge(ours, theirs)),
        (Counter(ours), Counter(theirs)) => Counter(max_number(ours, theirs)),
        (
            Clocked {
                clock: local_clock,
                payload: ours,
            },
            Clocked {
                clock: remote_clock,
                payload: theirs,
            },
        ) => {
            let payload = match local_clock.compare(&remote_clock) {
                ClockOrdering::After => ours,
                ClockOrdering::Before => theirs,
                ClockOrdering::Concurrent => deep_merge(ours, theirs),
            };
            let mut clock = local_clock;
            clock.merge(&remote_clock);
            Clocked { clock, payload }
        }
        (Object(ours), Object(theirs)) => Object(deep_merge(ours, theirs)),
        (_, remote) => remote,
    }
}

fn dedup(items: &mut Vec<Value>) {
    let mut seen: Vec<Value> = Vec::with_capacity(items.len());
    items.retain(|item| {
        if seen.contains(item) {
            false
        } else {
            seen.push(item.clone());
            true
        }
    });
}

fn max_number(a: Number, b: Number) -> Number {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if y > x => b,
        _ => a,
    }
}

/// Recursive key-wise merge: nested objects merge, everything else takes the
/// remote leaf
pub fn deep_merge(mut ours: Map<String, Value>, theirs: Map<String, Value>) -> Map<String, Value> {
    for (key, remote_value) in theirs {
        match (ours.remove(&key), remote_value) {
            (Some(Value::Object(local_obj)), Value::Object(remote_obj)) => {
                ours.insert(key, Value::Object(deep_merge(local_obj, remote_obj)));
            }
            (_, remote_value) => {
                ours.insert(key, remote_value);
            }
        }
    }
    ours
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn classify_kinds() {
        assert_eq!(kind_of(&json!([1, 2])), ValueKind::Sequence);
        assert_eq!(kind_of(&json!({"_type": "set", "values": []})), ValueKind::Sequence);
        assert_eq!(kind_of(&json!({"_type": "map", "entries": {}})), ValueKind::Map);
        assert_eq!(kind_of(&json!({"_type": "counter", "value": 3})), ValueKind::Counter);
        assert_eq!(kind_of(&json!({"vectorClock": {"a": 1}, "x": 1})), ValueKind::Clocked);
        assert_eq!(kind_of(&json!({"x": 1})), ValueKind::Object);
        assert_eq!(kind_of(&json!("s")), ValueKind::Scalar);
        // malformed tag falls back to a plain object
        assert_eq!(kind_of(&json!({"_type": "counter", "value": "x"})), ValueKind::Object);
    }

    #[test]
    fn sequences_union() {
        let merged = merge_values(json!([1, 2, 3]), json!([2, 3, 4]));
        let got: HashSet<i64> = merged
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(got, HashSet::from([1, 2, 3, 4]));
        assert_eq!(merged.as_array().unwrap().len(), 4);
    }

    #[test]
    fn tagged_sets_stay_tagged() {
        let merged = merge_values(
            json!({"_type": "set", "values": ["a"]}),
            json!({"_type": "set", "values": ["a", "b"]}),
        );
        assert_eq!(merged, json!({"_type": "set", "values": ["a", "b"]}));
    }

    #[test]
    fn counters_take_max() {
        let merged = merge_values(
            json!({"_type": "counter", "value": 7}),
            json!({"_type": "counter", "value": 4}),
        );
        assert_eq!(merged, json!({"_type": "counter", "value": 7}));
    }

    #[test]
    fn maps_merge_keywise() {
        let merged = merge_values(
            json!({"_type": "map", "entries": {"a": 1, "n": {"x": 1, "y": 1}}}),
            json!({"_type": "map", "entries": {"b": 2, "n": {"y": 2}}}),
        );
        assert_eq!(
            merged,
            json!({"_type": "map", "entries": {"a": 1, "b": 2, "n": {"x": 1, "y": 2}}})
        );
    }

    #[test]
    fn objects_deep_merge_remote_wins_leaves() {
        let merged = merge_values(
            json!({"name": "x", "prefs": {"theme": "dark", "lang": "en"}}),
            json!({"prefs": {"theme": "light"}, "age": 3}),
        );
        assert_eq!(
            merged,
            json!({"name": "x", "age": 3, "prefs": {"theme": "light", "lang": "en"}})
        );
    }

    #[test]
    fn clocked_values_follow_causality() {
        let older = json!({"vectorClock": {"a": 1}, "v": "old"});
        let newer = json!({"vectorClock": {"a": 2}, "v": "new"});
        let merged = merge_values(newer.clone(), older.clone());
        assert_eq!(merged["v"], "new");
        assert_eq!(merged["vectorClock"], json!({"a": 2}));

        let left = json!({"vectorClock": {"a": 1}, "l": 1});
        let right = json!({"vectorClock": {"b": 1}, "r": 1});
        let merged = merge_values(left, right);
        assert_eq!(merged["vectorClock"], json!({"a": 1, "b": 1}));
        assert_eq!(merged["l"], 1);
        assert_eq!(merged["r"], 1);
    }

    #[test]
    fn mismatched_kinds_take_remote() {
        assert_eq!(merge_values(json!([1]), json!({"a": 1})), json!({"a": 1}));
        assert_eq!(merge_values(json!(1), json!(2)), json!(2));
    }
}
