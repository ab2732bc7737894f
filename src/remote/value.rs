//! The server's native value-object model. The remote protocol has no
//! untyped JSON argument path: every outbound payload carries explicit type
//! tags per element, so plain JSON arguments are wrapped before encoding.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum WireValue {
    String(String),
    Number(f64),
    Boolean(bool),
    /// Homogeneous string vector.
    Strings(Vec<String>),
    /// Homogeneous integer vector.
    Ints(Vec<i64>),
    /// Heterogeneous vector.
    Any(Vec<WireValue>),
    Map(IndexMap<String, WireValue>),
}

/// Wrap call arguments into the uniform keyed-map structure the server
/// expects. `Null` arguments become an empty map.
pub fn wrap_args(args: Value) -> WireValue {
    match args {
        Value::Object(map) => WireValue::Map(
            map.into_iter().map(|(k, v)| (k, wrap(v))).collect(),
        ),
        Value::Null => WireValue::Map(IndexMap::new()),
        other => {
            let mut map = IndexMap::new();
            map.insert("value".to_string(), wrap(other));
            WireValue::Map(map)
        }
    }
}

pub fn wrap(value: Value) -> WireValue {
    match value {
        Value::String(s) => WireValue::String(s),
        Value::Number(n) => WireValue::Number(n.as_f64().unwrap_or_default()),
        Value::Bool(b) => WireValue::Boolean(b),
        Value::Array(items) => wrap_array(items),
        Value::Object(map) => {
            WireValue::Map(map.into_iter().map(|(k, v)| (k, wrap(v))).collect())
        }
        // The value model has no null; an empty vector is the closest thing.
        Value::Null => WireValue::Any(vec![]),
    }
}

/// Arrays are typed as homogeneous string or integer vectors when every
/// element qualifies, otherwise as a heterogeneous vector.
fn wrap_array(items: Vec<Value>) -> WireValue {
    if items.iter().all(Value::is_string) {
        return WireValue::Strings(
            items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    _ => unreachable!(),
                })
                .collect(),
        );
    }
    if items.iter().all(|v| v.as_i64().is_some()) {
        return WireValue::Ints(items.iter().map(|v| v.as_i64().unwrap()).collect());
    }
    WireValue::Any(items.into_iter().map(wrap).collect())
}
