//! Payload combination rules.
//!
//! The sync manager is generic over the value it stores. A [`Payload`]
//! knows how to fold an incoming value into an existing one for the two
//! non-trivial merge strategies; replace needs no help.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;

/// A value that can be stored and reconciled by the sync manager.
pub trait Payload: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Shallow-merges `incoming` over `self`. Fields present in both take
    /// the incoming value.
    #[must_use]
    fn merge_fields(&self, incoming: &Self) -> Self;

    /// Concatenates `incoming` onto `self`.
    #[must_use]
    fn append(&self, incoming: &Self) -> Self;
}

impl Payload for Value {
    /// Objects merge key by key. Any other pairing is a replacement.
    fn merge_fields(&self, incoming: &Self) -> Self {
        match (self, incoming) {
            (Value::Object(existing), Value::Object(new_fields)) => {
                let mut merged = existing.clone();
                for (k, v) in new_fields {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            _ => incoming.clone(),
        }
    }

    /// Both sides are treated as arrays: `null` is empty, a scalar or
    /// object is a one-element array.
    fn append(&self, incoming: &Self) -> Self {
        let mut items = into_items(self);
        items.extend(into_items(incoming));
        Value::Array(items)
    }
}

fn into_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}
