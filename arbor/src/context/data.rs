//! Defines the dynamic values that flow through a request pipeline: handler
//! `data`, the composed dependency map, and the patches middlewares and
//! interceptors return.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::HttpError;

/// The merged `{...pathParams, ...queryParams, ...body}` record handed to
/// middlewares and handlers.
pub type Data = serde_json::Map<String, Value>;

/// Shallow merge of one data map into another. Last write wins.
pub fn merge_shallow(dst: &mut Data, src: Data) {
    for (k, v) in src {
        dst.insert(k, v);
    }
}

/// A single slot in the dependency map.
///
/// Most dependencies are plain JSON-representable values; `Shared` carries
/// anything else (a pool, a client) behind an `Arc` with downcast access.
#[derive(Clone)]
pub enum DepValue {
    /// A JSON value.
    Json(Value),
    /// An opaque shared value, retrieved by type through [`Dependencies::shared`].
    Shared(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for DepValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepValue::Json(v) => write!(f, "Json({})", v),
            DepValue::Shared(_) => f.write_str("Shared(..)"),
        }
    }
}

/// The composed dependency map: string keys to opaque values, produced by
/// shallow-merging every factory return in chain order.
#[derive(Clone, Debug, Default)]
pub struct Dependencies {
    entries: HashMap<String, DepValue>,
}

impl Dependencies {
    /// Creates an empty map.
    pub fn new() -> Dependencies {
        Dependencies::default()
    }

    /// Inserts a JSON-valued dependency.
    pub fn insert_json<K: Into<String>>(&mut self, key: K, value: Value) {
        self.entries.insert(key.into(), DepValue::Json(value));
    }

    /// Inserts an opaque shared dependency.
    pub fn insert_shared<K, T>(&mut self, key: K, value: T)
    where
        K: Into<String>,
        T: Any + Send + Sync,
    {
        self.entries
            .insert(key.into(), DepValue::Shared(Arc::new(value)));
    }

    /// Borrows a slot.
    pub fn get(&self, key: &str) -> Option<&DepValue> {
        self.entries.get(key)
    }

    /// Borrows a JSON-valued slot.
    pub fn json(&self, key: &str) -> Option<&Value> {
        match self.entries.get(key) {
            Some(DepValue::Json(v)) => Some(v),
            _ => None,
        }
    }

    /// Retrieves a shared slot, downcast to its concrete type.
    pub fn shared<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        match self.entries.get(key) {
            Some(DepValue::Shared(v)) => v.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over the keys of the map.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Shallow merge. Keys from `other` override existing keys.
    pub fn merge(&mut self, other: Dependencies) {
        for (k, v) in other.entries {
            self.entries.insert(k, v);
        }
    }

    /// Seeds a map from plain JSON fields.
    pub fn from_json_map(fields: &serde_json::Map<String, Value>) -> Dependencies {
        let mut deps = Dependencies::new();
        for (k, v) in fields {
            deps.insert_json(k.clone(), v.clone());
        }
        deps
    }
}

/// What a middleware or before-interceptor hands back: partial updates that
/// are shallow-merged into the running request.
#[derive(Default)]
pub struct Patch {
    /// Merged into handler `data`.
    pub data: Option<Data>,
    /// Legacy alias for `data`, honored when `useMiddlewareRequest` is set.
    pub params: Option<Data>,
    /// Merged into the context scratch map.
    pub scratch: Option<Data>,
    /// Merged into the composed dependency map.
    pub dependencies: Option<Dependencies>,
}

impl Patch {
    /// A patch that changes nothing.
    pub fn none() -> Patch {
        Patch::default()
    }

    /// A patch updating handler `data`.
    pub fn data(data: Data) -> Patch {
        Patch {
            data: Some(data),
            ..Patch::default()
        }
    }

    /// A patch updating the context scratch map.
    pub fn scratch(scratch: Data) -> Patch {
        Patch {
            scratch: Some(scratch),
            ..Patch::default()
        }
    }

    /// A patch updating the dependency map.
    pub fn dependencies(deps: Dependencies) -> Patch {
        Patch {
            dependencies: Some(deps),
            ..Patch::default()
        }
    }
}

/// What an after-interceptor observes: the handler's result, or the error
/// that cut the pipeline short.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// The pipeline reached the handler; carries a JSON view of its return
    /// value when one exists (streams and raw responses have none).
    Success(Option<Value>),
    /// A before-interceptor, middleware or the handler failed.
    Error(HttpError),
}

/// The context handed to dependency factories: the process environment (when
/// permitted) plus caller-provided seed values.
#[derive(Clone, Debug, Default)]
pub struct FactoryContext {
    /// Process environment. `None` when the configuration withholds it.
    pub env: Option<Arc<HashMap<String, String>>>,
    /// Seed values provided by the engine, e.g. the matched route pattern.
    pub values: Data,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_shallow_and_last_write_wins() {
        let mut a = Dependencies::new();
        a.insert_json("k", json!("a"));
        a.insert_json("only_a", json!(1));

        let mut b = Dependencies::new();
        b.insert_json("k", json!("b"));

        a.merge(b);
        assert_eq!(a.json("k"), Some(&json!("b")));
        assert_eq!(a.json("only_a"), Some(&json!(1)));
    }

    #[test]
    fn shared_values_downcast_by_type() {
        struct Pool {
            size: usize,
        }

        let mut deps = Dependencies::new();
        deps.insert_shared("pool", Pool { size: 4 });

        assert_eq!(deps.shared::<Pool>("pool").unwrap().size, 4);
        assert!(deps.shared::<String>("pool").is_none());
        assert!(deps.json("pool").is_none());
    }

    #[test]
    fn data_merge_overrides() {
        let mut dst = Data::new();
        dst.insert("x".into(), json!(1));
        let mut src = Data::new();
        src.insert("x".into(), json!(2));
        src.insert("y".into(), json!(3));

        merge_shallow(&mut dst, src);
        assert_eq!(dst["x"], json!(2));
        assert_eq!(dst["y"], json!(3));
    }
}
