//! Defines the per-request context passed through middlewares, interceptors
//! and handlers.

pub mod data;
pub(crate) mod request_id;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::{HeaderMap, Method, Uri};
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::context::data::{Data, Dependencies};
use crate::helpers::http::request::body::BodyKind;
use crate::helpers::http::{collapse_values, request::query_string::QueryStringMapping};
use crate::response::ResponseHandle;

/// The immutable view of the incoming request shared by every pipeline stage.
#[derive(Debug)]
pub struct RequestParts {
    /// HTTP method of the request.
    pub method: Method,
    /// Full request URI.
    pub uri: Uri,
    /// Request headers; multi-valued per HTTP semantics.
    pub headers: HeaderMap,
    /// Parameters extracted from the matched route pattern.
    pub path_params: HashMap<String, String>,
    /// Decoded query string parameters.
    pub query_params: QueryStringMapping,
    /// The parsed request body.
    pub body: BodyKind,
    /// The raw request payload, untouched.
    pub raw_body: Bytes,
    /// Peer address, when the transport provides one.
    pub client_addr: Option<SocketAddr>,
}

impl RequestParts {
    /// Builds the merged `data` record: path params, then query params, then
    /// body fields, later writes winning.
    pub(crate) fn initial_data(&self) -> Data {
        let mut data = Data::new();
        for (k, v) in &self.path_params {
            data.insert(k.clone(), Value::String(v.clone()));
        }
        for (k, v) in &self.query_params {
            data.insert(k.clone(), collapse_values(v.clone()));
        }
        for (k, v) in self.body.data_fields() {
            data.insert(k, v);
        }
        data
    }

    /// A request-shaped map, handed to middlewares in place of `data` when
    /// the `useMiddlewareRequest` compatibility flag is set.
    pub(crate) fn as_data(&self) -> Data {
        let headers: serde_json::Map<String, Value> = self
            .headers
            .keys()
            .map(|name| {
                let values: Vec<String> = self
                    .headers
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok().map(String::from))
                    .collect();
                (name.as_str().to_string(), collapse_values(values))
            })
            .collect();

        let mut data = Data::new();
        data.insert("method".into(), json!(self.method.as_str()));
        data.insert("path".into(), json!(self.uri.path()));
        data.insert(
            "query".into(),
            Value::Object(
                self.query_params
                    .iter()
                    .map(|(k, v)| (k.clone(), collapse_values(v.clone())))
                    .collect(),
            ),
        );
        data.insert("headers".into(), Value::Object(headers));
        data
    }
}

/// Signals client disconnects into the pipeline.
///
/// Handlers can poll [`is_cancelled`](CancelToken::is_cancelled) or await
/// [`cancelled`](CancelToken::cancelled); stream writes after cancellation
/// fail silently and close the stream.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Creates an untriggered token.
    pub fn new() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        CancelToken {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Marks the request as cancelled and wakes any waiters.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// True once the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the request is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

/// The per-request context.
///
/// Pipeline stages receive a clone; the executor owns the canonical copies of
/// the mutable parts (`dependencies`, `scratch`) and folds returned patches
/// into them between stages, so each stage observes its predecessors'
/// mutations.
#[derive(Clone)]
pub struct Context {
    /// Stable unique id for the request, echoed in the response headers.
    pub request_id: String,
    /// The incoming request.
    pub request: Arc<RequestParts>,
    /// Handle onto the response under construction.
    pub response: ResponseHandle,
    /// The composed dependency map.
    pub dependencies: Dependencies,
    /// Mutable scratch carried across pipeline stages; seeded with the
    /// matched route pattern and the start timestamp.
    pub scratch: Data,
    /// Cancellation signal for the request.
    pub cancelled: CancelToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(method: Method, uri: &str) -> RequestParts {
        RequestParts {
            method,
            uri: uri.parse().unwrap(),
            headers: HeaderMap::new(),
            path_params: HashMap::new(),
            query_params: QueryStringMapping::new(),
            body: BodyKind::Empty,
            raw_body: Bytes::new(),
            client_addr: None,
        }
    }

    #[test]
    fn data_merges_params_query_then_body() {
        let mut p = parts(Method::POST, "http://example.com/users/1?tag=q");
        p.path_params.insert("id".into(), "1".into());
        p.query_params.insert("tag".into(), vec!["q".into()]);
        p.body = BodyKind::Json(json!({"tag": "body-wins", "name": "Ada"}));

        let data = p.initial_data();
        assert_eq!(data["id"], "1");
        assert_eq!(data["tag"], "body-wins");
        assert_eq!(data["name"], "Ada");
    }

    #[test]
    fn request_shaped_data_carries_method_and_path() {
        let mut p = parts(Method::GET, "http://example.com/a/b?x=1");
        p.headers.insert("accept", "application/json".parse().unwrap());
        p.query_params.insert("x".into(), vec!["1".into()]);

        let data = p.as_data();
        assert_eq!(data["method"], "GET");
        assert_eq!(data["path"], "/a/b");
        assert_eq!(data["query"]["x"], "1");
        assert_eq!(data["headers"]["accept"], "application/json");
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        token.cancel();
        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());
    }
}
