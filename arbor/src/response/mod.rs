//! Defines the response controller: buffered and streaming response state,
//! the single-commit lifecycle, and the handles exposed to application code.

pub mod sse;

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use futures_util::stream::Stream;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use log::{error, trace, warn};
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::config::{CorsConfig, SecurityConfig};
use crate::context::CancelToken;
use crate::error::{HttpError, Result};

pub use sse::{SseEvent, SseHandle, SseOptions};

/// Headers and policies stamped onto every response at commit time.
#[derive(Clone, Debug, Default)]
pub(crate) struct CommitDecor {
    pub request_id_header: String,
    pub request_id: String,
    pub default_headers: Vec<(HeaderName, HeaderValue)>,
    pub cors: Option<CorsConfig>,
}

impl CommitDecor {
    pub(crate) fn new(
        request_id_header: &str,
        request_id: &str,
        security: &SecurityConfig,
    ) -> CommitDecor {
        let default_headers = security
            .default_headers
            .iter()
            .filter_map(|(k, v)| {
                match (k.parse::<HeaderName>(), v.parse::<HeaderValue>()) {
                    (Ok(name), Ok(value)) => Some((name, value)),
                    _ => {
                        warn!(" ignoring malformed default header `{}`", k);
                        None
                    }
                }
            })
            .collect();

        CommitDecor {
            request_id_header: request_id_header.to_string(),
            request_id: request_id.to_string(),
            default_headers,
            cors: security.cors.clone(),
        }
    }
}

/// How far along the response lifecycle a request is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResponseMode {
    /// Nothing committed; the handler's return value will become the body.
    Buffered,
    /// A chunked stream or SSE stream is open.
    Streaming { sse: bool, keep_open: bool },
    /// `send` committed the response, or the buffered body was finalized.
    Committed,
}

/// A body payload accepted by [`ResponseHandle::send`].
#[derive(Clone, Debug)]
pub enum Payload {
    /// Serialized as JSON, `application/json` unless overridden.
    Json(Value),
    /// Passed through, `text/plain` unless overridden.
    Text(String),
    /// Passed through, `application/octet-stream` unless overridden.
    Bytes(Bytes),
}

impl Payload {
    fn into_parts(self) -> (Bytes, &'static str) {
        match self {
            Payload::Json(v) => (
                Bytes::from(serde_json::to_vec(&v).unwrap_or_default()),
                mime::APPLICATION_JSON.as_ref(),
            ),
            Payload::Text(s) => (Bytes::from(s), mime::TEXT_PLAIN.as_ref()),
            Payload::Bytes(b) => (b, mime::APPLICATION_OCTET_STREAM.as_ref()),
        }
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Payload {
        Payload::Json(v)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Payload {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Payload {
        Payload::Bytes(b)
    }
}

/// Options for [`ResponseHandle::stream`].
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    /// Content type for the stream; `application/octet-stream` by default.
    pub content_type: Option<String>,
}

struct ResponseState {
    status: StatusCode,
    status_text: Option<String>,
    headers: hyper::HeaderMap,
    mode: ResponseMode,
    responded: bool,
    commit_tx: Option<oneshot::Sender<Response<Body>>>,
    sender: Option<UnboundedSender<io::Result<Bytes>>>,
    decor: CommitDecor,
    cancel: CancelToken,
    request_id: String,
}

/// Handle onto the response under construction, exposed to handlers,
/// middlewares and interceptors via the request context.
///
/// At most one of [`send`](Self::send), [`stream`](Self::stream) or
/// [`sse`](Self::sse) succeeds per request; once one has, status and headers
/// are frozen and further mutation fails with `response_already_committed`.
#[derive(Clone)]
pub struct ResponseHandle {
    inner: Arc<Mutex<ResponseState>>,
}

pub(crate) fn already_committed() -> HttpError {
    HttpError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "response already committed",
    )
    .with_code("response_already_committed")
}

impl ResponseHandle {
    pub(crate) fn new(
        decor: CommitDecor,
        commit_tx: oneshot::Sender<Response<Body>>,
        cancel: CancelToken,
    ) -> ResponseHandle {
        let mut headers = hyper::HeaderMap::new();
        // The request id is echoed from the very start of the pipeline.
        if let (Ok(name), Ok(value)) = (
            decor.request_id_header.parse::<HeaderName>(),
            decor.request_id.parse::<HeaderValue>(),
        ) {
            headers.insert(name, value);
        }

        let request_id = decor.request_id.clone();
        ResponseHandle {
            inner: Arc::new(Mutex::new(ResponseState {
                status: StatusCode::OK,
                status_text: None,
                headers,
                mode: ResponseMode::Buffered,
                responded: false,
                commit_tx: Some(commit_tx),
                sender: None,
                decor,
                cancel,
                request_id,
            })),
        }
    }

    /// Sets the response status. Fails after commit.
    pub fn status(&self, status: StatusCode) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.mode != ResponseMode::Buffered {
            return Err(already_committed());
        }
        state.status = status;
        Ok(())
    }

    /// Sets the response status text. Fails after commit.
    pub fn status_text<S: Into<String>>(&self, text: S) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.mode != ResponseMode::Buffered {
            return Err(already_committed());
        }
        state.status_text = Some(text.into());
        Ok(())
    }

    /// Sets a header, replacing any existing values. Fails after commit.
    pub fn header(&self, name: &str, value: &str) -> Result<()> {
        self.with_headers(|headers| {
            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), value.parse::<HeaderValue>())
            {
                headers.insert(name, value);
            }
        })
    }

    /// Appends a header value, keeping existing ones. Fails after commit.
    pub fn append_header(&self, name: &str, value: &str) -> Result<()> {
        self.with_headers(|headers| {
            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), value.parse::<HeaderValue>())
            {
                headers.append(name, value);
            }
        })
    }

    /// Merge-assigns a map of headers. String values set a single header;
    /// array values emit one header per element.
    pub fn headers(&self, entries: &serde_json::Map<String, Value>) -> Result<()> {
        self.with_headers(|headers| {
            for (name, value) in entries {
                let name = match name.parse::<HeaderName>() {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                match value {
                    Value::Array(values) => {
                        headers.remove(&name);
                        for v in values {
                            if let Ok(value) = header_value(v) {
                                headers.append(name.clone(), value);
                            }
                        }
                    }
                    other => {
                        if let Ok(value) = header_value(other) {
                            headers.insert(name, value);
                        }
                    }
                }
            }
        })
    }

    fn with_headers<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut hyper::HeaderMap),
    {
        let mut state = self.inner.lock().unwrap();
        if state.mode != ResponseMode::Buffered {
            return Err(already_committed());
        }
        f(&mut state.headers);
        Ok(())
    }

    /// Commits the response with the current status and headers and the given
    /// body. This is the explicit `already-sent` path; the handler's eventual
    /// return value is ignored afterwards.
    pub fn send<P: Into<Payload>>(&self, payload: P) -> Result<()> {
        self.commit_with_body(None, Some(payload.into().into_parts()), &[])
    }

    /// Commits the response with no body.
    pub fn send_empty(&self) -> Result<()> {
        self.commit_with_body(None, None, &[])
    }

    /// Opens a chunked response stream and releases the response head to the
    /// client. Returns a handle for writing chunks.
    pub fn stream(&self, options: StreamOptions) -> Result<StreamHandle> {
        let content_type = options
            .content_type
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
        self.open_stream(&content_type, false, false, None)?;
        Ok(StreamHandle {
            response: self.clone(),
        })
    }

    /// Opens a server-sent-events stream. Disables proxy buffering, emits the
    /// reconnection delay when configured, and releases the response head.
    pub fn sse(&self, options: SseOptions) -> Result<SseHandle> {
        let retry_preamble = options
            .retry
            .map(|millis| Bytes::from(format!("retry: {}\n\n", millis)));
        self.open_stream(
            mime::TEXT_EVENT_STREAM.as_ref(),
            true,
            options.keep_open,
            retry_preamble,
        )?;
        Ok(SseHandle {
            response: self.clone(),
        })
    }

    fn open_stream(
        &self,
        content_type: &str,
        sse: bool,
        keep_open: bool,
        preamble: Option<Bytes>,
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.mode != ResponseMode::Buffered {
            return Err(already_committed());
        }

        let (tx, rx) = unbounded_channel();
        if !state.headers.contains_key(CONTENT_TYPE) {
            if let Ok(value) = content_type.parse::<HeaderValue>() {
                state.headers.insert(CONTENT_TYPE, value);
            }
        }
        if sse {
            // SSE responses must reach the client unbuffered.
            if let Ok(value) = "no-cache".parse::<HeaderValue>() {
                state.headers.insert(hyper::header::CACHE_CONTROL, value);
            }
        }

        if let Some(chunk) = preamble {
            let _ = tx.send(Ok(chunk));
        }

        state.sender = Some(tx);
        state.mode = ResponseMode::Streaming { sse, keep_open };

        let response = build_response(&mut state, Body::wrap_stream(ChunkStream(rx)));
        release(&mut state, response);
        Ok(())
    }

    /// Writes a chunk to the open stream. Writes on a cancelled or closed
    /// connection are dropped silently and close the stream.
    pub(crate) fn write_chunk(&self, chunk: Bytes) {
        let mut state = self.inner.lock().unwrap();
        let closed = match &state.sender {
            Some(sender) => sender.send(Ok(chunk)).is_err(),
            None => {
                trace!("[{}] dropping write to closed stream", state.request_id);
                false
            }
        };

        if closed {
            trace!(
                "[{}] stream receiver gone, closing and cancelling",
                state.request_id
            );
            state.sender = None;
            state.cancel.cancel();
        }
    }

    /// Closes the open stream, if any.
    pub(crate) fn close_stream(&self) {
        let mut state = self.inner.lock().unwrap();
        state.sender = None;
        if let ResponseMode::Streaming { sse, .. } = state.mode {
            state.mode = ResponseMode::Streaming {
                sse,
                keep_open: false,
            };
        }
        state.responded = true;
    }

    /// Commits the buffered response. Used by the engine when shaping the
    /// handler's return value or an error; `status` overrides the stored
    /// status (error shaping), `extra_headers` carries e.g. `Allow`.
    pub(crate) fn commit_with_body(
        &self,
        status: Option<StatusCode>,
        body: Option<(Bytes, &str)>,
        extra_headers: &[(HeaderName, HeaderValue)],
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.mode != ResponseMode::Buffered || state.responded {
            return Err(already_committed());
        }

        if let Some(status) = status {
            state.status = status;
        }
        for (name, value) in extra_headers {
            state.headers.insert(name.clone(), value.clone());
        }

        let body = match body {
            Some((bytes, content_type)) => {
                if !state.headers.contains_key(CONTENT_TYPE) {
                    if let Ok(value) = content_type.parse::<HeaderValue>() {
                        state.headers.insert(CONTENT_TYPE, value);
                    }
                }
                Body::from(bytes)
            }
            None => Body::empty(),
        };

        state.mode = ResponseMode::Committed;
        let response = build_response(&mut state, body);
        release(&mut state, response);
        Ok(())
    }

    /// Adopts status and headers from a platform response; the caller shapes
    /// the body separately.
    pub(crate) fn adopt(&self, status: StatusCode, headers: &hyper::HeaderMap) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.mode != ResponseMode::Buffered {
            return Err(already_committed());
        }
        state.status = status;
        for (name, value) in headers {
            state.headers.append(name.clone(), value.clone());
        }
        Ok(())
    }

    pub(crate) fn mode(&self) -> ResponseMode {
        self.inner.lock().unwrap().mode
    }

    /// True once a response head has been released to the client.
    pub fn is_committed(&self) -> bool {
        let state = self.inner.lock().unwrap();
        !matches!(state.mode, ResponseMode::Buffered) || state.responded
    }

    pub(crate) fn status_snapshot(&self) -> (StatusCode, Option<String>) {
        let state = self.inner.lock().unwrap();
        (state.status, state.status_text.clone())
    }
}

fn header_value(value: &Value) -> std::result::Result<HeaderValue, ()> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return Err(()),
    };
    text.parse::<HeaderValue>().map_err(|_| ())
}

/// Applies commit decoration and builds the hyper response.
fn build_response(state: &mut ResponseState, body: Body) -> Response<Body> {
    for (name, value) in &state.decor.default_headers {
        if !state.headers.contains_key(name) {
            state.headers.insert(name.clone(), value.clone());
        }
    }

    if let Some(cors) = &state.decor.cors {
        apply_cors(&mut state.headers, cors);
    }

    let mut response = Response::new(body);
    *response.status_mut() = state.status;
    *response.headers_mut() = state.headers.clone();
    response
}

fn apply_cors(headers: &mut hyper::HeaderMap, cors: &CorsConfig) {
    const ORIGIN: &str = "access-control-allow-origin";
    const METHODS: &str = "access-control-allow-methods";
    const ALLOW_HEADERS: &str = "access-control-allow-headers";

    let entries = [
        (ORIGIN, Some(cors.allow_origin.clone())),
        (
            METHODS,
            (!cors.allow_methods.is_empty()).then(|| cors.allow_methods.join(", ")),
        ),
        (
            ALLOW_HEADERS,
            (!cors.allow_headers.is_empty()).then(|| cors.allow_headers.join(", ")),
        ),
    ];

    for (name, value) in entries {
        if let Some(value) = value {
            let name = HeaderName::from_static(name);
            if !headers.contains_key(&name) {
                if let Ok(value) = value.parse::<HeaderValue>() {
                    headers.insert(name, value);
                }
            }
        }
    }
}

/// Fires the commit channel. Losing the race (a second commit attempt, or a
/// client that has already gone away) drops the response with a log line.
fn release(state: &mut ResponseState, response: Response<Body>) {
    state.responded = state.mode == ResponseMode::Committed || state.responded;
    match state.commit_tx.take() {
        Some(tx) => {
            if tx.send(response).is_err() {
                error!(
                    "[{}] client disconnected before the response was released",
                    state.request_id
                );
                state.cancel.cancel();
            }
        }
        None => {
            error!(
                "[{}] discarding response produced after commit",
                state.request_id
            );
        }
    }
}

/// A handle for writing chunks to an open response stream.
pub struct StreamHandle {
    response: ResponseHandle,
}

impl StreamHandle {
    /// Writes a chunk. Failed writes (closed or cancelled connection) are
    /// dropped silently.
    pub fn write<B: Into<Bytes>>(&self, chunk: B) {
        self.response.write_chunk(chunk.into());
    }

    /// Closes the stream.
    pub fn close(&self) {
        self.response.close_stream();
    }
}

struct ChunkStream(UnboundedReceiver<io::Result<Bytes>>);

impl Stream for ChunkStream {
    type Item = io::Result<Bytes>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}
