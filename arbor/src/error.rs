//! Defines the error type surfaced by every stage of the request pipeline, and
//! the shaping rules that turn an error into an HTTP status and body.

use hyper::{Method, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;

/// An alias for results produced inside the request pipeline.
pub type Result<T> = std::result::Result<T, HttpError>;

/// Classifies an [`HttpError`] by the failure that produced it.
///
/// The kind determines the default status code and the error `code` string
/// reported in response bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// No route pattern matched the request path.
    RouteNotFound,
    /// A route matched the path, but declared no handler for the method.
    MethodNotAllowed,
    /// A dependency factory failed or returned something other than a map.
    DependencyFactoryFailed,
    /// A discovered dependency file lacked a callable factory export.
    DependencyExportInvalid,
    /// A middleware factory produced something other than a middleware.
    MiddlewareFactoryInvalid,
    /// A route module exposed no callable handler at all.
    HandlerInvalid,
    /// An error raised by application code carrying an explicit status.
    Http,
    /// A write to a closed or cancelled stream. Logged, never surfaced.
    Stream,
    /// Anything else. Maps to a bare 500.
    Unhandled,
}

impl ErrorKind {
    fn code(self) -> Option<&'static str> {
        match self {
            ErrorKind::RouteNotFound => Some("route_not_found"),
            ErrorKind::MethodNotAllowed => Some("method_not_allowed"),
            ErrorKind::DependencyFactoryFailed => Some("dependency_factory_failed"),
            ErrorKind::DependencyExportInvalid => Some("dependency_export_invalid"),
            ErrorKind::MiddlewareFactoryInvalid => Some("middleware_factory_invalid"),
            ErrorKind::HandlerInvalid => Some("handler_invalid"),
            ErrorKind::Stream => Some("stream_error"),
            ErrorKind::Http | ErrorKind::Unhandled => None,
        }
    }
}

/// The error value that travels through the pipeline.
///
/// Application code raises these from handlers, middlewares and interceptors;
/// the framework raises them for routing and composition failures. Whatever
/// the origin, [`shape`] converts the value into a `{status, body}` pair at
/// the end of the request.
#[derive(Clone, Debug, Error)]
#[error("{status}: {message}")]
pub struct HttpError {
    /// HTTP status the response will carry.
    pub status: StatusCode,
    /// Human readable message, reported in the response body.
    pub message: String,
    /// Optional machine readable code, reported when present.
    pub code: Option<String>,
    /// Optional structured details, reported when present.
    pub details: Option<Value>,
    /// Methods for the `Allow` header on a 405.
    pub allow: Vec<Method>,
    pub(crate) kind: ErrorKind,
    pub(crate) stack: Option<String>,
}

impl HttpError {
    /// Creates an application error with an explicit status.
    pub fn new<S: Into<String>>(status: StatusCode, message: S) -> HttpError {
        HttpError {
            status,
            message: message.into(),
            code: None,
            details: None,
            allow: Vec::new(),
            kind: ErrorKind::Http,
            stack: None,
        }
    }

    /// Attaches a machine readable code.
    pub fn with_code<S: Into<String>>(mut self, code: S) -> HttpError {
        self.code = Some(code.into());
        self
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: Value) -> HttpError {
        self.details = Some(details);
        self
    }

    /// The kind of failure this error represents.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn with_kind(mut self, kind: ErrorKind) -> HttpError {
        self.kind = kind;
        if self.code.is_none() {
            self.code = kind.code().map(String::from);
        }
        self
    }

    /// A 404 for a path no route pattern matched.
    pub fn route_not_found(path: &str) -> HttpError {
        HttpError::new(StatusCode::NOT_FOUND, format!("no route for {}", path))
            .with_kind(ErrorKind::RouteNotFound)
    }

    /// A 405 carrying the methods the matched route does declare.
    pub fn method_not_allowed(mut allow: Vec<Method>) -> HttpError {
        allow.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        allow.dedup();
        let mut err = HttpError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            .with_kind(ErrorKind::MethodNotAllowed);
        err.allow = allow;
        err
    }

    pub(crate) fn dependency_factory_failed<S: Into<String>>(detail: S) -> HttpError {
        HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, detail.into())
            .with_kind(ErrorKind::DependencyFactoryFailed)
    }

    pub(crate) fn dependency_export_invalid(file: &str) -> HttpError {
        HttpError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{} does not export a dependency factory", file),
        )
        .with_kind(ErrorKind::DependencyExportInvalid)
    }

    pub(crate) fn middleware_factory_invalid(file: &str) -> HttpError {
        HttpError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{} did not produce a middleware function", file),
        )
        .with_kind(ErrorKind::MiddlewareFactoryInvalid)
    }

    pub(crate) fn handler_invalid(file: &str) -> HttpError {
        HttpError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{} exposes no callable handler", file),
        )
        .with_kind(ErrorKind::HandlerInvalid)
    }

    pub(crate) fn stream_closed() -> HttpError {
        HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "stream closed")
            .with_kind(ErrorKind::Stream)
    }

    /// Wraps an arbitrary failure. The original is retained for debug-mode
    /// shaping; clients otherwise see a bare `Internal Server Error`.
    pub fn unhandled<E: std::fmt::Debug + std::fmt::Display>(err: E) -> HttpError {
        let mut shaped =
            HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{}", err))
                .with_kind(ErrorKind::Unhandled);
        shaped.stack = Some(format!("{:?}", err));
        shaped
    }
}

impl From<anyhow::Error> for HttpError {
    fn from(err: anyhow::Error) -> HttpError {
        HttpError::unhandled(err)
    }
}

/// Converts an error into the `{status, body}` pair written to the client.
///
/// Precedence follows the pipeline contract: an explicit status on the error
/// always wins; unhandled errors collapse to a bare 500, with the message and
/// captured stack exposed only when `debug` is set.
pub fn shape(err: &HttpError, debug: bool) -> (StatusCode, Value) {
    if err.kind == ErrorKind::Unhandled {
        let body = if debug {
            json!({
                "error": {
                    "message": err.message,
                    "stack": err.stack.as_deref().unwrap_or(&err.message),
                }
            })
        } else {
            json!({ "error": { "message": "Internal Server Error" } })
        };
        return (StatusCode::INTERNAL_SERVER_ERROR, body);
    }

    let mut error = serde_json::Map::new();
    error.insert("message".into(), Value::String(err.message.clone()));
    if let Some(code) = &err.code {
        error.insert("code".into(), Value::String(code.clone()));
    }
    if let Some(details) = &err.details {
        error.insert("details".into(), details.clone());
    }

    (err.status, json!({ "error": error }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_status_wins() {
        let err = HttpError::new(StatusCode::UNAUTHORIZED, "Unauthorized");
        let (status, body) = shape(&err, false);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["message"], "Unauthorized");
        assert!(body["error"].get("code").is_none());
    }

    #[test]
    fn code_and_details_included_only_when_present() {
        let err = HttpError::new(StatusCode::CONFLICT, "busy")
            .with_code("try_later")
            .with_details(json!({"retry_in": 3}));
        let (_, body) = shape(&err, false);
        assert_eq!(body["error"]["code"], "try_later");
        assert_eq!(body["error"]["details"]["retry_in"], 3);
    }

    #[test]
    fn unhandled_hides_message_without_debug() {
        let err = HttpError::unhandled(anyhow::anyhow!("db exploded"));
        let (status, body) = shape(&err, false);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "Internal Server Error");
        assert!(body["error"].get("stack").is_none());
    }

    #[test]
    fn unhandled_exposes_stack_in_debug() {
        let err = HttpError::unhandled(anyhow::anyhow!("db exploded"));
        let (_, body) = shape(&err, true);
        assert_eq!(body["error"]["message"], "db exploded");
        assert!(body["error"]["stack"].as_str().unwrap().contains("db exploded"));
    }

    #[test]
    fn allow_list_is_sorted_and_deduped() {
        let err = HttpError::method_not_allowed(vec![Method::POST, Method::GET, Method::POST]);
        assert_eq!(err.allow, vec![Method::GET, Method::POST]);
        assert_eq!(err.status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
