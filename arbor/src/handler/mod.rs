//! Defines handler resolution and invocation, including the reconciliation
//! of a handler's return value with the state of the response.

use bytes::Bytes;
use hyper::{Body, Method, Response};
use log::{error, trace, warn};
use serde_json::{json, Value};

use crate::config::HandlerMode;
use crate::context::data::Data;
use crate::context::Context;
use crate::engine::Warnings;
use crate::error::{HttpError, Result};
use crate::module::{Export, HandlerFn, Module, ModuleUrl};
use crate::response::ResponseMode;

/// What a handler hands back to the pipeline.
///
/// Most handlers return `Json`; `Response` adopts a fully formed platform
/// response (status, headers and body) into the pipeline's own state.
#[derive(Debug)]
pub enum HandlerResult {
    /// No return value; an empty body unless the response was committed.
    Empty,
    /// A JSON value, serialized into the body.
    Json(Value),
    /// A string, passed through unmodified.
    Text(String),
    /// Raw bytes, passed through unmodified.
    Bytes(Bytes),
    /// A platform response whose status, headers and body are adopted.
    Response(Response<Body>),
}

impl HandlerResult {
    /// The JSON view of the result handed to after-interceptors; streams,
    /// bytes and platform responses have none.
    pub(crate) fn value_view(&self) -> Option<Value> {
        match self {
            HandlerResult::Json(v) => Some(v.clone()),
            HandlerResult::Text(s) => Some(Value::String(s.clone())),
            _ => None,
        }
    }

    fn final_chunk(&self) -> Option<Bytes> {
        match self {
            HandlerResult::Empty | HandlerResult::Response(_) => None,
            HandlerResult::Json(v) => {
                Some(Bytes::from(serde_json::to_vec(v).unwrap_or_default()))
            }
            HandlerResult::Text(s) => Some(Bytes::from(s.clone())),
            HandlerResult::Bytes(b) => Some(b.clone()),
        }
    }
}

impl From<Value> for HandlerResult {
    fn from(v: Value) -> HandlerResult {
        HandlerResult::Json(v)
    }
}

impl From<String> for HandlerResult {
    fn from(s: String) -> HandlerResult {
        HandlerResult::Text(s)
    }
}

impl From<&str> for HandlerResult {
    fn from(s: &str) -> HandlerResult {
        HandlerResult::Text(s.to_string())
    }
}

impl From<Bytes> for HandlerResult {
    fn from(b: Bytes) -> HandlerResult {
        HandlerResult::Bytes(b)
    }
}

impl From<()> for HandlerResult {
    fn from(_: ()) -> HandlerResult {
        HandlerResult::Empty
    }
}

impl From<Response<Body>> for HandlerResult {
    fn from(r: Response<Body>) -> HandlerResult {
        HandlerResult::Response(r)
    }
}

/// Resolves the handler for a request: the export named after the uppercased
/// method, falling back to `default`.
///
/// Method policing happened at match time; reaching this point with no
/// callable handler means the module declares none at all, a hard error.
pub(crate) fn resolve_handler(
    module: &Module,
    file: &ModuleUrl,
    method: &Method,
    mode: HandlerMode,
    ctx: &Context,
    warnings: &Warnings,
) -> Result<HandlerFn> {
    let export = module
        .get(method.as_str())
        .or_else(|| module.default_export());

    let export = match export {
        Some(export) => export,
        None => return Err(HttpError::handler_invalid(file.as_str())),
    };

    match (export, mode) {
        (Export::Handler(f), HandlerMode::Default) => Ok(f.clone()),
        (Export::Handler(f), HandlerMode::This) => {
            warnings.warn_handler_mode("handlerMode `this` is deprecated; behaving as `default`");
            Ok(f.clone())
        }
        (Export::HandlerFactory(factory), HandlerMode::Factory) => {
            warnings.warn_handler_mode("handlerMode `factory` is deprecated");
            factory(ctx.dependencies.clone())
        }
        (Export::Handler(_), HandlerMode::Factory) => Err(HttpError::handler_invalid(
            &format!("{} (handlerMode `factory` expects a factory export)", file),
        )),
        (Export::HandlerFactory(_), _) => Err(HttpError::handler_invalid(&format!(
            "{} (factory export requires handlerMode `factory`)",
            file
        ))),
        _ => Err(HttpError::handler_invalid(file.as_str())),
    }
}

/// The reconciled result of a handler invocation.
pub(crate) struct Invocation {
    /// JSON view handed to after-interceptors.
    pub view: Option<Value>,
    /// The value to shape into the buffered body, when the response is still
    /// uncommitted.
    pub buffered: Option<HandlerResult>,
}

/// Invokes a handler and reconciles its return value with the response:
///
/// * buffered — the return value becomes the body at finalization;
/// * streaming — the return value is written as a final chunk, and the stream
///   closed unless it is a kept-open SSE stream;
/// * already sent — the return value is ignored, and a late rejection is
///   logged without altering the response.
pub(crate) async fn run_handler(
    handler: HandlerFn,
    data: Data,
    ctx: &Context,
) -> Result<Invocation> {
    let result = handler(data, ctx.clone()).await;

    match (result, ctx.response.mode()) {
        (Ok(result), ResponseMode::Buffered) => Ok(Invocation {
            view: result.value_view(),
            buffered: Some(result),
        }),
        (Ok(result), ResponseMode::Streaming { sse, keep_open }) => {
            if let Some(chunk) = result.final_chunk() {
                ctx.response.write_chunk(chunk);
            } else if matches!(result, HandlerResult::Response(_)) {
                warn!(
                    "[{}] ignoring platform response returned on an open stream",
                    ctx.request_id
                );
            }

            if sse && keep_open {
                trace!("[{}] leaving sse stream open on handler return", ctx.request_id);
            } else {
                ctx.response.close_stream();
            }

            Ok(Invocation {
                view: result.value_view(),
                buffered: None,
            })
        }
        (Ok(_), ResponseMode::Committed) => {
            trace!(
                "[{}] response already sent; ignoring handler return value",
                ctx.request_id
            );
            Ok(Invocation {
                view: Some(committed_view(ctx)),
                buffered: None,
            })
        }
        (Err(err), ResponseMode::Committed) => {
            error!(
                "[{}] handler rejected after the response was sent: {}",
                ctx.request_id, err
            );
            Ok(Invocation {
                view: Some(committed_view(ctx)),
                buffered: None,
            })
        }
        (Err(err), _) => Err(err),
    }
}

/// The synthetic view after-interceptors receive when the handler committed
/// the response itself.
fn committed_view(ctx: &Context) -> Value {
    let (status, status_text) = ctx.response.status_snapshot();
    let status_text = status_text
        .or_else(|| status.canonical_reason().map(String::from))
        .unwrap_or_default();
    json!({
        "statusCode": status.as_u16(),
        "statusText": status_text,
        "message": status_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_views() {
        assert_eq!(
            HandlerResult::Json(json!({"a": 1})).value_view(),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            HandlerResult::Text("hi".into()).value_view(),
            Some(Value::String("hi".into()))
        );
        assert!(HandlerResult::Empty.value_view().is_none());
        assert!(HandlerResult::Bytes(Bytes::from_static(b"x"))
            .value_view()
            .is_none());
    }

    #[test]
    fn final_chunks_serialize() {
        assert_eq!(
            HandlerResult::Json(json!({"a": 1})).final_chunk().unwrap(),
            Bytes::from_static(b"{\"a\":1}")
        );
        assert_eq!(
            HandlerResult::Text("tail".into()).final_chunk().unwrap(),
            Bytes::from_static(b"tail")
        );
        assert!(HandlerResult::Empty.final_chunk().is_none());
    }
}
