//! Defines the per-request executor: dependencies, before-interceptors,
//! middlewares, the handler, and after-interceptors, run strictly in order,
//! with errors shaped deterministically at the end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};
use log::{debug, error, trace, warn};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::MiddlewareMode;
use crate::context::data::{
    merge_shallow, Data, Dependencies, FactoryContext, Outcome, Patch,
};
use crate::context::request_id::derive_request_id;
use crate::context::{CancelToken, Context, RequestParts};
use crate::engine::EngineCore;
use crate::error::{shape, HttpError, Result};
use crate::handler::{self, HandlerResult};
use crate::helpers::http::request::{body as request_body, query_string};
use crate::helpers::timing::Timer;
use crate::module::{Export, MiddlewareFn, Module, ModuleUrl};
use crate::pipeline::{dependencies, discovery};
use crate::response::{CommitDecor, ResponseHandle, ResponseMode};

/// Runs one request through the pipeline. The response is released through
/// `commit_tx` the moment it commits; the pipeline keeps running afterwards
/// (after-interceptors, stream writes) on its own task.
pub(crate) async fn run(
    core: Arc<EngineCore>,
    req: Request<Body>,
    client_addr: Option<SocketAddr>,
    commit_tx: oneshot::Sender<Response<Body>>,
) {
    let timer = Timer::new();
    let (parts, body) = req.into_parts();

    let raw_body = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(" failed to read request body: {}", e);
            Bytes::new()
        }
    };

    let request_id = derive_request_id(&parts.headers, &core.config.logging.request_id_header);
    let cancel = CancelToken::new();
    let decor = CommitDecor::new(
        &core.config.logging.request_id_header,
        &request_id,
        &core.config.security,
    );
    let response = ResponseHandle::new(decor, commit_tx, cancel.clone());

    debug!("[{}] {} {}", request_id, parts.method, parts.uri.path());
    log_headers(&core, &request_id, &parts.headers);

    if let Err(err) = serve(
        &core,
        parts,
        raw_body,
        client_addr,
        &request_id,
        &response,
        &cancel,
    )
    .await
    {
        finalize_error(&core, &request_id, &response, &err);
    }

    trace!("[{}] request complete in {}", request_id, timer.elapsed());
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    core: &Arc<EngineCore>,
    parts: hyper::http::request::Parts,
    raw_body: Bytes,
    client_addr: Option<SocketAddr>,
    request_id: &str,
    response: &ResponseHandle,
    cancel: &CancelToken,
) -> Result<()> {
    let table = core.route_table().await.map_err(HttpError::unhandled)?;

    // Routing decides 404 and 405 up front; an unsupported method never
    // reaches dependency factories or middlewares.
    let path = parts.uri.path().to_string();
    let (pattern, route_file, path_params) = match table.match_route(&parts.method, &path) {
        Ok((entry, params)) => (entry.pattern.clone(), entry.file.clone(), params),
        Err(non_match) => {
            trace!("[{}] not routable: {} {}", request_id, parts.method, path);
            let (status, allow) = non_match.deconstruct();
            return Err(if status == StatusCode::METHOD_NOT_ALLOWED {
                HttpError::method_not_allowed(allow)
            } else {
                HttpError::route_not_found(&path)
            });
        }
    };
    trace!("[{}] matched {} -> {}", request_id, pattern, route_file);

    let route_module = core
        .store
        .load(&route_file)
        .await
        .map_err(HttpError::unhandled)?;

    let allow_shared = core.config.compatibility.allow_shared == Some(true);
    let files = discovery::discover(&core.store, &route_file, allow_shared, &core.warnings).await;

    // Dependency composition. The env injection is withheld only when shared
    // support is explicitly disabled.
    let env_allowed = core.config.compatibility.allow_shared != Some(false);
    let mut factory_values = Data::new();
    factory_values.insert("route".into(), Value::String(pattern.clone()));
    let factory_ctx = FactoryContext {
        env: if env_allowed { Some(core.env.clone()) } else { None },
        values: factory_values,
    };

    let seed = Dependencies::from_json_map(&core.config.runtime.dependencies.initial);
    let composed = dependencies::compose(
        &core.store,
        &core.dep_cache,
        &files.composition_files,
        !files.shared_files.is_empty(),
        &seed,
        &factory_ctx,
    )
    .await?;

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let request = Arc::new(RequestParts {
        method: parts.method,
        query_params: query_string::split(parts.uri.query()),
        body: request_body::parse(content_type.as_deref(), &raw_body),
        uri: parts.uri,
        headers: parts.headers,
        path_params,
        raw_body,
        client_addr,
    });

    let mut scratch = Data::new();
    scratch.insert("route".into(), Value::String(pattern));
    scratch.insert("startedAt".into(), Value::from(unix_millis()));

    let mut data = request.initial_data();
    let mut deps = composed;
    let mut error: Option<HttpError> = None;
    let mut view: Option<Value> = None;
    let mut buffered: Option<HandlerResult> = None;

    // Before-interceptors, outermost first. A failure skips straight to the
    // after-interceptor phase.
    for file in &files.interceptor_files {
        let module = match core.store.load(file).await {
            Ok(module) => module,
            Err(e) => {
                error = Some(HttpError::unhandled(e));
                break;
            }
        };
        let before = match module.get("beforeRun") {
            Some(Export::Before(f)) => f.clone(),
            _ => continue,
        };

        let ctx = make_ctx(request_id, &request, response, &deps, &scratch, cancel);
        match before(data.clone(), ctx).await {
            Ok(patch) => apply_patch(&mut data, &mut scratch, &mut deps, patch, false),
            Err(e) => {
                trace!("[{}] before-interceptor {} failed: {}", request_id, file, e);
                error = Some(e);
                break;
            }
        }
    }

    // Middlewares, outermost first.
    if error.is_none() {
        for file in &files.middleware_files {
            let module = match core.store.load(file).await {
                Ok(module) => module,
                Err(e) => {
                    error = Some(HttpError::unhandled(e));
                    break;
                }
            };
            let middleware = match resolve_middleware(&module, file, core, &deps) {
                Ok(Some(f)) => f,
                Ok(None) => continue,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };

            let payload = if core.config.compatibility.use_middleware_request {
                request.as_data()
            } else {
                data.clone()
            };
            let ctx = make_ctx(request_id, &request, response, &deps, &scratch, cancel);
            match middleware(payload, ctx).await {
                Ok(patch) => apply_patch(
                    &mut data,
                    &mut scratch,
                    &mut deps,
                    patch,
                    core.config.compatibility.use_middleware_request,
                ),
                Err(e) => {
                    trace!("[{}] middleware {} failed: {}", request_id, file, e);
                    error = Some(e);
                    break;
                }
            }
        }
    }

    // The handler.
    if error.is_none() {
        let ctx = make_ctx(request_id, &request, response, &deps, &scratch, cancel);
        let resolved = handler::resolve_handler(
            &route_module,
            &route_file,
            &request.method,
            core.config.compatibility.handler_mode,
            &ctx,
            &core.warnings,
        );
        match resolved {
            Ok(h) => match handler::run_handler(h, data.clone(), &ctx).await {
                Ok(invocation) => {
                    view = invocation.view;
                    buffered = invocation.buffered;
                }
                Err(e) => error = Some(e),
            },
            Err(e) => error = Some(e),
        }
    }

    // After-interceptors, deepest first, success or failure alike. They must
    // not disturb response shaping, so their own failures are swallowed.
    let outcome = match &error {
        Some(e) => Outcome::Error(e.clone()),
        None => Outcome::Success(view),
    };
    for file in files.interceptor_files.iter().rev() {
        let module = match core.store.load(file).await {
            Ok(module) => module,
            Err(e) => {
                error!("[{}] after-interceptor {} unavailable: {}", request_id, file, e);
                continue;
            }
        };
        let after = match module.get("afterRun") {
            Some(Export::After(f)) => f.clone(),
            _ => continue,
        };

        let ctx = make_ctx(request_id, &request, response, &deps, &scratch, cancel);
        if let Err(e) = after(outcome.clone(), ctx).await {
            error!("[{}] after-interceptor {} failed: {}", request_id, file, e);
        }
    }

    match error {
        Some(err) => finalize_error(core, request_id, response, &err),
        None => finalize_success(request_id, response, buffered).await,
    }

    Ok(())
}

fn make_ctx(
    request_id: &str,
    request: &Arc<RequestParts>,
    response: &ResponseHandle,
    deps: &Dependencies,
    scratch: &Data,
    cancel: &CancelToken,
) -> Context {
    Context {
        request_id: request_id.to_string(),
        request: request.clone(),
        response: response.clone(),
        dependencies: deps.clone(),
        scratch: scratch.clone(),
        cancelled: cancel.clone(),
    }
}

/// Folds a returned patch into the canonical request state. Later writers
/// win, whether they came from a deeper chain level or a later list entry.
fn apply_patch(
    data: &mut Data,
    scratch: &mut Data,
    deps: &mut Dependencies,
    patch: Patch,
    honor_params: bool,
) {
    if let Some(update) = patch.data {
        merge_shallow(data, update);
    }
    if honor_params {
        if let Some(params) = patch.params {
            merge_shallow(data, params);
        }
    }
    if let Some(update) = patch.scratch {
        merge_shallow(scratch, update);
    }
    if let Some(update) = patch.dependencies {
        deps.merge(update);
    }
}

fn resolve_middleware(
    module: &Module,
    file: &ModuleUrl,
    core: &EngineCore,
    deps: &Dependencies,
) -> Result<Option<MiddlewareFn>> {
    let export = match module.first_of(&["middleware", "default"]) {
        Some(export) => export,
        None => return Ok(None),
    };

    match (export, core.config.compatibility.middleware_mode) {
        (Export::Middleware(f), MiddlewareMode::Default) => Ok(Some(f.clone())),
        (Export::Middleware(f), MiddlewareMode::This)
        | (Export::Middleware(f), MiddlewareMode::Assign) => {
            core.warnings.warn_middleware_mode(
                "middlewareMode `this`/`assign` are deprecated; behaving as `default`",
            );
            Ok(Some(f.clone()))
        }
        (Export::MiddlewareFactory(factory), MiddlewareMode::Factory) => {
            factory(deps.clone()).map(Some)
        }
        (Export::Middleware(_), MiddlewareMode::Factory)
        | (Export::MiddlewareFactory(_), _) => {
            Err(HttpError::middleware_factory_invalid(file.as_str()))
        }
        _ => Ok(None),
    }
}

async fn finalize_success(
    request_id: &str,
    response: &ResponseHandle,
    buffered: Option<HandlerResult>,
) {
    match response.mode() {
        ResponseMode::Buffered => {
            let commit = match buffered.unwrap_or(HandlerResult::Empty) {
                HandlerResult::Empty => response.commit_with_body(None, None, &[]),
                HandlerResult::Json(v) => response.commit_with_body(
                    None,
                    Some((
                        Bytes::from(serde_json::to_vec(&v).unwrap_or_default()),
                        mime::APPLICATION_JSON.as_ref(),
                    )),
                    &[],
                ),
                HandlerResult::Text(s) => response.commit_with_body(
                    None,
                    Some((Bytes::from(s), mime::TEXT_PLAIN.as_ref())),
                    &[],
                ),
                HandlerResult::Bytes(b) => response.commit_with_body(
                    None,
                    Some((b, mime::APPLICATION_OCTET_STREAM.as_ref())),
                    &[],
                ),
                HandlerResult::Response(platform) => {
                    let (head, body) = platform.into_parts();
                    let bytes = hyper::body::to_bytes(body).await.unwrap_or_default();
                    if let Err(e) = response.adopt(head.status, &head.headers) {
                        trace!("[{}] could not adopt platform response: {}", request_id, e);
                    }
                    response.commit_with_body(
                        None,
                        Some((bytes, mime::APPLICATION_OCTET_STREAM.as_ref())),
                        &[],
                    )
                }
            };

            if let Err(e) = commit {
                error!("[{}] could not commit response: {}", request_id, e);
            }
        }
        // An open stream was either closed by the invoker or deliberately
        // kept open; a committed response needs nothing more.
        ResponseMode::Streaming { .. } | ResponseMode::Committed => {}
    }
}

fn finalize_error(
    core: &EngineCore,
    request_id: &str,
    response: &ResponseHandle,
    err: &HttpError,
) {
    let (status, body) = shape(err, core.config.debug);
    let bytes = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());

    match response.mode() {
        ResponseMode::Buffered => {
            let mut extra: Vec<(HeaderName, HeaderValue)> = Vec::new();
            if !err.allow.is_empty() {
                let list = err
                    .allow
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                if let Ok(value) = list.parse::<HeaderValue>() {
                    extra.push((ALLOW, value));
                }
            }

            if let Err(e) = response.commit_with_body(
                Some(status),
                Some((bytes, mime::APPLICATION_JSON.as_ref())),
                &extra,
            ) {
                error!("[{}] could not commit error response: {}", request_id, e);
            }
        }
        ResponseMode::Streaming { .. } => {
            trace!("[{}] writing error as final stream chunk", request_id);
            response.write_chunk(bytes);
            response.close_stream();
        }
        ResponseMode::Committed => {
            error!("[{}] error after response commit: {}", request_id, err);
        }
    }
}

fn log_headers(core: &EngineCore, request_id: &str, headers: &hyper::HeaderMap) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }

    let scrub = &core.config.security.scrub_headers;
    for (name, value) in headers {
        let shown = if scrub.iter().any(|s| s.eq_ignore_ascii_case(name.as_str())) {
            "[scrubbed]"
        } else {
            value.to_str().unwrap_or("[binary]")
        };
        trace!("[{}] > {}: {}", request_id, name, shown);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patches_merge_in_order() {
        let mut data = Data::new();
        data.insert("a".into(), json!(1));
        let mut scratch = Data::new();
        let mut deps = Dependencies::new();

        let mut update = Data::new();
        update.insert("a".into(), json!(2));
        update.insert("b".into(), json!(3));
        apply_patch(&mut data, &mut scratch, &mut deps, Patch::data(update), false);

        assert_eq!(data["a"], json!(2));
        assert_eq!(data["b"], json!(3));
    }

    #[test]
    fn params_patch_requires_request_mode() {
        let mut data = Data::new();
        let mut scratch = Data::new();
        let mut deps = Dependencies::new();

        let mut params = Data::new();
        params.insert("p".into(), json!(true));
        let patch = Patch {
            params: Some(params.clone()),
            ..Patch::default()
        };
        apply_patch(&mut data, &mut scratch, &mut deps, patch, false);
        assert!(data.get("p").is_none());

        let patch = Patch {
            params: Some(params),
            ..Patch::default()
        };
        apply_patch(&mut data, &mut scratch, &mut deps, patch, true);
        assert_eq!(data["p"], json!(true));
    }
}
