//! Defines the module abstraction the engine executes: named exports as
//! opaque callables, and the `ModuleResolver` interface that supplies them.
//!
//! Route source in this implementation is registered ahead of time rather
//! than imported from text: a [`Module`] is built once (usually through
//! [`ModuleBuilder`]) and resolved by URL through a [`ModuleResolver`]. The
//! bundled [`MemoryResolver`](crate::module::memory::MemoryResolver) is the
//! compile-time map; alternative resolvers can bridge to whatever loading
//! scheme an embedding application uses.

pub mod memory;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use hyper::Method;
use serde_json::Value;

use crate::context::data::{Data, Dependencies, FactoryContext, Outcome, Patch};
use crate::context::Context;
use crate::error::Result;
use crate::handler::HandlerResult;

/// A boxed future, the form all module callables return their work in.
pub type BoxFuture<T> = futures_util::future::BoxFuture<'static, T>;

/// A route handler: `(data, context) -> result`.
pub type HandlerFn = Arc<dyn Fn(Data, Context) -> BoxFuture<Result<HandlerResult>> + Send + Sync>;

/// A middleware or before-interceptor: `(data, context) -> patch`.
pub type MiddlewareFn = Arc<dyn Fn(Data, Context) -> BoxFuture<Result<Patch>> + Send + Sync>;

/// An after-interceptor: `(result_or_error, context)`.
pub type AfterFn = Arc<dyn Fn(Outcome, Context) -> BoxFuture<Result<()>> + Send + Sync>;

/// A dependency factory: `(factory_context) -> dependency map`.
pub type FactoryFn = Arc<dyn Fn(FactoryContext) -> BoxFuture<Result<Dependencies>> + Send + Sync>;

/// A middleware factory, used by the `factory` compatibility mode.
pub type MiddlewareFactoryFn = Arc<dyn Fn(Dependencies) -> Result<MiddlewareFn> + Send + Sync>;

/// A handler factory, used by the `factory` compatibility mode.
pub type HandlerFactoryFn = Arc<dyn Fn(Dependencies) -> Result<HandlerFn> + Send + Sync>;

/// A single named export of a module.
#[derive(Clone)]
pub enum Export {
    /// A route handler.
    Handler(HandlerFn),
    /// A factory producing a route handler from the dependency map.
    HandlerFactory(HandlerFactoryFn),
    /// A middleware.
    Middleware(MiddlewareFn),
    /// A factory producing a middleware from the dependency map.
    MiddlewareFactory(MiddlewareFactoryFn),
    /// A before-interceptor.
    Before(MiddlewareFn),
    /// An after-interceptor.
    After(AfterFn),
    /// A dependency factory.
    Dependencies(FactoryFn),
    /// A plain, non-callable value.
    Value(Value),
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Export::Handler(_) => "Handler",
            Export::HandlerFactory(_) => "HandlerFactory",
            Export::Middleware(_) => "Middleware",
            Export::MiddlewareFactory(_) => "MiddlewareFactory",
            Export::Before(_) => "Before",
            Export::After(_) => "After",
            Export::Dependencies(_) => "Dependencies",
            Export::Value(v) => return write!(f, "Value({})", v),
        };
        f.write_str(name)
    }
}

/// An executable module: a set of named exports, with `default` as the
/// conventional fallback name.
#[derive(Clone, Debug, Default)]
pub struct Module {
    exports: HashMap<String, Export>,
}

impl Module {
    /// Starts building a module.
    pub fn builder() -> ModuleBuilder {
        ModuleBuilder {
            module: Module::default(),
        }
    }

    /// Borrows a named export.
    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    /// Borrows the `default` export.
    pub fn default_export(&self) -> Option<&Export> {
        self.exports.get("default")
    }

    /// The first present export among `names`.
    pub(crate) fn first_of<'a>(&'a self, names: &[&str]) -> Option<&'a Export> {
        names.iter().find_map(|name| self.exports.get(*name))
    }

    /// The HTTP methods this module declares handlers for.
    pub fn methods(&self) -> HashSet<Method> {
        self.exports
            .iter()
            .filter(|(_, export)| {
                matches!(export, Export::Handler(_) | Export::HandlerFactory(_))
            })
            .filter_map(|(name, _)| method_for(name))
            .collect()
    }

    /// True when the module's `default` export is a handler, serving any
    /// method not declared by name.
    pub(crate) fn has_default_handler(&self) -> bool {
        matches!(
            self.default_export(),
            Some(Export::Handler(_)) | Some(Export::HandlerFactory(_))
        )
    }
}

/// Builds a [`Module`] by registering exports under the route-file naming
/// conventions: handlers under their HTTP method name or `default`,
/// `middleware`, `dependencies`, `beforeRun` and `afterRun`.
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    /// Registers a handler for an HTTP method.
    pub fn handler<F, Fut>(self, method: Method, f: F) -> Self
    where
        F: Fn(Data, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerResult>> + Send + 'static,
    {
        let name = method.as_str().to_string();
        self.export(name, Export::Handler(wrap_handler(f)))
    }

    /// Registers the `default` handler, used when no method-named export
    /// matches.
    pub fn default_handler<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Data, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerResult>> + Send + 'static,
    {
        self.export("default", Export::Handler(wrap_handler(f)))
    }

    /// Registers a handler factory for an HTTP method (`handlerMode:
    /// factory`).
    pub fn handler_factory<F>(self, method: Method, f: F) -> Self
    where
        F: Fn(Dependencies) -> Result<HandlerFn> + Send + Sync + 'static,
    {
        let name = method.as_str().to_string();
        self.export(name, Export::HandlerFactory(Arc::new(f)))
    }

    /// Registers the `middleware` export.
    pub fn middleware<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Data, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Patch>> + Send + 'static,
    {
        self.export("middleware", Export::Middleware(wrap_middleware(f)))
    }

    /// Registers the `middleware` export as a factory (`middlewareMode:
    /// factory`).
    pub fn middleware_factory<F>(self, f: F) -> Self
    where
        F: Fn(Dependencies) -> Result<MiddlewareFn> + Send + Sync + 'static,
    {
        self.export("middleware", Export::MiddlewareFactory(Arc::new(f)))
    }

    /// Registers the `dependencies` export.
    pub fn dependencies<F, Fut>(self, f: F) -> Self
    where
        F: Fn(FactoryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Dependencies>> + Send + 'static,
    {
        self.export(
            "dependencies",
            Export::Dependencies(Arc::new(move |ctx| Box::pin(f(ctx)))),
        )
    }

    /// Registers the `beforeRun` interceptor export.
    pub fn before<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Data, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Patch>> + Send + 'static,
    {
        self.export("beforeRun", Export::Before(wrap_middleware(f)))
    }

    /// Registers the `afterRun` interceptor export.
    pub fn after<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Outcome, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.export(
            "afterRun",
            Export::After(Arc::new(move |outcome, ctx| Box::pin(f(outcome, ctx)))),
        )
    }

    /// Registers a plain value export.
    pub fn value<S: Into<String>>(self, name: S, value: Value) -> Self {
        self.export(name.into(), Export::Value(value))
    }

    /// Registers an export under an explicit name.
    pub fn export<S: Into<String>>(mut self, name: S, export: Export) -> Self {
        self.module.exports.insert(name.into(), export);
        self
    }

    /// Finishes the module.
    pub fn build(self) -> Module {
        self.module
    }
}

/// The method-named exports a route module may declare handlers under.
/// Arbitrary export names are not methods, `default` included.
fn method_for(name: &str) -> Option<Method> {
    match name {
        "GET" => Some(Method::GET),
        "POST" => Some(Method::POST),
        "PUT" => Some(Method::PUT),
        "DELETE" => Some(Method::DELETE),
        "PATCH" => Some(Method::PATCH),
        "HEAD" => Some(Method::HEAD),
        "OPTIONS" => Some(Method::OPTIONS),
        _ => None,
    }
}

fn wrap_handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Data, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerResult>> + Send + 'static,
{
    Arc::new(move |data, ctx| Box::pin(f(data, ctx)))
}

fn wrap_middleware<F, Fut>(f: F) -> MiddlewareFn
where
    F: Fn(Data, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Patch>> + Send + 'static,
{
    Arc::new(move |data, ctx| Box::pin(f(data, ctx)))
}

/// The logical location of a module, relative to the routes root.
///
/// Stored normalized: forward slashes, no leading `/` or `./`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleUrl(String);

impl ModuleUrl {
    /// Creates a normalized module URL.
    pub fn new<S: AsRef<str>>(raw: S) -> ModuleUrl {
        let raw = raw.as_ref().replace('\\', "/");
        let trimmed = raw
            .trim_start_matches("./")
            .trim_start_matches('/')
            .to_string();
        ModuleUrl(trimmed)
    }

    /// The normalized path.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The directory portion of the path; empty for top-level files.
    pub fn directory(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    /// The file name without its extension.
    pub fn stem(&self) -> &str {
        let name = match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        };
        match name.rfind('.') {
            Some(idx) => &name[..idx],
            None => name,
        }
    }
}

impl fmt::Display for ModuleUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for a resolved module.
#[derive(Clone, Copy, Debug)]
pub struct ModuleStat {
    /// Modification time, when the backing store can provide one. Stores
    /// without mtimes (remote sources) fall back to TTL based caching.
    pub mtime: Option<i64>,
    /// Whether the URL names an importable module at all.
    pub is_file: bool,
}

/// Resolves logical paths to importable modules.
///
/// The engine is written entirely against this interface; implementations
/// decide where modules actually come from.
pub trait ModuleResolver: Send + Sync {
    /// True when this resolver knows how to serve the URL. Used by managers
    /// that fan out across several resolvers.
    fn can_handle(&self, url: &ModuleUrl) -> bool;

    /// Resolves a specifier to a canonical URL.
    fn resolve(&self, specifier: &str) -> anyhow::Result<ModuleUrl>;

    /// Imports the module at a URL.
    fn import(&self, url: &ModuleUrl) -> BoxFuture<anyhow::Result<Arc<Module>>>;

    /// Stats the URL without importing it.
    fn stat(&self, url: &ModuleUrl) -> BoxFuture<anyhow::Result<ModuleStat>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn urls_normalize_and_split() {
        let url = ModuleUrl::new("./users/[id].ts");
        assert_eq!(url.as_str(), "users/[id].ts");
        assert_eq!(url.directory(), "users");
        assert_eq!(url.stem(), "[id]");

        let top = ModuleUrl::new("index.ts");
        assert_eq!(top.directory(), "");
        assert_eq!(top.stem(), "index");
    }

    #[test]
    fn methods_reflect_handler_exports() {
        let module = Module::builder()
            .handler(Method::GET, |_, _| async { Ok(HandlerResult::Empty) })
            .handler(Method::POST, |_, _| async { Ok(HandlerResult::Empty) })
            .value("GET_COUNT", json!(2))
            .build();

        let methods = module.methods();
        assert!(methods.contains(&Method::GET));
        assert!(methods.contains(&Method::POST));
        assert_eq!(methods.len(), 2);
        assert!(!module.has_default_handler());
    }

    #[test]
    fn default_exports_count_only_when_callable() {
        let module = Module::builder()
            .default_handler(|_, _| async { Ok(HandlerResult::Empty) })
            .build();
        assert!(module.has_default_handler());
        assert!(module.methods().is_empty());

        let module = Module::builder().value("default", json!("nope")).build();
        assert!(!module.has_default_handler());
        assert!(module.methods().is_empty());
    }
}
