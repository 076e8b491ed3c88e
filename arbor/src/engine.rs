//! Defines the engine: the root object owning configuration, the module
//! resolver, the route table and the three request-pipeline caches.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use hyper::{Body, Request, Response, StatusCode};
use log::{error, trace, warn};
use tokio::sync::oneshot;

use crate::config::{Config, Discovery};
use crate::module::{Module, ModuleResolver, ModuleStat, ModuleUrl};
use crate::pipeline::dependencies::DependencyCache;
use crate::pipeline::executor;
use crate::router::table::RouteTable;

/// How long imported modules without a modification time stay cached. Local
/// modules invalidate by mtime instead and ignore this.
pub(crate) const REMOTE_CACHE_TTL: Duration = Duration::from_secs(60);

/// One-time deprecation warnings, emitted at most once per engine.
#[derive(Default)]
pub(crate) struct Warnings {
    shared: AtomicBool,
    middleware_mode: AtomicBool,
    handler_mode: AtomicBool,
}

impl Warnings {
    pub(crate) fn warn_shared(&self, message: &str) {
        if !self.shared.swap(true, Ordering::SeqCst) {
            warn!(" {}", message);
        }
    }

    pub(crate) fn warn_middleware_mode(&self, message: &str) {
        if !self.middleware_mode.swap(true, Ordering::SeqCst) {
            warn!(" {}", message);
        }
    }

    pub(crate) fn warn_handler_mode(&self, message: &str) {
        if !self.handler_mode.swap(true, Ordering::SeqCst) {
            warn!(" {}", message);
        }
    }
}

struct CachedModule {
    module: Arc<Module>,
    mtime: Option<i64>,
    fetched: Instant,
}

/// The imported-module cache in front of the resolver. Local modules
/// invalidate when their mtime moves; mtime-less modules expire after
/// [`REMOTE_CACHE_TTL`].
pub(crate) struct ModuleStore {
    resolver: Arc<dyn ModuleResolver>,
    cache: Mutex<HashMap<ModuleUrl, CachedModule>>,
}

impl ModuleStore {
    fn new(resolver: Arc<dyn ModuleResolver>) -> ModuleStore {
        ModuleStore {
            resolver,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Stats a URL; resolver failures read as "absent".
    pub(crate) async fn stat(&self, url: &ModuleUrl) -> Option<ModuleStat> {
        match self.resolver.stat(url).await {
            Ok(stat) if stat.is_file => Some(stat),
            Ok(_) => None,
            Err(e) => {
                trace!(" stat failed for {}: {}", url, e);
                None
            }
        }
    }

    /// Loads a module through the cache.
    pub(crate) async fn load(&self, url: &ModuleUrl) -> anyhow::Result<Arc<Module>> {
        let stat = self.resolver.stat(url).await?;
        if !stat.is_file {
            anyhow::bail!("{} is not an importable module", url);
        }

        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(url) {
                let fresh = match (cached.mtime, stat.mtime) {
                    (Some(cached_mtime), Some(mtime)) => cached_mtime == mtime,
                    _ => cached.fetched.elapsed() < REMOTE_CACHE_TTL,
                };
                if fresh {
                    return Ok(cached.module.clone());
                }
            }
        }

        let module = self.resolver.import(url).await?;
        self.cache.lock().unwrap().insert(
            url.clone(),
            CachedModule {
                module: module.clone(),
                mtime: stat.mtime,
                fetched: Instant::now(),
            },
        );
        Ok(module)
    }

    pub(crate) fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }
}

pub(crate) struct EngineCore {
    pub(crate) config: Config,
    pub(crate) store: ModuleStore,
    pub(crate) dep_cache: DependencyCache,
    pub(crate) env: Arc<HashMap<String, String>>,
    pub(crate) warnings: Warnings,
    routes: RwLock<Option<Arc<RouteTable>>>,
}

impl EngineCore {
    /// The route table, built on first use under lazy discovery. Two racing
    /// requests may both build; the first install wins and the results are
    /// identical.
    pub(crate) async fn route_table(&self) -> anyhow::Result<Arc<RouteTable>> {
        if let Some(table) = self.routes.read().unwrap().as_ref() {
            return Ok(table.clone());
        }

        trace!(" building route table from {}", self.config.routing.routes_dir);
        let mut table = RouteTable::scan(
            Path::new(&self.config.routing.routes_dir),
            &self.config.routing,
        )?;
        resolve_methods(&self.store, &mut table).await;

        let mut slot = self.routes.write().unwrap();
        if let Some(table) = slot.as_ref() {
            return Ok(table.clone());
        }
        let table = Arc::new(table);
        *slot = Some(table.clone());
        Ok(table)
    }
}

/// Imports every route module of a freshly built table to record the methods
/// it declares, so the matcher can police methods before any pipeline stage
/// runs. A module that fails to import stays unrestricted; its failure
/// surfaces on the first request that reaches it.
async fn resolve_methods(store: &ModuleStore, table: &mut RouteTable) {
    for entry in table.routes_mut() {
        match store.load(&entry.file).await {
            Ok(module) => {
                entry.methods = module.methods();
                entry.default_handler = module.has_default_handler();
            }
            Err(e) => {
                warn!(" could not inspect route module {}: {}", entry.file, e);
            }
        }
    }
}

/// The engine: matches requests against the discovered routes and runs each
/// one through its hierarchical pipeline.
///
/// Cheap to clone; all shared state lives behind an `Arc`, mirroring the
/// one-router-many-connections model of the underlying server.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Starts building an engine for the given configuration.
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            resolver: None,
            routes: None,
        }
    }

    /// Dispatches a request through the pipeline and produces the response.
    pub async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        self.dispatch_from(req, None).await
    }

    /// Dispatches a request, recording the peer address on the context.
    ///
    /// The pipeline runs on its own task; the response is released as soon as
    /// it commits, which for streaming handlers is well before the pipeline
    /// finishes.
    pub async fn dispatch_from(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        let (tx, rx) = oneshot::channel();
        let core = self.core.clone();
        tokio::spawn(executor::run(core, req, client_addr, tx));

        match rx.await {
            Ok(response) => response,
            Err(_) => {
                error!(" pipeline ended without releasing a response");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }

    /// Drops every cached module, factory result and composed dependency map.
    /// Subsequent requests re-import and re-compose, which is the hot-reload
    /// path and the reset tests rely on.
    pub fn clear_module_cache(&self) {
        self.core.store.clear();
        self.core.dep_cache.clear();
    }

    /// The discovered routes, in specificity order.
    pub async fn routes(&self) -> anyhow::Result<Vec<crate::router::table::RouteEntry>> {
        Ok(self.core.route_table().await?.routes().to_vec())
    }

    /// Tears the engine down, releasing caches.
    pub fn shutdown(self) {
        self.clear_module_cache();
    }
}

/// Builds an [`Engine`].
pub struct EngineBuilder {
    config: Config,
    resolver: Option<Arc<dyn ModuleResolver>>,
    routes: Option<RouteTable>,
}

impl EngineBuilder {
    /// Supplies the module resolver. Required.
    pub fn resolver(mut self, resolver: Arc<dyn ModuleResolver>) -> EngineBuilder {
        self.resolver = Some(resolver);
        self
    }

    /// Supplies a prebuilt route table instead of scanning `routes_dir`.
    pub fn routes(mut self, routes: RouteTable) -> EngineBuilder {
        self.routes = Some(routes);
        self
    }

    /// Finishes the engine. Under eager discovery the route table is built
    /// here and every route module imported to record its declared methods;
    /// under lazy discovery both are deferred to the first request.
    pub async fn build(self) -> anyhow::Result<Engine> {
        let resolver = self
            .resolver
            .ok_or_else(|| anyhow::anyhow!("an engine requires a module resolver"))?;
        let store = ModuleStore::new(resolver);

        let table = match self.routes {
            Some(table) => Some(table),
            None if self.config.routing.discovery == Discovery::Eager => {
                let path = Path::new(&self.config.routing.routes_dir);
                if path.is_dir() {
                    Some(RouteTable::scan(path, &self.config.routing)?)
                } else {
                    warn!(
                        " routes directory {} not found; starting with no routes",
                        self.config.routing.routes_dir
                    );
                    Some(RouteTable::from_files(
                        std::iter::empty(),
                        &self.config.routing,
                    ))
                }
            }
            None => None,
        };

        let routes = match table {
            Some(mut table) => {
                resolve_methods(&store, &mut table).await;
                Some(Arc::new(table))
            }
            None => None,
        };

        let env: HashMap<String, String> = std::env::vars().collect();

        Ok(Engine {
            core: Arc::new(EngineCore {
                config: self.config,
                store,
                dep_cache: DependencyCache::default(),
                env: Arc::new(env),
                warnings: Warnings::default(),
                routes: RwLock::new(routes),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::memory::MemoryResolver;

    #[tokio::test]
    async fn module_store_serves_cached_modules_until_touched() {
        let resolver = Arc::new(MemoryResolver::new());
        resolver.register("index.ts", Module::builder().build());
        let store = ModuleStore::new(resolver.clone());

        let url = ModuleUrl::new("index.ts");
        let first = store.load(&url).await.unwrap();
        let second = store.load(&url).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        resolver.register("index.ts", Module::builder().build());
        let third = store.load(&url).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn builder_requires_a_resolver() {
        assert!(Engine::builder(Config::default()).build().await.is_err());
    }

    #[test]
    fn warnings_fire_once() {
        let warnings = Warnings::default();
        warnings.warn_shared("first");
        warnings.warn_shared("second");
        assert!(warnings.shared.load(Ordering::SeqCst));
    }
}
