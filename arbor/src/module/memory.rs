//! An in-memory `ModuleResolver` backed by a registry of prebuilt modules.
//!
//! This is the compile-time module map: applications register a module per
//! route file path, and the engine resolves against the registry exactly as
//! it would against a remote loader. Registration bumps a monotonic mtime so
//! the engine's caches observe edits, which also makes the resolver a natural
//! fixture for invalidation tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::FutureExt;

use crate::module::{BoxFuture, Module, ModuleResolver, ModuleStat, ModuleUrl};

struct Registered {
    module: Arc<Module>,
    mtime: i64,
}

/// A registry of modules keyed by their routes-relative path.
#[derive(Default)]
pub struct MemoryResolver {
    modules: RwLock<HashMap<ModuleUrl, Registered>>,
    clock: AtomicI64,
}

impl MemoryResolver {
    /// Creates an empty registry.
    pub fn new() -> MemoryResolver {
        MemoryResolver::default()
    }

    /// Registers (or replaces) the module at `path`.
    pub fn register<S: AsRef<str>>(&self, path: S, module: Module) {
        let mtime = self.tick();
        self.modules.write().unwrap().insert(
            ModuleUrl::new(path),
            Registered {
                module: Arc::new(module),
                mtime,
            },
        );
    }

    /// Removes the module at `path`.
    pub fn remove<S: AsRef<str>>(&self, path: S) {
        self.modules.write().unwrap().remove(&ModuleUrl::new(path));
    }

    /// Bumps the mtime of the module at `path`, simulating an edit.
    pub fn touch<S: AsRef<str>>(&self, path: S) {
        let mtime = self.tick();
        if let Some(entry) = self.modules.write().unwrap().get_mut(&ModuleUrl::new(path)) {
            entry.mtime = mtime;
        }
    }

    /// Every registered path, in sorted order. Feed this to
    /// [`RouteTable::from_files`](crate::router::table::RouteTable::from_files).
    pub fn paths(&self) -> Vec<ModuleUrl> {
        let mut paths: Vec<ModuleUrl> =
            self.modules.read().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl ModuleResolver for MemoryResolver {
    fn can_handle(&self, url: &ModuleUrl) -> bool {
        self.modules.read().unwrap().contains_key(url)
    }

    fn resolve(&self, specifier: &str) -> anyhow::Result<ModuleUrl> {
        Ok(ModuleUrl::new(specifier))
    }

    fn import(&self, url: &ModuleUrl) -> BoxFuture<anyhow::Result<Arc<Module>>> {
        let result = match self.modules.read().unwrap().get(url) {
            Some(entry) => Ok(entry.module.clone()),
            None => Err(anyhow::anyhow!("module not found: {}", url)),
        };
        async move { result }.boxed()
    }

    fn stat(&self, url: &ModuleUrl) -> BoxFuture<anyhow::Result<ModuleStat>> {
        let stat = match self.modules.read().unwrap().get(url) {
            Some(entry) => ModuleStat {
                mtime: Some(entry.mtime),
                is_file: true,
            },
            None => ModuleStat {
                mtime: None,
                is_file: false,
            },
        };
        async move { Ok(stat) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registers_and_stats_modules() {
        let resolver = MemoryResolver::new();
        resolver.register("index.ts", Module::builder().build());

        let url = ModuleUrl::new("index.ts");
        assert!(resolver.can_handle(&url));

        let stat = resolver.stat(&url).await.unwrap();
        assert!(stat.is_file);
        let first = stat.mtime.unwrap();

        resolver.touch("index.ts");
        let stat = resolver.stat(&url).await.unwrap();
        assert!(stat.mtime.unwrap() > first);
    }

    #[tokio::test]
    async fn missing_modules_stat_as_absent() {
        let resolver = MemoryResolver::new();
        let url = ModuleUrl::new("nope.ts");

        assert!(!resolver.can_handle(&url));
        assert!(!resolver.stat(&url).await.unwrap().is_file);
        assert!(resolver.import(&url).await.is_err());
    }
}
