//! Defines dependency composition: invoking each discovered factory in chain
//! order and shallow-merging the returned maps, with two levels of
//! memoization keyed by file URL and modification time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::trace;

use crate::context::data::{Dependencies, FactoryContext};
use crate::engine::{ModuleStore, REMOTE_CACHE_TTL};
use crate::error::{HttpError, Result};
use crate::module::{Export, ModuleUrl};

struct FactoryEntry {
    deps: Dependencies,
    mtime: Option<i64>,
    fetched: Instant,
}

/// The two memo tables behind [`compose`]: whole composed maps keyed by the
/// full chain, and per-file factory results keyed by `(file, mtime)`.
///
/// Composed entries carry an async mutex so concurrent requests for the same
/// cold key serialize into a single build; factories therefore run at most
/// once per `(file, mtime)` even under racing requests.
#[derive(Default)]
pub(crate) struct DependencyCache {
    composed: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Dependencies>>>>>,
    factories: Mutex<HashMap<ModuleUrl, FactoryEntry>>,
}

impl DependencyCache {
    pub(crate) fn clear(&self) {
        self.composed.lock().unwrap().clear();
        self.factories.lock().unwrap().clear();
    }

    fn composed_cell(&self, key: &str) -> Arc<tokio::sync::Mutex<Option<Dependencies>>> {
        self.composed
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert_with(Default::default)
            .clone()
    }

    fn cached_factory(&self, file: &ModuleUrl, mtime: Option<i64>) -> Option<Dependencies> {
        let factories = self.factories.lock().unwrap();
        let entry = factories.get(file)?;

        let fresh = match (entry.mtime, mtime) {
            (Some(cached), Some(current)) => cached == current,
            _ => entry.fetched.elapsed() < REMOTE_CACHE_TTL,
        };
        fresh.then(|| entry.deps.clone())
    }

    fn store_factory(&self, file: &ModuleUrl, mtime: Option<i64>, deps: Dependencies) {
        self.factories.lock().unwrap().insert(
            file.clone(),
            FactoryEntry {
                deps,
                mtime,
                fetched: Instant::now(),
            },
        );
    }
}

/// Composes the dependency map for a chain of dependency files.
///
/// The seed merges first, then every factory's return in chain order, deeper
/// factories overriding shallower keys. For a fixed chain and unchanged
/// mtimes the composed map is served from cache and no factory runs again.
pub(crate) async fn compose(
    store: &ModuleStore,
    cache: &DependencyCache,
    files: &[ModuleUrl],
    shared_in_play: bool,
    seed: &Dependencies,
    factory_ctx: &FactoryContext,
) -> Result<Dependencies> {
    let mut mtimes = Vec::with_capacity(files.len());
    for file in files {
        mtimes.push(store.stat(file).await.and_then(|s| s.mtime));
    }

    let key = composed_key(files, &mtimes, shared_in_play);
    let cell = cache.composed_cell(&key);
    let mut slot = cell.lock().await;

    if let Some(composed) = slot.as_ref() {
        trace!(" composed dependencies served from cache");
        return Ok(composed.clone());
    }

    let mut composed = seed.clone();
    for (file, mtime) in files.iter().zip(&mtimes) {
        let deps = match cache.cached_factory(file, *mtime) {
            Some(deps) => deps,
            None => {
                let deps = run_factory(store, file, factory_ctx).await?;
                cache.store_factory(file, *mtime, deps.clone());
                deps
            }
        };
        composed.merge(deps);
    }

    *slot = Some(composed.clone());
    Ok(composed)
}

async fn run_factory(
    store: &ModuleStore,
    file: &ModuleUrl,
    factory_ctx: &FactoryContext,
) -> Result<Dependencies> {
    let module = store
        .load(file)
        .await
        .map_err(|e| HttpError::dependency_factory_failed(format!("{}: {}", file, e)))?;

    let factory = match module.first_of(&["dependencies", "shared", "default"]) {
        Some(Export::Dependencies(factory)) => factory.clone(),
        _ => return Err(HttpError::dependency_export_invalid(file.as_str())),
    };

    trace!(" running dependency factory {}", file);
    factory(factory_ctx.clone()).await.map_err(|e| {
        HttpError::dependency_factory_failed(format!("{}: {}", file, e.message))
    })
}

fn composed_key(files: &[ModuleUrl], mtimes: &[Option<i64>], shared_in_play: bool) -> String {
    let mut key = String::new();
    for (file, mtime) in files.iter().zip(mtimes) {
        key.push_str(file.as_str());
        key.push('@');
        match mtime {
            Some(mtime) => key.push_str(&mtime.to_string()),
            None => key.push('-'),
        }
        key.push('|');
    }
    if shared_in_play {
        key.push_str("#shared");
    }
    key
}
