//! Defines discovery of the pipeline files contributing to a route: the walk
//! from the routes root down to the route's directory, probing each level for
//! `dependencies`, `middleware`, `interceptors` and (optionally) `shared`
//! modules.

use log::{trace, warn};

use crate::engine::{ModuleStore, Warnings};
use crate::module::{Export, Module, ModuleUrl};
use crate::router::table::MODULE_EXTENSIONS;

/// The pipeline files discovered for a route, each list in root-to-leaf
/// order. A deeper level only ever appends; it cannot reorder what shallower
/// levels contributed.
#[derive(Clone, Debug, Default)]
pub struct PipelineFiles {
    /// Dependency factories, outermost first.
    pub dependency_files: Vec<ModuleUrl>,
    /// Middlewares, outermost first.
    pub middleware_files: Vec<ModuleUrl>,
    /// Interceptor modules, outermost first.
    pub interceptor_files: Vec<ModuleUrl>,
    /// Deprecated `shared` modules, outermost first. Empty unless enabled.
    pub shared_files: Vec<ModuleUrl>,
    /// Dependency and shared files interleaved per level, the order factories
    /// actually run in.
    pub(crate) composition_files: Vec<ModuleUrl>,
}

enum Probe {
    Dependencies,
    Middleware,
    Interceptors,
    Shared,
}

impl Probe {
    fn basename(&self) -> &'static str {
        match self {
            Probe::Dependencies => "dependencies",
            Probe::Middleware => "middleware",
            Probe::Interceptors => "interceptors",
            Probe::Shared => "shared",
        }
    }

    /// Whether an imported module carries a usable export for this probe.
    /// Dependency-like probes accept any export under their names; a
    /// non-callable one is a hard error later, at composition time.
    fn usable(&self, module: &Module) -> bool {
        match self {
            Probe::Dependencies => module.first_of(&["dependencies", "default"]).is_some(),
            Probe::Shared => module
                .first_of(&["shared", "dependencies", "default"])
                .is_some(),
            Probe::Middleware => matches!(
                module.first_of(&["middleware", "default"]),
                Some(Export::Middleware(_)) | Some(Export::MiddlewareFactory(_))
            ),
            Probe::Interceptors => {
                matches!(module.get("beforeRun"), Some(Export::Before(_)))
                    || matches!(module.get("afterRun"), Some(Export::After(_)))
            }
        }
    }
}

/// Walks the ancestor chain of a route file, outermost level first, probing
/// each level for the recognized pipeline files.
pub(crate) async fn discover(
    store: &ModuleStore,
    route_file: &ModuleUrl,
    allow_shared: bool,
    warnings: &Warnings,
) -> PipelineFiles {
    let mut files = PipelineFiles::default();

    for level in levels(route_file) {
        let deps = probe_level(store, &level, Probe::Dependencies).await;
        let shared = if allow_shared {
            probe_level(store, &level, Probe::Shared).await
        } else {
            Vec::new()
        };

        if !shared.is_empty() {
            warnings.warn_shared(
                "`shared` pipeline files are deprecated; move factories to `dependencies`",
            );
        }

        files.composition_files.extend(deps.iter().cloned());
        files.composition_files.extend(shared.iter().cloned());
        files.dependency_files.extend(deps);
        files.shared_files.extend(shared);

        files
            .middleware_files
            .extend(probe_level(store, &level, Probe::Middleware).await);
        files
            .interceptor_files
            .extend(probe_level(store, &level, Probe::Interceptors).await);
    }

    trace!(
        " pipeline for {}: {} dependency, {} middleware, {} interceptor file(s)",
        route_file,
        files.dependency_files.len(),
        files.middleware_files.len(),
        files.interceptor_files.len()
    );

    files
}

/// The directory levels from the routes root down to the route's directory.
fn levels(route_file: &ModuleUrl) -> Vec<String> {
    let mut levels = vec![String::new()];
    let directory = route_file.directory();

    if !directory.is_empty() {
        let mut prefix = String::new();
        for component in directory.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            levels.push(prefix.clone());
        }
    }

    levels
}

/// Probes one level for one basename. Both extension alternates are checked,
/// `.ts` before `.js`, and both participate when both exist.
async fn probe_level(store: &ModuleStore, level: &str, probe: Probe) -> Vec<ModuleUrl> {
    let mut found = Vec::new();

    for ext in &MODULE_EXTENSIONS {
        let path = if level.is_empty() {
            format!("{}.{}", probe.basename(), ext)
        } else {
            format!("{}/{}.{}", level, probe.basename(), ext)
        };
        let url = ModuleUrl::new(path);

        if store.stat(&url).await.is_none() {
            continue;
        }

        match store.load(&url).await {
            Ok(module) if probe.usable(&module) => found.push(url),
            Ok(_) => trace!(" {} has no usable {} export", url, probe.basename()),
            Err(e) => warn!(" skipping unimportable pipeline file {}: {}", url, e),
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_walk_root_to_leaf() {
        assert_eq!(levels(&ModuleUrl::new("index.ts")), vec![String::new()]);
        assert_eq!(
            levels(&ModuleUrl::new("a/b/c.ts")),
            vec!["".to_string(), "a".to_string(), "a/b".to_string()]
        );
    }
}
