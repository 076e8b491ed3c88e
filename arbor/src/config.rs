//! The configuration surface recognized by the engine.
//!
//! Loading configuration from disk is the embedding application's concern;
//! every section here derives `Deserialize` with defaults so a partial
//! document maps cleanly onto a full `Config`.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// Root configuration for an engine instance.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Route discovery and matching options.
    pub routing: RoutingConfig,
    /// Logging options.
    pub logging: LoggingConfig,
    /// Compatibility switches for older route trees.
    pub compatibility: CompatibilityConfig,
    /// Runtime options.
    pub runtime: RuntimeConfig,
    /// Response security options.
    pub security: SecurityConfig,
    /// When set, 500 bodies include the error message and captured stack.
    pub debug: bool,
}

/// Options controlling route discovery and matching.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Directory scanned for route files, relative to the working directory.
    pub routes_dir: String,
    /// Trailing-slash matching policy.
    pub trailing_slash: TrailingSlash,
    /// When the route table is built.
    pub discovery: Discovery,
}

impl Default for RoutingConfig {
    fn default() -> RoutingConfig {
        RoutingConfig {
            routes_dir: "routes".into(),
            trailing_slash: TrailingSlash::Preserve,
            discovery: Discovery::Eager,
        }
    }
}

/// Policy applied uniformly when matching request paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingSlash {
    /// Exact matching. A trailing slash on a non-root path matches nothing.
    Preserve,
    /// `/users/` matches the same route as `/users`.
    Strip,
    /// Both forms are accepted and treated as equivalent.
    Add,
}

/// When the route table is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discovery {
    /// All routes enumerated at engine construction.
    Eager,
    /// Enumerated on the first matching request.
    Lazy,
}

/// Options controlling request logging.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Header used to carry the request id, copied in and echoed back out.
    pub request_id_header: String,
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            request_id_header: "x-request-id".into(),
        }
    }
}

/// Switches preserving behavior of older route trees.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompatibilityConfig {
    /// How middleware exports are invoked.
    pub middleware_mode: MiddlewareMode,
    /// Pass a request-shaped map in place of `data` to middlewares, and fold
    /// a returned `params` patch into `data`.
    pub use_middleware_request: bool,
    /// How handler exports are invoked.
    pub handler_mode: HandlerMode,
    /// Gates the deprecated `shared` pipeline files. `Some(true)` probes them
    /// (with a warning); `Some(false)` additionally withholds the `env`
    /// injection from dependency factories.
    pub allow_shared: Option<bool>,
}

impl Default for CompatibilityConfig {
    fn default() -> CompatibilityConfig {
        CompatibilityConfig {
            middleware_mode: MiddlewareMode::Default,
            use_middleware_request: false,
            handler_mode: HandlerMode::Default,
            allow_shared: None,
        }
    }
}

/// How middleware exports are invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiddlewareMode {
    /// Call the export with `(data, context)`.
    Default,
    /// Deprecated binding mode; behaves as `default`.
    This,
    /// The export is a factory over the composed dependencies and must
    /// produce a middleware function.
    Factory,
    /// Deprecated binding mode; behaves as `default`.
    Assign,
}

/// How handler exports are invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerMode {
    /// Call the export with `(data, context)`.
    Default,
    /// Deprecated binding mode; behaves as `default`.
    This,
    /// The export is a factory over the composed dependencies and must
    /// produce a handler function.
    Factory,
}

/// Options applied while composing and running pipelines.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Dependency composition settings.
    pub dependencies: DependencySettings,
}

/// Seed values and merge policy for dependency composition.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DependencySettings {
    /// Merged into the dependency map before any factory runs.
    pub initial: serde_json::Map<String, Value>,
    /// Merge policy for factory returns.
    pub merge: MergeMode,
}

impl Default for DependencySettings {
    fn default() -> DependencySettings {
        DependencySettings {
            initial: serde_json::Map::new(),
            merge: MergeMode::Shallow,
        }
    }
}

/// Merge policy for dependency maps. Only shallow merging is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Last write wins, one level deep.
    Shallow,
}

/// Headers and policies applied at response commit.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityConfig {
    /// CORS headers, applied when configured.
    pub cors: Option<CorsConfig>,
    /// Injected at response commit unless the handler already set them.
    pub default_headers: HashMap<String, String>,
    /// Header names redacted from request logs.
    pub scrub_headers: Vec<String>,
}

/// CORS headers applied at response commit.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CorsConfig {
    /// Value for `Access-Control-Allow-Origin`.
    pub allow_origin: String,
    /// Values for `Access-Control-Allow-Methods`.
    pub allow_methods: Vec<String>,
    /// Values for `Access-Control-Allow-Headers`.
    pub allow_headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> CorsConfig {
        CorsConfig {
            allow_origin: "*".into(),
            allow_methods: Vec::new(),
            allow_headers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_deserializes() {
        let config: Config = serde_json::from_str(
            r#"{
                "routing": {"routesDir": "api", "trailingSlash": "strip"},
                "compatibility": {"middlewareMode": "factory"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.routing.routes_dir, "api");
        assert_eq!(config.routing.trailing_slash, TrailingSlash::Strip);
        assert_eq!(config.routing.discovery, Discovery::Eager);
        assert_eq!(config.compatibility.middleware_mode, MiddlewareMode::Factory);
        assert_eq!(config.logging.request_id_header, "x-request-id");
        assert!(!config.debug);
    }

    #[test]
    fn merge_mode_rejects_unsupported_values() {
        let parsed: std::result::Result<Config, _> = serde_json::from_str(
            r#"{"runtime": {"dependencies": {"merge": "deep"}}}"#,
        );
        assert!(parsed.is_err());
    }
}
