//! Tests on-disk route discovery against a scratch routes directory.

use std::fs;
use std::sync::Arc;

use hyper::{Body, Method, Request, StatusCode};
use serde_json::json;

use arbor::config::Discovery;
use arbor::prelude::*;

fn write(root: &std::path::Path, relative: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "export {}\n").unwrap();
}

#[test]
fn scan_discovers_routes_in_specificity_order() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    write(root, "index.ts");
    write(root, "middleware.ts");
    write(root, "users/index.ts");
    write(root, "users/[id].ts");
    write(root, "users/me.ts");
    write(root, "docs/[...slug].ts");
    write(root, "notes.md");
    write(root, ".hidden/secret.ts");

    let config = Config::default();
    let table = RouteTable::scan(root, &config.routing).unwrap();
    let patterns: Vec<&str> = table.routes().iter().map(|e| e.pattern.as_str()).collect();

    // Longer literal prefixes sort first within a parameter count; catch-alls
    // sort after plain parameters.
    assert_eq!(
        patterns,
        vec!["/users/me", "/users", "/", "/users/[id]", "/docs/[...slug]"]
    );
}

#[tokio::test]
async fn lazy_engines_scan_on_first_request() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "ping.ts");

    // The filesystem provides the route shape; the resolver provides the
    // executable modules for the discovered paths.
    let resolver = Arc::new(MemoryResolver::new());
    resolver.register(
        "ping.ts",
        Module::builder()
            .handler(Method::GET, |_data, _ctx| async {
                Ok(json!({"pong": true}).into())
            })
            .build(),
    );

    let mut config = Config::default();
    config.routing.routes_dir = root.to_string_lossy().into_owned();
    config.routing.discovery = Discovery::Lazy;

    let engine = Engine::builder(config)
        .resolver(resolver)
        .build()
        .await
        .unwrap();

    let req = Request::builder()
        .method(Method::GET)
        .uri("http://example.com/ping")
        .body(Body::empty())
        .unwrap();
    let response = engine.dispatch(req).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["pong"], true);
}

#[tokio::test]
async fn build_resolves_declared_methods() {
    let resolver = Arc::new(MemoryResolver::new());
    resolver.register(
        "items.ts",
        Module::builder()
            .handler(Method::GET, |_data, _ctx| async { Ok(json!([]).into()) })
            .handler(Method::POST, |_data, _ctx| async { Ok(json!({}).into()) })
            .build(),
    );

    let config = Config::default();
    let routes = RouteTable::from_files(resolver.paths(), &config.routing);
    let engine = Engine::builder(config)
        .resolver(resolver)
        .routes(routes)
        .build()
        .await
        .unwrap();

    let routes = engine.routes().await.unwrap();
    let items = routes.iter().find(|e| e.pattern == "/items").unwrap();
    assert!(items.methods.contains(&Method::GET));
    assert!(items.methods.contains(&Method::POST));
    assert_eq!(items.methods.len(), 2);
    assert!(!items.default_handler);
}
