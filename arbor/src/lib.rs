//! Arbor &ndash; a file-system-routed web application server that promotes
//! convention, composition and speed.
//!
//! Routes are discovered from a directory tree: each route file serves the
//! URL its path spells, `[name]` directories bind path parameters, and
//! `[...name]` binds the remainder of a path. Around every route, ancestor
//! directories contribute `dependencies`, `middleware` and `interceptors`
//! modules which the engine assembles into an ordered, hierarchical pipeline
//! per request.
#![doc(html_root_url = "https://docs.rs/arbor/0.1.0")] // Update when changed in Cargo.toml
#![warn(missing_docs, deprecated)]
#![doc(test(no_crate_inject, attr(deny(warnings))))]

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handler;
pub mod helpers;
pub mod module;
pub mod pipeline;
pub mod prelude;
pub mod response;
pub mod router;
pub mod service;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use hyper::server::conn::Http;
use log::{info, trace};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

pub use crate::engine::{Engine, EngineBuilder};
use crate::service::ArborService;

/// Starts an Arbor application with the default number of threads.
pub fn start<A>(addr: A, engine: Engine)
where
    A: ToSocketAddrs + 'static,
{
    start_with_num_threads(addr, engine, num_cpus::get())
}

/// Starts an Arbor application with a designated number of threads.
pub fn start_with_num_threads<A>(addr: A, engine: Engine, threads: usize)
where
    A: ToSocketAddrs + 'static,
{
    let runtime = new_runtime(threads);
    if let Err(e) = runtime.block_on(init_server(addr, engine)) {
        panic!("server failed to start: {}", e);
    }
}

/// Returns a `Future` used to spawn an Arbor application on an existing
/// runtime.
///
/// This is used internally, but exposed in case the developer intends on
/// doing any manual wiring that isn't supported by the Arbor API. It's
/// mainly useful for shutdown handling.
pub async fn init_server<A>(addr: A, engine: Engine) -> anyhow::Result<()>
where
    A: ToSocketAddrs + 'static,
{
    let addr = resolve_addr(addr)?;
    let listener = TcpListener::bind(addr).await?;

    info!(
        target: "arbor::start",
        " Arbor listening on http://{}",
        addr
    );

    bind_server(listener, engine).await
}

async fn bind_server(listener: TcpListener, engine: Engine) -> anyhow::Result<()> {
    let protocol = Arc::new(Http::new());
    let arbor_service = ArborService::new(engine);

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let service = arbor_service.connect(peer_addr);
        let protocol = protocol.clone();

        tokio::spawn(async move {
            if let Err(e) = protocol.serve_connection(socket, service).await {
                trace!(" connection error: {}", e);
            }
        });
    }
}

fn new_runtime(threads: usize) -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name("arbor-worker")
        .enable_all()
        .build()
        .expect("unable to build tokio runtime")
}

fn resolve_addr<A: ToSocketAddrs>(addr: A) -> anyhow::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("unable to resolve listener address"))
}
