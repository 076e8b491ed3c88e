//! Defines the `ArborService` type which is used to wrap an engine and
//! interface with Hyper.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::service::Service;
use hyper::{Body, Request, Response};

use crate::engine::Engine;

/// Wraps an [`Engine`] for serving requests. Connections are bound to
/// [`ConnectedArborService`] values carrying the peer address.
pub struct ArborService {
    engine: Engine,
}

impl ArborService {
    /// Wraps an engine.
    pub fn new(engine: Engine) -> ArborService {
        ArborService { engine }
    }

    /// Binds the service to a connected client.
    pub fn connect(&self, client_addr: SocketAddr) -> ConnectedArborService {
        ConnectedArborService {
            engine: self.engine.clone(),
            client_addr,
        }
    }
}

/// An `ArborService` which has been connected to a client. The major
/// difference is that a `client_addr` has been assigned (as this isn't
/// available from Hyper).
pub struct ConnectedArborService {
    engine: Engine,
    client_addr: SocketAddr,
}

impl Service<Request<Body>> for ConnectedArborService {
    type Response = Response<Body>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let engine = self.engine.clone();
        let client_addr = self.client_addr;
        Box::pin(async move { Ok(engine.dispatch_from(req, Some(client_addr)).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hyper::{Method, StatusCode};
    use std::sync::Arc;

    use crate::config::Config;
    use crate::module::memory::MemoryResolver;
    use crate::module::Module;
    use crate::router::table::RouteTable;

    #[tokio::test]
    async fn serves_through_the_hyper_service_interface() {
        let resolver = Arc::new(MemoryResolver::new());
        resolver.register(
            "index.ts",
            Module::builder()
                .handler(Method::GET, |_data, _ctx| async {
                    Ok(serde_json::json!({"ok": true}).into())
                })
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

        let service = ArborService::new(engine);
        let mut connected = service.connect("127.0.0.1:10000".parse().unwrap());

        let req = Request::get("http://localhost/")
            .body(Body::empty())
            .unwrap();
        let response = connected.call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
