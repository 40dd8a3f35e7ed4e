//! Host HTTP surface: routes `/<service>/...` to service handlers

use crate::config::GATEWAY_PREFIX;
use crate::error::{json_error_response, BoxError, GatewayBody, GatewayErrorCode};
use crate::process::ServiceRegistry;
use crate::proxy::ReverseProxy;
use crate::service::ServiceHandler;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Maps mount names to service handlers
pub struct GatewayRouter {
    registry: Arc<ServiceRegistry>,
    handlers: BTreeMap<String, ServiceHandler>,
}

impl GatewayRouter {
    pub fn new(registry: Arc<ServiceRegistry>, proxy: Arc<ReverseProxy>) -> Self {
        let handlers = registry
            .supervisors()
            .map(|(name, supervisor)| {
                (
                    name.clone(),
                    ServiceHandler::new(Arc::clone(supervisor), Arc::clone(&proxy)),
                )
            })
            .collect();
        Self { registry, handlers }
    }

    pub async fn route<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();
        let (mount, rest) = split_mount(&path);

        if mount == GATEWAY_PREFIX {
            return self.internal(rest);
        }

        let handler = match self.handlers.get(mount) {
            Some(handler) => handler,
            None => {
                debug!(path = %path, "No service mounted at path");
                return json_error_response(
                    GatewayErrorCode::UnknownService,
                    format!("No service mounted at '/{}'", mount),
                );
            }
        };

        let (mut parts, body) = req.into_parts();
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{}?{}", rest, query),
            None => rest.to_string(),
        };
        parts.uri = match Uri::builder().path_and_query(path_and_query).build() {
            Ok(uri) => uri,
            Err(e) => {
                error!(error = %e, "Failed to rewrite request path");
                return json_error_response(GatewayErrorCode::InternalError, "Invalid request path");
            }
        };

        handler.handle(Request::from_parts(parts, body), client_addr).await
    }

    /// Endpoints served by the gateway itself under `/_gateway`
    fn internal(&self, path: &str) -> Response<GatewayBody> {
        match path {
            "/health" => text_response(StatusCode::OK, "text/plain", "ok"),
            "/status" => match serde_json::to_string(&self.registry.statuses()) {
                Ok(json) => text_response(StatusCode::OK, "application/json", json),
                Err(e) => {
                    error!(error = %e, "Failed to serialize service status");
                    json_error_response(GatewayErrorCode::InternalError, "Failed to serialize status")
                }
            },
            _ => json_error_response(
                GatewayErrorCode::UnknownService,
                format!("Unknown gateway endpoint '{}'", path),
            ),
        }
    }
}

/// Split `/auth/user` into `("auth", "/user")`; an empty remainder becomes `/`
fn split_mount(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, "/"),
    }
}

fn text_response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Accept loop serving the router until shutdown is signalled
pub struct GatewayServer {
    bind_addr: SocketAddr,
    router: Arc<GatewayRouter>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<GatewayRouter>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<GatewayRouter>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, Infallible>(router.route(req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
