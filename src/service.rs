//! Health-gated request handler for one supervised service

use crate::error::{json_error_response, BoxError, GatewayBody, GatewayErrorCode};
use crate::process::ServiceSupervisor;
use crate::proxy::{ProxyTarget, ReverseProxy};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Forwards requests to a service only while it is running and ready
#[derive(Clone)]
pub struct ServiceHandler {
    supervisor: Arc<ServiceSupervisor>,
    proxy: Arc<ReverseProxy>,
}

impl ServiceHandler {
    pub fn new(supervisor: Arc<ServiceSupervisor>, proxy: Arc<ReverseProxy>) -> Self {
        Self { supervisor, proxy }
    }

    /// Readiness and target are re-read for every request, so a service that
    /// stops or moves to a new port is picked up by the next call.
    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let config = self.supervisor.config();

        if !self.supervisor.is_running() {
            debug!(service = %config.name, uri = %req.uri(), "Rejecting request, service not ready");
            return json_error_response(
                GatewayErrorCode::ServiceNotReady,
                format!("Service '{}' is not ready", config.name),
            );
        }

        let target = ProxyTarget::from_config(&config);
        self.proxy
            .forward(req, &target, client_addr, config.request_timeout)
            .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::proxy::PoolConfig;
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use hyper_util::rt::TokioIo;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Upstream answering every path with 200 and counting requests
    async fn counting_upstream() -> (u16, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        if req.uri().path() != "/health" {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                        let port_body = format!("served {}", req.uri().path());
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                Response::new(Full::new(Bytes::from(port_body))),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (port, hits)
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn config(port: u16) -> ServiceConfig {
        let mut config = ServiceConfig::new("auth", "sleep", port);
        config.args = vec!["60".to_string()];
        config.poll_interval = Duration::from_millis(20);
        config.max_attempts = 50;
        config
    }

    fn request(path: &str) -> Request<Empty<Bytes>> {
        Request::builder().uri(path).body(Empty::new()).unwrap()
    }

    async fn wait_ready(supervisor: &ServiceSupervisor) {
        for _ in 0..200 {
            if supervisor.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("service never became ready");
    }

    #[tokio::test]
    async fn test_rejects_before_start_without_contacting_upstream() {
        let (port, hits) = counting_upstream().await;
        let supervisor = ServiceSupervisor::new(config(port));
        let handler = ServiceHandler::new(supervisor, Arc::new(ReverseProxy::new(PoolConfig::default())));

        let response = handler.handle(request("/user"), client_addr()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("x-gateway-error").unwrap(),
            "SERVICE_NOT_READY"
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_forwards_when_ready_and_rejects_after_stop() {
        let (port, hits) = counting_upstream().await;
        let supervisor = ServiceSupervisor::new(config(port));
        let handler = ServiceHandler::new(
            Arc::clone(&supervisor),
            Arc::new(ReverseProxy::new(PoolConfig::default())),
        );

        supervisor.start().unwrap();
        wait_ready(&supervisor).await;

        let response = handler.handle(request("/settings"), client_addr()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"served /settings");

        supervisor.stop();
        let response = handler.handle(request("/settings"), client_addr()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_target_follows_reconfiguration() {
        let (first_port, first_hits) = counting_upstream().await;
        let (second_port, second_hits) = counting_upstream().await;
        let supervisor = ServiceSupervisor::new(config(first_port));
        let handler = ServiceHandler::new(
            Arc::clone(&supervisor),
            Arc::new(ReverseProxy::new(PoolConfig::default())),
        );

        supervisor.start().unwrap();
        wait_ready(&supervisor).await;
        handler.handle(request("/a"), client_addr()).await;

        supervisor.stop();
        supervisor.reconfigure(config(second_port)).unwrap();
        supervisor.start().unwrap();
        wait_ready(&supervisor).await;
        handler.handle(request("/b"), client_addr()).await;

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        supervisor.stop();
    }
}
