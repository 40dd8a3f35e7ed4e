//! Reverse proxy to supervised services
//!
//! Requests are copied explicitly: method, path and query, every header in
//! order, and the body as a stream. The only header the proxy adds is
//! `X-Forwarded-For`. Responses come back untouched. Redirects are never
//! followed and failed requests are never retried, since the upstream may have
//! already acted on a non-idempotent request.

use crate::config::ServiceConfig;
use crate::error::{json_error_response, BoxError, GatewayBody, GatewayErrorCode};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::HeaderValue;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Client address set by a trusted front proxy
const X_REAL_IP: &str = "x-real-ip";

/// Base URL of a supervised service, recomputed for every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    base_url: String,
}

impl ProxyTarget {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.base_url())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Upstream URL for an inbound path and query, appended verbatim
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }
}

/// Configuration for upstream connection reuse
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per service
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Forwards requests to a target over pooled HTTP/1.1 connections
pub struct ReverseProxy {
    client: Client<HttpConnector, GatewayBody>,
}

impl ReverseProxy {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .retry_canceled_requests(false)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Reverse proxy client initialized"
        );

        Self { client }
    }

    /// Forward `req` to `target` and return the upstream response, or a
    /// gateway error if the upstream could not be reached in time.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        target: &ProxyTarget,
        client_addr: SocketAddr,
        timeout: Duration,
    ) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = target.url_for(path);

        let uri: Uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                error!(url, error = %e, "Failed to build upstream URI");
                return json_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    "Could not construct upstream request",
                );
            }
        };

        let forwarded_for = forwarded_for(&parts.headers, client_addr);
        let method = parts.method;

        let mut upstream_req: Request<GatewayBody> =
            Request::new(body.map_err(Into::into).boxed());
        *upstream_req.method_mut() = method.clone();
        *upstream_req.uri_mut() = uri;
        *upstream_req.headers_mut() = parts.headers;
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            upstream_req.headers_mut().insert(X_FORWARDED_FOR, value);
        }

        debug!(%method, url, forwarded_for, "Forwarding request");

        match tokio::time::timeout(timeout, self.client.request(upstream_req)).await {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.map_err(Into::into).boxed())
            }
            Ok(Err(e)) => {
                error!(%method, url, error = %e, "Upstream request failed");
                json_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    "Failed to reach upstream service",
                )
            }
            Err(_) => {
                warn!(%method, url, timeout_ms = timeout.as_millis(), "Upstream request timed out");
                json_error_response(
                    GatewayErrorCode::RequestTimeout,
                    format!("Upstream did not respond within {}ms", timeout.as_millis()),
                )
            }
        }
    }
}

/// Client address for `X-Forwarded-For`: the trusted `X-Real-IP` header if
/// present, otherwise the address of the connected peer
fn forwarded_for(headers: &hyper::HeaderMap, client_addr: SocketAddr) -> String {
    headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| client_addr.ip().to_string())
}
