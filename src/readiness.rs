//! Readiness polling for supervised services
//!
//! A poller probes the service's health endpoint on a fixed interval. The
//! first 2xx response makes the service ready. Running out of attempts is
//! not an error: the service simply stays not-ready until it is restarted.

use crate::config::ServiceConfig;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Readiness phase of a service, as reported by the status API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessPhase {
    /// No process is running
    Stopped,
    /// Probing the health endpoint
    Polling,
    /// Health endpoint answered with 2xx
    Ready,
    /// Attempt budget used up without a successful probe
    Exhausted,
}

/// How a polling run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    Exhausted { attempts: u32 },
    Cancelled,
}

/// Single-shot HTTP health checks with a short timeout
#[derive(Clone)]
pub struct HealthProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .build(connector);

        Self { client, timeout }
    }

    /// True if `url` answers with a 2xx status within the timeout
    pub async fn check(&self, url: &str) -> bool {
        let req = match Request::builder()
            .method("GET")
            .uri(url)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                debug!(url, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                debug!(url, timeout_ms = self.timeout.as_millis(), "Health probe timed out");
                false
            }
        }
    }
}

/// Polls one service's health endpoint until ready, exhausted or cancelled
pub struct ReadinessPoller {
    service: String,
    url: String,
    interval: Duration,
    max_attempts: u32,
    probe: HealthProbe,
}

impl ReadinessPoller {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            service: config.name.clone(),
            url: config.health_url(),
            interval: config.poll_interval,
            max_attempts: config.max_attempts,
            probe: HealthProbe::new(config.probe_timeout),
        }
    }

    /// Probe immediately, then once per interval, up to `max_attempts` probes.
    ///
    /// The last success or failure lands no later than
    /// `max_attempts × interval` after the call (plus one probe timeout).
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> PollOutcome {
        debug!(service = %self.service, url = %self.url, "Starting readiness polling");

        let mut attempts = 0;
        loop {
            attempts += 1;

            let healthy = tokio::select! {
                healthy = self.probe.check(&self.url) => healthy,
                _ = cancelled(&mut cancel) => return PollOutcome::Cancelled,
            };

            if healthy {
                info!(service = %self.service, attempts, "Service passed readiness check");
                return PollOutcome::Ready { attempts };
            }

            debug!(service = %self.service, attempts, max_attempts = self.max_attempts, "Service not ready yet");

            if attempts >= self.max_attempts {
                warn!(
                    service = %self.service,
                    attempts,
                    url = %self.url,
                    "Readiness attempts exhausted, service stays unavailable until restarted"
                );
                return PollOutcome::Exhausted { attempts };
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancelled(&mut cancel) => return PollOutcome::Cancelled,
            }
        }
    }
}

/// Resolves once the cancel flag is set or its sender is gone
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}
