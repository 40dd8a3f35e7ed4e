//! Tandemgate - a subprocess supervisor with a health-gated reverse proxy
//!
//! This library lets a host application run companion services as child
//! processes and expose them over HTTP:
//! - Locates service binaries in project, system and `PATH` directories
//! - Builds each service's environment from typed configuration
//! - Spawns and supervises the processes, relaying their output to `tracing`
//! - Polls health endpoints and only marks a service ready after a 2xx answer
//! - Proxies requests to ready services and answers 503 for the rest

pub mod config;
pub mod env;
pub mod error;
pub mod locator;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod server;
pub mod service;

/// Package name, used in the startup banner
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version, used in the startup banner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
