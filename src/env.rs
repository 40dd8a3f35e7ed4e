//! Environment for supervised service processes
//!
//! Maps a [`ServiceConfig`] onto the variables the auth service binary reads.
//! The binary has renamed several settings over its releases, so both the
//! legacy and the current spelling are emitted for those. Fields left empty
//! (or zero) produce no variable at all so the binary keeps its own default.

use crate::config::ServiceConfig;
use std::ffi::OsString;

/// Environment handed to a service process
#[derive(Debug, Clone, Default)]
pub struct ServiceEnvironment {
    /// `KEY=VALUE` entries built from the ambient env and the config
    pub vars: Vec<String>,
    /// Inherited entries that are not valid UTF-8, passed through unchanged
    pub passthrough: Vec<(OsString, OsString)>,
}

/// Build the environment for a service from the current process environment
pub fn service_environment(config: &ServiceConfig) -> ServiceEnvironment {
    let (ambient, passthrough) = split_ambient(std::env::vars_os());
    ServiceEnvironment {
        vars: build_environment(config, ambient),
        passthrough,
    }
}

/// Separate variables representable as `String` from those that are not
pub fn split_ambient<I>(vars: I) -> (Vec<(String, String)>, Vec<(OsString, OsString)>)
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut utf8 = Vec::new();
    let mut other = Vec::new();
    for (key, value) in vars {
        match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => utf8.push((key, value)),
            (key, value) => other.push((
                key.map(OsString::from).unwrap_or_else(|k| k),
                value.map(OsString::from).unwrap_or_else(|v| v),
            )),
        }
    }
    (utf8, other)
}

/// Build the `KEY=VALUE` environment for a service on top of `ambient`.
///
/// Inherited variables keep their position; a configured value for an
/// inherited key replaces it in place, new keys are appended.
pub fn build_environment<I>(config: &ServiceConfig, ambient: I) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut vars = EnvList {
        entries: ambient.into_iter().collect(),
    };

    if !config.database_url.is_empty() {
        vars.set("DATABASE_URL", &config.database_url);
        vars.set("GOTRUE_DB_DATABASE_URL", &config.database_url);
        vars.set("GOTRUE_DB_DRIVER", "postgres");
    }
    vars.set_both("GOTRUE_JWT_SECRET", "JWT_SECRET", &config.jwt_secret);
    vars.set_both("GOTRUE_SITE_URL", "SITE_URL", &config.site_url);
    vars.set_both("API_EXTERNAL_URL", "GOTRUE_API_EXTERNAL_URL", &config.external_url);
    vars.set_nonempty("GOTRUE_API_HOST", &config.host);
    if config.port > 0 {
        let port = config.port.to_string();
        vars.set("PORT", &port);
        vars.set("GOTRUE_API_PORT", &port);
    }
    vars.set_both("GOTRUE_LOG_LEVEL", "LOG_LEVEL", &config.log_level);
    if config.db_max_retries > 0 {
        vars.set("GOTRUE_DB_MAX_RETRIES", &config.db_max_retries.to_string());
    }
    vars.set_nonempty("GOTRUE_DB_MIGRATIONS_PATH", &config.migrations_path);

    let smtp = &config.smtp;
    vars.set_nonempty("GOTRUE_SMTP_HOST", &smtp.host);
    if smtp.port > 0 {
        vars.set("GOTRUE_SMTP_PORT", &smtp.port.to_string());
    }
    vars.set_nonempty("GOTRUE_SMTP_USER", &smtp.user);
    vars.set_nonempty("GOTRUE_SMTP_PASS", &smtp.password);
    vars.set_nonempty("GOTRUE_SMTP_ADMIN_EMAIL", &smtp.admin_email);
    vars.set_nonempty("GOTRUE_SMTP_SENDER_NAME", &smtp.sender_name);
    if smtp.autoconfirm {
        vars.set("GOTRUE_MAILER_AUTOCONFIRM", "true");
    }

    for (key, value) in &config.env {
        vars.set_nonempty(key, value);
    }

    vars.entries
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

struct EnvList {
    entries: Vec<(String, String)>,
}

impl EnvList {
    fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    fn set_nonempty(&mut self, key: &str, value: &str) {
        if !value.is_empty() {
            self.set(key, value);
        }
    }

    fn set_both(&mut self, current: &str, legacy: &str, value: &str) {
        self.set_nonempty(current, value);
        self.set_nonempty(legacy, value);
    }
}
