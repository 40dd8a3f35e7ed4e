use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path prefix reserved for the gateway's own endpoints
pub const GATEWAY_PREFIX: &str = "_gateway";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Default settings shared by all services
    #[serde(default)]
    pub defaults: ServiceDefaults,

    /// Supervised services keyed by mount name
    #[serde(default)]
    pub services: HashMap<String, ServiceEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8000, env fallback: TANDEMGATE_PORT)
    pub port: Option<u16>,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle upstream connections per service (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_LISTEN_PORT)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceDefaults {
    /// Default health endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Delay between readiness probes in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Number of failed probes before readiness polling gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout for a single readiness probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Timeout for a proxied request in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            health_path: default_health_path(),
            poll_interval_ms: default_poll_interval(),
            max_attempts: default_max_attempts(),
            probe_timeout_ms: default_probe_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Mail relay settings handed to the auth service
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Sender address
    #[serde(default)]
    pub admin_email: String,
    #[serde(default)]
    pub sender_name: String,
    /// Confirm sign-ups without sending mail
    #[serde(default)]
    pub autoconfirm: bool,
}

/// A `[services.<name>]` table as written in the config file
///
/// # Security Warning
///
/// `binary` and `args` are executed directly. Configuration files must be
/// protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceEntry {
    /// Binary name or path to execute
    #[serde(default)]
    pub binary: String,

    #[serde(default)]
    pub args: Vec<String>,

    pub working_dir: Option<String>,

    /// Extra directories searched for the binary before system locations
    #[serde(default)]
    pub search_dirs: Vec<String>,

    /// Host the service listens on (default: 127.0.0.1)
    #[serde(default)]
    pub host: String,

    /// Port the service listens on
    #[serde(default)]
    pub port: u16,

    /// Connection string of the database the service fronts
    #[serde(default)]
    pub database_url: String,

    #[serde(default)]
    pub jwt_secret: String,

    #[serde(default)]
    pub site_url: String,

    /// Externally reachable URL of the service
    #[serde(default)]
    pub external_url: String,

    #[serde(default)]
    pub log_level: String,

    pub db_max_retries: Option<u32>,

    #[serde(default)]
    pub migrations_path: String,

    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Additional environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Health check endpoint path (overrides default)
    pub health_path: Option<String>,

    /// Readiness poll interval in milliseconds (overrides default)
    pub poll_interval_ms: Option<u64>,

    /// Readiness attempt budget (overrides default)
    pub max_attempts: Option<u32>,

    /// Readiness probe timeout in milliseconds (overrides default)
    pub probe_timeout_ms: Option<u64>,

    /// Proxied request timeout in seconds (overrides default)
    pub request_timeout_secs: Option<u64>,
}

impl ServiceEntry {
    /// Create an entry for a binary listening on a port
    pub fn new(binary: &str, port: u16) -> Self {
        Self {
            binary: binary.to_string(),
            port,
            ..Self::default()
        }
    }

    pub fn health_path<'a>(&'a self, defaults: &'a ServiceDefaults) -> &'a str {
        self.health_path.as_deref().unwrap_or(&defaults.health_path)
    }

    pub fn poll_interval(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(defaults.poll_interval_ms))
    }

    pub fn max_attempts(&self, defaults: &ServiceDefaults) -> u32 {
        self.max_attempts.unwrap_or(defaults.max_attempts)
    }

    pub fn probe_timeout(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.unwrap_or(defaults.probe_timeout_ms))
    }

    pub fn request_timeout(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
        )
    }

    /// Fill empty fields from `<PREFIX>_<FIELD>` variables
    fn apply_env_fallback<F>(&mut self, prefix: &str, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |field: &str| {
            lookup(&format!("{}_{}", prefix, field)).filter(|v| !v.is_empty())
        };

        let strings: [(&str, &mut String); 13] = [
            ("BINARY", &mut self.binary),
            ("HOST", &mut self.host),
            ("DATABASE_URL", &mut self.database_url),
            ("JWT_SECRET", &mut self.jwt_secret),
            ("SITE_URL", &mut self.site_url),
            ("EXTERNAL_URL", &mut self.external_url),
            ("LOG_LEVEL", &mut self.log_level),
            ("MIGRATIONS_PATH", &mut self.migrations_path),
            ("SMTP_HOST", &mut self.smtp.host),
            ("SMTP_USER", &mut self.smtp.user),
            ("SMTP_PASS", &mut self.smtp.password),
            ("SMTP_ADMIN_EMAIL", &mut self.smtp.admin_email),
            ("SMTP_SENDER_NAME", &mut self.smtp.sender_name),
        ];
        for (field, slot) in strings {
            if slot.is_empty() {
                if let Some(value) = var(field) {
                    *slot = value;
                }
            }
        }

        if self.port == 0 {
            if let Some(port) = var("PORT").and_then(|v| v.parse().ok()) {
                self.port = port;
            }
        }
        if self.smtp.port == 0 {
            if let Some(port) = var("SMTP_PORT").and_then(|v| v.parse().ok()) {
                self.smtp.port = port;
            }
        }
        if self.db_max_retries.is_none() {
            self.db_max_retries = var("DB_MAX_RETRIES").and_then(|v| v.parse().ok());
        }
    }

    /// Validate the service entry
    pub fn validate(&self, name: &str, defaults: &ServiceDefaults) -> Result<(), String> {
        if !is_valid_service_name(name) {
            return Err(format!(
                "Service '{}': name must be non-empty and contain only letters, digits, '-' or '_', and not start with '_'",
                name
            ));
        }

        if self.binary.is_empty() {
            return Err(format!("Service '{}': 'binary' is required", name));
        }

        if self.port == 0 {
            return Err(format!(
                "Service '{}': 'port' must be greater than 0",
                name
            ));
        }

        if !self.health_path(defaults).starts_with('/') {
            return Err(format!(
                "Service '{}': 'health_path' must start with '/'",
                name
            ));
        }

        if self.max_attempts(defaults) == 0 {
            return Err(format!(
                "Service '{}': 'max_attempts' must be greater than 0",
                name
            ));
        }

        Ok(())
    }

    /// Produce the immutable runtime description of this service
    pub fn resolve(&self, name: &str, defaults: &ServiceDefaults) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            binary: self.binary.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.as_ref().map(PathBuf::from),
            search_dirs: self.search_dirs.iter().map(PathBuf::from).collect(),
            host: self.host.clone(),
            port: self.port,
            database_url: self.database_url.clone(),
            jwt_secret: self.jwt_secret.clone(),
            site_url: self.site_url.clone(),
            external_url: self.external_url.clone(),
            log_level: self.log_level.clone(),
            db_max_retries: self.db_max_retries.unwrap_or(0),
            migrations_path: self.migrations_path.clone(),
            smtp: self.smtp.clone(),
            env: self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            health_path: self.health_path(defaults).to_string(),
            poll_interval: self.poll_interval(defaults),
            max_attempts: self.max_attempts(defaults),
            probe_timeout: self.probe_timeout(defaults),
            request_timeout: self.request_timeout(defaults),
        }
    }
}

/// Immutable description of how to supervise one subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    pub binary: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub search_dirs: Vec<PathBuf>,
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub site_url: String,
    pub external_url: String,
    pub log_level: String,
    /// 0 leaves the service's own default in place
    pub db_max_retries: u32,
    pub migrations_path: String,
    pub smtp: SmtpConfig,
    /// Additional environment, sorted by key
    pub env: BTreeMap<String, String>,
    pub health_path: String,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
}

impl ServiceConfig {
    /// Create a config with default timing for a binary on a port
    pub fn new(name: &str, binary: &str, port: u16) -> Self {
        ServiceEntry::new(binary, port).resolve(name, &ServiceDefaults::default())
    }

    /// Host used to reach the service from the gateway
    pub fn connect_host(&self) -> &str {
        match self.host.as_str() {
            "" | "0.0.0.0" => DEFAULT_SERVICE_HOST,
            host => host,
        }
    }

    /// Base URL of the service, computed from the current port
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.connect_host(), self.port)
    }

    /// Full URL of the readiness endpoint
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_path)
    }
}

const DEFAULT_LISTEN_PORT: u16 = 8000;
const DEFAULT_SERVICE_HOST: &str = "127.0.0.1";

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_poll_interval() -> u64 {
    500 // 500ms
}

fn default_max_attempts() -> u32 {
    60 // 30 seconds at the default interval
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    30
}

fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Environment variable prefix for a service name (`auth-v2` -> `AUTH_V2`)
pub fn env_prefix(name: &str) -> String {
    name.to_ascii_uppercase().replace('-', "_")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_fallback(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Resolve unset values from environment variables
    pub fn apply_env_fallback<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.server.port.is_none() {
            self.server.port = lookup("TANDEMGATE_PORT").and_then(|v| v.parse().ok());
        }

        for (name, entry) in self.services.iter_mut() {
            entry.apply_env_fallback(&env_prefix(name), &lookup);
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut names: Vec<&String> = self.services.keys().collect();
        names.sort();
        for name in names {
            if let Err(e) = self.services[name].validate(name, &self.defaults) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Resolve a configured service into its runtime config
    pub fn resolve(&self, name: &str) -> Option<ServiceConfig> {
        self.services
            .get(name)
            .map(|entry| entry.resolve(name, &self.defaults))
    }

    /// Resolve every configured service, sorted by name
    pub fn resolve_all(&self) -> Vec<ServiceConfig> {
        let mut configs: Vec<ServiceConfig> = self
            .services
            .iter()
            .map(|(name, entry)| entry.resolve(name, &self.defaults))
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "0.0.0.0"

[defaults]
poll_interval_ms = 200
max_attempts = 10
health_path = "/healthz"

[services.auth]
binary = "gotrue"
port = 9999
database_url = "postgres://postgres@localhost:5432/app"
jwt_secret = "super-secret"
site_url = "http://localhost:3000"

[services.auth.smtp]
host = "smtp.example.com"
port = 587
autoconfirm = true

[services.auth.env]
GOTRUE_DISABLE_SIGNUP = "false"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port(), 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.services.len(), 1);

        let auth = config.resolve("auth").unwrap();
        assert_eq!(auth.binary, "gotrue");
        assert_eq!(auth.port, 9999);
        assert_eq!(auth.health_path, "/healthz");
        assert_eq!(auth.poll_interval, Duration::from_millis(200));
        assert_eq!(auth.max_attempts, 10);
        assert_eq!(auth.smtp.host, "smtp.example.com");
        assert_eq!(auth.smtp.port, 587);
        assert!(auth.smtp.autoconfirm);
        assert_eq!(auth.env.get("GOTRUE_DISABLE_SIGNUP").unwrap(), "false");
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port(), 8000);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
    }

    #[test]
    fn test_default_service_defaults() {
        let defaults = ServiceDefaults::default();
        assert_eq!(defaults.health_path, "/health");
        assert_eq!(defaults.poll_interval_ms, 500);
        assert_eq!(defaults.max_attempts, 60);
        assert_eq!(defaults.probe_timeout_ms, 2000);
        assert_eq!(defaults.request_timeout_secs, 30);
    }

    #[test]
    fn test_service_entry_overrides_defaults() {
        let defaults = ServiceDefaults::default();
        let mut entry = ServiceEntry::new("gotrue", 9999);
        entry.poll_interval_ms = Some(50);
        entry.max_attempts = Some(4);
        entry.request_timeout_secs = Some(5);
        entry.health_path = Some("/ready".to_string());

        assert_eq!(entry.poll_interval(&defaults), Duration::from_millis(50));
        assert_eq!(entry.max_attempts(&defaults), 4);
        assert_eq!(entry.request_timeout(&defaults), Duration::from_secs(5));
        assert_eq!(entry.health_path(&defaults), "/ready");
        assert_eq!(entry.probe_timeout(&defaults), Duration::from_millis(2000));
    }

    #[test]
    fn test_env_fallback_fills_empty_fields_only() {
        let toml = r#"
[services.auth]
binary = "gotrue"
jwt_secret = "from-file"
"#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.apply_env_fallback(|key| match key {
            "AUTH_JWT_SECRET" => Some("from-env".to_string()),
            "AUTH_DATABASE_URL" => Some("postgres://env".to_string()),
            "AUTH_PORT" => Some("9999".to_string()),
            "AUTH_SMTP_PORT" => Some("2525".to_string()),
            "AUTH_DB_MAX_RETRIES" => Some("7".to_string()),
            "TANDEMGATE_PORT" => Some("8088".to_string()),
            _ => None,
        });

        let auth = config.resolve("auth").unwrap();
        assert_eq!(auth.jwt_secret, "from-file");
        assert_eq!(auth.database_url, "postgres://env");
        assert_eq!(auth.port, 9999);
        assert_eq!(auth.smtp.port, 2525);
        assert_eq!(auth.db_max_retries, 7);
        assert_eq!(config.server.port(), 8088);
    }

    #[test]
    fn test_env_fallback_ignores_empty_and_unparsable_values() {
        let mut config = Config::default();
        config
            .services
            .insert("auth".to_string(), ServiceEntry::new("gotrue", 0));
        config.apply_env_fallback(|key| match key {
            "AUTH_PORT" => Some("not-a-port".to_string()),
            "AUTH_SITE_URL" => Some(String::new()),
            _ => None,
        });

        let auth = &config.services["auth"];
        assert_eq!(auth.port, 0);
        assert!(auth.site_url.is_empty());
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix("auth"), "AUTH");
        assert_eq!(env_prefix("auth-v2"), "AUTH_V2");
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config
            .services
            .insert("auth".to_string(), ServiceEntry::new("", 9999));
        config
            .services
            .insert("db".to_string(), ServiceEntry::new("postgres", 0));
        config
            .services
            .insert("_gateway".to_string(), ServiceEntry::new("x", 1));
        config.apply_env_fallback(no_env);

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'auth': 'binary' is required"));
        assert!(err.contains("'db': 'port' must be greater than 0"));
        assert!(err.contains("'_gateway': name"));
    }

    #[test]
    fn test_validate_health_path_and_attempts() {
        let defaults = ServiceDefaults::default();
        let mut entry = ServiceEntry::new("gotrue", 9999);
        entry.health_path = Some("health".to_string());
        assert!(entry.validate("auth", &defaults).is_err());

        entry.health_path = None;
        entry.max_attempts = Some(0);
        assert!(entry.validate("auth", &defaults).is_err());

        entry.max_attempts = None;
        assert!(entry.validate("auth", &defaults).is_ok());
    }

    #[test]
    fn test_base_url_uses_loopback_for_unspecified_host() {
        let mut config = ServiceConfig::new("auth", "gotrue", 9999);
        assert_eq!(config.base_url(), "http://127.0.0.1:9999");
        assert_eq!(config.health_url(), "http://127.0.0.1:9999/health");

        config.host = "0.0.0.0".to_string();
        assert_eq!(config.base_url(), "http://127.0.0.1:9999");

        config.host = "localhost".to_string();
        config.port = 9998;
        assert_eq!(config.base_url(), "http://localhost:9998");
    }

    #[test]
    fn test_resolve_all_is_sorted() {
        let mut config = Config::default();
        config
            .services
            .insert("storage".to_string(), ServiceEntry::new("storage-api", 5000));
        config
            .services
            .insert("auth".to_string(), ServiceEntry::new("gotrue", 9999));

        let names: Vec<String> = config.resolve_all().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["auth", "storage"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandemgate.toml");
        std::fs::write(
            &path,
            r#"
[services.auth]
binary = "gotrue"
port = 9999
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.resolve("auth").unwrap().port, 9999);
    }
}
