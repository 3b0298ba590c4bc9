use crate::channel::ChannelConfig;
use crate::classify::{BlockingPoolExecutor, ClassificationRule, Executor, RuleClassifier};
use crate::host::PrivateHeaderTrust;
use crate::settings::{DispatcherSettings, DEFAULT_BUFFER_SIZE};
use crate::vhost::{ConfiguredHost, HostAlias, StaticHandler, VirtualHostResolver};
use hyper::{Method, StatusCode};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Name of the endpoint used when none are configured
pub const DEFAULT_ENDPOINT: &str = "defaultHttpEndpoint";

/// Name of the virtual host used when none are configured
pub const DEFAULT_VIRTUAL_HOST: &str = "default_host";

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Dispatcher-wide behaviour
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// One dispatch channel per endpoint
    #[serde(default = "default_endpoints")]
    pub endpoints: BTreeMap<String, EndpointConfig>,

    #[serde(default = "default_virtual_hosts")]
    pub virtual_hosts: BTreeMap<String, VirtualHostConfig>,

    /// Work classification rules, first match wins
    #[serde(default)]
    pub classification: Vec<ClassificationRuleConfig>,

    /// Executor pools referenced by classification rules
    #[serde(default)]
    pub pools: HashMap<String, PoolConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Generate a self-signed certificate for secure endpoints when no
    /// certificate files are configured
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Grace period for quiescing channels on SIGTERM/SIGINT (default: 30)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl ServerConfig {
    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn tls_available(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            pid_file: None,
            tls: false,
            tls_cert: None,
            tls_key: None,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    /// `true`/`false`, or the list of proxy addresses allowed to send
    /// private headers
    #[serde(default)]
    pub use_private_headers: PrivateHeaderTrust,

    /// Serve the landing page and "context root not found" page (default: true)
    #[serde(default = "default_true")]
    pub welcome_page_enabled: bool,

    /// Pad short 404 bodies (default: true)
    #[serde(default = "default_true")]
    pub pad_not_found_body: bool,

    /// Strict-Transport-Security value added on secure connections
    pub hsts_value: Option<String>,

    /// Include host:port in 404 bodies for unmatched URLs (default: false)
    #[serde(default)]
    pub verbose_not_found: bool,

    /// Response buffer size for endpoints that do not set one
    #[serde(default = "default_buffer_size")]
    pub default_buffer_size: usize,

    /// Run handlers on the default executor (default: true). When disabled,
    /// requests that no classification rule claims get a 503.
    #[serde(default = "default_true")]
    pub executor_enabled: bool,

    /// Concurrency limit of the default executor (default: 64)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_handlers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            use_private_headers: PrivateHeaderTrust::default(),
            welcome_page_enabled: true,
            pad_not_found_body: true,
            hsts_value: None,
            verbose_not_found: false,
            default_buffer_size: default_buffer_size(),
            executor_enabled: true,
            max_concurrent_handlers: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EndpointConfig {
    pub port: u16,

    /// Serve TLS on this endpoint
    #[serde(default)]
    pub secure: bool,

    /// Response buffer size (overrides dispatcher default)
    pub buffer_size: Option<usize>,
}

impl EndpointConfig {
    pub fn channel_config(&self, name: &str) -> ChannelConfig {
        ChannelConfig {
            endpoint: name.to_string(),
            buffer_size: self.buffer_size,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VirtualHostConfig {
    /// `host:port` aliases; `*` matches any host or port
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Endpoints this host answers on (default: all)
    #[serde(default)]
    pub allow_from_endpoints: Vec<String>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl VirtualHostConfig {
    fn validate(&self, name: &str, endpoints: &BTreeMap<String, EndpointConfig>) -> Vec<String> {
        let mut errors = Vec::new();
        if self.aliases.is_empty() {
            errors.push(format!("Virtual host '{}': at least one alias is required", name));
        }
        for alias in &self.aliases {
            if let Err(e) = HostAlias::parse(alias) {
                errors.push(format!("Virtual host '{}': {}", name, e));
            }
        }
        for endpoint in &self.allow_from_endpoints {
            if !endpoints.contains_key(endpoint) {
                errors.push(format!(
                    "Virtual host '{}': unknown endpoint '{}' in allow_from_endpoints",
                    name, endpoint
                ));
            }
        }
        for route in &self.routes {
            if let Err(e) = route.validate() {
                errors.push(format!("Virtual host '{}': {}", name, e));
            }
        }
        errors
    }

    /// Build the routable host with a static handler per route
    pub fn build(&self, name: &str) -> anyhow::Result<ConfiguredHost> {
        let aliases = self
            .aliases
            .iter()
            .map(|a| HostAlias::parse(a))
            .collect::<Result<Vec<_>, _>>()?;
        let host = ConfiguredHost::new(name, aliases)
            .with_allowed_endpoints(self.allow_from_endpoints.clone());
        for route in &self.routes {
            let status = StatusCode::from_u16(route.status)?;
            host.add_route(
                &route.context_root,
                Arc::new(StaticHandler::new(status, route.content_type.clone(), route.body.clone())),
            );
        }
        Ok(host)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    pub context_root: String,

    #[serde(default = "default_route_status")]
    pub status: u16,

    #[serde(default = "default_content_type")]
    pub content_type: String,

    #[serde(default)]
    pub body: String,
}

impl RouteConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.context_root.starts_with('/') {
            return Err(format!(
                "route context_root '{}' must start with '/'",
                self.context_root
            ));
        }
        if !(100..=999).contains(&self.status) {
            return Err(format!("route '{}' has invalid status {}", self.context_root, self.status));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassificationRuleConfig {
    pub path_prefix: String,

    /// Only match this method (optional)
    pub method: Option<String>,

    /// Pool from `[pools]` that runs matching requests
    pub pool: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_max_concurrent() -> usize {
    64
}

fn default_route_status() -> u16 {
    200
}

fn default_content_type() -> String {
    "text/plain; charset=UTF-8".to_string()
}

fn default_endpoints() -> BTreeMap<String, EndpointConfig> {
    BTreeMap::from([(
        DEFAULT_ENDPOINT.to_string(),
        EndpointConfig {
            port: 9080,
            secure: false,
            buffer_size: None,
        },
    )])
}

fn default_virtual_hosts() -> BTreeMap<String, VirtualHostConfig> {
    BTreeMap::from([(
        DEFAULT_VIRTUAL_HOST.to_string(),
        VirtualHostConfig {
            aliases: vec!["*:*".to_string()],
            allow_from_endpoints: Vec::new(),
            routes: Vec::new(),
        },
    )])
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("Server: 'tls_cert' and 'tls_key' must be set together".to_string());
        }
        if self.dispatcher.default_buffer_size == 0 {
            errors.push("Dispatcher: 'default_buffer_size' must be greater than 0".to_string());
        }
        if self.dispatcher.max_concurrent_handlers == 0 {
            errors.push("Dispatcher: 'max_concurrent_handlers' must be greater than 0".to_string());
        }

        if self.endpoints.is_empty() {
            errors.push("At least one endpoint is required".to_string());
        }
        let mut ports: HashMap<u16, &str> = HashMap::new();
        for (name, endpoint) in &self.endpoints {
            if endpoint.port == 0 {
                errors.push(format!("Endpoint '{}': 'port' must be greater than 0", name));
            } else if let Some(other) = ports.insert(endpoint.port, name) {
                errors.push(format!(
                    "Endpoint '{}': port {} already used by endpoint '{}'",
                    name, endpoint.port, other
                ));
            }
            if endpoint.buffer_size == Some(0) {
                errors.push(format!("Endpoint '{}': 'buffer_size' must be greater than 0", name));
            }
            if endpoint.secure && !self.server.tls_available() {
                errors.push(format!(
                    "Endpoint '{}': secure endpoints need 'tls = true' or 'tls_cert'/'tls_key'",
                    name
                ));
            }
        }

        for (name, host) in &self.virtual_hosts {
            errors.extend(host.validate(name, &self.endpoints));
        }

        for (index, rule) in self.classification.iter().enumerate() {
            if !self.pools.contains_key(&rule.pool) {
                errors.push(format!(
                    "Classification rule {}: unknown pool '{}'",
                    index + 1,
                    rule.pool
                ));
            }
            if let Some(method) = &rule.method {
                if Method::from_bytes(method.as_bytes()).is_err() {
                    errors.push(format!(
                        "Classification rule {}: invalid method '{}'",
                        index + 1,
                        method
                    ));
                }
            }
        }
        for (name, pool) in &self.pools {
            if pool.max_concurrent == 0 {
                errors.push(format!("Pool '{}': 'max_concurrent' must be greater than 0", name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Routable hosts for every configured virtual host
    pub fn build_virtual_hosts(&self) -> anyhow::Result<Vec<Arc<ConfiguredHost>>> {
        self.virtual_hosts
            .iter()
            .map(|(name, host)| host.build(name).map(Arc::new))
            .collect()
    }

    /// Rule classifier over the configured pools, if any rules exist
    pub fn build_classifier(&self, handle: &Handle) -> anyhow::Result<Option<RuleClassifier>> {
        if self.classification.is_empty() {
            return Ok(None);
        }
        let mut pools: HashMap<&str, Arc<dyn Executor>> = HashMap::new();
        for (name, pool) in &self.pools {
            pools.insert(
                name.as_str(),
                Arc::new(BlockingPoolExecutor::new(name.clone(), handle.clone(), pool.max_concurrent)),
            );
        }

        let mut classifier = RuleClassifier::new();
        for rule in &self.classification {
            let executor = pools
                .get(rule.pool.as_str())
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown pool '{}'", rule.pool))?;
            let method = rule
                .method
                .as_deref()
                .map(|m| Method::from_bytes(m.as_bytes()))
                .transpose()?;
            classifier = classifier.with_rule(ClassificationRule {
                path_prefix: rule.path_prefix.clone(),
                method,
                executor,
            });
        }
        Ok(Some(classifier))
    }

    /// Dispatcher settings around `resolver`
    pub fn dispatcher_settings(
        &self,
        resolver: Arc<dyn VirtualHostResolver>,
        handle: &Handle,
    ) -> anyhow::Result<DispatcherSettings> {
        let dispatcher = &self.dispatcher;
        let mut settings = DispatcherSettings::new(resolver)
            .with_trust(dispatcher.use_private_headers.clone())
            .with_welcome_page(dispatcher.welcome_page_enabled)
            .with_padding(dispatcher.pad_not_found_body)
            .with_hsts(dispatcher.hsts_value.clone())
            .with_verbose_not_found(dispatcher.verbose_not_found);
        if dispatcher.executor_enabled {
            settings = settings.with_executor(Arc::new(BlockingPoolExecutor::new(
                "default",
                handle.clone(),
                dispatcher.max_concurrent_handlers,
            )));
        }
        if let Some(classifier) = self.build_classifier(handle)? {
            settings = settings.with_classifier(Arc::new(classifier));
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
shutdown_grace_secs = 5

[dispatcher]
use_private_headers = ["10.0.0.1"]
welcome_page_enabled = false
hsts_value = "max-age=31536000"
verbose_not_found = true

[endpoints.http]
port = 9080

[endpoints.admin]
port = 9443
buffer_size = 4096

[virtual_hosts.default_host]
aliases = ["*:9080"]
allow_from_endpoints = ["http"]

[[virtual_hosts.default_host.routes]]
context_root = "/health"
body = "OK"

[[virtual_hosts.default_host.routes]]
context_root = "/gone"
status = 410
content_type = "text/html"
body = "<p>gone</p>"

[[classification]]
path_prefix = "/reports"
method = "POST"
pool = "reports"

[pools.reports]
max_concurrent = 2
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.shutdown_grace(), Duration::from_secs(5));
        assert!(!config.dispatcher.welcome_page_enabled);
        assert!(config.dispatcher.verbose_not_found);
        assert_eq!(
            config.dispatcher.use_private_headers,
            PrivateHeaderTrust::Proxies(vec!["10.0.0.1".parse().unwrap()])
        );
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(
            config.endpoints["admin"].channel_config("admin"),
            ChannelConfig::new("admin").with_buffer_size(4096)
        );
        let host = &config.virtual_hosts["default_host"];
        assert_eq!(host.routes.len(), 2);
        assert_eq!(host.routes[0].status, 200);
        assert_eq!(host.routes[0].content_type, "text/plain; charset=UTF-8");
        assert_eq!(config.classification[0].pool, "reports");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.shutdown_grace_secs, 30);
        assert!(config.dispatcher.welcome_page_enabled);
        assert!(config.dispatcher.pad_not_found_body);
        assert!(config.dispatcher.executor_enabled);
        assert_eq!(config.dispatcher.default_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.dispatcher.use_private_headers, PrivateHeaderTrust::All(true));
        assert_eq!(config.endpoints[DEFAULT_ENDPOINT].port, 9080);
        assert_eq!(config.virtual_hosts[DEFAULT_VIRTUAL_HOST].aliases, vec!["*:*"]);
    }

    #[test]
    fn test_private_headers_boolean() {
        let config: Config = toml::from_str("[dispatcher]\nuse_private_headers = false\n").unwrap();
        assert_eq!(config.dispatcher.use_private_headers, PrivateHeaderTrust::All(false));
    }

    #[test]
    fn test_validation_aggregates_errors() {
        let toml = r#"
[server]
tls_cert = "cert.pem"

[endpoints.a]
port = 0

[endpoints.b]
port = 8080
secure = true

[endpoints.c]
port = 8080

[virtual_hosts.app]
aliases = ["example.com:notaport"]
allow_from_endpoints = ["missing"]

[[virtual_hosts.app.routes]]
context_root = "nope"

[[classification]]
path_prefix = "/"
pool = "ghost"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'tls_cert' and 'tls_key' must be set together"));
        assert!(err.contains("Endpoint 'a': 'port' must be greater than 0"));
        assert!(err.contains("secure endpoints need"));
        assert!(err.contains("port 8080 already used"));
        assert!(err.contains("Virtual host 'app'"));
        assert!(err.contains("unknown endpoint 'missing'"));
        assert!(err.contains("must start with '/'"));
        assert!(err.contains("unknown pool 'ghost'"));
    }

    #[test]
    fn test_virtual_host_without_alias_rejected() {
        let toml = r#"
[virtual_hosts.bare]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("at least one alias is required"));
    }

    #[test]
    fn test_build_virtual_hosts() {
        let toml = r#"
[virtual_hosts.shop]
aliases = ["shop.example.com:*"]

[[virtual_hosts.shop.routes]]
context_root = "/cart"
status = 201
body = "created"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let hosts = config.build_virtual_hosts().unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].aliases()[0].to_string(), "shop.example.com:*");
        assert!(hosts[0].route_for("/cart/items").is_some());
        assert!(hosts[0].route_for("/other").is_none());
    }

    #[tokio::test]
    async fn test_dispatcher_settings() {
        let toml = r#"
[dispatcher]
executor_enabled = false
pad_not_found_body = false

[[classification]]
path_prefix = "/batch"
pool = "batch"

[pools.batch]
max_concurrent = 1
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        let resolver = Arc::new(crate::vhost::VirtualHostMap::new());
        let settings = config.dispatcher_settings(resolver, &Handle::current()).unwrap();
        assert!(settings.executor.is_none());
        assert!(settings.classifier.is_some());
        assert!(!settings.pad_not_found_body);
        assert!(settings.welcome_page_enabled);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[endpoints.web]\nport = 8081\n").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.endpoints["web"].port, 8081);
        assert!(!config.endpoints.contains_key(DEFAULT_ENDPOINT));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[endpoints.web]\nport = 0\n").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
