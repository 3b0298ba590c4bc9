//! Virtual hosts and request discrimination
//!
//! The link asks a [`VirtualHostResolver`] for the virtual host serving an
//! endpoint/host/port combination, then asks that host to discriminate the
//! request to a [`RequestHandler`]. [`VirtualHostMap`] is the alias-matching
//! implementation used by the server; embedders can supply their own.

use crate::error::{escape_html, DispatchError};
use crate::link::DispatchLink;
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use hyper::StatusCode;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Application code that produces a response
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &HttpRequest, response: &HttpResponse) -> Result<(), DispatchError>;
}

impl<F> RequestHandler for F
where
    F: Fn(&HttpRequest, &HttpResponse) -> Result<(), DispatchError> + Send + Sync,
{
    fn handle(&self, request: &HttpRequest, response: &HttpResponse) -> Result<(), DispatchError> {
        self(request, response)
    }
}

/// A routing target selected by host and port
pub trait VirtualHost: Send + Sync {
    fn name(&self) -> &str;

    /// Find the handler for the link's request
    fn discriminate(&self, link: &DispatchLink) -> Option<Arc<dyn RequestHandler>>;
}

/// Maps an endpoint and the link's requested host/port to a virtual host
pub trait VirtualHostResolver: Send + Sync {
    fn find_virtual_host(&self, endpoint: &str, link: &DispatchLink) -> Option<Arc<dyn VirtualHost>>;
}

/// A `host:port` alias; `*` matches anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAlias {
    host: Option<String>,
    port: Option<u16>,
}

impl HostAlias {
    pub fn parse(alias: &str) -> Result<Self, DispatchError> {
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(DispatchError::Config("empty host alias".to_string()));
        }
        let (host, port) = match alias.rsplit_once(':') {
            Some((host, port)) if !host.ends_with(':') && !port.contains(']') => (host, Some(port)),
            _ => (alias, None),
        };
        let host = match host {
            "*" => None,
            "" => return Err(DispatchError::Config(format!("invalid host alias {:?}", alias))),
            h => Some(h.to_ascii_lowercase()),
        };
        let port = match port {
            None | Some("*") => None,
            Some(p) => Some(
                p.parse()
                    .map_err(|_| DispatchError::Config(format!("invalid port in host alias {:?}", alias)))?,
            ),
        };
        Ok(Self { host, port })
    }

    /// Match strength: `None` for no match, higher is more specific
    pub fn score(&self, host: &str, port: u16) -> Option<u8> {
        let host_score = match &self.host {
            Some(h) if h.eq_ignore_ascii_case(host) => 2,
            Some(_) => return None,
            None => 0,
        };
        let port_score = match self.port {
            Some(p) if p == port => 1,
            Some(_) => return None,
            None => 0,
        };
        Some(host_score + port_score)
    }
}

impl fmt::Display for HostAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.host.as_deref().unwrap_or("*");
        match self.port {
            Some(p) => write!(f, "{}:{}", host, p),
            None => write!(f, "{}:*", host),
        }
    }
}

struct Route {
    context_root: String,
    handler: Arc<dyn RequestHandler>,
}

/// A virtual host with aliases and context-root routes
pub struct ConfiguredHost {
    name: String,
    aliases: Vec<HostAlias>,
    allowed_endpoints: Vec<String>,
    routes: RwLock<Vec<Route>>,
}

impl ConfiguredHost {
    pub fn new(name: impl Into<String>, aliases: Vec<HostAlias>) -> Self {
        Self {
            name: name.into(),
            aliases,
            allowed_endpoints: Vec::new(),
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Restrict the host to the named endpoints
    pub fn with_allowed_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.allowed_endpoints = endpoints;
        self
    }

    pub fn aliases(&self) -> &[HostAlias] {
        &self.aliases
    }

    pub fn allows_endpoint(&self, endpoint: &str) -> bool {
        self.allowed_endpoints.is_empty() || self.allowed_endpoints.iter().any(|e| e == endpoint)
    }

    /// Register a handler under a context root such as `/app` or `/`
    pub fn add_route(&self, context_root: &str, handler: Arc<dyn RequestHandler>) {
        let context_root = normalize_context_root(context_root);
        let mut routes = self.routes.write();
        routes.retain(|r| r.context_root != context_root);
        info!(virtual_host = %self.name, context_root = %context_root, "Route registered");
        routes.push(Route {
            context_root,
            handler,
        });
    }

    pub fn remove_route(&self, context_root: &str) -> bool {
        let context_root = normalize_context_root(context_root);
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.context_root != context_root);
        routes.len() != before
    }

    fn best_score(&self, host: &str, port: u16) -> Option<u8> {
        self.aliases.iter().filter_map(|a| a.score(host, port)).max()
    }

    /// Longest context root matching `path`
    pub fn route_for(&self, path: &str) -> Option<Arc<dyn RequestHandler>> {
        let routes = self.routes.read();
        routes
            .iter()
            .filter(|r| context_root_matches(&r.context_root, path))
            .max_by_key(|r| r.context_root.len())
            .map(|r| Arc::clone(&r.handler))
    }
}

impl VirtualHost for ConfiguredHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn discriminate(&self, link: &DispatchLink) -> Option<Arc<dyn RequestHandler>> {
        let request = link.request()?;
        self.route_for(request.path())
    }
}

fn normalize_context_root(root: &str) -> String {
    let trimmed = root.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn context_root_matches(root: &str, path: &str) -> bool {
    root == "/"
        || path == root
        || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}

/// Alias-matching resolver over a set of configured hosts
#[derive(Default)]
pub struct VirtualHostMap {
    hosts: RwLock<Vec<Arc<ConfiguredHost>>>,
}

impl VirtualHostMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: Arc<ConfiguredHost>) {
        let mut hosts = self.hosts.write();
        hosts.retain(|h| h.name != host.name);
        hosts.push(host);
    }

    pub fn host(&self, name: &str) -> Option<Arc<ConfiguredHost>> {
        self.hosts.read().iter().find(|h| h.name == name).cloned()
    }

    /// Replace every host at once
    pub fn replace_hosts(&self, hosts: Vec<Arc<ConfiguredHost>>) {
        *self.hosts.write() = hosts;
    }

    /// Most specific host for `endpoint`, `host` and `port`
    pub fn resolve(&self, endpoint: &str, host: &str, port: u16) -> Option<Arc<ConfiguredHost>> {
        let hosts = self.hosts.read();
        let mut best: Option<(u8, &Arc<ConfiguredHost>)> = None;
        for candidate in hosts.iter().filter(|h| h.allows_endpoint(endpoint)) {
            if let Some(score) = candidate.best_score(host, port) {
                if best.map(|(s, _)| score > s).unwrap_or(true) {
                    best = Some((score, candidate));
                }
            }
        }
        best.map(|(_, h)| Arc::clone(h))
    }
}

impl VirtualHostResolver for VirtualHostMap {
    fn find_virtual_host(&self, endpoint: &str, link: &DispatchLink) -> Option<Arc<dyn VirtualHost>> {
        let request = link.request()?;
        let host = request.requested_host();
        let port = request.requested_port();
        let found = self.resolve(endpoint, &host, port);
        debug!(
            endpoint,
            host = %host,
            port,
            virtual_host = found.as_ref().map(|h| h.name.as_str()),
            "Virtual host lookup"
        );
        found.map(|h| h as Arc<dyn VirtualHost>)
    }
}

/// Handler that always answers with the same response
#[derive(Debug, Clone)]
pub struct StaticHandler {
    status: StatusCode,
    content_type: String,
    body: String,
}

impl StaticHandler {
    pub fn new(status: StatusCode, content_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body: body.into(),
        }
    }
}

impl RequestHandler for StaticHandler {
    fn handle(&self, _request: &HttpRequest, response: &HttpResponse) -> Result<(), DispatchError> {
        response.set_status(self.status);
        response.set_header("content-type", &self.content_type)?;
        response.set_content_length(Some(self.body.len() as u64));
        response.body().write_str(&self.body)?;
        Ok(())
    }
}

/// Built-in pages shown when nothing handles a request
pub struct WelcomePage;

impl WelcomePage {
    /// Page served for `/` when no application claims it
    pub fn landing_page() -> String {
        format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
             <title>{name}</title>\n</head>\n<body>\n<h1>{name} {version}</h1>\n\
             <p>The server is running. No application is deployed at this address.</p>\n\
             </body>\n</html>\n",
            name = env!("CARGO_PKG_NAME"),
            version = env!("CARGO_PKG_VERSION"),
        )
    }

    /// Page served with a 404 for any other unclaimed URL
    pub fn not_found_page(url: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
             <title>Context Root Not Found</title>\n</head>\n<body>\n\
             <h1>Context Root Not Found</h1>\n\
             <p>No application is mapped to {}.</p>\n</body>\n</html>\n",
            escape_html(url)
        )
    }
}
