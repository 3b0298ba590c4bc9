//! Request adapter handed to handlers

use crate::connection::ConnectionInfo;
use crate::host::{
    default_port, split_host_port, TrustCache, TrustPolicy, PRIVATE_HOST, PRIVATE_PORT,
    PRIVATE_REMOTE_ADDR, PRIVATE_SECURE, X_FORWARDED_PROTO,
};
use crate::message::{Cookie, RequestBody, WireRequest};
use hyper::header::{HeaderMap, HOST};
use hyper::{Method, Uri, Version};
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

/// Public view of an inbound request
pub struct HttpRequest {
    message: WireRequest,
    info: ConnectionInfo,
    trust_policy: Arc<TrustPolicy>,
    trust_cache: Arc<TrustCache>,
    body: OnceLock<RequestBody>,
}

impl HttpRequest {
    pub(crate) fn new(
        message: WireRequest,
        info: ConnectionInfo,
        trust_policy: Arc<TrustPolicy>,
        trust_cache: Arc<TrustCache>,
    ) -> Self {
        Self {
            message,
            info,
            trust_policy,
            trust_cache,
            body: OnceLock::new(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.message.method
    }

    pub fn uri(&self) -> &Uri {
        &self.message.uri
    }

    pub fn path(&self) -> &str {
        self.message.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.message.uri.query()
    }

    pub fn version(&self) -> Version {
        self.message.version
    }

    /// First value of a header, `None` when absent
    pub fn header(&self, name: &str) -> Option<&str> {
        self.message.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All values of a header, empty when absent
    pub fn headers(&self, name: &str) -> Vec<&str> {
        self.message
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn header_names(&self) -> Vec<&str> {
        self.message.headers.keys().map(|k| k.as_str()).collect()
    }

    pub fn header_map(&self) -> &HeaderMap {
        &self.message.headers
    }

    pub fn cookie(&self, name: &str) -> Option<Cookie> {
        self.message.cookies().into_iter().find(|c| c.name == name)
    }

    pub fn cookies(&self) -> Vec<Cookie> {
        self.message.cookies()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.message.content_length()
    }

    pub fn is_chunked(&self) -> bool {
        self.message.is_chunked()
    }

    /// The body stream, created on first access
    pub fn body(&self) -> &RequestBody {
        self.body
            .get_or_init(|| RequestBody::new(&self.message.body, self.message.content_length()))
    }

    /// Close the body stream if it was ever opened
    pub(crate) fn close_body(&self) -> std::io::Result<()> {
        match self.body.get() {
            Some(body) => body.close(),
            None => match &self.message.body {
                Err(failure) => Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("request body incomplete: {}", failure),
                )),
                Ok(_) => Ok(()),
            },
        }
    }

    /// False while announced trailers have not all arrived
    pub fn is_trailers_ready(&self) -> bool {
        !self.message.expects_trailers() || self.message.trailers.is_some()
    }

    /// Trailers, once ready and only for chunked bodies
    pub fn trailers(&self) -> Option<&HeaderMap> {
        if !self.message.is_chunked() {
            return None;
        }
        self.message.trailers.as_ref()
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        self.trailers()?.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the peer may supply private headers
    pub fn is_trusted(&self) -> bool {
        self.trust_cache
            .is_trusted(&self.trust_policy, self.info.remote_addr.ip())
    }

    fn private_header(&self, name: &str) -> Option<&str> {
        if !self.is_trusted() {
            return None;
        }
        self.header(name).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Authority from the Host header, falling back to the URI
    fn authority(&self) -> Option<(String, Option<u16>)> {
        if let Some(host) = self.header(HOST.as_str()) {
            if let Some(parts) = split_host_port(host) {
                return Some(parts);
            }
        }
        let authority = self.message.uri.authority()?;
        split_host_port(authority.as_str())
    }

    /// Host name the client asked for
    pub fn requested_host(&self) -> String {
        if let Some(host) = self.private_header(PRIVATE_HOST) {
            return host.to_ascii_lowercase();
        }
        if let Some((host, _)) = self.authority() {
            return host;
        }
        match self.info.local_addr.ip() {
            IpAddr::V6(ip) => format!("[{}]", ip),
            ip => ip.to_string(),
        }
    }

    /// Port the client connected to
    pub fn requested_port(&self) -> u16 {
        if let Some(port) = self.private_header(PRIVATE_PORT).and_then(|p| p.parse().ok()) {
            return port;
        }
        if let Some((_, Some(port))) = self.authority() {
            return port;
        }
        if let Some(port) = self.private_header(X_FORWARDED_PROTO).and_then(default_port) {
            return port;
        }
        self.info.local_addr.port()
    }

    /// Scheme the client used
    pub fn scheme(&self) -> &'static str {
        if let Some(secure) = self.private_header(PRIVATE_SECURE) {
            return if secure.eq_ignore_ascii_case("true") { "https" } else { "http" };
        }
        if let Some(proto) = self.private_header(X_FORWARDED_PROTO) {
            if proto.eq_ignore_ascii_case("https") {
                return "https";
            }
            if proto.eq_ignore_ascii_case("http") {
                return "http";
            }
        }
        if self.info.is_secure() {
            "https"
        } else {
            "http"
        }
    }

    pub fn is_secure(&self) -> bool {
        self.scheme() == "https"
    }

    /// Client address, as reported by a trusted proxy when available
    pub fn remote_ip(&self) -> IpAddr {
        self.private_header(PRIVATE_REMOTE_ADDR)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.info.remote_addr.ip())
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// The request URL as the client would have written it
    pub fn request_url(&self) -> String {
        let host = self.requested_host();
        let port = self.requested_port();
        let scheme = self.scheme();
        let path = self
            .message
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        if default_port(scheme) == Some(port) {
            format!("{}://{}{}", scheme, host, path)
        } else {
            format!("{}://{}:{}{}", scheme, host, port, path)
        }
    }
}
