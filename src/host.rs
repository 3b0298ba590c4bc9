//! Private header trust and requested host/port resolution
//!
//! A front-end proxy (or web server plugin) can forward the host, port and
//! scheme the client originally used in private `$WS..` headers. Those headers
//! are only honoured when the peer is trusted. Trust is evaluated once per
//! link and re-evaluated whenever the global policy generation changes.

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Private header carrying the host name the client connected to
pub const PRIVATE_HOST: &str = "$wssn";
/// Private header carrying the port the client connected to
pub const PRIVATE_PORT: &str = "$wssp";
/// Private header carrying whether the client connection was secure
pub const PRIVATE_SECURE: &str = "$wsis";
/// Private header carrying the client's remote address
pub const PRIVATE_REMOTE_ADDR: &str = "$wsra";

/// Header name for forwarded proto
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Which peers may supply private headers
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PrivateHeaderTrust {
    /// `true` trusts every peer, `false` trusts none
    All(bool),
    /// Only the listed proxy addresses are trusted
    Proxies(Vec<IpAddr>),
}

impl Default for PrivateHeaderTrust {
    fn default() -> Self {
        PrivateHeaderTrust::All(true)
    }
}

impl PrivateHeaderTrust {
    pub fn trusts(&self, peer: IpAddr) -> bool {
        match self {
            PrivateHeaderTrust::All(enabled) => *enabled,
            PrivateHeaderTrust::Proxies(proxies) => proxies.contains(&peer),
        }
    }
}

/// Global trust policy with a generation counter
#[derive(Debug, Default)]
pub struct TrustPolicy {
    trust: RwLock<PrivateHeaderTrust>,
    generation: AtomicU64,
}

impl TrustPolicy {
    pub fn new(trust: PrivateHeaderTrust) -> Self {
        Self {
            trust: RwLock::new(trust),
            generation: AtomicU64::new(0),
        }
    }

    /// Replace the policy; invalidates every per-link cache
    pub fn set(&self, trust: PrivateHeaderTrust) {
        *self.trust.write() = trust;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn trusts(&self, peer: IpAddr) -> bool {
        self.trust.read().trusts(peer)
    }
}

/// Per-link cache of the trust decision
#[derive(Debug, Default)]
pub struct TrustCache {
    cached: Mutex<Option<(u64, bool)>>,
}

impl TrustCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `peer` may supply private headers under `policy`
    pub fn is_trusted(&self, policy: &TrustPolicy, peer: IpAddr) -> bool {
        let generation = policy.generation();
        let mut cached = self.cached.lock();
        if let Some((cached_generation, trusted)) = *cached {
            if cached_generation == generation {
                return trusted;
            }
        }
        let trusted = policy.trusts(peer);
        *cached = Some((generation, trusted));
        trusted
    }

    pub fn clear(&self) {
        *self.cached.lock() = None;
    }
}

/// Split an authority (`host`, `host:port`, `[v6]`, `[v6]:port`) into parts
pub fn split_host_port(authority: &str) -> Option<(String, Option<u16>)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &authority[..end + 2];
        let after = &rest[end + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if after.is_empty() => None,
            None => return None,
        };
        return Some((host.to_ascii_lowercase(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some((host.to_ascii_lowercase(), Some(port.parse().ok()?)))
        }
        Some(_) => None,
        None => Some((authority.to_ascii_lowercase(), None)),
    }
}

/// Default port of a URI scheme
pub fn default_port(scheme: &str) -> Option<u16> {
    if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss") {
        Some(443)
    } else if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("ws") {
        Some(80)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_trust_variants() {
        assert!(PrivateHeaderTrust::All(true).trusts(ip("10.0.0.1")));
        assert!(!PrivateHeaderTrust::All(false).trusts(ip("10.0.0.1")));

        let proxies = PrivateHeaderTrust::Proxies(vec![ip("10.0.0.1")]);
        assert!(proxies.trusts(ip("10.0.0.1")));
        assert!(!proxies.trusts(ip("10.0.0.2")));
    }

    #[test]
    fn test_trust_deserializes_bool_or_list() {
        #[derive(Deserialize)]
        struct Wrapper {
            trust: PrivateHeaderTrust,
        }
        let w: Wrapper = toml::from_str("trust = false").unwrap();
        assert_eq!(w.trust, PrivateHeaderTrust::All(false));

        let w: Wrapper = toml::from_str(r#"trust = ["127.0.0.1", "::1"]"#).unwrap();
        assert_eq!(
            w.trust,
            PrivateHeaderTrust::Proxies(vec![ip("127.0.0.1"), ip("::1")])
        );
    }

    #[test]
    fn test_cache_invalidated_by_generation() {
        let policy = TrustPolicy::new(PrivateHeaderTrust::All(true));
        let cache = TrustCache::new();
        let peer = ip("192.168.1.5");

        assert!(cache.is_trusted(&policy, peer));

        policy.set(PrivateHeaderTrust::All(false));
        assert_eq!(policy.generation(), 1);
        assert!(!cache.is_trusted(&policy, peer));

        policy.set(PrivateHeaderTrust::Proxies(vec![peer]));
        assert!(cache.is_trusted(&policy, peer));
    }

    #[test]
    fn test_cache_reuses_decision_within_generation() {
        let policy = TrustPolicy::new(PrivateHeaderTrust::All(true));
        let cache = TrustCache::new();
        let peer = ip("192.168.1.5");
        assert!(cache.is_trusted(&policy, peer));

        // Mutate without bumping the generation: the cached answer stands
        *policy.trust.write() = PrivateHeaderTrust::All(false);
        assert!(cache.is_trusted(&policy, peer));

        cache.clear();
        assert!(!cache.is_trusted(&policy, peer));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("Example.com"),
            Some(("example.com".to_string(), None))
        );
        assert_eq!(
            split_host_port("example.com:8080"),
            Some(("example.com".to_string(), Some(8080)))
        );
        assert_eq!(
            split_host_port("[::1]:9443"),
            Some(("[::1]".to_string(), Some(9443)))
        );
        assert_eq!(split_host_port("[::1]"), Some(("[::1]".to_string(), None)));
        assert_eq!(split_host_port("example.com:notaport"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port(""), None);
    }

    #[test]
    fn test_default_port() {
        assert_eq!(default_port("https"), Some(443));
        assert_eq!(default_port("HTTP"), Some(80));
        assert_eq!(default_port("ftp"), None);
    }
}
