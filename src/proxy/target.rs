//! Upstream targets and prefix routing

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use url::Url;

use super::ProxyError;
use crate::config::ProxyConfig;
use crate::oauth::prefix_applies;

/// One upstream host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// `https` upstreams are reached over TLS
    pub tls: bool,
    /// Host name or address
    pub host: String,
    /// Port (scheme default when omitted)
    pub port: u16,
    /// Path of the configured URL, prepended to every request
    pub base_path: String,
}

impl Upstream {
    /// Parse `http(s)://host[:port][/path]`.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(raw).map_err(|e| ProxyError::InvalidTarget(format!("{raw}: {e}")))?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ProxyError::InvalidTarget(format!(
                    "{raw}: unsupported scheme '{other}'"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidTarget(format!("{raw}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });

        Ok(Self {
            tls,
            host,
            port,
            base_path: url.path().trim_end_matches('/').to_string(),
        })
    }

    /// `host:port` (IPv6 hosts bracketed)
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `http` or `https`
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }
}

/// A prefix route over a load-balanced set of hosts
#[derive(Debug)]
pub struct TargetPool {
    /// Inbound prefix, stripped before forwarding (empty for the catch-all)
    pub prefix: String,
    /// Downstream base path inserted before the stripped path
    pub base_path: String,
    hosts: Vec<Arc<Upstream>>,
    next: AtomicUsize,
}

impl TargetPool {
    /// Create a pool; fails on an empty or unparseable host list.
    pub fn new(prefix: &str, base_path: &str, hosts: &[String]) -> Result<Self, ProxyError> {
        if hosts.is_empty() {
            return Err(ProxyError::InvalidTarget(format!("route '{prefix}' has no hosts")));
        }
        let hosts = hosts
            .iter()
            .map(|h| Upstream::parse(h).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            base_path: base_path.trim_end_matches('/').to_string(),
            hosts,
            next: AtomicUsize::new(0),
        })
    }

    /// Next host, round-robin
    pub fn next_host(&self) -> Arc<Upstream> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        Arc::clone(&self.hosts[i])
    }

    /// Number of hosts
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Always false; pools are never built empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Upstream path and query: strip the matched prefix, then prepend the
    /// upstream URL path and the route base path.
    #[must_use]
    pub fn rewrite_path(&self, upstream: &Upstream, path: &str, query: Option<&str>) -> String {
        let rest = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        let mut target = String::with_capacity(upstream.base_path.len() + self.base_path.len() + rest.len() + 1);
        target.push_str(&upstream.base_path);
        target.push_str(&self.base_path);
        if !rest.is_empty() && !rest.starts_with('/') {
            target.push('/');
        }
        target.push_str(rest);
        if target.is_empty() {
            target.push('/');
        }
        if let Some(q) = query {
            target.push('?');
            target.push_str(q);
        }
        target
    }
}

/// Prefix routes, longest first, plus an optional catch-all
#[derive(Debug, Default)]
pub struct ProxyRoutes {
    routes: Vec<Arc<TargetPool>>,
    catch_all: Option<Arc<TargetPool>>,
}

impl ProxyRoutes {
    /// Build from the `proxy` section.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let mut routes = config
            .routes
            .iter()
            .map(|r| TargetPool::new(&r.path_prefix, &r.base_path, &r.hosts).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        let catch_all = if config.hosts.is_empty() {
            None
        } else {
            Some(Arc::new(TargetPool::new("", "", &config.hosts)?))
        };

        Ok(Self { routes, catch_all })
    }

    /// Pool for `path`; `None` means the path is not proxied.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Arc<TargetPool>> {
        self.routes
            .iter()
            .find(|pool| prefix_applies(&pool.prefix, path))
            .or(self.catch_all.as_ref())
            .cloned()
    }
}
