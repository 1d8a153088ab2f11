//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Listener configuration
    pub server: ServerConfig,
    /// Reverse proxy configuration
    pub proxy: ProxyConfig,
    /// Inbound token verification
    pub security: SecurityConfig,
    /// Outbound OAuth client configuration
    pub client: ClientConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Accept HTTP/2 (h2 over TLS via ALPN, h2c prior knowledge otherwise)
    pub http2: bool,
    /// TLS certificate and key for the listener
    #[serde(default)]
    pub tls: Option<ListenerTlsConfig>,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8443,
            http2: true,
            tls: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// PEM files for the TLS listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerTlsConfig {
    /// Certificate chain (PEM)
    pub cert_path: String,
    /// Private key (PEM, PKCS#8 / PKCS#1 / SEC1)
    pub key_path: String,
    /// CA bundle (PEM) for optional client certificates
    #[serde(default)]
    pub client_ca_path: Option<String>,
}

/// Reverse proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Enable the proxy (otherwise every request falls through to 404)
    pub enabled: bool,
    /// Prefix routes, matched longest prefix first
    pub routes: Vec<RouteConfig>,
    /// Catch-all upstream hosts for paths no route matches (empty = no catch-all)
    pub hosts: Vec<String>,
    /// Absolute per-request deadline (0 = disabled)
    #[serde(with = "humantime_serde")]
    pub max_request_time: Duration,
    /// Replace the `Host` header with the upstream authority
    pub rewrite_host_header: bool,
    /// Append to existing `X-Forwarded-*` headers instead of replacing them
    pub reuse_x_forwarded: bool,
    /// Retries after a failed connection attempt (total attempts = N + 1)
    pub max_connection_retries: u32,
    /// Idle connections kept per upstream host
    pub connections_per_host: usize,
    /// Upstream connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Negotiate HTTP/2 with TLS upstreams via ALPN
    pub http2_enabled: bool,
    /// Extra CA certificates (PEM) trusted for TLS upstreams
    #[serde(default)]
    pub upstream_ca_path: Option<String>,
    /// Methods that are safe to retry against another upstream
    pub idempotent_methods: Vec<String>,
    /// Forward verified claims to the backend as `X-Jwt-Claims`
    pub forward_jwt_claims: bool,
    /// Provider whose client-credential token is attached to proxied requests
    #[serde(default)]
    pub client_credentials: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            routes: Vec::new(),
            hosts: Vec::new(),
            max_request_time: Duration::ZERO,
            rewrite_host_header: true,
            reuse_x_forwarded: false,
            max_connection_retries: 3,
            connections_per_host: 16,
            connect_timeout: Duration::from_secs(5),
            http2_enabled: false,
            upstream_ca_path: None,
            idempotent_methods: default_idempotent_methods(),
            forward_jwt_claims: false,
            client_credentials: None,
        }
    }
}

fn default_idempotent_methods() -> Vec<String> {
    ["GET", "HEAD", "PUT", "DELETE", "OPTIONS", "TRACE"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// A prefix route to a set of upstream hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Inbound path prefix, stripped before forwarding
    pub path_prefix: String,
    /// Upstream base URLs (`http://host:port`), load balanced round-robin
    pub hosts: Vec<String>,
    /// Path prepended to the stripped request path
    #[serde(default)]
    pub base_path: String,
}

/// How signing keys are published by the OAuth providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeyResolverMode {
    /// `GET <server><key_uri>/<kid>` returns one PEM certificate
    X509Certificate,
    /// `GET <server><jwk_uri>` returns a JWK set
    #[default]
    JsonWebKeySet,
}

/// Inbound token verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Require a verified bearer token on every non-skipped path
    pub enabled: bool,
    /// Paths that bypass verification (prefix match)
    pub skip_path_prefixes: Vec<String>,
    /// Tolerated clock difference with the token issuer
    pub clock_skew_seconds: u64,
    /// Key publication mode of the providers
    pub key_resolver: KeyResolverMode,
    /// Cache verification results
    pub enable_jwt_cache: bool,
    /// Lifetime of a cached verification result
    #[serde(with = "humantime_serde")]
    pub jwt_cache_ttl: Duration,
    /// Result-cache size above which a warning is logged
    pub jwt_cache_full_size: usize,
    /// Accept RSA keys shorter than 2048 bits
    pub relaxed_key_validation: bool,
    /// Skip expiry checks entirely (test environments only)
    pub ignore_jwt_expiry: bool,
    /// Local certificates: kid -> PEM file
    pub certificates: HashMap<String, String>,
    /// Fetch every provider's key set at startup
    pub bootstrap_from_key_service: bool,
    /// Upper bound on distinct cached kids
    pub max_cached_keys: usize,
    /// Consult these providers in order for every token (key rotation across issuers)
    pub jwk_service_ids: Vec<String>,
    /// Verify opaque (non-JWT) tokens through the introspection endpoint
    pub enable_swt: bool,
    /// Path prefix -> scopes, at least one of which the token must carry
    pub required_scopes: HashMap<String, Vec<String>>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            skip_path_prefixes: vec!["/health".to_string()],
            clock_skew_seconds: 60,
            key_resolver: KeyResolverMode::default(),
            enable_jwt_cache: true,
            jwt_cache_ttl: Duration::from_secs(600),
            jwt_cache_full_size: 100_000,
            relaxed_key_validation: false,
            ignore_jwt_expiry: false,
            certificates: HashMap::new(),
            bootstrap_from_key_service: false,
            max_cached_keys: 1000,
            jwk_service_ids: Vec::new(),
            enable_swt: false,
            required_scopes: HashMap::new(),
        }
    }
}

/// Outbound OAuth client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Renew tokens this long before they expire (served meanwhile)
    #[serde(with = "humantime_serde")]
    pub token_renew_before_expired: Duration,
    /// Wait before another synchronous renewal after a stuck or failed one
    #[serde(with = "humantime_serde")]
    pub expired_refresh_retry_delay: Duration,
    /// Wait before another background renewal after a stuck or failed one
    #[serde(with = "humantime_serde")]
    pub early_refresh_retry_delay: Duration,
    /// Maximum cached client-credential tokens
    pub token_cache_capacity: usize,
    /// Timeout for token, key and introspection calls
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Provider used when no path table or service list applies
    #[serde(default)]
    pub default_provider: Option<String>,
    /// OAuth providers by service id
    pub providers: HashMap<String, ProviderConfig>,
    /// Request path prefix -> service id
    pub path_prefix_services: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token_renew_before_expired: Duration::from_secs(60),
            expired_refresh_retry_delay: Duration::from_secs(2),
            early_refresh_retry_delay: Duration::from_secs(4),
            token_cache_capacity: 200,
            request_timeout: Duration::from_secs(10),
            default_provider: None,
            providers: HashMap::new(),
            path_prefix_services: HashMap::new(),
        }
    }
}

/// One OAuth provider (authorization server)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL, e.g. `https://oauth.example.com`
    pub server_url: String,
    /// Client id for Basic authentication
    pub client_id: String,
    /// Client secret (supports `${VAR}`)
    pub client_secret: String,
    /// Scopes requested for client-credential tokens
    pub scopes: Vec<String>,
    /// Token endpoint path
    pub token_uri: String,
    /// X.509 key endpoint path (kid is appended)
    pub key_uri: String,
    /// JWK set endpoint path
    pub jwk_uri: String,
    /// Introspection endpoint path
    pub introspect_uri: String,
    /// Send client credentials on key requests
    pub key_basic_auth: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scopes: Vec::new(),
            token_uri: "/oauth2/token".to_string(),
            key_uri: "/oauth2/key".to_string(),
            jwk_uri: "/oauth2/keys".to_string(),
            introspect_uri: "/oauth2/introspect".to_string(),
            key_basic_auth: false,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTHPROXY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                match env::var("HOME") {
                    Ok(home) => path_str.replacen('~', &home, 1),
                    Err(_) => path_str.clone(),
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in provider credentials and URLs
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for provider in self.client.providers.values_mut() {
            provider.server_url = expand_string(&re, &provider.server_url);
            provider.client_id = expand_string(&re, &provider.client_id);
            provider.client_secret = expand_string(&re, &provider.client_secret);
        }
        for route in &mut self.proxy.routes {
            for host in &mut route.hosts {
                *host = expand_string(&re, host);
            }
        }
        for host in &mut self.proxy.hosts {
            *host = expand_string(&re, host);
        }

        Ok(())
    }

    /// Check cross-references between sections.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        let providers = &self.client.providers;

        for (id, provider) in providers {
            url::Url::parse(&provider.server_url).map_err(|e| {
                Error::Config(format!("Provider '{id}' has invalid server_url: {e}"))
            })?;
        }

        let referenced = self
            .client
            .path_prefix_services
            .values()
            .chain(self.security.jwk_service_ids.iter())
            .chain(self.client.default_provider.iter())
            .chain(self.proxy.client_credentials.iter());
        for id in referenced {
            if !providers.contains_key(id) {
                return Err(Error::Config(format!("Unknown OAuth provider '{id}'")));
            }
        }

        for route in &self.proxy.routes {
            if !route.path_prefix.starts_with('/') {
                return Err(Error::Config(format!(
                    "Route prefix must start with '/': {}",
                    route.path_prefix
                )));
            }
            if route.hosts.is_empty() {
                return Err(Error::Config(format!(
                    "Route '{}' has no hosts",
                    route.path_prefix
                )));
            }
        }

        Ok(())
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Human-readable serde for `Duration` ("30s", "5m", "100ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration as milliseconds (e.g., "1500ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else {
            s.trim().parse::<u64>().map(Duration::from_secs)
        }
    }
}
