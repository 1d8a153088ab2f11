//! Outbound header construction
//!
//! The upstream request starts with the headers the proxy sets itself
//! (`Host`, `X-Forwarded-*`, TLS peer data, claims); inbound headers are then
//! copied only where not already set. Hop-by-hop headers never cross, except
//! that `TE: trailers` is passed on so trailer fields can be relayed.

use std::net::SocketAddr;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::header::{
    CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRANSFER_ENCODING, UPGRADE,
};

use super::target::Upstream;

/// `X-Forwarded-For`
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
/// `X-Forwarded-Proto`
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
/// `X-Forwarded-Host`
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
/// `X-Forwarded-Port`
pub const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
/// Verified claims forwarded to the backend
pub const X_JWT_CLAIMS: HeaderName = HeaderName::from_static("x-jwt-claims");
/// Client-credential token when `Authorization` carries the caller's token
pub const X_SCOPE_TOKEN: HeaderName = HeaderName::from_static("x-scope-token");
/// TLS cipher suite of the inbound connection
pub const X_SSL_CIPHER: HeaderName = HeaderName::from_static("x-ssl-cipher");
/// TLS protocol version of the inbound connection
pub const X_SSL_PROTOCOL: HeaderName = HeaderName::from_static("x-ssl-protocol");
/// Base64 DER of the client certificate
pub const X_SSL_CLIENT_CERT: HeaderName = HeaderName::from_static("x-ssl-client-cert");

const HTTP2_SETTINGS: HeaderName = HeaderName::from_static("http2-settings");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// TLS details of the inbound connection, attached by the listener
#[derive(Debug, Clone, Default)]
pub struct TlsPeerInfo {
    /// Negotiated cipher suite, e.g. `TLS13_AES_128_GCM_SHA256`
    pub cipher_suite: Option<String>,
    /// Negotiated protocol version, e.g. `TLSv1_3`
    pub protocol: Option<String>,
    /// Client certificate chain (DER), leaf first
    pub peer_certificates: Vec<Vec<u8>>,
}

/// Where an inbound request came from, attached by the listener
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Remote socket address
    pub remote_addr: SocketAddr,
    /// Local listening port
    pub local_port: u16,
    /// TLS details when the listener terminates TLS
    pub tls: Option<TlsPeerInfo>,
}

impl ClientInfo {
    /// `https` when TLS terminated here
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() { "https" } else { "http" }
    }
}

/// Header rewriting options
#[derive(Debug, Clone, Copy)]
pub struct HeaderRules {
    /// Replace `Host` with the upstream authority
    pub rewrite_host: bool,
    /// Append to / keep existing `X-Forwarded-*` instead of replacing
    pub reuse_x_forwarded: bool,
}

/// Whether the request asks for an upgrade the proxy relays (anything but h2c).
#[must_use]
pub fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.trim().eq_ignore_ascii_case("h2c"))
}

fn is_hop_by_hop(name: &HeaderName, connection_tokens: &[String]) -> bool {
    name == CONNECTION
        || name == KEEP_ALIVE
        || name == PROXY_CONNECTION
        || name == PROXY_AUTHENTICATE
        || name == PROXY_AUTHORIZATION
        || name == TE
        || name == TRANSFER_ENCODING
        || name == UPGRADE
        || name == HTTP2_SETTINGS
        || connection_tokens.iter().any(|t| name.as_str() == t)
}

/// Whether `TE` lists `trailers`
fn accepts_trailers(headers: &HeaderMap) -> bool {
    headers
        .get_all(TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| {
            t.split(';')
                .next()
                .is_some_and(|t| t.trim().eq_ignore_ascii_case("trailers"))
        })
}

/// Lower-cased header names listed in `Connection`
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Build the upstream request headers.
///
/// `inbound_host` is the authority the client addressed (`Host` header or
/// HTTP/2 `:authority`).
#[must_use]
pub fn outbound_headers(
    inbound: &HeaderMap,
    inbound_host: Option<&str>,
    upstream: &Upstream,
    client: Option<&ClientInfo>,
    rules: HeaderRules,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len() + 6);

    if rules.rewrite_host {
        if let Ok(v) = HeaderValue::from_str(&upstream.authority()) {
            out.insert(HOST, v);
        }
    } else if let Some(v) = inbound_host.and_then(|h| HeaderValue::from_str(h).ok()) {
        out.insert(HOST, v);
    }

    if let Some(client) = client {
        set_forwarded(&mut out, inbound, inbound_host, client, rules.reuse_x_forwarded);
        if let Some(tls) = &client.tls {
            set_tls_peer(&mut out, tls);
        }
    }

    let tokens = connection_tokens(inbound);
    for name in inbound.keys() {
        if out.contains_key(name) || is_hop_by_hop(name, &tokens) {
            continue;
        }
        for value in inbound.get_all(name) {
            out.append(name.clone(), value.clone());
        }
    }

    if accepts_trailers(inbound) {
        out.insert(TE, HeaderValue::from_static("trailers"));
    }

    // Protocol switches other than h2c are relayed end to end
    if wants_upgrade(inbound) {
        if let Some(v) = inbound.get(UPGRADE) {
            out.insert(UPGRADE, v.clone());
            out.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        }
    }

    out
}

fn set_forwarded(
    out: &mut HeaderMap,
    inbound: &HeaderMap,
    inbound_host: Option<&str>,
    client: &ClientInfo,
    reuse: bool,
) {
    let ip = client.remote_addr.ip().to_string();
    let forwarded_for = match inbound.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if reuse && !existing.trim().is_empty() => format!("{existing}, {ip}"),
        _ => ip,
    };
    if let Ok(v) = HeaderValue::from_str(&forwarded_for) {
        out.insert(X_FORWARDED_FOR, v);
    }

    let host = inbound_host.unwrap_or_default();
    let port = client.local_port.to_string();
    for (name, value) in [
        (X_FORWARDED_PROTO, client.scheme()),
        (X_FORWARDED_HOST, host),
        (X_FORWARDED_PORT, port.as_str()),
    ] {
        match inbound.get(&name) {
            Some(existing) if reuse => {
                out.insert(name, existing.clone());
            }
            _ => {
                if let Ok(v) = HeaderValue::from_str(value) {
                    if !value.is_empty() {
                        out.insert(name, v);
                    }
                }
            }
        }
    }
}

fn set_tls_peer(out: &mut HeaderMap, tls: &TlsPeerInfo) {
    let pairs = [
        (X_SSL_CIPHER, tls.cipher_suite.clone()),
        (X_SSL_PROTOCOL, tls.protocol.clone()),
        (X_SSL_CLIENT_CERT, tls.peer_certificates.first().map(|der| STANDARD.encode(der))),
    ];
    for (name, value) in pairs {
        if let Some(v) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
            out.insert(name, v);
        }
    }
}

/// Copy response headers from the upstream, dropping hop-by-hop headers.
///
/// `keep_upgrade` preserves `Connection`/`Upgrade` on a 101 response.
#[must_use]
pub fn response_headers(upstream: &HeaderMap, keep_upgrade: bool) -> HeaderMap {
    let tokens = connection_tokens(upstream);
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        let upgrade_header = name == UPGRADE || name == CONNECTION;
        if is_hop_by_hop(name, &tokens) && !(keep_upgrade && upgrade_header) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
