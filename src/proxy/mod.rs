//! Streaming reverse proxy
//!
//! Requests whose path matches a configured prefix route are relayed to one
//! of the route's upstream hosts:
//! - per-host pool of exclusively borrowed upstream connections
//! - frame-by-frame body streaming (trailers included) in both directions
//! - connection-failure retries for idempotent methods, next host each time
//! - `X-Forwarded-*`, `Host` and TLS peer header rewriting
//! - `101 Switching Protocols` relayed as a raw bidirectional byte stream

mod handler;
mod headers;
mod pool;
mod retry;
mod target;
mod transfer;

pub use handler::ProxyHandler;
pub use headers::{
    ClientInfo, HeaderRules, TlsPeerInfo, X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PORT,
    X_FORWARDED_PROTO, X_JWT_CLAIMS, X_SCOPE_TOKEN, X_SSL_CIPHER, X_SSL_CLIENT_CERT,
    X_SSL_PROTOCOL, outbound_headers, response_headers, wants_upgrade,
};
pub use pool::{ConnectionPool, PooledConnection, SendFailure};
pub use retry::RetryPolicy;
pub use target::{ProxyRoutes, TargetPool, Upstream};
pub use transfer::RelayBody;

use thiserror::Error;

use crate::oauth::IssueError;

/// Proxy failures
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Upstream URL or route definition is unusable
    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),

    /// Could not establish a connection to the upstream
    #[error("failed to connect to {authority}: {reason}")]
    Connect {
        /// `host:port`
        authority: String,
        /// Underlying cause
        reason: String,
    },

    /// `max_request_time` elapsed
    #[error("request deadline exceeded")]
    Timeout,

    /// The upstream exchange failed after the connection was established
    #[error("upstream exchange failed: {0}")]
    Upstream(String),

    /// Upstream TLS setup failed
    #[error("upstream TLS error: {0}")]
    Tls(String),

    /// No client-credential token could be attached
    #[error(transparent)]
    Token(#[from] IssueError),
}

impl ProxyError {
    pub(crate) fn connect(authority: &str, reason: impl std::fmt::Display) -> Self {
        Self::Connect {
            authority: authority.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Connection could not be established; nothing reached the upstream
    #[must_use]
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_name_the_authority() {
        let err = ProxyError::connect("backend:8080", "connection refused");
        assert!(err.is_connect());
        assert_eq!(
            err.to_string(),
            "failed to connect to backend:8080: connection refused"
        );
        assert!(!ProxyError::Timeout.is_connect());
    }
}
