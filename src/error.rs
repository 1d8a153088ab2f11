//! Error types for the gateway process
//!
//! Component contracts (`TokenIssuer`, `KeyResolver`, `TokenVerifier`,
//! `ProxyHandler`) carry their own typed errors; this type covers startup,
//! configuration and the server loop, and absorbs component errors at the
//! composition root.

use std::io;

use thiserror::Error;

use crate::oauth::IssueError;
use crate::proxy::ProxyError;
use crate::security::{KeyError, VerifyError};

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Outbound token issuance failed
    #[error(transparent)]
    Issue(#[from] IssueError),

    /// Signing key resolution failed
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Token verification failed
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Proxy relay failed
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is an operator-facing configuration fault.
    #[must_use]
    pub fn is_config(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Key(e) => e.is_config(),
            Self::Issue(e) => e.is_config(),
            _ => false,
        }
    }
}
