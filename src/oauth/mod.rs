//! Outbound OAuth 2.0 client
//!
//! Obtains and renews the bearer tokens this gateway presents to other
//! services, and talks to the provider key and introspection endpoints on
//! behalf of the verifier.
//!
//! Features:
//! - Provider registry with a path prefix → service id table
//! - Closed set of grant request composers
//! - Client-credential token cache with synchronous and background renewal
//! - Typed failures for rejected, malformed and unreachable responses

mod client;
mod grant;
mod issuer;
mod provider;
mod token_cache;

pub use client::{ErrorStatus, IntrospectionResponse, OAuthClient, RemoteError, TokenResponse};
pub use grant::{GrantRequest, WireRequest};
pub use issuer::{IssuedToken, TokenIssuer, TokenKey};
pub use provider::{Provider, ProviderRegistry};
pub use token_cache::{CachedToken, TokenCache, TokenSlot};

pub(crate) use provider::prefix_applies;

use thiserror::Error;

/// Token issuance failures
#[derive(Error, Debug)]
pub enum IssueError {
    /// Another renewal for this key is outstanding; retry shortly
    #[error("token for '{key}' is not yet available, renewal in progress")]
    NotYetAvailable {
        /// Cache key
        key: String,
    },

    /// No provider with this service id is configured
    #[error("no OAuth provider configured for service '{0}'")]
    UnknownProvider(String),

    /// The provider answered with an error-status body
    #[error("token request rejected ({status} {code}): {message}")]
    Rejected {
        /// Status from the body (or the response)
        status: u16,
        /// Provider error code
        code: String,
        /// Description
        message: String,
    },

    /// JSON that is neither a token nor an error status
    #[error("malformed token response: {0}")]
    Malformed(String),

    /// The endpoint could not be reached or answered unusably
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl IssueError {
    /// Configuration fault rather than a runtime failure
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::UnknownProvider(_))
    }

    /// Expected to clear once the outstanding renewal completes
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotYetAvailable { .. })
    }
}

/// First four characters of a secret followed by `****`.
#[must_use]
pub fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{visible}****")
    }
}
