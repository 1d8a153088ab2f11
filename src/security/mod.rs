//! Inbound bearer token verification.
//!
//! Provides signing key resolution across OAuth providers, JWT verification
//! with clock-skew tolerant expiry checks, a verification result cache,
//! introspection of opaque tokens, and the axum middleware that applies them.

mod claims;
mod keys;
mod middleware;
mod result_cache;
mod swt;
mod verifier;

pub use claims::{UnverifiedToken, VerifiedClaims};
pub use keys::{KeyCacheStats, KeyContext, KeyError, KeyKind, KeyResolver, VerificationKey};
pub use middleware::{AuthState, auth_middleware};
pub use result_cache::ResultCache;
pub use swt::SwtVerifier;
pub use verifier::{MIN_RSA_BITS, TokenVerifier};

use thiserror::Error;

use crate::oauth::RemoteError;

/// Token and claim verification failures
#[derive(Error, Debug)]
pub enum VerifyError {
    /// No bearer token on the request
    #[error("missing bearer token")]
    MissingToken,

    /// Not a compact JWT
    #[error("malformed token: {0}")]
    Malformed(String),

    /// A claim has the wrong type or is missing
    #[error("malformed claim '{0}'")]
    MalformedClaim(&'static str),

    /// The header carries no `kid`
    #[error("token header has no 'kid'")]
    MissingKeyId,

    /// `now - skew >= exp`
    #[error("token expired at {exp} (now {now})")]
    Expired {
        /// `exp` claim
        exp: u64,
        /// Verifier clock, seconds
        now: u64,
    },

    /// RSA key below the accepted size
    #[error("key '{kid}' is too weak ({bits} bits)")]
    WeakKey {
        /// Key id
        kid: String,
        /// Modulus size
        bits: usize,
    },

    /// Signature did not verify
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Token lacks every scope the path requires
    #[error("insufficient scope")]
    InsufficientScope,

    /// Verification key could not be resolved
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Introspection reported the token inactive
    #[error("token inactive: {0}")]
    Inactive(String),

    /// Introspection endpoint unreachable
    #[error("introspection failed: {0}")]
    Introspection(RemoteError),
}

impl VerifyError {
    /// Configuration fault rather than a bad token
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Key(e) if e.is_config())
    }
}
