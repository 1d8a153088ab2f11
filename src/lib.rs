//! Authenticating reverse proxy
//!
//! Verifies inbound bearer tokens against signing keys published by one or
//! more OAuth providers, then relays the request to a backend service.
//!
//! # Features
//!
//! - **JWT verification**: JWKS or X.509 key resolution per provider, expiry
//!   checks with clock-skew tolerance, cached verification results
//! - **Opaque tokens**: introspection-based verification
//! - **Client credentials**: outbound tokens renewed ahead of expiry
//! - **Streaming proxy**: pooled upstream connections, retries for
//!   idempotent methods, upgrade relay, per-request deadlines

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod proxy;
pub mod security;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("tracing already initialised: {e}")))
}
