//! Authentication middleware
//!
//! Supports:
//! - Bearer JWTs verified against provider signing keys
//! - Opaque tokens verified by introspection (when enabled)
//! - Per-path required scopes
//! - Path prefixes that bypass authentication

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, error, warn};

use super::claims::VerifiedClaims;
use super::keys::KeyContext;
use super::swt::SwtVerifier;
use super::verifier::TokenVerifier;
use super::VerifyError;
use crate::config::SecurityConfig;
use crate::oauth::{ProviderRegistry, prefix_applies};

/// Everything the middleware needs, built once by the composition root
pub struct AuthState {
    enabled: bool,
    verifier: Arc<TokenVerifier>,
    swt: Option<Arc<SwtVerifier>>,
    providers: Arc<ProviderRegistry>,
    skip_path_prefixes: Vec<String>,
    service_ids: Vec<String>,
    /// (prefix, scopes), longest prefix first
    required_scopes: Vec<(String, Vec<String>)>,
}

impl AuthState {
    /// Build from the `security` section.
    #[must_use]
    pub fn new(
        config: &SecurityConfig,
        verifier: Arc<TokenVerifier>,
        swt: Option<Arc<SwtVerifier>>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        let mut required_scopes: Vec<(String, Vec<String>)> = config
            .required_scopes
            .iter()
            .map(|(prefix, scopes)| (prefix.clone(), scopes.clone()))
            .collect();
        required_scopes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            enabled: config.enabled,
            verifier,
            swt,
            providers,
            skip_path_prefixes: config.skip_path_prefixes.clone(),
            service_ids: config.jwk_service_ids.clone(),
            required_scopes,
        }
    }

    /// Whether `path` bypasses authentication
    #[must_use]
    pub fn is_skipped(&self, path: &str) -> bool {
        self.skip_path_prefixes
            .iter()
            .any(|prefix| prefix_applies(prefix, path))
    }

    /// Key context and result-cache scope for a request path.
    ///
    /// An explicit service id list wins; otherwise a configured path table
    /// selects one provider by longest prefix.
    #[must_use]
    pub fn context_for(&self, path: &str) -> (KeyContext, Option<String>) {
        if !self.service_ids.is_empty() {
            return (KeyContext::ByServiceIds(self.service_ids.clone()), None);
        }
        if self.providers.has_path_table() {
            let scope = self.providers.match_path(path).map(|(prefix, _)| prefix.to_string());
            return (KeyContext::ByPath(path.to_string()), scope);
        }
        (KeyContext::Default, None)
    }

    fn required_scopes_for(&self, path: &str) -> Option<&[String]> {
        self.required_scopes
            .iter()
            .find(|(prefix, _)| prefix_applies(prefix, path))
            .map(|(_, scopes)| scopes.as_slice())
    }

    /// Verify the bearer token on a request to `path`.
    pub async fn authenticate(
        &self,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<Arc<VerifiedClaims>, VerifyError> {
        let token = bearer_token(headers).ok_or(VerifyError::MissingToken)?;
        let (context, scope) = self.context_for(path);

        let claims = if is_jwt(token) {
            self.verifier.verify(token, &context, scope.as_deref()).await?
        } else if let Some(swt) = &self.swt {
            swt.verify(token, &context).await?
        } else {
            return Err(VerifyError::Malformed("not a JWT".to_string()));
        };

        if let Some(required) = self.required_scopes_for(path) {
            if !claims.has_any_scope(required) {
                return Err(VerifyError::InsufficientScope);
            }
        }
        Ok(claims)
    }
}

/// `Authorization: Bearer <token>` (scheme is case-insensitive)
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn is_jwt(token: &str) -> bool {
    token.bytes().filter(|b| *b == b'.').count() == 2
}

/// Authentication middleware
///
/// On success the verified claims are inserted as a request extension
/// (`Arc<VerifiedClaims>`) for the proxy.
pub async fn auth_middleware(
    State(state): State<Arc<AuthState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if !state.enabled || state.is_skipped(&path) {
        debug!(path = %path, "Authentication skipped");
        return next.run(request).await;
    }

    let verified = state.authenticate(&path, request.headers()).await;
    match verified {
        Ok(claims) => {
            debug!(path = %path, subject = ?claims.subject, client_id = ?claims.client_id, "Authenticated request");
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => rejection(&path, &e),
    }
}

fn rejection(path: &str, err: &VerifyError) -> Response {
    match err {
        e if e.is_config() => {
            error!(path = %path, error = %e, "Authentication misconfigured");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal_error"})),
            )
                .into_response()
        }
        VerifyError::InsufficientScope => {
            warn!(path = %path, "Token lacks required scope");
            (
                StatusCode::FORBIDDEN,
                [("WWW-Authenticate", "Bearer error=\"insufficient_scope\"")],
                Json(json!({"error": "insufficient_scope"})),
            )
                .into_response()
        }
        e => {
            warn!(path = %path, error = %e, "Rejected bearer token");
            (
                StatusCode::UNAUTHORIZED,
                [("WWW-Authenticate", "Bearer")],
                Json(json!({"error": "unauthorized"})),
            )
                .into_response()
        }
    }
}
