//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::debug;

use crate::oauth::TokenIssuer;
use crate::proxy::{ProxyHandler, TargetPool};
use crate::security::{AuthState, SwtVerifier, TokenVerifier, auth_middleware};

/// Shared application state
pub struct AppState {
    /// Reverse proxy (`None` when disabled)
    pub proxy: Option<Arc<ProxyHandler>>,
    /// Outbound token issuer
    pub issuer: Arc<TokenIssuer>,
    /// JWT verifier
    pub verifier: Arc<TokenVerifier>,
    /// Introspection verifier (when opaque tokens are accepted)
    pub swt: Option<Arc<SwtVerifier>>,
}

const HEALTH_PATH: &str = "/health";

/// Create the router
///
/// `/health` is served locally; every other path goes to the proxy. The
/// route is resolved before authentication, so paths no route covers are
/// answered 404 whatever the credentials.
pub fn create_router(state: Arc<AppState>, auth: Arc<AuthState>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health_handler))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), resolve_route))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check with cache statistics
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "token_cache": state.issuer.cache_stats(),
        "keys": state.verifier.keys().stats(),
        "jwt_cache": state.verifier.cache_stats(),
        "swt_cache": state.swt.as_ref().map(|swt| swt.cache_stats()),
    }))
}

/// Attach the matching proxy target as a request extension, or answer 404.
async fn resolve_route(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if path != HEALTH_PATH {
        match state.proxy.as_ref().and_then(|proxy| proxy.route(path)) {
            Some(target) => {
                request.extensions_mut().insert(target);
            }
            None => {
                debug!(path = %path, "No proxy route");
                return not_found();
            }
        }
    }
    next.run(request).await
}

async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let target = request.extensions().get::<Arc<TargetPool>>().cloned();
    match (state.proxy.as_ref(), target) {
        (Some(proxy), Some(target)) => proxy.forward(target, request).await,
        _ => not_found(),
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))).into_response()
}
