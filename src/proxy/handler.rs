//! Request relay: target selection, retries and deadlines

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::ConnectInfo,
    response::{IntoResponse, Response},
};
use http::header::{AUTHORIZATION, CONNECTION, HOST, HeaderValue, UPGRADE};
use http::{Method, Request, StatusCode, Uri, Version, request::Parts};
use hyper::body::{Body as _, Incoming};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::headers::{
    ClientInfo, HeaderRules, X_JWT_CLAIMS, X_SCOPE_TOKEN, outbound_headers, response_headers,
    wants_upgrade,
};
use super::pool::{ConnectionPool, PooledConnection, SendFailure};
use super::retry::RetryPolicy;
use super::target::{ProxyRoutes, TargetPool, Upstream};
use super::transfer::{RelayBody, relay_upgrade};
use super::ProxyError;
use crate::config::ProxyConfig;
use crate::oauth::{IssueError, TokenIssuer};
use crate::security::VerifiedClaims;

/// Relays matched requests to their upstream pool
pub struct ProxyHandler {
    routes: ProxyRoutes,
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    rules: HeaderRules,
    max_request_time: Option<Duration>,
    forward_jwt_claims: bool,
    service_token: Option<(Arc<TokenIssuer>, String)>,
}

impl ProxyHandler {
    /// Build from the `proxy` section. `issuer` is required only when
    /// `client_credentials` names a provider.
    pub fn new(config: &ProxyConfig, issuer: Option<Arc<TokenIssuer>>) -> Result<Self, ProxyError> {
        let service_token = match (&config.client_credentials, issuer) {
            (Some(service_id), Some(issuer)) => Some((issuer, service_id.clone())),
            (Some(service_id), None) => {
                return Err(ProxyError::InvalidTarget(format!(
                    "client credentials for '{service_id}' need a token issuer"
                )));
            }
            (None, _) => None,
        };

        Ok(Self {
            routes: ProxyRoutes::from_config(config)?,
            pool: Arc::new(ConnectionPool::new(config)?),
            retry: RetryPolicy::new(config),
            rules: HeaderRules {
                rewrite_host: config.rewrite_host_header,
                reuse_x_forwarded: config.reuse_x_forwarded,
            },
            max_request_time: (!config.max_request_time.is_zero()).then_some(config.max_request_time),
            forward_jwt_claims: config.forward_jwt_claims,
            service_token,
        })
    }

    /// Upstream pool for `path`; `None` means the request is not proxied
    /// and belongs to the next handler.
    #[must_use]
    pub fn route(&self, path: &str) -> Option<Arc<TargetPool>> {
        self.routes.resolve(path)
    }

    /// Upstream connection pool
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Relay `request` to `target`.
    ///
    /// Connection failures are retried against the next host for idempotent
    /// methods. Once the upstream answered, its status is passed through.
    pub async fn forward(&self, target: Arc<TargetPool>, mut request: Request<Body>) -> Response {
        // Tunnels cannot be relayed through a path-routed upstream
        if request.method() == Method::CONNECT {
            debug!(uri = %request.uri(), "Refusing CONNECT");
            return failure(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed");
        }

        let deadline = self.max_request_time.map(|d| Instant::now() + d);

        let service_token = match self.service_token().await {
            Ok(token) => token,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Client-credential token not yet available");
                return unavailable();
            }
            Err(e) => {
                error!(error = %e, "Failed to obtain client-credential token");
                return failure(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
            }
        };

        let inbound_upgrade = wants_upgrade(request.headers()).then(|| hyper::upgrade::on(&mut request));
        let (parts, body) = request.into_parts();
        let exchange = self.exchange(&target, &parts, body, service_token.as_ref());

        let outcome = match deadline {
            Some(at) => match tokio::time::timeout_at(at, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(path = %parts.uri.path(), "Request deadline exceeded before response");
                    return unavailable();
                }
            },
            None => exchange.await,
        };

        let (response, mut connection) = match outcome {
            Ok(exchanged) => exchanged,
            Err(e) => {
                warn!(path = %parts.uri.path(), error = %e, "Proxy request failed");
                return unavailable();
            }
        };

        let status = response.status();
        debug!(path = %parts.uri.path(), status = %status, "Upstream responded");

        if status == StatusCode::SWITCHING_PROTOCOLS {
            let mut response = response;
            if let Some(inbound) = inbound_upgrade {
                relay_upgrade(inbound, &mut response);
            }
            let (mut head, _) = response.into_parts();
            head.headers = response_headers(&head.headers, true);
            return Response::from_parts(head, Body::empty());
        }

        let (mut head, body) = response.into_parts();
        head.headers = response_headers(&head.headers, false);
        head.version = Version::default();

        if body.is_end_stream() {
            connection.mark_reusable();
            return Response::from_parts(head, Body::empty());
        }
        let deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
        Response::from_parts(head, Body::new(RelayBody::new(body, deadline, connection)))
    }

    async fn service_token(&self) -> Result<Option<HeaderValue>, IssueError> {
        let Some((issuer, service_id)) = &self.service_token else {
            return Ok(None);
        };
        let token = issuer.client_credentials(service_id).await?;
        Ok(HeaderValue::from_str(&token.bearer()).ok())
    }

    /// Attempt loop. The body stays with the proxy until a connection is up
    /// and is handed back by hyper when the request never left.
    async fn exchange(
        &self,
        target: &TargetPool,
        parts: &Parts,
        mut body: Body,
        service_token: Option<&HeaderValue>,
    ) -> Result<(Response<Incoming>, PooledConnection), ProxyError> {
        let mut attempt = 0u32;
        loop {
            let upstream = target.next_host();
            let failure = match self.pool.acquire(&upstream).await {
                Ok(mut connection) => {
                    let http2 = connection.is_http2();
                    let request =
                        self.upstream_request(target, &upstream, parts, body, service_token, http2)?;
                    match connection.send(request).await {
                        Ok(response) => return Ok((response, connection)),
                        Err(SendFailure { error, unsent: Some(unsent) }) => {
                            body = unsent.into_body();
                            error
                        }
                        Err(SendFailure { error, unsent: None }) => return Err(error),
                    }
                }
                Err(e) if e.is_connect() => e,
                Err(e) => return Err(e),
            };

            if !self.retry.should_retry(&parts.method, attempt) {
                return Err(failure);
            }
            info!(
                upstream = %upstream.authority(),
                attempt = attempt + 1,
                error = %failure,
                "Retrying request on next upstream"
            );
            attempt += 1;
        }
    }

    fn upstream_request(
        &self,
        target: &TargetPool,
        upstream: &Upstream,
        parts: &Parts,
        body: Body,
        service_token: Option<&HeaderValue>,
        http2: bool,
    ) -> Result<Request<Body>, ProxyError> {
        let path = target.rewrite_path(upstream, parts.uri.path(), parts.uri.query());
        let uri = if http2 {
            format!("{}://{}{path}", upstream.scheme(), upstream.authority()).parse::<Uri>()
        } else {
            path.parse::<Uri>()
        }
        .map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;

        let inbound_host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.authority().map(http::uri::Authority::as_str));
        let client = parts
            .extensions
            .get::<ConnectInfo<ClientInfo>>()
            .map(|info| &info.0);
        let mut headers = outbound_headers(&parts.headers, inbound_host, upstream, client, self.rules);

        headers.remove(X_JWT_CLAIMS);
        if self.forward_jwt_claims {
            if let Some(claims) = parts.extensions.get::<Arc<VerifiedClaims>>() {
                if let Ok(v) = HeaderValue::from_bytes(claims.to_json().as_bytes()) {
                    headers.insert(X_JWT_CLAIMS, v);
                }
            }
        }

        if let Some(token) = service_token {
            if headers.contains_key(AUTHORIZATION) {
                headers.insert(X_SCOPE_TOKEN, token.clone());
            } else {
                headers.insert(AUTHORIZATION, token.clone());
            }
        }

        if http2 {
            headers.remove(CONNECTION);
            headers.remove(UPGRADE);
        }

        let mut request = Request::new(body);
        *request.method_mut() = parts.method.clone();
        *request.uri_mut() = uri;
        *request.version_mut() = if http2 { Version::HTTP_2 } else { Version::HTTP_11 };
        *request.headers_mut() = headers;
        Ok(request)
    }
}

fn unavailable() -> Response {
    failure(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
}

fn failure(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}
