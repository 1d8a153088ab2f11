//! HTTP client for the OAuth provider endpoints
//!
//! Token issuance and key lookup use separate `reqwest` clients so a slow key
//! server cannot exhaust the connection pool that token renewal relies on.
//! Both are built once by the composition root and shared behind `Arc`.

use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use reqwest::{Client, Response, header::CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::grant::WireRequest;
use super::provider::Provider;
use super::{IssueError, mask};

/// Failure talking to a provider endpoint
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Connection, TLS or timeout failure
    #[error("request to {url} failed: {source}")]
    Transport {
        /// Endpoint URL
        url: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// Non-success status without a recognisable error body
    #[error("{url} returned HTTP {status}")]
    Status {
        /// Endpoint URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// Body was not the expected media type
    #[error("{url} returned unexpected content type '{content_type}'")]
    ContentType {
        /// Endpoint URL
        url: String,
        /// Received `Content-Type`
        content_type: String,
    },

    /// Endpoint URL could not be built
    #[error("cannot build a request URL from {url}: {message}")]
    InvalidUrl {
        /// Base URL or offending input
        url: String,
        /// Reason
        message: String,
    },

    /// Body could not be decoded
    #[error("{url} returned a malformed body: {message}")]
    Body {
        /// Endpoint URL
        url: String,
        /// Decoder message
        message: String,
    },
}

/// Successful token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Bearer token
    pub access_token: String,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Granted scopes, space separated
    #[serde(default)]
    pub scope: Option<String>,
}

/// Error envelope returned by the provider in place of a token
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorStatus {
    /// HTTP status echoed in the body
    pub status_code: Option<u16>,
    /// Stable error code, e.g. `ERR12001`
    pub code: Option<String>,
    /// Short message
    pub message: Option<String>,
    /// Human readable description
    pub description: Option<String>,
    /// `ERROR`, `WARN`, ...
    pub severity: Option<String>,
}

/// Token introspection response (RFC 7662 plus provider error fields)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IntrospectionResponse {
    /// Whether the token is currently valid
    pub active: bool,
    /// Client the token was issued to
    pub client_id: Option<String>,
    /// Token type
    pub token_type: Option<String>,
    /// Space separated scopes
    pub scope: Option<String>,
    /// Subject
    pub sub: Option<String>,
    /// Expiry, seconds since the epoch
    pub exp: Option<u64>,
    /// Issued at, seconds since the epoch
    pub iat: Option<u64>,
    /// Issuer
    pub iss: Option<String>,
    /// Error code when the provider refused the request
    pub error: Option<String>,
    /// Error description
    pub error_description: Option<String>,
}

/// Shared client for token, key and introspection calls
#[derive(Debug, Clone)]
pub struct OAuthClient {
    /// Token issuance and introspection
    token_http: Client,
    /// Key and JWKS lookup
    lookup_http: Client,
}

impl OAuthClient {
    /// Build both HTTP clients with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(request_timeout: Duration) -> crate::Result<Self> {
        let build = |purpose: &str| {
            Client::builder()
                .timeout(request_timeout)
                .user_agent(concat!("authproxy/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| crate::Error::Internal(format!("{purpose} client: {e}")))
        };
        Ok(Self {
            token_http: build("token")?,
            lookup_http: build("key lookup")?,
        })
    }

    /// Send a composed grant request and decode the token response.
    ///
    /// The body is only trusted when it is JSON; an `access_token` member
    /// marks success, an error-status envelope is surfaced as
    /// [`IssueError::Rejected`].
    pub async fn request_token(&self, request: &WireRequest) -> Result<TokenResponse, IssueError> {
        let mut builder = self.token_http.post(&request.url).form(&request.form);
        if let Some((client_id, secret)) = &request.basic_auth {
            debug!(
                url = %request.url,
                client_id = %client_id,
                secret = %mask(secret),
                grant_type = request.field("grant_type").unwrap_or_default(),
                "Requesting token"
            );
            builder = builder.basic_auth(client_id, Some(secret));
        }

        let response = builder.send().await.map_err(|source| RemoteError::Transport {
            url: request.url.clone(),
            source,
        })?;

        let status = response.status();
        let Some(body) = json_body(&request.url, response).await? else {
            return Err(if status.is_success() {
                IssueError::Malformed("token response is not JSON".to_string())
            } else {
                RemoteError::Status {
                    url: request.url.clone(),
                    status: status.as_u16(),
                }
                .into()
            });
        };

        if status.is_success() && body.get("access_token").is_some_and(Value::is_string) {
            let token: TokenResponse = serde_json::from_value(body)
                .map_err(|e| IssueError::Malformed(e.to_string()))?;
            return match token.expires_in {
                Some(secs) if secs > 0 => Ok(token),
                _ => Err(IssueError::Malformed(
                    "token response has no positive expires_in".to_string(),
                )),
            };
        }

        if body.get("code").is_some() || body.get("statusCode").is_some() {
            let error: ErrorStatus = serde_json::from_value(body).unwrap_or_default();
            warn!(
                url = %request.url,
                status = status.as_u16(),
                code = error.code.as_deref().unwrap_or("-"),
                "Token request rejected"
            );
            return Err(IssueError::Rejected {
                status: error.status_code.unwrap_or(status.as_u16()),
                code: error.code.unwrap_or_default(),
                message: error
                    .description
                    .or(error.message)
                    .unwrap_or_else(|| "token request rejected".to_string()),
            });
        }

        if status.is_success() {
            Err(IssueError::Malformed(
                "token response has neither access_token nor an error status".to_string(),
            ))
        } else {
            Err(RemoteError::Status {
                url: request.url.clone(),
                status: status.as_u16(),
            }
            .into())
        }
    }

    /// `GET <server><key_uri>/<kid>`, returning the certificate body.
    ///
    /// The kid is sent as a single percent-encoded path segment.
    pub async fn fetch_certificate(&self, provider: &Provider, kid: &str) -> Result<String, RemoteError> {
        let url = certificate_url(&provider.endpoint(&provider.config.key_uri), kid)?;
        debug!(service_id = %provider.id, url = %url, "Fetching signing certificate");

        let response = self.key_request(provider, &url).await?;
        response.text().await.map_err(|e| RemoteError::Body {
            url,
            message: e.to_string(),
        })
    }

    /// `GET <server><jwk_uri>`, returning the parsed key set.
    pub async fn fetch_jwks(&self, provider: &Provider) -> Result<JwkSet, RemoteError> {
        let url = provider.endpoint(&provider.config.jwk_uri);
        debug!(service_id = %provider.id, url = %url, "Fetching JWK set");

        let response = self.key_request(provider, &url).await?;
        let text = response.text().await.map_err(|e| RemoteError::Body {
            url: url.clone(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| RemoteError::Body {
            url,
            message: e.to_string(),
        })
    }

    /// `POST <server><introspect_uri>` with `token=<token>`.
    pub async fn introspect(
        &self,
        provider: &Provider,
        token: &str,
    ) -> Result<IntrospectionResponse, RemoteError> {
        let url = provider.endpoint(&provider.config.introspect_uri);
        debug!(service_id = %provider.id, url = %url, "Introspecting token");

        let response = self
            .token_http
            .post(&url)
            .basic_auth(&provider.config.client_id, Some(&provider.config.client_secret))
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|source| RemoteError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        match json_body(&url, response).await? {
            Some(body) => serde_json::from_value(body).map_err(|e| RemoteError::Body {
                url,
                message: e.to_string(),
            }),
            None if status.is_success() => Err(RemoteError::ContentType {
                url,
                content_type: "non-JSON".to_string(),
            }),
            None => Err(RemoteError::Status {
                url,
                status: status.as_u16(),
            }),
        }
    }

    async fn key_request(&self, provider: &Provider, url: &str) -> Result<Response, RemoteError> {
        let mut builder = self.lookup_http.get(url);
        if provider.config.key_basic_auth {
            builder = builder.basic_auth(&provider.config.client_id, Some(&provider.config.client_secret));
        }
        let response = builder.send().await.map_err(|source| RemoteError::Transport {
            url: url.to_string(),
            source,
        })?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

fn certificate_url(base: &str, kid: &str) -> Result<String, RemoteError> {
    let invalid = |message: String| RemoteError::InvalidUrl {
        url: base.to_string(),
        message,
    };
    if matches!(kid, "" | "." | "..") {
        return Err(invalid(format!("'{kid}' is not a usable key id")));
    }
    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid("base URL has no path".to_string()))?
        .pop_if_empty()
        .push(kid);
    Ok(url.into())
}

/// Decode the body as JSON when the response says it is JSON.
///
/// Returns `Ok(None)` for any other content type.
async fn json_body(url: &str, response: Response) -> Result<Option<Value>, RemoteError> {
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
    if !is_json {
        return Ok(None);
    }
    let text = response.text().await.map_err(|e| RemoteError::Body {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&text).map(Some).map_err(|e| RemoteError::Body {
        url: url.to_string(),
        message: e.to_string(),
    })
}
