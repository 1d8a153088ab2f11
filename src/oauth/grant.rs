//! Token grant requests and their wire form.
//!
//! Every grant posts `application/x-www-form-urlencoded` to
//! `<server_url><token_uri>`; they differ in form fields and in whether the
//! client authenticates with Basic credentials or a signed assertion.

use super::provider::Provider;

/// SAML 2.0 bearer assertion grant type (RFC 7522).
pub const SAML_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:saml2-bearer";
/// JWT client assertion type (RFC 7523).
pub const JWT_CLIENT_ASSERTION: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// A token request ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    /// Absolute token endpoint URL
    pub url: String,
    /// Form fields in send order
    pub form: Vec<(String, String)>,
    /// Basic authentication (client id, client secret)
    pub basic_auth: Option<(String, String)>,
}

impl WireRequest {
    /// Value of a form field, if present.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Supported grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantRequest {
    /// Service-to-service token for the listed scopes
    ClientCredentials {
        /// Requested scopes (space-joined on the wire)
        scopes: Vec<String>,
    },
    /// Exchange a SAML assertion, client authenticated by a JWT assertion
    SamlBearer {
        /// Base64url SAML assertion
        saml_assertion: String,
        /// Signed JWT authenticating the client
        client_assertion: String,
    },
    /// Token for a user the client has already authenticated
    ClientAuthenticatedUser {
        /// Requested scopes
        scopes: Vec<String>,
        /// User id
        user_id: String,
        /// User type (e.g. `employee`, `customer`)
        user_type: String,
        /// Space separated roles
        roles: Option<String>,
        /// CSRF token bound to the user session
        csrf: Option<String>,
    },
    /// Authorization code exchange
    AuthorizationCode {
        /// Code returned to the redirect URI
        code: String,
        /// Redirect URI used in the authorization request
        redirect_uri: Option<String>,
        /// Requested scopes
        scopes: Vec<String>,
        /// CSRF token bound to the user session
        csrf: Option<String>,
    },
    /// Refresh token exchange
    RefreshToken {
        /// Refresh token
        refresh_token: String,
        /// Requested scopes
        scopes: Vec<String>,
        /// CSRF token bound to the user session
        csrf: Option<String>,
    },
}

impl GrantRequest {
    /// `grant_type` form value.
    #[must_use]
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::ClientCredentials { .. } => "client_credentials",
            Self::SamlBearer { .. } => SAML_BEARER_GRANT,
            Self::ClientAuthenticatedUser { .. } => "client_authenticated_user",
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::RefreshToken { .. } => "refresh_token",
        }
    }

    /// Compose the wire request for `provider`.
    #[must_use]
    pub fn compose(&self, provider: &Provider) -> WireRequest {
        let mut form = vec![("grant_type".to_string(), self.grant_type().to_string())];
        let mut push = |name: &str, value: &str| form.push((name.to_string(), value.to_string()));
        let mut basic_auth = Some((
            provider.config.client_id.clone(),
            provider.config.client_secret.clone(),
        ));

        match self {
            Self::ClientCredentials { scopes } => {
                push_scopes(&mut push, scopes);
            }
            Self::SamlBearer {
                saml_assertion,
                client_assertion,
            } => {
                push("assertion", saml_assertion);
                push("client_assertion_type", JWT_CLIENT_ASSERTION);
                push("client_assertion", client_assertion);
                basic_auth = None;
            }
            Self::ClientAuthenticatedUser {
                scopes,
                user_id,
                user_type,
                roles,
                csrf,
            } => {
                push_scopes(&mut push, scopes);
                push("user_id", user_id);
                push("user_type", user_type);
                if let Some(roles) = roles {
                    push("roles", roles);
                }
                if let Some(csrf) = csrf {
                    push("csrf", csrf);
                }
            }
            Self::AuthorizationCode {
                code,
                redirect_uri,
                scopes,
                csrf,
            } => {
                push("code", code);
                if let Some(uri) = redirect_uri {
                    push("redirect_uri", uri);
                }
                push_scopes(&mut push, scopes);
                if let Some(csrf) = csrf {
                    push("csrf", csrf);
                }
            }
            Self::RefreshToken {
                refresh_token,
                scopes,
                csrf,
            } => {
                push("refresh_token", refresh_token);
                push_scopes(&mut push, scopes);
                if let Some(csrf) = csrf {
                    push("csrf", csrf);
                }
            }
        }

        WireRequest {
            url: provider.endpoint(&provider.config.token_uri),
            form,
            basic_auth,
        }
    }
}

fn push_scopes(push: &mut impl FnMut(&str, &str), scopes: &[String]) {
    if !scopes.is_empty() {
        push("scope", &scopes.join(" "));
    }
}
