//! Opaque (by-reference) token verification through introspection

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::VerifyError;
use super::claims::VerifiedClaims;
use super::keys::{KeyContext, providers_for};
use super::result_cache::ResultCache;
use crate::cache::CacheStatsSnapshot;
use crate::clock::Clock;
use crate::config::SecurityConfig;
use crate::oauth::{IntrospectionResponse, OAuthClient, ProviderRegistry};

/// Introspects opaque tokens and caches active results
pub struct SwtVerifier {
    client: Arc<OAuthClient>,
    providers: Arc<ProviderRegistry>,
    cache: ResultCache,
    clock: Arc<dyn Clock>,
    clock_skew_secs: u64,
}

impl SwtVerifier {
    /// Create a verifier sharing the OAuth client and provider registry.
    #[must_use]
    pub fn new(
        client: Arc<OAuthClient>,
        providers: Arc<ProviderRegistry>,
        config: &SecurityConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            providers,
            cache: ResultCache::new(
                config.jwt_cache_ttl,
                config.jwt_cache_full_size,
                Arc::clone(&clock),
            ),
            clock,
            clock_skew_secs: config.clock_skew_seconds,
        }
    }

    /// Introspect `token` at the candidate providers in order; the first
    /// that reports it active wins.
    ///
    /// Cached results are keyed by the answering provider, so a token one
    /// provider vouched for is only reused where that provider is a candidate.
    pub async fn verify(
        &self,
        token: &str,
        context: &KeyContext,
    ) -> Result<Arc<VerifiedClaims>, VerifyError> {
        let candidates = providers_for(&self.providers, context)?;

        for provider in &candidates {
            let key = cache_key(&provider.id, token);
            if let Some(claims) = self.cache.get(&key) {
                if let Err(e) = self.check_expiry(claims.expires_at) {
                    self.cache.remove(&key);
                    return Err(e);
                }
                return Ok(claims);
            }
        }

        let mut last = VerifyError::Inactive("token is not active".to_string());
        for provider in candidates {
            let response = match self.client.introspect(&provider, token).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(service_id = %provider.id, error = %e, "Introspection failed");
                    last = VerifyError::Introspection(e);
                    continue;
                }
            };
            if let Some(error) = &response.error {
                debug!(service_id = %provider.id, error = %error, "Introspection refused");
                last = VerifyError::Inactive(
                    response.error_description.clone().unwrap_or_else(|| error.clone()),
                );
                continue;
            }
            if !response.active {
                last = VerifyError::Inactive("token is not active".to_string());
                continue;
            }

            self.check_expiry(response.exp)?;
            let claims = Arc::new(VerifiedClaims::from_map(introspection_claims(&response))?);
            self.cache
                .put(cache_key(&provider.id, token), Arc::clone(&claims));
            return Ok(claims);
        }
        Err(last)
    }

    fn check_expiry(&self, exp: Option<u64>) -> Result<(), VerifyError> {
        match exp {
            Some(exp) => {
                let now = self.clock.now_secs();
                if now.saturating_sub(self.clock_skew_secs) >= exp {
                    Err(VerifyError::Expired { exp, now })
                } else {
                    Ok(())
                }
            }
            // Active without exp: the provider vouches for it
            None => Ok(()),
        }
    }

    /// Introspection result cache statistics
    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// Sweep expired introspection results
    pub fn evict_expired(&self) -> usize {
        self.cache.evict_expired()
    }
}

fn cache_key(service_id: &str, token: &str) -> String {
    ResultCache::key(Some(&format!("swt:{service_id}")), token)
}

fn introspection_claims(response: &IntrospectionResponse) -> Map<String, Value> {
    let mut map = Map::new();
    let mut put = |name: &str, value: Value| {
        if !value.is_null() {
            map.insert(name.to_string(), value);
        }
    };
    put("active", json!(response.active));
    put("client_id", json!(response.client_id));
    put("token_type", json!(response.token_type));
    put("scope", json!(response.scope));
    put("sub", json!(response.sub));
    put("exp", json!(response.exp));
    put("iat", json!(response.iat));
    put("iss", json!(response.iss));
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_depends_on_provider() {
        assert_ne!(cache_key("petstoreAuth", "tok"), cache_key("marketAuth", "tok"));
        assert_eq!(cache_key("petstoreAuth", "tok"), cache_key("petstoreAuth", "tok"));
    }

    #[test]
    fn introspection_fields_become_claims() {
        let response = IntrospectionResponse {
            active: true,
            client_id: Some("svc".to_string()),
            scope: Some("pet.r pet.w".to_string()),
            exp: Some(42),
            ..IntrospectionResponse::default()
        };
        let map = introspection_claims(&response);
        assert!(!map.contains_key("sub"));

        let claims = VerifiedClaims::from_map(map).unwrap();
        assert_eq!(claims.client_id.as_deref(), Some("svc"));
        assert_eq!(claims.scopes, vec!["pet.r", "pet.w"]);
        assert_eq!(claims.expires_at, Some(42));
    }
}
