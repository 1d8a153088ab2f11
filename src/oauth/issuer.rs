//! Client-credential token issuance with renew-ahead
//!
//! Renewal policy for a cached token:
//!
//! | state                         | action                                             |
//! |-------------------------------|----------------------------------------------------|
//! | missing / expired             | renew synchronously, or `NotYetAvailable` while another renewal is outstanding |
//!
//! A synchronous renewal that stalls is retried after the expired-retry
//! delay. A background renewal is never overlapped by a synchronous one.
//! | valid, inside renew window    | return it; start a background renewal              |
//! | valid, outside renew window   | return it                                          |

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::client::{OAuthClient, TokenResponse};
use super::grant::GrantRequest;
use super::provider::ProviderRegistry;
use super::token_cache::{TokenCache, TokenSlot};
use super::IssueError;
use crate::cache::CacheStatsSnapshot;
use crate::clock::Clock;
use crate::config::ClientConfig;

/// Identity of a cached token: issuing provider and requested scopes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    /// Provider service id
    pub service_id: String,
    /// Requested scopes (sorted, deduplicated)
    pub scopes: Vec<String>,
}

impl TokenKey {
    /// Key for `service_id` and `scopes` (order-insensitive).
    #[must_use]
    pub fn new(service_id: impl Into<String>, scopes: &[String]) -> Self {
        let mut scopes = scopes.to_vec();
        scopes.sort();
        scopes.dedup();
        Self {
            service_id: service_id.into(),
            scopes,
        }
    }

    /// Cache key string, `service:scope1 scope2`
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.service_id, self.scopes.join(" "))
    }
}

/// A usable bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Raw access token
    pub access_token: String,
    /// Absolute expiry, ms since the epoch
    pub expires_at_ms: u64,
    /// Scopes the token carries
    pub scopes: Vec<String>,
}

impl IssuedToken {
    /// `Authorization` header value
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Issues and renews outbound tokens
pub struct TokenIssuer {
    client: Arc<OAuthClient>,
    providers: Arc<ProviderRegistry>,
    cache: Arc<TokenCache>,
    clock: Arc<dyn Clock>,
    renew_before_ms: u64,
    expired_retry_ms: u64,
    early_retry_ms: u64,
}

/// Clears the renewing flag when the renewal attempt ends, however it ends,
/// unless a newer attempt has started since.
struct RenewingGuard {
    slot: TokenSlot,
    generation: u64,
}

impl Drop for RenewingGuard {
    fn drop(&mut self) {
        self.slot.lock().end_renewal(self.generation);
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl TokenIssuer {
    /// Create an issuer over a shared client, registry and clock.
    #[must_use]
    pub fn new(
        client: Arc<OAuthClient>,
        providers: Arc<ProviderRegistry>,
        config: &ClientConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            providers,
            cache: Arc::new(TokenCache::new(config.token_cache_capacity)),
            clock,
            renew_before_ms: millis(config.token_renew_before_expired),
            expired_retry_ms: millis(config.expired_refresh_retry_delay),
            early_retry_ms: millis(config.early_refresh_retry_delay),
        }
    }

    /// Client-credential token for a provider's configured scopes.
    pub async fn client_credentials(&self, service_id: &str) -> Result<IssuedToken, IssueError> {
        let provider = self
            .providers
            .get(service_id)
            .ok_or_else(|| IssueError::UnknownProvider(service_id.to_string()))?;
        self.get_token(&TokenKey::new(service_id, &provider.config.scopes))
            .await
    }

    /// Cached client-credential token for `key`, renewing as needed.
    pub async fn get_token(&self, key: &TokenKey) -> Result<IssuedToken, IssueError> {
        let provider = self
            .providers
            .get(&key.service_id)
            .ok_or_else(|| IssueError::UnknownProvider(key.service_id.clone()))?;
        let cache_key = key.cache_key();
        let (slot, created) = self.cache.get_or_create(&cache_key, &key.scopes, &provider);
        if created {
            debug!(key = %cache_key, "Token cache miss");
        }

        let now = self.clock.now_millis();

        // Decide under the lock, act after releasing it.
        let decision = {
            let mut token = slot.lock();
            if token.is_expired(now) {
                // A background renewal still in flight is waited out; only a
                // stalled synchronous one is retried after the delay.
                if !token.renewing || (token.renewing_sync && now > token.expired_retry_at_ms) {
                    token.expired_retry_at_ms = now.saturating_add(self.expired_retry_ms);
                    Decision::RenewNow(token.begin_renewal(true))
                } else {
                    Decision::NotYetAvailable
                }
            } else {
                let current = IssuedToken {
                    access_token: token.token.clone().unwrap_or_default(),
                    expires_at_ms: token.expires_at_ms,
                    scopes: token.scopes.clone(),
                };
                if token.expires_at_ms - now < self.renew_before_ms
                    && (!token.renewing || now > token.early_retry_at_ms)
                {
                    token.early_retry_at_ms = now.saturating_add(self.early_retry_ms);
                    Decision::RenewInBackground(current, token.begin_renewal(false))
                } else {
                    Decision::Current(current)
                }
            }
        };

        match decision {
            Decision::Current(token) => Ok(token),
            Decision::NotYetAvailable => {
                debug!(key = %cache_key, "Token renewal in progress, not yet available");
                Err(IssueError::NotYetAvailable { key: cache_key })
            }
            Decision::RenewNow(generation) => {
                let guard = RenewingGuard {
                    slot: Arc::clone(&slot),
                    generation,
                };
                let result = renew(&self.client, self.clock.as_ref(), &slot).await;
                drop(guard);
                result
            }
            Decision::RenewInBackground(current, generation) => {
                let client = Arc::clone(&self.client);
                let clock = Arc::clone(&self.clock);
                let guard = RenewingGuard {
                    slot: Arc::clone(&slot),
                    generation,
                };
                tokio::spawn(async move {
                    if let Err(e) = renew(&client, clock.as_ref(), &guard.slot).await {
                        warn!(key = %cache_key, error = %e, "Background token renewal failed");
                    }
                    drop(guard);
                });
                Ok(current)
            }
        }
    }

    /// One uncached grant exchange (authorization code, refresh, SAML, ...).
    pub async fn exchange(
        &self,
        service_id: &str,
        grant: &GrantRequest,
    ) -> Result<TokenResponse, IssueError> {
        let provider = self
            .providers
            .get(service_id)
            .ok_or_else(|| IssueError::UnknownProvider(service_id.to_string()))?;
        self.client.request_token(&grant.compose(&provider)).await
    }

    /// Token cache statistics
    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// Shared token cache
    #[must_use]
    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }
}

enum Decision {
    Current(IssuedToken),
    RenewInBackground(IssuedToken, u64),
    RenewNow(u64),
    NotYetAvailable,
}

/// Exactly one remote call; the entry is updated in place on success.
async fn renew(
    client: &OAuthClient,
    clock: &dyn Clock,
    slot: &TokenSlot,
) -> Result<IssuedToken, IssueError> {
    let (key, request) = {
        let token = slot.lock();
        let grant = GrantRequest::ClientCredentials {
            scopes: token.scopes.clone(),
        };
        (token.key.clone(), grant.compose(&token.provider))
    };

    let response = client.request_token(&request).await.inspect_err(|e| {
        warn!(key = %key, url = %request.url, error = %e, "Token renewal failed");
    })?;

    let issued_at = clock.now_millis();
    let expires_in_ms = response.expires_in.unwrap_or(0).saturating_mul(1000);
    let mut token = slot.lock();
    token.token = Some(response.access_token);
    token.expires_at_ms = issued_at.saturating_add(expires_in_ms);
    if let Some(scope) = response.scope.filter(|s| !s.trim().is_empty()) {
        token.scopes = scope.split_whitespace().map(ToString::to_string).collect();
    }
    info!(key = %key, expires_at_ms = token.expires_at_ms, "Token renewed");

    Ok(IssuedToken {
        access_token: token.token.clone().unwrap_or_default(),
        expires_at_ms: token.expires_at_ms,
        scopes: token.scopes.clone(),
    })
}
