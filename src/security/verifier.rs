//! JWT verification
//!
//! `Unverified → StructurallyParsed → ExpiryChecked → SignatureVerified`, any
//! step may reject. Expiry is checked here with the configured skew, so the
//! signature check runs with `jsonwebtoken`'s own time checks disabled.

use std::collections::HashSet;
use std::sync::Arc;

use jsonwebtoken::{TokenData, Validation};
use serde_json::{Map, Value};
use tracing::debug;

use super::VerifyError;
use super::claims::{UnverifiedToken, VerifiedClaims};
use super::keys::{KeyContext, KeyKind, KeyResolver};
use super::result_cache::ResultCache;
use crate::cache::CacheStatsSnapshot;
use crate::clock::Clock;
use crate::config::SecurityConfig;

/// Smallest RSA modulus accepted without relaxed key validation
pub const MIN_RSA_BITS: usize = 2048;

/// Verifies bearer JWTs against keys from the [`KeyResolver`]
pub struct TokenVerifier {
    keys: Arc<KeyResolver>,
    cache: Option<ResultCache>,
    clock: Arc<dyn Clock>,
    clock_skew_secs: u64,
    relaxed_key_validation: bool,
    ignore_expiry: bool,
}

impl TokenVerifier {
    /// Create a verifier; the result cache is enabled by `enable_jwt_cache`.
    #[must_use]
    pub fn new(keys: Arc<KeyResolver>, config: &SecurityConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = config.enable_jwt_cache.then(|| {
            ResultCache::new(
                config.jwt_cache_ttl,
                config.jwt_cache_full_size,
                Arc::clone(&clock),
            )
        });
        Self {
            keys,
            cache,
            clock,
            clock_skew_secs: config.clock_skew_seconds,
            relaxed_key_validation: config.relaxed_key_validation,
            ignore_expiry: config.ignore_jwt_expiry,
        }
    }

    /// Verify `token`, caching the result under `cache_scope` (usually the
    /// matched path prefix).
    pub async fn verify(
        &self,
        token: &str,
        context: &KeyContext,
        cache_scope: Option<&str>,
    ) -> Result<Arc<VerifiedClaims>, VerifyError> {
        let cache_key = self
            .cache
            .as_ref()
            .map(|_| ResultCache::key(cache_scope, token));

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(claims) = cache.get(key) {
                // The entry can outlive the token
                if !self.ignore_expiry {
                    if let Err(e) = self.check_expiry(claims.expires_at) {
                        cache.remove(key);
                        return Err(e);
                    }
                }
                return Ok(claims);
            }
        }

        let claims = Arc::new(self.verify_uncached(token, context, self.ignore_expiry).await?);

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            cache.put(key, Arc::clone(&claims));
        }
        Ok(claims)
    }

    /// Verify an expired-but-trusted token, e.g. to renew it. Never cached.
    pub async fn verify_ignoring_expiry(
        &self,
        token: &str,
        context: &KeyContext,
    ) -> Result<VerifiedClaims, VerifyError> {
        self.verify_uncached(token, context, true).await
    }

    async fn verify_uncached(
        &self,
        token: &str,
        context: &KeyContext,
        ignore_expiry: bool,
    ) -> Result<VerifiedClaims, VerifyError> {
        let parsed = UnverifiedToken::parse(token)?;

        let exp = parsed.expiry()?;
        if !ignore_expiry {
            self.check_expiry(exp)?;
        }

        let kid = parsed.kid().ok_or(VerifyError::MissingKeyId)?;
        let key = self.keys.resolve(kid, context).await?;

        if let KeyKind::Rsa { bits } = key.kind {
            if !self.relaxed_key_validation && bits < MIN_RSA_BITS {
                return Err(VerifyError::WeakKey {
                    kid: kid.to_string(),
                    bits,
                });
            }
        }

        let mut validation = Validation::new(parsed.header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let data: TokenData<Map<String, Value>> =
            jsonwebtoken::decode(token, &key.key, &validation)
                .map_err(|e| VerifyError::InvalidSignature(e.to_string()))?;

        debug!(kid = %kid, service_id = ?key.service_id, "Token signature verified");
        VerifiedClaims::from_map(data.claims)
    }

    /// Reject when `now - skew >= exp`, or when `exp` is missing.
    fn check_expiry(&self, exp: Option<u64>) -> Result<(), VerifyError> {
        let exp = exp.ok_or(VerifyError::MalformedClaim("exp"))?;
        let now = self.clock.now_secs();
        if now.saturating_sub(self.clock_skew_secs) >= exp {
            return Err(VerifyError::Expired { exp, now });
        }
        Ok(())
    }

    /// Result cache statistics (`None` when disabled)
    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStatsSnapshot> {
        self.cache.as_ref().map(ResultCache::stats)
    }

    /// Sweep expired result-cache entries
    pub fn evict_expired(&self) -> usize {
        self.cache.as_ref().map_or(0, ResultCache::evict_expired)
    }

    /// Underlying key resolver
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyResolver> {
        &self.keys
    }
}
