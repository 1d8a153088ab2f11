//! Signing key resolution and caching
//!
//! # Resolution flow
//!
//! 1. Static certificates loaded from configuration are consulted first.
//! 2. The [`KeyContext`] names the candidate providers: the default provider,
//!    the provider mapped to the request path, or an explicit ordered list.
//! 3. Each candidate's namespace in the local cache is checked for the `kid`.
//! 4. On a miss the candidates are fetched in order. In JWKS mode every key of
//!    a fetched set is cached, so a rotation window costs one fetch.
//!
//! Cache entries are keyed by `(service id, kid)` so two providers that reuse
//! a `kid` never see each other's keys. Entries are populated and never
//! invalidated on read; concurrent fetches of the same unseen `kid` may both
//! insert, and since they carry the same key the last writer wins harmlessly.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_parser::pem::parse_x509_pem;
use x509_parser::public_key::PublicKey;

use crate::cache::{CacheStats, CacheStatsSnapshot};
use crate::config::{KeyResolverMode, SecurityConfig};
use crate::oauth::{OAuthClient, Provider, ProviderRegistry, RemoteError};

/// Which providers may have signed a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyContext {
    /// The single configured (or only) provider
    Default,
    /// The provider mapped to this request path by longest prefix
    ByPath(String),
    /// These providers, tried in order
    ByServiceIds(Vec<String>),
}

/// Signing key resolution failures
#[derive(Error, Debug)]
pub enum KeyError {
    /// No path prefix maps this request to a provider
    #[error("no OAuth provider mapped for path '{0}'")]
    NoProviderForPath(String),

    /// A service id that is not configured
    #[error("unknown OAuth provider '{0}'")]
    UnknownProvider(String),

    /// Default context without a default provider
    #[error("no default OAuth provider configured")]
    NoDefaultProvider,

    /// None of the candidate providers publishes this kid
    #[error("signing key '{kid}' not found")]
    NotFound {
        /// Key id
        kid: String,
    },

    /// Key material could not be turned into a verification key
    #[error("invalid key material for '{kid}': {reason}")]
    InvalidKey {
        /// Key id
        kid: String,
        /// Parser message
        reason: String,
    },

    /// Key endpoint unreachable or answered unusably
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl KeyError {
    /// Configuration fault rather than a runtime failure
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::NoProviderForPath(_) | Self::UnknownProvider(_) | Self::NoDefaultProvider
        )
    }
}

/// Public key family, for key-strength checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// RSA with the modulus size in bits
    Rsa {
        /// Modulus length in bits
        bits: usize,
    },
    /// ECDSA
    Ec,
    /// `EdDSA`
    Ed,
}

/// A resolved verification key
#[derive(Clone)]
pub struct VerificationKey {
    /// Key id
    pub kid: String,
    /// Provider that published it (`None` for static certificates)
    pub service_id: Option<String>,
    /// Key family
    pub kind: KeyKind,
    /// Key for `jsonwebtoken`
    pub key: DecodingKey,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("service_id", &self.service_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl VerificationKey {
    /// Build from a PEM encoded X.509 certificate.
    pub fn from_certificate_pem(
        kid: &str,
        service_id: Option<&str>,
        pem: &[u8],
    ) -> Result<Self, KeyError> {
        let invalid = |reason: String| KeyError::InvalidKey {
            kid: kid.to_string(),
            reason,
        };

        let (_, pem) = parse_x509_pem(pem).map_err(|e| invalid(format!("PEM: {e}")))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| invalid(format!("certificate: {e}")))?;
        let spki = cert.public_key();

        let (kind, key) = match spki
            .parsed()
            .map_err(|e| invalid(format!("public key: {e}")))?
        {
            PublicKey::RSA(rsa) => {
                let modulus = strip_leading_zeros(rsa.modulus);
                let exponent = strip_leading_zeros(rsa.exponent);
                (
                    KeyKind::Rsa {
                        bits: bit_length(modulus),
                    },
                    DecodingKey::from_rsa_raw_components(modulus, exponent),
                )
            }
            PublicKey::EC(point) => (KeyKind::Ec, DecodingKey::from_ec_der(point.data())),
            _ => return Err(invalid("unsupported public key type".to_string())),
        };

        Ok(Self {
            kid: kid.to_string(),
            service_id: service_id.map(ToString::to_string),
            kind,
            key,
        })
    }

    /// Build from one JSON Web Key.
    pub fn from_jwk(kid: &str, service_id: &str, jwk: &Jwk) -> Result<Self, KeyError> {
        let invalid = |reason: String| KeyError::InvalidKey {
            kid: kid.to_string(),
            reason,
        };

        let kind = match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => {
                let n = URL_SAFE_NO_PAD
                    .decode(rsa.n.trim_end_matches('='))
                    .map_err(|e| invalid(format!("modulus: {e}")))?;
                KeyKind::Rsa {
                    bits: bit_length(strip_leading_zeros(&n)),
                }
            }
            AlgorithmParameters::EllipticCurve(_) => KeyKind::Ec,
            AlgorithmParameters::OctetKeyPair(_) => KeyKind::Ed,
            AlgorithmParameters::OctetKey(_) => {
                return Err(invalid("symmetric keys are not accepted".to_string()));
            }
        };
        let key = DecodingKey::from_jwk(jwk).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            kid: kid.to_string(),
            service_id: Some(service_id.to_string()),
            kind,
            key,
        })
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn bit_length(be: &[u8]) -> usize {
    match be.first() {
        None => 0,
        Some(first) => be.len() * 8 - first.leading_zeros() as usize,
    }
}

type NamespacedKid = (String, String);

/// Key cache sizes for the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct KeyCacheStats {
    /// Keys loaded from configuration
    pub static_keys: usize,
    /// Cached X.509 keys
    pub certificates: usize,
    /// Cached JWKs
    pub jwks: usize,
    /// Lookup counters over both maps
    pub lookups: CacheStatsSnapshot,
}

/// Resolves `kid`s to verification keys across the configured providers
pub struct KeyResolver {
    client: Arc<OAuthClient>,
    providers: Arc<ProviderRegistry>,
    mode: KeyResolverMode,
    max_cached_keys: usize,
    static_keys: HashMap<String, Arc<VerificationKey>>,
    cert_map: DashMap<NamespacedKid, Arc<VerificationKey>>,
    jwk_map: DashMap<NamespacedKid, Arc<VerificationKey>>,
    stats: CacheStats,
}

impl KeyResolver {
    /// Create a resolver, loading static certificates from `config`.
    pub fn new(
        client: Arc<OAuthClient>,
        providers: Arc<ProviderRegistry>,
        config: &SecurityConfig,
    ) -> Result<Self, KeyError> {
        let mut static_keys = HashMap::new();
        for (kid, path) in &config.certificates {
            let pem = std::fs::read(path).map_err(|e| KeyError::InvalidKey {
                kid: kid.clone(),
                reason: format!("{path}: {e}"),
            })?;
            let key = VerificationKey::from_certificate_pem(kid, None, &pem)?;
            debug!(kid = %kid, path = %path, "Loaded static certificate");
            static_keys.insert(kid.clone(), Arc::new(key));
        }

        Ok(Self {
            client,
            providers,
            mode: config.key_resolver,
            max_cached_keys: config.max_cached_keys,
            static_keys,
            cert_map: DashMap::new(),
            jwk_map: DashMap::new(),
            stats: CacheStats::default(),
        })
    }

    fn map(&self) -> &DashMap<NamespacedKid, Arc<VerificationKey>> {
        match self.mode {
            KeyResolverMode::X509Certificate => &self.cert_map,
            KeyResolverMode::JsonWebKeySet => &self.jwk_map,
        }
    }

    /// Candidate providers for a context, in the order they are consulted.
    pub fn providers_for(&self, context: &KeyContext) -> Result<Vec<Arc<Provider>>, KeyError> {
        providers_for(&self.providers, context)
    }

    /// Resolve `kid` to a verification key.
    pub async fn resolve(
        &self,
        kid: &str,
        context: &KeyContext,
    ) -> Result<Arc<VerificationKey>, KeyError> {
        if let Some(key) = self.static_keys.get(kid) {
            self.stats.hit();
            return Ok(Arc::clone(key));
        }

        let candidates = self.providers_for(context)?;

        for provider in &candidates {
            if let Some(key) = self.map().get(&(provider.id.clone(), kid.to_string())) {
                self.stats.hit();
                return Ok(Arc::clone(key.value()));
            }
        }
        self.stats.miss();

        let mut last_error = None;
        let mut any_answered = false;
        for provider in &candidates {
            let fetched = match self.mode {
                KeyResolverMode::X509Certificate => self.fetch_certificate(provider, kid).await,
                KeyResolverMode::JsonWebKeySet => self.fetch_key_set(provider, kid).await,
            };
            match fetched {
                Ok(Some(key)) => return Ok(key),
                Ok(None) => {
                    any_answered = true;
                    debug!(service_id = %provider.id, kid = %kid, "Key set does not contain kid");
                }
                Err(e) => {
                    warn!(service_id = %provider.id, kid = %kid, error = %e, "Key lookup failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !any_answered => Err(e),
            _ => Err(KeyError::NotFound {
                kid: kid.to_string(),
            }),
        }
    }

    async fn fetch_certificate(
        &self,
        provider: &Provider,
        kid: &str,
    ) -> Result<Option<Arc<VerificationKey>>, KeyError> {
        let pem = self.client.fetch_certificate(provider, kid).await?;
        let key = Arc::new(VerificationKey::from_certificate_pem(
            kid,
            Some(&provider.id),
            pem.as_bytes(),
        )?);
        self.insert(&provider.id, kid, Arc::clone(&key));
        Ok(Some(key))
    }

    async fn fetch_key_set(
        &self,
        provider: &Provider,
        kid: &str,
    ) -> Result<Option<Arc<VerificationKey>>, KeyError> {
        let set = self.client.fetch_jwks(provider).await?;
        let cached = self.cache_key_set(&provider.id, &set);
        info!(service_id = %provider.id, keys = set.keys.len(), cached, "Fetched JWK set");

        if let Some(key) = self.map().get(&(provider.id.clone(), kid.to_string())) {
            return Ok(Some(Arc::clone(key.value())));
        }
        // Set contains the kid but it was not cached (cap reached or unusable key)
        match set.find(kid) {
            Some(jwk) => VerificationKey::from_jwk(kid, &provider.id, jwk).map(|k| Some(Arc::new(k))),
            None => Ok(None),
        }
    }

    /// Cache every usable key of `set` under `service_id`; returns how many.
    fn cache_key_set(&self, service_id: &str, set: &JwkSet) -> usize {
        let mut cached = 0;
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.as_deref() else {
                continue;
            };
            match VerificationKey::from_jwk(kid, service_id, jwk) {
                Ok(key) => {
                    if self.insert(service_id, kid, Arc::new(key)) {
                        cached += 1;
                    }
                }
                Err(e) => debug!(service_id = %service_id, error = %e, "Skipping unusable JWK"),
            }
        }
        cached
    }

    /// Insert unless the distinct-key cap is reached.
    fn insert(&self, service_id: &str, kid: &str, key: Arc<VerificationKey>) -> bool {
        let map = self.map();
        let id = (service_id.to_string(), kid.to_string());
        if !map.contains_key(&id) && map.len() >= self.max_cached_keys {
            warn!(
                service_id = %service_id,
                kid = %kid,
                max_cached_keys = self.max_cached_keys,
                "Key cache full, not caching key"
            );
            return false;
        }
        map.insert(id, key);
        true
    }

    /// Preload every candidate provider's key set (JWKS mode only).
    ///
    /// Failures are logged; returns the number of keys cached.
    pub async fn bootstrap(&self, service_ids: &[String]) -> usize {
        if self.mode != KeyResolverMode::JsonWebKeySet {
            return 0;
        }
        let providers: Vec<Arc<Provider>> = if service_ids.is_empty() {
            self.providers.all().cloned().collect()
        } else {
            service_ids.iter().filter_map(|id| self.providers.get(id)).collect()
        };

        let mut total = 0;
        for provider in providers {
            match self.client.fetch_jwks(&provider).await {
                Ok(set) => total += self.cache_key_set(&provider.id, &set),
                Err(e) => warn!(service_id = %provider.id, error = %e, "Key bootstrap failed"),
            }
        }
        info!(keys = total, "Bootstrapped signing keys");
        total
    }

    /// Drop every fetched key (static certificates stay).
    pub fn reset(&self) {
        let dropped = self.cert_map.len() + self.jwk_map.len();
        self.cert_map.clear();
        self.jwk_map.clear();
        self.stats.evicted(dropped as u64);
        info!(dropped, "Signing key cache reset");
    }

    /// Whether `kid` is cached for `service_id`
    #[must_use]
    pub fn is_cached(&self, service_id: &str, kid: &str) -> bool {
        self.map()
            .contains_key(&(service_id.to_string(), kid.to_string()))
    }

    /// Cache sizes and counters
    #[must_use]
    pub fn stats(&self) -> KeyCacheStats {
        KeyCacheStats {
            static_keys: self.static_keys.len(),
            certificates: self.cert_map.len(),
            jwks: self.jwk_map.len(),
            lookups: self.stats.snapshot(self.cert_map.len() + self.jwk_map.len()),
        }
    }
}

/// Candidate providers for `context`, in consultation order.
pub(crate) fn providers_for(
    registry: &ProviderRegistry,
    context: &KeyContext,
) -> Result<Vec<Arc<Provider>>, KeyError> {
    match context {
        KeyContext::Default => registry
            .default_provider()
            .map(|p| vec![p])
            .ok_or(KeyError::NoDefaultProvider),
        KeyContext::ByPath(path) => {
            let (_, id) = registry
                .match_path(path)
                .ok_or_else(|| KeyError::NoProviderForPath(path.clone()))?;
            registry
                .get(id)
                .map(|p| vec![p])
                .ok_or_else(|| KeyError::UnknownProvider(id.to_string()))
        }
        KeyContext::ByServiceIds(ids) => ids
            .iter()
            .map(|id| {
                registry
                    .get(id)
                    .ok_or_else(|| KeyError::UnknownProvider(id.clone()))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ProviderConfig};

    fn registry() -> ProviderRegistry {
        let mut config = ClientConfig::default();
        for id in ["petstoreAuth", "marketAuth"] {
            config.providers.insert(
                id.to_string(),
                ProviderConfig {
                    server_url: format!("https://{id}.local"),
                    ..ProviderConfig::default()
                },
            );
        }
        config
            .path_prefix_services
            .insert("/api/petstore".to_string(), "petstoreAuth".to_string());
        ProviderRegistry::from_config(&config)
    }

    #[test]
    fn path_context_without_match_is_a_config_error() {
        let err = providers_for(&registry(), &KeyContext::ByPath("/other".to_string())).unwrap_err();
        assert!(err.is_config());
        assert!(matches!(err, KeyError::NoProviderForPath(_)));
    }

    #[test]
    fn service_list_keeps_order_and_rejects_unknown_ids() {
        let ids = KeyContext::ByServiceIds(vec!["marketAuth".to_string(), "petstoreAuth".to_string()]);
        let providers = providers_for(&registry(), &ids).unwrap();
        assert_eq!(providers[0].id, "marketAuth");
        assert_eq!(providers[1].id, "petstoreAuth");

        let unknown = KeyContext::ByServiceIds(vec!["nope".to_string()]);
        assert!(providers_for(&registry(), &unknown).unwrap_err().is_config());
    }

    #[test]
    fn default_context_needs_a_default_provider() {
        assert!(matches!(
            providers_for(&registry(), &KeyContext::Default),
            Err(KeyError::NoDefaultProvider)
        ));
    }

    #[test]
    fn rsa_bit_length_ignores_sign_byte() {
        let mut modulus = vec![0u8];
        modulus.extend(std::iter::repeat_n(0xffu8, 256));
        assert_eq!(bit_length(strip_leading_zeros(&modulus)), 2048);
        assert_eq!(bit_length(&[0x01, 0x00]), 9);
        assert_eq!(bit_length(&[]), 0);
    }

    #[test]
    fn symmetric_jwks_are_refused() {
        let jwk: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "oct", "kid": "h1", "k": "c2VjcmV0"
        }))
        .unwrap();
        assert!(matches!(
            VerificationKey::from_jwk("h1", "petstoreAuth", &jwk),
            Err(KeyError::InvalidKey { .. })
        ));
    }

    #[test]
    fn certificate_pem_yields_ec_key() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["issuer.local".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();

        let key = VerificationKey::from_certificate_pem("100", Some("petstoreAuth"), cert.pem().as_bytes())
            .unwrap();
        assert_eq!(key.kind, KeyKind::Ec);
        assert_eq!(key.service_id.as_deref(), Some("petstoreAuth"));

        assert!(VerificationKey::from_certificate_pem("100", None, b"not a pem").is_err());
    }
}
