//! Shared fixtures: signing keys, token minting and provider configuration

#![allow(dead_code)]

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};

use authproxy::config::{ClientConfig, ProviderConfig};

/// 2023-11-14T22:13:20Z, a fixed "now" for clock-driven tests
pub const NOW_MS: u64 = 1_700_000_000_000;
/// `NOW_MS` in seconds
pub const NOW_SECS: u64 = NOW_MS / 1000;

/// A P-256 signing key published under `kid`
pub struct TestKey {
    pub kid: String,
    key_pair: rcgen::KeyPair,
}

impl TestKey {
    pub fn new(kid: &str) -> Self {
        Self {
            kid: kid.to_string(),
            key_pair: rcgen::KeyPair::generate().unwrap(),
        }
    }

    /// Public key as a JWK
    pub fn jwk(&self) -> Value {
        let point = self.key_pair.public_key_raw();
        // Uncompressed SEC1 point: 0x04 || x || y
        let (x, y) = point[1..].split_at(32);
        json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "alg": "ES256",
            "kid": self.kid,
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        })
    }

    /// Self-signed certificate carrying the public key
    pub fn certificate_pem(&self) -> String {
        rcgen::CertificateParams::new(vec!["issuer.local".to_string()])
            .unwrap()
            .self_signed(&self.key_pair)
            .unwrap()
            .pem()
    }

    /// ES256 token with `kid` in the header
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        let key = EncodingKey::from_ec_pem(self.key_pair.serialize_pem().as_bytes()).unwrap();
        jsonwebtoken::encode(&header, claims, &key).unwrap()
    }
}

/// JWK set document for `keys`
pub fn jwks(keys: &[&TestKey]) -> Value {
    json!({ "keys": keys.iter().map(|k| k.jwk()).collect::<Vec<_>>() })
}

/// Claims expiring `exp` (seconds since epoch)
pub fn claims(exp: u64) -> Value {
    json!({
        "iss": "https://issuer.local",
        "sub": "user-1",
        "client_id": "petstore-client",
        "scope": "pet.read pet.write",
        "exp": exp,
    })
}

/// Token without signature checks in mind: arbitrary header and payload
pub fn unsigned_token(header: &Value, claims: &Value) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        URL_SAFE_NO_PAD.encode(b"not-a-signature"),
    )
}

/// Provider pointing at a mock server
pub fn provider(server_url: &str) -> ProviderConfig {
    ProviderConfig {
        server_url: server_url.to_string(),
        client_id: "gateway".to_string(),
        client_secret: "secret".to_string(),
        scopes: vec!["svc.read".to_string()],
        ..ProviderConfig::default()
    }
}

/// Client section with the given providers
pub fn client_config(providers: &[(&str, &str)]) -> ClientConfig {
    ClientConfig {
        providers: providers
            .iter()
            .map(|(id, url)| ((*id).to_string(), provider(url)))
            .collect::<HashMap<_, _>>(),
        ..ClientConfig::default()
    }
}
