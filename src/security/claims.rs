//! Token structure and claim extraction

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::Header;
use serde::Serialize;
use serde_json::{Map, Value};

use super::VerifyError;

/// A compact JWT split and decoded without checking the signature
#[derive(Debug, Clone)]
pub struct UnverifiedToken {
    /// Decoded header (`alg`, `kid`, ...)
    pub header: Header,
    /// Decoded payload
    pub claims: Map<String, Value>,
}

impl UnverifiedToken {
    /// Split `token` into header and payload.
    pub fn parse(token: &str) -> Result<Self, VerifyError> {
        let mut parts = token.split('.');
        let (Some(_), Some(payload), Some(_), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(VerifyError::Malformed("expected three dot-separated parts".to_string()));
        };

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| VerifyError::Malformed(format!("header: {e}")))?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| VerifyError::Malformed(format!("payload encoding: {e}")))?;
        let claims = match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(VerifyError::Malformed("payload is not a JSON object".to_string())),
            Err(e) => return Err(VerifyError::Malformed(format!("payload: {e}"))),
        };

        Ok(Self { header, claims })
    }

    /// `kid` header parameter
    #[must_use]
    pub fn kid(&self) -> Option<&str> {
        self.header.kid.as_deref()
    }

    /// `exp` claim in seconds; `None` when absent.
    pub fn expiry(&self) -> Result<Option<u64>, VerifyError> {
        numeric_date(&self.claims, "exp")
    }
}

/// Read a NumericDate claim. Fractional seconds are truncated.
pub(crate) fn numeric_date(claims: &Map<String, Value>, name: &'static str) -> Result<Option<u64>, VerifyError> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| {
                        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                        let secs = f.trunc() as u64;
                        secs
                    })
            })
            .map(Some)
            .ok_or(VerifyError::MalformedClaim(name)),
        Some(_) => Err(VerifyError::MalformedClaim(name)),
    }
}

/// Signature-checked claims handed to the rest of the request pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifiedClaims {
    /// `iss`
    pub issuer: Option<String>,
    /// `sub`
    pub subject: Option<String>,
    /// `exp`, seconds since the epoch
    pub expires_at: Option<u64>,
    /// `scope` / `scp`, split on whitespace
    pub scopes: Vec<String>,
    /// `client_id` / `cid`
    pub client_id: Option<String>,
    /// `user_id` / `uid`
    pub user_id: Option<String>,
    /// Every claim as received
    #[serde(skip)]
    pub raw: Map<String, Value>,
}

impl VerifiedClaims {
    /// Build from a payload that has already passed verification.
    pub(crate) fn from_map(raw: Map<String, Value>) -> Result<Self, VerifyError> {
        let text = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| raw.get(*n).and_then(Value::as_str))
                .map(ToString::to_string)
        };

        let scopes = match raw.get("scope").or_else(|| raw.get("scp")) {
            Some(Value::String(s)) => s.split_whitespace().map(ToString::to_string).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            issuer: text(&["iss"]),
            subject: text(&["sub"]),
            expires_at: numeric_date(&raw, "exp")?,
            scopes,
            client_id: text(&["client_id", "cid"]),
            user_id: text(&["user_id", "uid"]),
            raw,
        })
    }

    /// Whether the token carries at least one of `required` (empty = any).
    #[must_use]
    pub fn has_any_scope(&self, required: &[String]) -> bool {
        required.is_empty() || required.iter().any(|r| self.scopes.contains(r))
    }

    /// Full claim set as JSON, for forwarding to backends.
    #[must_use]
    pub fn to_json(&self) -> String {
        Value::Object(self.raw.clone()).to_string()
    }
}
