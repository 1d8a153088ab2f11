//! Connection-failure retry policy

use std::collections::HashSet;

use http::Method;
use tracing::debug;

use crate::config::ProxyConfig;

/// Retry policy for failed upstream connections
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`)
    pub max_retries: u32,
    /// Methods safe to replay against another upstream
    idempotent: HashSet<Method>,
}

impl RetryPolicy {
    /// Create from config. Unparseable method names are ignored.
    #[must_use]
    pub fn new(config: &ProxyConfig) -> Self {
        let idempotent = config
            .idempotent_methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).ok())
            .collect();
        Self {
            max_retries: config.max_connection_retries,
            idempotent,
        }
    }

    /// Whether `method` may be replayed
    #[must_use]
    pub fn is_idempotent(&self, method: &Method) -> bool {
        self.idempotent.contains(method)
    }

    /// Whether another attempt may follow failed attempt number `attempt`
    /// (0-based).
    #[must_use]
    pub fn should_retry(&self, method: &Method, attempt: u32) -> bool {
        if !self.is_idempotent(method) {
            debug!(method = %method, "Not retrying non-idempotent request");
            return false;
        }
        if attempt >= self.max_retries {
            debug!(method = %method, attempts = attempt + 1, "Max connection retries reached");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy::new(&ProxyConfig {
            max_connection_retries: retries,
            ..ProxyConfig::default()
        })
    }

    #[test]
    fn default_idempotent_methods() {
        let policy = policy(3);
        for method in [Method::GET, Method::HEAD, Method::PUT, Method::DELETE, Method::OPTIONS, Method::TRACE] {
            assert!(policy.is_idempotent(&method), "{method}");
        }
        assert!(!policy.is_idempotent(&Method::POST));
        assert!(!policy.is_idempotent(&Method::PATCH));
    }

    #[test]
    fn retry_budget_allows_n_retries() {
        let policy = policy(2);
        assert!(policy.should_retry(&Method::GET, 0));
        assert!(policy.should_retry(&Method::GET, 1));
        assert!(!policy.should_retry(&Method::GET, 2));
        assert!(!policy.should_retry(&Method::POST, 0));
    }

    #[test]
    fn configured_methods_are_case_insensitive() {
        let policy = RetryPolicy::new(&ProxyConfig {
            idempotent_methods: vec!["get".to_string(), " post ".to_string()],
            ..ProxyConfig::default()
        });
        assert!(policy.is_idempotent(&Method::POST));
        assert!(!policy.is_idempotent(&Method::PUT));
    }
}
