//! OAuth provider lookup by service id and by request path.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ClientConfig, ProviderConfig};

/// A configured provider with its service id.
#[derive(Debug, Clone)]
pub struct Provider {
    /// Service id (key in `client.providers`)
    pub id: String,
    /// Endpoint and credential configuration
    pub config: ProviderConfig,
}

impl Provider {
    /// `<server_url><path>` without doubling the slash.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.config.server_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

/// Provider registry shared by the key resolver and the token issuer.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<Provider>>,
    /// (prefix, service id), longest prefix first
    path_table: Vec<(String, String)>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    /// Build from the `client` configuration section.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|(id, provider)| {
                (
                    id.clone(),
                    Arc::new(Provider {
                        id: id.clone(),
                        config: provider.clone(),
                    }),
                )
            })
            .collect();

        let mut path_table: Vec<(String, String)> = config
            .path_prefix_services
            .iter()
            .map(|(prefix, id)| (prefix.clone(), id.clone()))
            .collect();
        path_table.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            providers,
            path_table,
            default_provider: config.default_provider.clone(),
        }
    }

    /// Look up a provider by service id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Provider>> {
        self.providers.get(id).cloned()
    }

    /// All providers, in no particular order.
    pub fn all(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.providers.values()
    }

    /// Whether a path → service id table is configured.
    #[must_use]
    pub fn has_path_table(&self) -> bool {
        !self.path_table.is_empty()
    }

    /// The provider used when no other context applies: the configured
    /// `default_provider`, or the only provider if exactly one exists.
    #[must_use]
    pub fn default_provider(&self) -> Option<Arc<Provider>> {
        match &self.default_provider {
            Some(id) => self.get(id),
            None if self.providers.len() == 1 => self.providers.values().next().cloned(),
            None => None,
        }
    }

    /// Longest configured prefix that applies to `path`, with its service id.
    ///
    /// A prefix applies when the path equals it or continues with `/`.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<(&str, &str)> {
        self.path_table
            .iter()
            .find(|(prefix, _)| prefix_applies(prefix, path))
            .map(|(prefix, id)| (prefix.as_str(), id.as_str()))
    }
}

/// `/api/pet` applies to `/api/pet` and `/api/pet/1`, not to `/api/petstore`.
pub(crate) fn prefix_applies(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
