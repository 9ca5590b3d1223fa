use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::ClientConfig;
use crate::error::LlmError;
use crate::transport::{HttpTransport, RetryPolicy};

use super::Provider;

/// Named providers, shared across tasks.
///
/// Lookups take a read lock and hand out an `Arc`, so a provider replaced
/// while a call is in flight stays alive until that call finishes.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: RwLock<FxHashMap<String, Arc<Provider>>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured provider over one shared connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Config`] when the HTTP client or a provider cannot
    /// be built.
    pub fn from_config(config: &ClientConfig) -> Result<Self, LlmError> {
        let transport = HttpTransport::new(&config.http)?;
        let registry = Self::new();
        for provider_config in &config.providers {
            let retry = RetryPolicy::from(&config.retry_for(provider_config));
            let provider = Provider::from_config(provider_config, retry, transport.clone())?;
            tracing::debug!(
                provider = %provider.name(),
                kind = %provider.kind(),
                model = %provider.model(),
                "registered provider"
            );
            registry.register(provider);
        }
        Ok(registry)
    }

    /// Add a provider, returning the one it replaced.
    pub fn register(&self, provider: Provider) -> Option<Arc<Provider>> {
        let name = provider.name().to_string();
        self.providers.write().insert(name, Arc::new(provider))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers.read().get(name).cloned()
    }

    /// Like [`get`](Self::get), but an unknown name is an error.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Config`] naming the missing provider.
    pub fn resolve(&self, name: &str) -> Result<Arc<Provider>, LlmError> {
        self.get(name)
            .ok_or_else(|| LlmError::Config(format!("unknown provider '{name}'")))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers.write().remove(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r"
retry:
  max_attempts: 4
providers:
  - name: claude
    kind: anthropic
    api_key: sk-ant
    model: claude-sonnet-4-5
  - name: flash
    kind: gemini
    api_key: g-key
    model: gemini-2.5-flash
    retry:
      max_attempts: 2
";

    #[test]
    fn test_from_config_registers_all() {
        let config = ClientConfig::from_yaml_str(CONFIG).unwrap();
        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["claude".to_string(), "flash".to_string()]);
        assert_eq!(registry.get("claude").unwrap().retry_policy().max_attempts, 4);
        assert_eq!(registry.get("flash").unwrap().retry_policy().max_attempts, 2);
        assert!(matches!(registry.resolve("missing"), Err(LlmError::Config(_))));
    }

    #[test]
    fn test_replace_keeps_old_handle_alive() {
        let config = ClientConfig::from_yaml_str(CONFIG).unwrap();
        let registry = ProviderRegistry::from_config(&config).unwrap();
        let before = registry.get("claude").unwrap();

        let replacement = before.as_ref().clone().with_retry_policy(RetryPolicy::none());
        let replaced = registry.register(replacement).unwrap();
        assert!(Arc::ptr_eq(&before, &replaced));
        assert_eq!(registry.get("claude").unwrap().retry_policy().max_attempts, 1);
        assert_eq!(before.retry_policy().max_attempts, 4);

        assert!(registry.remove("claude").is_some());
        assert_eq!(registry.len(), 1);
    }
}
