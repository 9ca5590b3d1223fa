pub mod validation;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocol::canonical::ProviderKind;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// HTTP client settings shared by every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Whole-exchange limit for buffered calls; streams only wait this long for headers.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    /// Zero keeps idle connections forever.
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default)]
    pub use_env_proxy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

fn default_timeout_secs() -> u64 {
    180
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_pool_max_idle_per_host() -> usize {
    16
}
fn default_pool_idle_timeout_secs() -> u64 {
    90
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            use_env_proxy: false,
            proxy: None,
        }
    }
}

/// Backoff settings; see [`RetryPolicy`](crate::transport::RetryPolicy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    6
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// One named upstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    /// Defaults to the provider's public endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable read when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    /// Anthropic version header; ignored by other kinds.
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Extra header sent with every request to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
}

impl ProviderConfig {
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
    }

    /// The configured key, falling back to `api_key_env`.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            return Some(key.to_string());
        }
        let var = self.api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            http: HttpConfig::default(),
            retry: RetryConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] when parsing fails or
    /// [`ConfigError::Validation`] when semantic validation fails.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_yaml::from_str(contents)?;
        validate_config(&config)?;
        Ok(config)
    }

    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Retry settings for a provider: its override, else the global block.
    #[must_use]
    pub fn retry_for(&self, provider: &ProviderConfig) -> RetryConfig {
        provider.retry.clone().unwrap_or_else(|| self.retry.clone())
    }
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: impl AsRef<Path>) -> Result<ClientConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    ClientConfig::from_yaml_str(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.http.pool_max_idle_per_host, 16);
        assert!(!config.http.use_env_proxy);
        assert_eq!(config.providers.len(), 4);
        let claude = config.provider("claude").unwrap();
        assert_eq!(claude.kind, ProviderKind::Anthropic);
        assert_eq!(claude.api_version.as_deref(), Some("2023-06-01"));
        let gemini = config.provider("gemini").unwrap();
        assert_eq!(gemini.base_url(), ProviderKind::Gemini.default_base_url());
        assert_eq!(config.retry_for(gemini).max_attempts, 3);
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = ClientConfig::from_yaml_str(
            "providers:\n  - name: gpt\n    kind: openai\n    model: gpt-4o\n    api_key: sk-test\n",
        )
        .unwrap();
        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.http.timeout_secs, 180);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.providers[0].base_url(), "https://api.openai.com/v1");
    }

    #[test]
    fn test_unknown_kind_is_yaml_error() {
        let err = ClientConfig::from_yaml_str(
            "providers:\n  - name: x\n    kind: cohere\n    model: m\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_api_key_env_fallback() {
        let provider = ProviderConfig {
            name: "p".into(),
            kind: ProviderKind::OpenAi,
            base_url: None,
            api_key: None,
            api_key_env: Some("LLMWIRE_TEST_KEY_THAT_IS_UNSET".into()),
            model: "m".into(),
            max_tokens: None,
            api_version: None,
            headers: Vec::new(),
            retry: None,
        };
        assert_eq!(provider.resolve_api_key(), None);
        let provider = ProviderConfig {
            api_key: Some("sk-direct".into()),
            ..provider
        };
        assert_eq!(provider.resolve_api_key().as_deref(), Some("sk-direct"));
    }
}
