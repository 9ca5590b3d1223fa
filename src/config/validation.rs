use std::collections::HashSet;

use super::{ClientConfig, ConfigError, ProviderConfig, RetryConfig};

pub(crate) const VALID_LOG_LEVELS: [&str; 6] =
    ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];

/// Validate the full client config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &ClientConfig) -> Result<(), ConfigError> {
    validate_http_config(config)?;
    validate_retry_config("retry", &config.retry)?;
    validate_providers(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_http_config(config: &ClientConfig) -> Result<(), ConfigError> {
    let http = &config.http;
    if http.pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "http.pool_max_idle_per_host must be greater than 0",
        ));
    }
    if http.timeout_secs == 0 {
        return Err(validation_err("http.timeout_secs must be greater than 0"));
    }
    validate_proxy_url("http.proxy", http.proxy.as_deref())
}

fn validate_retry_config(field: &str, retry: &RetryConfig) -> Result<(), ConfigError> {
    if retry.max_attempts == 0 {
        return Err(validation_err(format!(
            "{field}.max_attempts must be at least 1"
        )));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(validation_err(format!(
            "{field}.base_delay_ms must not exceed {field}.max_delay_ms"
        )));
    }
    Ok(())
}

fn validate_providers(config: &ClientConfig) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for provider in &config.providers {
        if provider.name.trim().is_empty() {
            return Err(validation_err("Provider name cannot be empty"));
        }
        if !names.insert(provider.name.as_str()) {
            return Err(validation_err(format!(
                "Duplicate provider name '{}'",
                provider.name
            )));
        }
        validate_provider(provider)?;
    }
    Ok(())
}

fn validate_provider(provider: &ProviderConfig) -> Result<(), ConfigError> {
    let name = &provider.name;
    if provider.model.trim().is_empty() {
        return Err(validation_err(format!(
            "Provider '{name}': model cannot be empty"
        )));
    }
    let base_url = provider.base_url();
    let parsed = url::Url::parse(base_url).map_err(|err| {
        validation_err(format!(
            "Provider '{name}': base_url '{base_url}' is not a valid URL: {err}"
        ))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "Provider '{name}': base_url must use http:// or https://"
        )));
    }
    if provider.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
        return Err(validation_err(format!(
            "Provider '{name}': api_key cannot be empty when set"
        )));
    }
    if provider.max_tokens == Some(0) {
        return Err(validation_err(format!(
            "Provider '{name}': max_tokens must be greater than 0 when set"
        )));
    }
    for header in &provider.headers {
        http::HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| {
            validation_err(format!(
                "Provider '{name}': invalid header name '{}'",
                header.name
            ))
        })?;
        http::HeaderValue::from_str(&header.value).map_err(|_| {
            validation_err(format!(
                "Provider '{name}': invalid value for header '{}'",
                header.name
            ))
        })?;
    }
    if let Some(retry) = &provider.retry {
        validate_retry_config(&format!("providers.{name}.retry"), retry)?;
    }
    Ok(())
}

fn validate_proxy_url(field_name: &str, proxy: Option<&str>) -> Result<(), ConfigError> {
    let Some(proxy) = proxy.map(str::trim) else {
        return Ok(());
    };
    if proxy.is_empty() {
        return Err(validation_err(format!(
            "{field_name} cannot be empty when set"
        )));
    }
    let parsed = url::Url::parse(proxy).map_err(|err| {
        validation_err(format!("{field_name} is not a valid URL: {err}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
        return Err(validation_err(format!(
            "{field_name} must use http://, https:// or socks5://"
        )));
    }
    Ok(())
}

fn validate_log_level(config: &ClientConfig) -> Result<(), ConfigError> {
    if !VALID_LOG_LEVELS.contains(&config.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {VALID_LOG_LEVELS:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use crate::protocol::canonical::ProviderKind;

    fn make_provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: ProviderKind::Anthropic,
            base_url: None,
            api_key: Some("sk-test".to_string()),
            api_key_env: None,
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: Some(4096),
            api_version: None,
            headers: Vec::new(),
            retry: None,
        }
    }

    fn make_valid_config() -> ClientConfig {
        ClientConfig {
            providers: vec![make_provider("claude")],
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&make_valid_config()).is_ok());
    }

    #[test]
    fn test_duplicate_provider_name() {
        let mut config = make_valid_config();
        config.providers.push(make_provider("claude"));
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("Duplicate provider name"));
    }

    #[test]
    fn test_empty_provider_name() {
        let mut config = make_valid_config();
        config.providers[0].name = "  ".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = make_valid_config();
        config.providers[0].base_url = Some("not a url".into());
        assert!(validate_config(&config).is_err());
        config.providers[0].base_url = Some("ftp://example.com".into());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_api_key() {
        let mut config = make_valid_config();
        config.providers[0].api_key = Some(String::new());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = make_valid_config();
        config.log_level = "VERBOSE".into();
        assert!(validate_config(&config).is_err());
        config.log_level = "warning".into();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_pool_max_idle_per_host() {
        let mut config = make_valid_config();
        config.http.pool_max_idle_per_host = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_retry_bounds() {
        let mut config = make_valid_config();
        config.retry.max_attempts = 0;
        assert!(validate_config(&config).is_err());

        let mut config = make_valid_config();
        config.providers[0].retry = Some(RetryConfig {
            max_attempts: 2,
            base_delay_ms: 5_000,
            max_delay_ms: 1_000,
        });
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("providers.claude.retry"));
    }

    #[test]
    fn test_invalid_header() {
        let mut config = make_valid_config();
        config.providers[0].headers.push(HeaderConfig {
            name: "bad header".into(),
            value: "x".into(),
        });
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_proxy_url() {
        let mut config = make_valid_config();
        config.http.proxy = Some("ftp://proxy".into());
        assert!(validate_config(&config).is_err());
        config.http.proxy = Some("http://127.0.0.1:8080".into());
        assert!(validate_config(&config).is_ok());
    }
}
