//! Configuration Management
//!
//! Settings come from layered sources (explicit overrides, environment,
//! config file, built-in defaults), merged key by key with the highest
//! precedence source winning, then validated into an immutable
//! [`ResolvedConfig`]. [`ConfigManager`] caches the result and swaps it
//! atomically on [`ConfigManager::refresh`].

pub mod sources;

pub use sources::{ConfigSource, ConfigValues, DefaultsSource, EnvSource, FileSource, OverrideSource};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ErrorKind, ErrorRecord};
use crate::error_recovery::RetryPolicy;
use crate::provider::Provider;
use crate::rate_limit::RateLimitConfig;
use crate::utils::logging::obscure_credential;

/// A credential value that never prints in full
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for building provider requests
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", obscure_credential(&self.0))
    }
}

/// Settings for one provider
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub base_url: String,
    pub timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub database: Option<String>,
    credentials: BTreeMap<String, Secret>,
}

impl ProviderConfig {
    pub fn credential(&self, key: &str) -> Option<&Secret> {
        self.credentials.get(key)
    }

    /// Environment variables of credentials that are absent or malformed
    pub fn missing_credentials(&self) -> Vec<String> {
        self.provider
            .credential_keys()
            .iter()
            .filter_map(|key| match self.credentials.get(*key) {
                None => Some(self.provider.env_var(key)),
                Some(secret) => self
                    .provider
                    .validate_credential(key, secret.expose())
                    .err()
                    .map(|_| format!("{} (invalid format)", self.provider.env_var(key))),
            })
            .collect()
    }

    pub fn has_valid_credentials(&self) -> bool {
        self.missing_credentials().is_empty()
    }
}

/// The merged, validated configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    enabled: Vec<Provider>,
    fred: ProviderConfig,
    haver: ProviderConfig,
}

impl ResolvedConfig {
    /// Build from merged values
    ///
    /// Fails on the first absent required setting, out-of-range value or, for
    /// enabled providers, missing or malformed credential.
    pub fn from_values(values: &ConfigValues) -> Result<Self, ErrorRecord> {
        let reader = ValueReader { values };
        let enabled = parse_providers(reader.required("providers")?)?;

        let fred = build_provider(&reader, Provider::Fred, enabled.contains(&Provider::Fred))?;
        let haver = build_provider(&reader, Provider::Haver, enabled.contains(&Provider::Haver))?;

        Ok(Self {
            enabled,
            fred,
            haver,
        })
    }

    pub fn enabled_providers(&self) -> &[Provider] {
        &self.enabled
    }

    pub fn is_enabled(&self, provider: Provider) -> bool {
        self.enabled.contains(&provider)
    }

    pub fn provider(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::Fred => &self.fred,
            Provider::Haver => &self.haver,
        }
    }

    pub fn fred(&self) -> &ProviderConfig {
        &self.fred
    }

    pub fn haver(&self) -> &ProviderConfig {
        &self.haver
    }

    pub fn missing_credentials(&self, provider: Provider) -> Vec<String> {
        self.provider(provider).missing_credentials()
    }

    /// TOML document of every non-secret setting
    pub fn to_toml(&self) -> Result<String, ErrorRecord> {
        let saved = SavedConfig {
            providers: self.enabled.iter().map(|p| p.name().to_string()).collect(),
            fred: SavedProvider::from(self.fred()),
            haver: SavedProvider::from(self.haver()),
        };
        toml::to_string_pretty(&saved).map_err(|e| {
            ErrorRecord::configuration(format!("Failed to serialize configuration: {}", e))
        })
    }
}

#[derive(Serialize)]
struct SavedConfig {
    providers: Vec<String>,
    fred: SavedProvider,
    haver: SavedProvider,
}

#[derive(Serialize)]
struct SavedProvider {
    base_url: String,
    timeout: f64,
    rate_limit: u32,
    rate_window: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<String>,
    retry: SavedRetry,
}

#[derive(Serialize)]
struct SavedRetry {
    max_attempts: u32,
    base_delay: f64,
    max_delay: f64,
    jitter: f64,
    retry_data_errors: bool,
}

impl From<&ProviderConfig> for SavedProvider {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            timeout: config.timeout.as_secs_f64(),
            rate_limit: config.rate_limit.max_operations,
            rate_window: config.rate_limit.window.as_secs_f64(),
            database: config.database.clone(),
            retry: SavedRetry {
                max_attempts: config.retry.max_attempts(),
                base_delay: config.retry.base_delay().as_secs_f64(),
                max_delay: config.retry.max_delay().as_secs_f64(),
                jitter: config.retry.jitter_fraction(),
                retry_data_errors: config
                    .retry
                    .retryable_kinds()
                    .contains(&ErrorKind::DataRetrieval),
            },
        }
    }
}

fn parse_providers(value: &Value) -> Result<Vec<Provider>, ErrorRecord> {
    let names: Vec<String> = match value {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(type_error("providers", "a provider name", other)),
            })
            .collect::<Result<_, _>>()?,
        other => return Err(type_error("providers", "a comma-separated list", other)),
    };

    let mut providers = Vec::new();
    for name in names {
        let provider: Provider = name
            .parse()
            .map_err(|e: ErrorRecord| e.with_context("config_key", "providers"))?;
        if !providers.contains(&provider) {
            providers.push(provider);
        }
    }
    if providers.is_empty() {
        return Err(
            ErrorRecord::configuration("At least one provider must be enabled")
                .with_code("CONFIG_MISSING")
                .with_context("config_key", "providers"),
        );
    }
    Ok(providers)
}

fn build_provider(
    reader: &ValueReader<'_>,
    provider: Provider,
    enabled: bool,
) -> Result<ProviderConfig, ErrorRecord> {
    let section = provider.name();
    let key = |name: &str| format!("{}.{}", section, name);

    let base_url = reader.string(&key("base_url"))?;
    if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
        return Err(invalid_value(&key("base_url"), "an http or https URL", base_url.as_str()));
    }

    let timeout = reader.seconds(&key("timeout"))?;
    let rate_limit = RateLimitConfig::new(
        reader.unsigned(&key("rate_limit"))?,
        reader.seconds(&key("rate_window"))?,
    )
    .map_err(|e| e.with_context("config_key", key("rate_limit")))?;

    let retry = RetryPolicy::new(
        reader.unsigned(&key("retry.max_attempts"))?,
        reader.seconds(&key("retry.base_delay"))?,
        reader.seconds(&key("retry.max_delay"))?,
        reader.float(&key("retry.jitter"))?,
    )
    .map_err(|e| e.with_context("config_key", key("retry")))?;
    let retry = match reader.optional_bool(&key("retry.retry_data_errors"))? {
        Some(true) => retry.with_retryable_kinds([
            ErrorKind::Connection,
            ErrorKind::RateLimit,
            ErrorKind::DataRetrieval,
        ])?,
        _ => retry,
    };

    let database = match reader.get(&key("database")) {
        Some(_) => Some(reader.string(&key("database"))?),
        None => None,
    };

    let mut credentials = BTreeMap::new();
    for credential in provider.credential_keys() {
        let config_key = key(credential);
        match reader.get(&config_key) {
            Some(_) => {
                let value = reader.string(&config_key)?;
                if enabled {
                    provider.validate_credential(credential, &value)?;
                }
                credentials.insert(credential.to_string(), Secret::new(value));
            }
            None if enabled => {
                return Err(ErrorRecord::configuration(format!(
                    "Missing {} credential {}",
                    provider.display_name(),
                    provider.env_var(credential)
                ))
                .with_code("CONFIG_MISSING")
                .with_context("config_key", config_key)
                .with_suggestion(provider.setup_instructions().trim()));
            }
            None => {}
        }
    }

    Ok(ProviderConfig {
        provider,
        base_url,
        timeout,
        rate_limit,
        retry,
        database,
        credentials,
    })
}

/// Typed access to merged values; environment values arrive as strings
struct ValueReader<'a> {
    values: &'a ConfigValues,
}

impl<'a> ValueReader<'a> {
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.values.get(key)
    }

    fn required(&self, key: &str) -> Result<&'a Value, ErrorRecord> {
        self.get(key).ok_or_else(|| {
            ErrorRecord::configuration(format!("Missing required setting {}", key))
                .with_code("CONFIG_MISSING")
                .with_context("config_key", key)
        })
    }

    fn string(&self, key: &str) -> Result<String, ErrorRecord> {
        match self.required(key)? {
            Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            other => Err(type_error(key, "a non-empty string", other)),
        }
    }

    fn float(&self, key: &str) -> Result<f64, ErrorRecord> {
        let value = self.required(key)?;
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed
            .filter(|f| f.is_finite())
            .ok_or_else(|| type_error(key, "a number", value))
    }

    fn unsigned(&self, key: &str) -> Result<u32, ErrorRecord> {
        let value = self.required(key)?;
        let parsed = match value {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse::<u32>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| type_error(key, "a non-negative integer", value))
    }

    /// Positive duration in (fractional) seconds
    fn seconds(&self, key: &str) -> Result<Duration, ErrorRecord> {
        let secs = self.float(key)?;
        if secs <= 0.0 {
            return Err(invalid_value(key, "a positive number of seconds", secs));
        }
        Duration::try_from_secs_f64(secs)
            .map_err(|_| invalid_value(key, "a representable number of seconds", secs))
    }

    fn optional_bool(&self, key: &str) -> Result<Option<bool>, ErrorRecord> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(type_error(key, "a boolean", &Value::String(s.clone()))),
            },
            Some(other) => Err(type_error(key, "a boolean", other)),
        }
    }
}

fn type_error(key: &str, expected: &str, actual: &Value) -> ErrorRecord {
    ErrorRecord::configuration(format!("Setting {} must be {}", key, expected))
        .with_code("CONFIG_INVALID")
        .with_context("config_key", key)
        .with_context("expected", expected)
        .with_context("actual", crate::utils::logging::mask_value(key, actual))
}

fn invalid_value(key: &str, expected: &str, actual: impl Into<Value>) -> ErrorRecord {
    type_error(key, expected, &actual.into())
}

/// Merges sources and validates the result
pub struct ConfigResolver;

impl ConfigResolver {
    /// Merge `sources`, highest precedence first; the first source defining a key wins
    pub fn merge(sources: &[Box<dyn ConfigSource>]) -> Result<ConfigValues, ErrorRecord> {
        let mut merged = ConfigValues::new();
        for source in sources {
            let values = source
                .load()
                .map_err(|e| e.with_context("source", source.name()))?;
            for (key, value) in values {
                merged.entry(key).or_insert(value);
            }
        }
        Ok(merged)
    }

    pub fn resolve(sources: &[Box<dyn ConfigSource>]) -> Result<ResolvedConfig, ErrorRecord> {
        ResolvedConfig::from_values(&Self::merge(sources)?)
    }
}

/// Owns the configuration sources and the cached resolved configuration
pub struct ConfigManager {
    sources: Vec<Box<dyn ConfigSource>>,
    current: RwLock<Arc<ResolvedConfig>>,
}

impl ConfigManager {
    /// Resolve `sources` (highest precedence first) and cache the result
    pub fn new(sources: Vec<Box<dyn ConfigSource>>) -> Result<Self, ErrorRecord> {
        let resolved = ConfigResolver::resolve(&sources)?;
        info!(
            providers = ?resolved.enabled_providers(),
            "Configuration loaded from {} source(s)",
            sources.len()
        );
        Ok(Self {
            sources,
            current: RwLock::new(Arc::new(resolved)),
        })
    }

    /// Environment, then an optional explicit file or the standard search
    /// paths, then defaults
    pub fn from_environment(config_file: Option<PathBuf>) -> Result<Self, ErrorRecord> {
        let env = EnvSource::from_env();
        let home = env.vars().get("HOME").map(PathBuf::from);
        let file = match config_file {
            Some(path) => FileSource::new(path),
            None => FileSource::standard(home.as_deref()),
        };
        Self::new(vec![Box::new(env), Box::new(file), Box::new(DefaultsSource)])
    }

    /// The cached configuration
    pub fn current(&self) -> Arc<ResolvedConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-run resolution; on failure the previous configuration stays in place
    pub fn refresh(&self) -> Result<Arc<ResolvedConfig>, ErrorRecord> {
        match ConfigResolver::resolve(&self.sources) {
            Ok(resolved) => {
                let resolved = Arc::new(resolved);
                *self.current.write().unwrap_or_else(PoisonError::into_inner) = resolved.clone();
                info!("Configuration refreshed");
                Ok(resolved)
            }
            Err(e) => {
                warn!("Configuration refresh failed, keeping previous configuration: {}", e);
                Err(e)
            }
        }
    }

    pub fn missing_credentials(&self, provider: Provider) -> Vec<String> {
        self.current().missing_credentials(provider)
    }

    pub fn setup_instructions(provider: Provider) -> &'static str {
        provider.setup_instructions()
    }

    /// Write the current non-secret settings as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ErrorRecord> {
        let path = path.as_ref();
        let document = self.current().to_toml()?;
        let save_error = |e: std::io::Error| {
            ErrorRecord::configuration(format!("Failed to save configuration: {}", e))
                .with_context("path", path.display().to_string())
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(save_error)?;
        }
        fs::write(path, document).map_err(save_error)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("ConfigManager")
            .field("sources", &names)
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const FRED_KEY: &str = "abcdef0123456789abcdef0123456789";

    fn env(pairs: &[(&str, &str)]) -> EnvSource {
        EnvSource::from_vars(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    }

    fn boxed<S: ConfigSource + 'static>(source: S) -> Box<dyn ConfigSource> {
        Box::new(source)
    }

    #[test]
    fn test_merge_prefers_highest_precedence_per_key() {
        let sources = vec![
            boxed(OverrideSource::new()),
            boxed(OverrideSource::named("env").set("API_KEY", "X")),
            boxed(OverrideSource::named("file").set("API_KEY", "Y").set("timeout", 30)),
            boxed(OverrideSource::named("defaults").set("timeout", 10)),
        ];
        let merged = ConfigResolver::merge(&sources).unwrap();
        assert_eq!(merged["API_KEY"], "X");
        assert_eq!(merged["timeout"], 30);

        let without_env = vec![
            boxed(OverrideSource::new()),
            boxed(OverrideSource::named("file").set("API_KEY", "Y").set("timeout", 30)),
            boxed(OverrideSource::named("defaults").set("timeout", 10)),
        ];
        let merged = ConfigResolver::merge(&without_env).unwrap();
        assert_eq!(merged["API_KEY"], "Y");
    }

    #[test]
    fn test_resolve_with_defaults_and_env() {
        let sources = vec![boxed(env(&[("FRED_API_KEY", FRED_KEY)])), boxed(DefaultsSource)];
        let config = ConfigResolver::resolve(&sources).unwrap();

        assert_eq!(config.enabled_providers(), &[Provider::Fred]);
        let fred = config.fred();
        assert_eq!(fred.base_url, "https://api.stlouisfed.org/fred");
        assert_eq!(fred.timeout, Duration::from_secs(30));
        assert_eq!(fred.rate_limit, RateLimitConfig::per_minute(120));
        assert_eq!(fred.retry, Provider::Fred.default_retry_policy());
        assert_eq!(fred.credential("api_key").map(Secret::expose), Some(FRED_KEY));
        assert!(fred.has_valid_credentials());
        assert_eq!(config.haver().database.as_deref(), Some("USECON"));
        assert_eq!(
            config.missing_credentials(Provider::Haver),
            vec!["HAVER_USERNAME".to_string(), "HAVER_PASSWORD".to_string()]
        );
    }

    #[test]
    fn test_missing_credential_for_enabled_provider_fails() {
        let sources = vec![boxed(env(&[("FED_ETL_PROVIDERS", "haver")])), boxed(DefaultsSource)];
        let err = ConfigResolver::resolve(&sources).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.error_code(), Some("CONFIG_MISSING"));
        assert_eq!(err.context().get("config_key"), Some(&Value::from("haver.username")));
    }

    #[test]
    fn test_malformed_credential_fails_without_leaking_it() {
        let sources = vec![boxed(env(&[("FRED_API_KEY", "not-a-valid-key")])), boxed(DefaultsSource)];
        let err = ConfigResolver::resolve(&sources).unwrap_err();
        assert_eq!(err.error_code(), Some("CONFIG_INVALID"));
        assert!(!err.to_json().to_string().contains("not-a-valid-key"));
    }

    #[test]
    fn test_range_and_type_validation() {
        let cases = [
            ("fred.retry.max_attempts", Value::from(0)),
            ("fred.rate_limit", Value::from("lots")),
            ("fred.timeout", Value::from(-1)),
            ("fred.base_url", Value::from("ftp://example.com")),
            ("fred.retry.jitter", Value::from(2.5)),
            ("fred.retry.retry_data_errors", Value::from("maybe")),
            ("providers", Value::from("fred,bloomberg")),
        ];
        for (key, value) in cases {
            let sources = vec![
                boxed(OverrideSource::new().set(key, value.clone())),
                boxed(env(&[("FRED_API_KEY", FRED_KEY)])),
                boxed(DefaultsSource),
            ];
            let err = ConfigResolver::resolve(&sources).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{} = {}", key, value);
        }
    }

    #[test]
    fn test_missing_required_setting_fails() {
        let sources = vec![boxed(OverrideSource::new().set("providers", "fred"))];
        let err = ConfigResolver::resolve(&sources).unwrap_err();
        assert_eq!(err.error_code(), Some("CONFIG_MISSING"));
    }

    #[test]
    fn test_retry_data_errors_opt_in() {
        let sources = vec![
            boxed(env(&[
                ("FRED_API_KEY", FRED_KEY),
                ("FED_ETL__FRED__RETRY__RETRY_DATA_ERRORS", "true"),
            ])),
            boxed(DefaultsSource),
        ];
        let config = ConfigResolver::resolve(&sources).unwrap();
        assert!(config
            .fred()
            .retry
            .should_retry(&ErrorRecord::data_retrieval("truncated payload")));
        assert!(!config
            .haver()
            .retry
            .should_retry(&ErrorRecord::data_retrieval("truncated payload")));
    }

    #[test]
    fn test_secret_debug_is_masked() {
        let secret = Secret::new(FRED_KEY);
        let debug = format!("{:?}", secret);
        assert_eq!(debug, "Secret(abcde***)");
        assert!(!debug.contains(FRED_KEY));
    }

    #[test]
    fn test_refresh_keeps_previous_config_on_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[fred]\ntimeout = 12\n").unwrap();

        let manager = ConfigManager::new(vec![
            boxed(env(&[("FRED_API_KEY", FRED_KEY)])),
            boxed(FileSource::new(&path)),
            boxed(DefaultsSource),
        ])
        .unwrap();
        assert_eq!(manager.current().fred().timeout, Duration::from_secs(12));

        fs::write(&path, "[fred]\nrate_limit = 0\n").unwrap();
        assert!(manager.refresh().is_err());
        assert_eq!(manager.current().fred().timeout, Duration::from_secs(12));

        fs::write(&path, "[fred]\ntimeout = 20\n").unwrap();
        let refreshed = manager.refresh().unwrap();
        assert_eq!(refreshed.fred().timeout, Duration::from_secs(20));
        assert_eq!(manager.current().fred().timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_save_omits_credentials_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(vec![
            boxed(env(&[
                ("FRED_API_KEY", FRED_KEY),
                ("HAVER_USERNAME", "analyst"),
                ("HAVER_PASSWORD", "hunter22"),
                ("FED_ETL_PROVIDERS", "fred,haver"),
                ("HAVER_TIMEOUT", "50"),
            ])),
            boxed(DefaultsSource),
        ])
        .unwrap();

        let path = dir.path().join("nested").join("saved.toml");
        manager.save(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(!written.contains(FRED_KEY));
        assert!(!written.contains("hunter22"));
        assert!(!written.contains("analyst"));

        let reloaded = ConfigResolver::resolve(&[
            boxed(env(&[
                ("FRED_API_KEY", FRED_KEY),
                ("HAVER_USERNAME", "analyst"),
                ("HAVER_PASSWORD", "hunter22"),
            ])),
            boxed(FileSource::new(&path)),
        ])
        .unwrap();
        assert_eq!(reloaded.enabled_providers(), &[Provider::Fred, Provider::Haver]);
        assert_eq!(reloaded.haver().timeout, Duration::from_secs(50));
        assert_eq!(reloaded.haver().database.as_deref(), Some("USECON"));
    }

    #[test]
    fn test_setup_instructions() {
        assert!(ConfigManager::setup_instructions(Provider::Fred).contains("api_key.html"));
    }
}
