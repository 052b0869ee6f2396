//! Configuration sources
//!
//! Every source yields a flat map of dotted keys (`fred.timeout`,
//! `haver.retry.max_attempts`) to JSON values. Merging happens in
//! [`ConfigResolver`](super::ConfigResolver).

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::error::ErrorRecord;
use crate::provider::Provider;

/// Flat dotted-key view of one source
pub type ConfigValues = BTreeMap<String, Value>;

/// File names searched in the working directory, in order
pub const LOCAL_CONFIG_FILES: &[&str] = &[
    "federal_reserve_etl_config.toml",
    "federal_reserve_etl_config.yaml",
    "federal_reserve_etl_config.yml",
    "federal_reserve_etl_config.json",
];

/// Prefix of generic environment overrides: `FED_ETL__FRED__RETRY__MAX_ATTEMPTS`
pub const GENERIC_ENV_PREFIX: &str = "FED_ETL__";

/// Per-provider settings that can be set through `<PROVIDER>_<SETTING>` variables
const PROVIDER_ENV_SETTINGS: &[&str] = &[
    "api_key",
    "username",
    "password",
    "base_url",
    "rate_limit",
    "timeout",
    "database",
];

/// A provider of configuration values
pub trait ConfigSource: Send + Sync {
    /// Short label used in diagnostics
    fn name(&self) -> &str;

    fn load(&self) -> Result<ConfigValues, ErrorRecord>;
}

/// Explicit in-memory values, typically programmatic overrides
#[derive(Debug, Clone, Default)]
pub struct OverrideSource {
    name: String,
    values: ConfigValues,
}

impl OverrideSource {
    pub fn new() -> Self {
        Self::named("override")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: ConfigValues::new(),
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for OverrideSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<ConfigValues, ErrorRecord> {
        Ok(self.values.clone())
    }
}

/// Values taken from environment variables
///
/// The snapshot is captured at construction; [`EnvSource::from_vars`] builds
/// one from an explicit map.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    vars: HashMap<String, String>,
}

impl EnvSource {
    pub fn from_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }
}

impl ConfigSource for EnvSource {
    fn name(&self) -> &str {
        "environment"
    }

    fn load(&self) -> Result<ConfigValues, ErrorRecord> {
        let mut values = ConfigValues::new();

        // Generic form first so the named variables below win on conflict
        for (name, value) in &self.vars {
            if let Some(path) = name.strip_prefix(GENERIC_ENV_PREFIX) {
                let key = path
                    .split("__")
                    .filter(|part| !part.is_empty())
                    .map(str::to_lowercase)
                    .collect::<Vec<_>>()
                    .join(".");
                if !key.is_empty() {
                    values.insert(key, Value::String(value.clone()));
                }
            }
        }

        if let Some(providers) = self.vars.get("FED_ETL_PROVIDERS") {
            values.insert("providers".to_string(), Value::String(providers.clone()));
        }

        for provider in Provider::ALL {
            for setting in PROVIDER_ENV_SETTINGS {
                if let Some(value) = self.vars.get(&provider.env_var(setting)) {
                    if !value.is_empty() {
                        values.insert(
                            format!("{}.{}", provider.name(), setting),
                            Value::String(value.clone()),
                        );
                    }
                }
            }
        }

        Ok(values)
    }
}

/// A TOML, YAML or JSON file, format chosen by extension
#[derive(Debug, Clone)]
pub struct FileSource {
    path: Option<PathBuf>,
}

impl FileSource {
    /// A file that must exist
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// The first existing file among `candidates`, or an empty source if none exist
    pub fn first_existing<I, P>(candidates: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let path = candidates
            .into_iter()
            .map(Into::into)
            .find(|candidate: &PathBuf| candidate.is_file());
        Self { path }
    }

    /// Search the standard locations: the working directory, then
    /// `~/.federal_reserve_etl/config.toml`, then `/etc/federal_reserve_etl/config.toml`
    pub fn standard(home: Option<&Path>) -> Self {
        Self::first_existing(standard_search_paths(home))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Candidate config file locations in search order
pub fn standard_search_paths(home: Option<&Path>) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = LOCAL_CONFIG_FILES.iter().map(PathBuf::from).collect();
    if let Some(home) = home {
        paths.push(home.join(".federal_reserve_etl").join("config.toml"));
    }
    paths.push(PathBuf::from("/etc/federal_reserve_etl/config.toml"));
    paths
}

impl ConfigSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    fn load(&self) -> Result<ConfigValues, ErrorRecord> {
        let Some(path) = &self.path else {
            return Ok(ConfigValues::new());
        };
        debug!("Loading configuration from {}", path.display());

        let content = fs::read_to_string(path).map_err(|e| {
            ErrorRecord::configuration(format!("Failed to read config file: {}", e))
                .with_context("path", path.display().to_string())
        })?;
        let parsed = parse_document(path, &content)?;

        let mut values = ConfigValues::new();
        flatten_into(&mut values, None, parsed);
        Ok(values)
    }
}

fn parse_document(path: &Path, content: &str) -> Result<Value, ErrorRecord> {
    let parse_error = |e: String| {
        ErrorRecord::configuration(format!("Failed to parse config file: {}", e))
            .with_context("path", path.display().to_string())
    };

    match path.extension().and_then(|s| s.to_str()) {
        Some("toml") => toml::from_str(content).map_err(|e| parse_error(e.to_string())),
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(content).map_err(|e| parse_error(e.to_string()))
        }
        Some("json") => serde_json::from_str(content).map_err(|e| parse_error(e.to_string())),
        _ => Err(ErrorRecord::configuration(
            "Unsupported file format. Use .toml, .yaml, .yml, or .json",
        )
        .with_context("path", path.display().to_string())),
    }
}

/// Flatten nested tables into dotted keys; arrays and scalars are leaves
fn flatten_into(values: &mut ConfigValues, prefix: Option<&str>, value: Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let key = match prefix {
                    Some(prefix) => format!("{}.{}", prefix, key),
                    None => key,
                };
                flatten_into(values, Some(&key), child);
            }
        }
        Value::Null => {}
        leaf => {
            if let Some(prefix) = prefix {
                values.insert(prefix.to_string(), leaf);
            }
        }
    }
}

/// Built-in provider defaults; carries no credentials
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
    fn name(&self) -> &str {
        "defaults"
    }

    fn load(&self) -> Result<ConfigValues, ErrorRecord> {
        let mut values = ConfigValues::new();
        values.insert("providers".to_string(), Value::from(Provider::Fred.name()));

        for provider in Provider::ALL {
            let section = provider.name();
            let quota = provider.default_rate_limit();
            let policy = provider.default_retry_policy();
            let mut set = |key: &str, value: Value| {
                values.insert(format!("{}.{}", section, key), value);
            };

            set("base_url", Value::from(provider.default_base_url()));
            set("timeout", Value::from(provider.default_timeout().as_secs_f64()));
            set("rate_limit", Value::from(quota.max_operations));
            set("rate_window", Value::from(quota.window.as_secs_f64()));
            set("retry.max_attempts", Value::from(policy.max_attempts()));
            set("retry.base_delay", Value::from(policy.base_delay().as_secs_f64()));
            set("retry.max_delay", Value::from(policy.max_delay().as_secs_f64()));
            set("retry.jitter", Value::from(policy.jitter_fraction()));
            set("retry.retry_data_errors", Value::from(false));
            if let Some(database) = provider.default_database() {
                set("database", Value::from(database));
            }
        }

        Ok(values)
    }
}
