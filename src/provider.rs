//! Catalogue of supported data providers and their defaults

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorRecord;
use crate::error_recovery::RetryPolicy;
use crate::rate_limit::RateLimitConfig;
use crate::utils::logging::api_key_hint;

/// Default Haver database queried when a request names none
pub const HAVER_DEFAULT_DATABASE: &str = "USECON";

const FRED_SETUP: &str = "\
FRED API Setup Instructions:
1. Visit https://fred.stlouisfed.org/docs/api/api_key.html
2. Create a free account with FRED
3. Generate your API key
4. Set environment variable: export FRED_API_KEY=\"your-32-character-api-key\"
5. Or add to your ~/.bashrc or ~/.zshrc for persistence
";

const HAVER_SETUP: &str = "\
Haver Analytics Setup Instructions:
1. Contact Haver Analytics to obtain subscription credentials
2. Set environment variables:
   export HAVER_USERNAME=\"your-username\"
   export HAVER_PASSWORD=\"your-password\"
3. Or add to your ~/.bashrc or ~/.zshrc for persistence
";

/// A remote economic data API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Fred,
    Haver,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Fred, Provider::Haver];

    /// Lowercase name, also used as the rate-limit resource and config section
    pub fn name(self) -> &'static str {
        match self {
            Provider::Fred => "fred",
            Provider::Haver => "haver",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Provider::Fred => "FRED",
            Provider::Haver => "Haver Analytics",
        }
    }

    /// Prefix of the provider's environment variables
    pub fn env_prefix(self) -> &'static str {
        match self {
            Provider::Fred => "FRED",
            Provider::Haver => "HAVER",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::Fred => "https://api.stlouisfed.org/fred",
            Provider::Haver => "https://api.haver.com/v1",
        }
    }

    /// FRED allows 120 requests a minute, Haver 10 a second
    pub fn default_rate_limit(self) -> RateLimitConfig {
        match self {
            Provider::Fred => RateLimitConfig::per_minute(120),
            Provider::Haver => RateLimitConfig::per_second(10),
        }
    }

    pub fn default_timeout(self) -> Duration {
        match self {
            Provider::Fred => Duration::from_secs(30),
            Provider::Haver => Duration::from_secs(45),
        }
    }

    pub fn default_retry_policy(self) -> RetryPolicy {
        let base_delay = match self {
            Provider::Fred => Duration::from_secs(1),
            Provider::Haver => Duration::from_secs(2),
        };
        RetryPolicy::default()
            .with_base_delay(base_delay)
            .unwrap_or_default()
    }

    pub fn default_database(self) -> Option<&'static str> {
        match self {
            Provider::Fred => None,
            Provider::Haver => Some(HAVER_DEFAULT_DATABASE),
        }
    }

    /// Credential fields within the provider's config section
    pub fn credential_keys(self) -> &'static [&'static str] {
        match self {
            Provider::Fred => &["api_key"],
            Provider::Haver => &["username", "password"],
        }
    }

    /// Environment variable holding a credential or setting, e.g. `FRED_API_KEY`
    pub fn env_var(self, key: &str) -> String {
        format!("{}_{}", self.env_prefix(), key.to_uppercase())
    }

    /// Format check for a credential value; never contacts the provider
    pub fn validate_credential(self, key: &str, value: &str) -> Result<(), ErrorRecord> {
        let config_key = format!("{}.{}", self.name(), key);
        let invalid = |expected: &str| {
            ErrorRecord::configuration(format!(
                "{} has an invalid format for {}",
                self.env_var(key),
                self.display_name()
            ))
            .with_code("CONFIG_INVALID")
            .with_context("config_key", config_key.as_str())
            .with_context("expected", expected)
            .with_suggestion(format!("Check the value of {}", self.env_var(key)))
        };

        match (self, key) {
            (Provider::Fred, "api_key") => {
                if value.chars().count() != 32 || !value.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(invalid("32 alphanumeric characters")
                        .with_context("api_key_hint", api_key_hint(value)));
                }
            }
            (Provider::Haver, "username") => {
                if value.chars().count() < 3 {
                    return Err(invalid("at least 3 characters"));
                }
            }
            (Provider::Haver, "password") => {
                if value.chars().count() < 6 {
                    return Err(invalid("at least 6 characters"));
                }
            }
            _ => {
                return Err(ErrorRecord::configuration(format!(
                    "{} has no credential named {}",
                    self.display_name(),
                    key
                ))
                .with_context("config_key", config_key));
            }
        }
        Ok(())
    }

    /// Human-readable steps for obtaining and exporting credentials
    pub fn setup_instructions(self) -> &'static str {
        match self {
            Provider::Fred => FRED_SETUP,
            Provider::Haver => HAVER_SETUP,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provider {
    type Err = ErrorRecord;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fred" => Ok(Provider::Fred),
            "haver" => Ok(Provider::Haver),
            other => Err(ErrorRecord::configuration(format!(
                "Unsupported data source: {}",
                other
            ))
            .with_context("expected", "fred or haver")
            .with_context("actual", other)),
        }
    }
}
