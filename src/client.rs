//! Provider-aware entry point tying configuration, rate limiting and retries together

use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;
use tracing::debug;

use crate::config::ResolvedConfig;
use crate::error::{Classify, ErrorKind, ErrorRecord, EtlError};
use crate::error_recovery::{OperationCall, RetryExecutor};
use crate::provider::Provider;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::telemetry::{RecordSink, TracingSink};
use crate::validation::{validate_date_range, validate_variable_codes, DATE_FORMAT};

/// A validated request for observations of one or more series
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRequest {
    pub provider: Provider,
    pub variables: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub database: Option<String>,
    pub base_url: String,
}

/// Runs provider operations under each provider's retry policy, quota and timeout
///
/// One client should be shared by every task talking to the providers so
/// that they draw from the same rate-limit windows.
#[derive(Clone)]
pub struct ResilientClient {
    config: Arc<ResolvedConfig>,
    executor: RetryExecutor,
}

impl ResilientClient {
    pub fn new(config: Arc<ResolvedConfig>, sink: Arc<dyn RecordSink>) -> Self {
        let limiter = Provider::ALL.iter().fold(
            RateLimiter::new(RateLimitConfig::default()),
            |limiter, provider| {
                limiter.with_quota(provider.name(), config.provider(*provider).rate_limit)
            },
        );
        Self {
            config,
            executor: RetryExecutor::new(Arc::new(limiter), sink),
        }
    }

    /// Client whose operation records go to `tracing`
    pub fn with_tracing(config: Arc<ResolvedConfig>) -> Self {
        Self::new(config, Arc::new(TracingSink))
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Call description with the provider's resource and timeout filled in
    pub fn call(&self, provider: Provider, operation: impl Into<String>) -> OperationCall {
        OperationCall::new(operation, provider.name())
            .with_timeout(self.config.provider(provider).timeout)
    }

    /// Fail fast unless `provider` is enabled and has well-formed credentials
    pub fn ensure_ready(&self, provider: Provider) -> Result<(), EtlError> {
        if !self.config.is_enabled(provider) {
            return Err(EtlError::rejected(
                ErrorRecord::configuration(format!(
                    "{} is not an enabled provider",
                    provider.display_name()
                ))
                .with_context("config_key", "providers")
                .with_suggestion("Add the provider to FED_ETL_PROVIDERS"),
            ));
        }
        let missing = self.config.missing_credentials(provider);
        if !missing.is_empty() {
            return Err(EtlError::rejected(
                ErrorRecord::configuration(format!(
                    "Missing {} credentials: {}",
                    provider.display_name(),
                    missing.join(", ")
                ))
                .with_code("CONFIG_MISSING")
                .with_suggestion(provider.setup_instructions().trim()),
            ));
        }
        Ok(())
    }

    /// Run `operation` against `provider` with its retry policy
    ///
    /// The call's resource is forced to the provider so its quota applies.
    pub async fn execute<T, E, F, Fut>(
        &self,
        provider: Provider,
        call: OperationCall,
        operation: F,
    ) -> Result<T, EtlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.ensure_ready(provider)?;
        let settings = self.config.provider(provider);

        let scoped = OperationCall::new(call.name(), provider.name())
            .with_parameters(call.parameters().clone())
            .with_cancellation(call.cancellation().clone())
            .with_timeout(call.timeout().unwrap_or(settings.timeout));

        self.executor.execute(scoped, &settings.retry, operation).await
    }

    /// Validate a series request, then fetch it through `operation`
    ///
    /// Invalid codes or dates come back as a rejected validation error
    /// without `operation` ever running.
    pub async fn fetch_series<S, T, E, F, Fut>(
        &self,
        provider: Provider,
        variables: &[S],
        start_date: &str,
        end_date: &str,
        mut operation: F,
    ) -> Result<T, EtlError>
    where
        S: AsRef<str>,
        F: FnMut(SeriesRequest) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let variables = validate_variable_codes(variables)?;
        let (start, end) = validate_date_range(start_date, end_date)?;
        self.ensure_ready(provider)?;

        let settings = self.config.provider(provider);
        let request = SeriesRequest {
            provider,
            variables,
            start,
            end,
            database: settings.database.clone(),
            base_url: settings.base_url.clone(),
        };
        debug!(
            provider = %provider,
            variables = request.variables.len(),
            "Fetching series {} to {}",
            request.start,
            request.end
        );

        let mut call = self
            .call(provider, "fetch_series")
            .param("provider", provider.name())
            .param(
                "variables",
                Value::from(request.variables.iter().map(|v| Value::from(v.as_str())).collect::<Vec<_>>()),
            )
            .param("start_date", request.start.format(DATE_FORMAT).to_string())
            .param("end_date", request.end.format(DATE_FORMAT).to_string());
        if let Some(database) = &request.database {
            call = call.param("database", database.as_str());
        }

        self.execute(provider, call, || operation(request.clone()))
            .await
            .map_err(|e| annotate_data_error(e, &request.variables))
    }
}

/// Name the requested variables on unrecoverable data failures
fn annotate_data_error(error: EtlError, variables: &[String]) -> EtlError {
    match error {
        EtlError::Terminal {
            operation,
            attempts,
            mut last,
            history,
        } if last.kind() == ErrorKind::DataRetrieval => {
            if !last.context().contains_key("variables") {
                last.insert_context(
                    "variables",
                    Value::from(variables.iter().map(|v| Value::from(v.as_str())).collect::<Vec<_>>()),
                );
            }
            EtlError::Terminal {
                operation,
                attempts,
                last,
                history,
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, ConfigSource, DefaultsSource, EnvSource};
    use crate::error::FailureSignal;
    use crate::telemetry::MemorySink;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    fn config(pairs: &[(&str, &str)]) -> Arc<ResolvedConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let sources: Vec<Box<dyn ConfigSource>> =
            vec![Box::new(EnvSource::from_vars(vars)), Box::new(DefaultsSource)];
        Arc::new(ConfigResolver::resolve(&sources).unwrap())
    }

    fn both_providers() -> Arc<ResolvedConfig> {
        config(&[
            ("FED_ETL_PROVIDERS", "fred,haver"),
            ("FRED_API_KEY", "abcdef0123456789abcdef0123456789"),
            ("HAVER_USERNAME", "analyst"),
            ("HAVER_PASSWORD", "hunter22"),
        ])
    }

    #[tokio::test]
    async fn test_disabled_provider_is_rejected() {
        let cfg = config(&[("FRED_API_KEY", "abcdef0123456789abcdef0123456789")]);
        let sink = Arc::new(MemorySink::new());
        let client = ResilientClient::new(cfg, sink.clone());

        let err = client
            .execute(Provider::Haver, client.call(Provider::Haver, "ping"), || async {
                Ok::<_, FailureSignal>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_auth_error());
        assert_eq!(err.attempts(), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_provider() {
        let client = ResilientClient::new(both_providers(), Arc::new(MemorySink::new()));
        let count = Arc::new(Mutex::new(0u32));

        let err = client
            .fetch_series(Provider::Fred, &["GDP"], "2020-06-01", "2020-01-01", |_| {
                let count = count.clone();
                async move {
                    *count.lock().unwrap() += 1;
                    Ok::<_, FailureSignal>(())
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_user_error());
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_series_passes_normalized_request() {
        let sink = Arc::new(MemorySink::new());
        let client = ResilientClient::new(both_providers(), sink.clone());

        let request = client
            .fetch_series(
                Provider::Haver,
                &[" gdp ", "cpi"],
                "2020-01-01",
                "2020-12-31",
                |request| async move { Ok::<_, FailureSignal>(request) },
            )
            .await
            .unwrap();

        assert_eq!(request.variables, vec!["GDP", "CPI"]);
        assert_eq!(request.database.as_deref(), Some("USECON"));
        assert_eq!(request.base_url, "https://api.haver.com/v1");

        let record = sink.last().unwrap();
        assert_eq!(record.resource, "haver");
        assert_eq!(record.parameters.get("start_date"), Some(&Value::from("2020-01-01")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_series_is_not_retried_and_names_variables() {
        let client = ResilientClient::new(both_providers(), Arc::new(MemorySink::new()));
        let count = Arc::new(Mutex::new(0u32));

        let err = client
            .fetch_series(Provider::Fred, &["NOPE"], "2020-01-01", "2020-12-31", |_| {
                let count = count.clone();
                async move {
                    *count.lock().unwrap() += 1;
                    Err::<(), _>(FailureSignal::UnknownSeries {
                        code: "NOPE".to_string(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(err.kind(), Some(ErrorKind::DataRetrieval));
        assert!(err.record().unwrap().context().contains_key("variables"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_quota_applies() {
        let client = ResilientClient::new(both_providers(), Arc::new(MemorySink::new()));
        let started = Instant::now();

        for _ in 0..11 {
            client
                .execute(Provider::Haver, client.call(Provider::Haver, "ping"), || async {
                    Ok::<_, FailureSignal>(())
                })
                .await
                .unwrap();
        }

        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(client.executor().limiter().in_window("fred"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout_applies() {
        let cfg = config(&[
            ("FRED_API_KEY", "abcdef0123456789abcdef0123456789"),
            ("FRED_TIMEOUT", "2"),
            ("FED_ETL__FRED__RETRY__MAX_ATTEMPTS", "1"),
        ]);
        let client = ResilientClient::new(cfg, Arc::new(MemorySink::new()));

        let err = client
            .execute(Provider::Fred, client.call(Provider::Fred, "slow"), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, FailureSignal>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::Connection));
        assert_eq!(err.attempts(), 1);
    }
}
