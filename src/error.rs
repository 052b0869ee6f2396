//! Error taxonomy for the FRED / Haver API-access core
//!
//! Every failure observed while talking to a data provider is mapped onto exactly
//! one [`ErrorRecord`] whose [`ErrorKind`] is drawn from a closed set. The record
//! carries a human message, an ordered context map, an optional machine-readable
//! error code and an actionable suggestion.
//!
//! # Error Categories
//!
//! - **Connection** - transport failures and HTTP 5xx responses (retryable)
//! - **Authentication** - rejected or missing credentials (never retried)
//! - **DataRetrieval** - malformed bodies, unknown series, anything unclassified
//! - **Validation** - caller-supplied parameters rejected before any network call
//! - **RateLimit** - HTTP 429 or provider quota payloads (retryable)
//! - **Configuration** - missing or invalid settings at construction time
//!
//! # Classification
//!
//! Raw failure signals are turned into records through the [`Classify`] trait:
//! ```rust
//! use fedetl::error::{Classify, ErrorKind, FailureSignal};
//!
//! let record = FailureSignal::http(503).classify();
//! assert_eq!(record.kind(), ErrorKind::Connection);
//! assert!(record.is_retryable());
//!
//! let record = FailureSignal::http(401).classify();
//! assert_eq!(record.kind(), ErrorKind::Authentication);
//! assert!(record.suggestion().is_some());
//! ```
//!
//! Classification is pure: the same signal always yields the same record.
//! Timestamps and attempt numbers are added later by the operation context.

use std::fmt;
use std::time::Duration;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::utils::logging::{mask_value, sanitize_for_logging, truncate_string};

/// Longest response body kept in a record's context
const MAX_BODY_CHARS: usize = 200;

/// Closed set of failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Authentication,
    DataRetrieval,
    Validation,
    RateLimit,
    Configuration,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Connection,
        ErrorKind::Authentication,
        ErrorKind::DataRetrieval,
        ErrorKind::Validation,
        ErrorKind::RateLimit,
        ErrorKind::Configuration,
    ];

    /// Whether failures of this kind are transient by default
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::RateLimit)
    }

    /// Kinds that no retry policy may ever opt into
    pub fn is_never_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Authentication | ErrorKind::Validation | ErrorKind::Configuration
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::DataRetrieval => "data_retrieval",
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Configuration => "configuration",
        }
    }

    /// Remediation advice attached to records that have none of their own
    pub fn default_suggestion(self) -> &'static str {
        match self {
            ErrorKind::Connection => {
                "Check network connectivity and the provider's service status; transient failures are retried automatically"
            }
            ErrorKind::Authentication => {
                "Verify the API credentials: FRED needs FRED_API_KEY (32 characters), Haver needs HAVER_USERNAME and HAVER_PASSWORD"
            }
            ErrorKind::DataRetrieval => {
                "Check the requested series codes and date range against the provider's catalogue"
            }
            ErrorKind::Validation => "Correct the rejected parameter before issuing the request again",
            ErrorKind::RateLimit => {
                "Reduce the request rate or wait for the provider's quota window to reset"
            }
            ErrorKind::Configuration => {
                "Review the configuration sources (overrides, environment, config file) for the named key"
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained refinement of an [`ErrorKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubKind {
    Timeout,
    ConnectionRefused,
    DnsFailure,
    ConnectionReset,
    ServerError,
    CredentialRejected,
    QuotaExceeded,
    TooManyRequests,
    MalformedResponse,
    UnknownSeries,
    Unclassified,
}

impl SubKind {
    /// The kind this sub-kind refines
    pub fn kind(self) -> ErrorKind {
        match self {
            SubKind::Timeout
            | SubKind::ConnectionRefused
            | SubKind::DnsFailure
            | SubKind::ConnectionReset
            | SubKind::ServerError => ErrorKind::Connection,
            SubKind::CredentialRejected => ErrorKind::Authentication,
            SubKind::QuotaExceeded | SubKind::TooManyRequests => ErrorKind::RateLimit,
            SubKind::MalformedResponse | SubKind::UnknownSeries | SubKind::Unclassified => {
                ErrorKind::DataRetrieval
            }
        }
    }
}

/// Insertion-ordered map of context values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextMap {
    entries: Vec<(String, Value)>,
}

impl ContextMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing an existing entry in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of this map with credential-like values obscured
    pub fn masked(&self) -> ContextMap {
        ContextMap {
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), mask_value(k, v)))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ContextMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ContextMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for ContextMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// One classified failure instance
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("[{kind}] {message}")]
pub struct ErrorRecord {
    kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub_kind: Option<SubKind>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    context: ContextMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
    retryable: bool,
    #[serde(
        rename = "retry_after_secs",
        serialize_with = "serialize_secs",
        skip_serializing_if = "Option::is_none"
    )]
    retry_after: Option<Duration>,
}

fn serialize_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_f64(d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sub_kind: None,
            message: message.into(),
            error_code: None,
            context: ContextMap::new(),
            suggestion: None,
            retryable: kind.is_retryable(),
            retry_after: None,
        }
    }

    /// Create a record whose kind is implied by `sub_kind`
    pub fn from_sub_kind(sub_kind: SubKind, message: impl Into<String>) -> Self {
        let mut record = Self::new(sub_kind.kind(), message);
        record.sub_kind = Some(sub_kind);
        record
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
            .with_suggestion(ErrorKind::Authentication.default_suggestion())
    }

    pub fn data_retrieval(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataRetrieval, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let sub_kind = if retry_after.is_some() {
            SubKind::TooManyRequests
        } else {
            SubKind::QuotaExceeded
        };
        let mut record = Self::from_sub_kind(sub_kind, message).with_code("RATE_LIMITED");
        if let Some(hint) = retry_after {
            record.retry_after = Some(hint);
            record.insert_context("retry_after", hint.as_secs_f64());
        }
        record
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Standardized connection failure against an endpoint
    pub fn connection_error(endpoint: &str, status: Option<u16>) -> Self {
        let (message, code) = match status {
            Some(status) => (
                format!("Failed to connect to {} (HTTP {})", endpoint, status),
                format!("CONN_{}", status),
            ),
            None => (
                format!("Failed to connect to {}", endpoint),
                "CONN_FAILED".to_string(),
            ),
        };
        let mut record = Self::connection(message)
            .with_code(code)
            .with_context("endpoint", endpoint);
        if let Some(status) = status {
            record.insert_context("status_code", status);
        }
        record
    }

    /// Standardized authentication failure; `key_hint` should already be obscured
    pub fn auth_error(source: &str, key_hint: Option<&str>) -> Self {
        let message = match key_hint {
            Some(hint) => format!("Authentication failed for {} (API key: {})", source, hint),
            None => format!("Authentication failed for {}", source),
        };
        let mut record = Self::from_sub_kind(SubKind::CredentialRejected, message)
            .with_code("AUTH_FAILED")
            .with_suggestion(ErrorKind::Authentication.default_suggestion())
            .with_context("source", source);
        if let Some(hint) = key_hint {
            record.insert_context("api_key_hint", hint);
        }
        record
    }

    /// Standardized retrieval failure for a set of variables
    pub fn data_error<S: AsRef<str>>(variables: &[S], message: Option<&str>) -> Self {
        let names: Vec<&str> = variables.iter().map(|v| v.as_ref()).collect();
        let message = match message {
            Some(m) => m.to_string(),
            None => {
                let mut listed = names.iter().take(3).copied().collect::<Vec<_>>().join(", ");
                if names.len() > 3 {
                    listed.push_str(&format!(" (and {} more)", names.len() - 3));
                }
                format!("Failed to retrieve data for variables: {}", listed)
            }
        };
        Self::data_retrieval(message)
            .with_code("DATA_FAILED")
            .with_context("variables", names)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key, value);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn insert_context(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.context.insert(key, value);
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn sub_kind(&self) -> Option<SubKind> {
        self.sub_kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Copy of this record with credentials obscured in the message and context
    pub fn masked(&self) -> ErrorRecord {
        ErrorRecord {
            message: sanitize_for_logging(&self.message),
            context: self.context.masked(),
            ..self.clone()
        }
    }

    /// Serialize into a JSON value with masked context
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.masked()).unwrap_or(Value::Null)
    }
}

/// Transport-level failure flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    ConnectionRefused,
    DnsFailure,
    ConnectionReset,
}

/// Raw failure signal reported by a provider client
#[derive(Debug, Clone, PartialEq)]
pub enum FailureSignal {
    Transport {
        failure: TransportFailure,
        detail: String,
    },
    Http {
        status: u16,
        endpoint: Option<String>,
        body: Option<String>,
        retry_after: Option<Duration>,
    },
    QuotaExceeded {
        provider: String,
        detail: String,
        retry_after: Option<Duration>,
    },
    CredentialRejected {
        provider: String,
        detail: String,
    },
    MalformedResponse {
        detail: String,
    },
    UnknownSeries {
        code: String,
    },
    InvalidParameter {
        field: String,
        detail: String,
    },
    InvalidConfiguration {
        key: String,
        detail: String,
    },
    Unknown {
        detail: String,
    },
}

impl FailureSignal {
    pub fn http(status: u16) -> Self {
        FailureSignal::Http {
            status,
            endpoint: None,
            body: None,
            retry_after: None,
        }
    }

    pub fn transport(failure: TransportFailure, detail: impl Into<String>) -> Self {
        FailureSignal::Transport {
            failure,
            detail: detail.into(),
        }
    }

    /// Map this signal onto exactly one record
    pub fn to_record(&self) -> ErrorRecord {
        match self {
            FailureSignal::Transport { failure, detail } => {
                let sub_kind = match failure {
                    TransportFailure::Timeout => SubKind::Timeout,
                    TransportFailure::ConnectionRefused => SubKind::ConnectionRefused,
                    TransportFailure::DnsFailure => SubKind::DnsFailure,
                    TransportFailure::ConnectionReset => SubKind::ConnectionReset,
                };
                ErrorRecord::from_sub_kind(sub_kind, format!("Transport failure: {}", detail))
                    .with_code("CONN_FAILED")
                    .with_suggestion(ErrorKind::Connection.default_suggestion())
            }
            FailureSignal::Http {
                status,
                endpoint,
                body,
                retry_after,
            } => {
                let mut record = classify_status(*status, endpoint.as_deref(), *retry_after);
                record.insert_context("response_status", *status);
                if let Some(body) = body {
                    record.insert_context("response_body", truncate_string(body, MAX_BODY_CHARS));
                }
                record
            }
            FailureSignal::QuotaExceeded {
                provider,
                detail,
                retry_after,
            } => ErrorRecord::rate_limit(
                format!("{} quota exceeded: {}", provider, detail),
                *retry_after,
            )
            .with_context("provider", provider.as_str())
            .with_suggestion(ErrorKind::RateLimit.default_suggestion()),
            FailureSignal::CredentialRejected { provider, detail } => {
                ErrorRecord::auth_error(provider, None).with_context("detail", detail.as_str())
            }
            FailureSignal::MalformedResponse { detail } => ErrorRecord::from_sub_kind(
                SubKind::MalformedResponse,
                format!("Malformed response: {}", detail),
            )
            .with_code("DATA_FAILED")
            .with_suggestion(ErrorKind::DataRetrieval.default_suggestion()),
            FailureSignal::UnknownSeries { code } => ErrorRecord::from_sub_kind(
                SubKind::UnknownSeries,
                format!("Unknown series or variable code: {}", code),
            )
            .with_code("UNKNOWN_SERIES")
            .with_context("variables", vec![code.clone()])
            .with_suggestion(ErrorKind::DataRetrieval.default_suggestion()),
            FailureSignal::InvalidParameter { field, detail } => {
                ErrorRecord::validation(format!("Invalid {}: {}", field, detail))
                    .with_code("INVALID_PARAMETER")
                    .with_context("field", field.as_str())
                    .with_suggestion(ErrorKind::Validation.default_suggestion())
            }
            FailureSignal::InvalidConfiguration { key, detail } => {
                ErrorRecord::configuration(format!("Invalid configuration for {}: {}", key, detail))
                    .with_code("CONFIG_INVALID")
                    .with_context("config_key", key.as_str())
                    .with_suggestion(ErrorKind::Configuration.default_suggestion())
            }
            FailureSignal::Unknown { detail } => unclassified(detail),
        }
    }
}

fn classify_status(status: u16, endpoint: Option<&str>, retry_after: Option<Duration>) -> ErrorRecord {
    let target = endpoint.unwrap_or("provider");
    match status {
        401 | 403 => {
            let mut record = ErrorRecord::from_sub_kind(
                SubKind::CredentialRejected,
                format!("Credentials rejected by {} (HTTP {})", target, status),
            )
            .with_code("AUTH_FAILED")
            .with_suggestion(ErrorKind::Authentication.default_suggestion());
            if let Some(endpoint) = endpoint {
                record.insert_context("endpoint", endpoint);
            }
            record
        }
        429 => {
            let mut record = ErrorRecord::rate_limit(
                format!("Rate limit exceeded at {} (HTTP 429)", target),
                retry_after,
            )
            .with_suggestion(ErrorKind::RateLimit.default_suggestion());
            if let Some(endpoint) = endpoint {
                record.insert_context("endpoint", endpoint);
            }
            record
        }
        408 => ErrorRecord::connection_error(target, Some(status))
            .with_suggestion(ErrorKind::Connection.default_suggestion())
            .into_sub_kind(SubKind::Timeout),
        500..=599 => ErrorRecord::connection_error(target, Some(status))
            .with_suggestion(ErrorKind::Connection.default_suggestion())
            .into_sub_kind(SubKind::ServerError),
        404 => ErrorRecord::from_sub_kind(
            SubKind::UnknownSeries,
            format!("Resource not found at {} (HTTP 404)", target),
        )
        .with_code("DATA_FAILED")
        .with_suggestion(ErrorKind::DataRetrieval.default_suggestion()),
        _ => ErrorRecord::from_sub_kind(
            SubKind::Unclassified,
            format!("Unexpected response from {} (HTTP {})", target, status),
        )
        .with_code("DATA_FAILED")
        .with_suggestion(ErrorKind::DataRetrieval.default_suggestion()),
    }
}

fn unclassified(detail: &str) -> ErrorRecord {
    ErrorRecord::from_sub_kind(
        SubKind::Unclassified,
        format!("Unexpected failure: {}", truncate_string(detail, MAX_BODY_CHARS)),
    )
    .with_code("UNEXPECTED_ERROR")
    .with_context("original_error", detail)
    .with_suggestion(ErrorKind::DataRetrieval.default_suggestion())
}

impl ErrorRecord {
    // Only refines within the same kind; a mismatched sub-kind is ignored.
    fn into_sub_kind(mut self, sub_kind: SubKind) -> Self {
        if sub_kind.kind() == self.kind {
            self.sub_kind = Some(sub_kind);
        }
        self
    }
}

/// Conversion of an operation's error type into a classified record
pub trait Classify {
    fn classify(self) -> ErrorRecord;
}

impl Classify for ErrorRecord {
    fn classify(self) -> ErrorRecord {
        self
    }
}

impl Classify for FailureSignal {
    fn classify(self) -> ErrorRecord {
        self.to_record()
    }
}

impl Classify for &FailureSignal {
    fn classify(self) -> ErrorRecord {
        self.to_record()
    }
}

impl Classify for std::io::Error {
    fn classify(self) -> ErrorRecord {
        use std::io::ErrorKind as Io;

        let detail = self.to_string();
        let failure = match self.kind() {
            Io::TimedOut | Io::WouldBlock => Some(TransportFailure::Timeout),
            Io::ConnectionRefused => Some(TransportFailure::ConnectionRefused),
            Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe | Io::UnexpectedEof => {
                Some(TransportFailure::ConnectionReset)
            }
            _ => {
                let lower = detail.to_lowercase();
                if lower.contains("dns") || lower.contains("lookup") || lower.contains("resolve") {
                    Some(TransportFailure::DnsFailure)
                } else {
                    None
                }
            }
        };
        match failure {
            Some(failure) => FailureSignal::transport(failure, detail).to_record(),
            None => unclassified(&detail),
        }
    }
}

impl Classify for tokio::time::error::Elapsed {
    fn classify(self) -> ErrorRecord {
        FailureSignal::transport(TransportFailure::Timeout, "operation timed out").to_record()
    }
}

fn suggestion_suffix(record: &ErrorRecord) -> String {
    match record.suggestion() {
        Some(s) => format!(" (suggestion: {})", s),
        None => String::new(),
    }
}

/// Main error type surfaced to callers of the core
#[derive(Error, Debug, Clone)]
pub enum EtlError {
    /// Failure surfaced without entering the retry path
    #[error("{record}{}", suggestion_suffix(.record))]
    Rejected { record: ErrorRecord },

    /// Operation gave up; `last` is the final classified failure
    #[error("{operation} failed after {attempts} attempt(s): {last}{}", suggestion_suffix(.last))]
    Terminal {
        operation: String,
        attempts: u32,
        last: ErrorRecord,
        history: Vec<ErrorRecord>,
    },

    /// Operation aborted through its cancellation token
    #[error("{operation} cancelled after {attempts} attempt(s)")]
    Cancelled { operation: String, attempts: u32 },
}

impl EtlError {
    pub fn rejected(record: ErrorRecord) -> Self {
        Self::Rejected { record }
    }

    pub fn cancelled(operation: impl Into<String>, attempts: u32) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            attempts,
        }
    }

    /// The classified record behind this error, if any
    pub fn record(&self) -> Option<&ErrorRecord> {
        match self {
            EtlError::Rejected { record } => Some(record),
            EtlError::Terminal { last, .. } => Some(last),
            EtlError::Cancelled { .. } => None,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.record().map(ErrorRecord::kind)
    }

    pub fn history(&self) -> &[ErrorRecord] {
        match self {
            EtlError::Terminal { history, .. } => history,
            _ => &[],
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            EtlError::Rejected { .. } => 0,
            EtlError::Terminal { attempts, .. } | EtlError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EtlError::Cancelled { .. })
    }

    /// Check if the underlying failure is transient
    pub fn is_retryable(&self) -> bool {
        self.record().map(ErrorRecord::is_retryable).unwrap_or(false)
    }

    /// Check if this error is due to credentials or configuration
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self.kind(),
            Some(ErrorKind::Authentication) | Some(ErrorKind::Configuration)
        )
    }

    /// Check if this error is due to caller input
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), Some(ErrorKind::Validation))
    }
}

impl From<ErrorRecord> for EtlError {
    fn from(record: ErrorRecord) -> Self {
        EtlError::Rejected { record }
    }
}
