//! Resilient access to FRED and Haver Analytics economic data APIs.
//!
//! fedetl is the failure-handling core of an economic data ETL client. It sits
//! between your HTTP calls and the providers, and gives you classified errors,
//! per-provider rate limiting, retries with exponential backoff and jitter, and
//! exactly one structured record per operation. Credentials stay masked in
//! everything it logs.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use fedetl::{ConfigManager, FailureSignal, Provider, ResilientClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Environment, then config file, then built-in defaults
//!     let manager = ConfigManager::from_environment(None)?;
//!     let client = ResilientClient::with_tracing(manager.current());
//!
//!     let observations = client
//!         .fetch_series(Provider::Fred, &["GDP"], "2020-01-01", "2020-12-31", |request| async move {
//!             // Issue the HTTP request here and map failures onto a FailureSignal
//!             Ok::<_, FailureSignal>(format!("{} series from {}", request.variables.len(), request.base_url))
//!         })
//!         .await?;
//!
//!     println!("{}", observations);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture Overview
//!
//! - **[`error`]** - Closed error taxonomy; raw failure signals classify into one `ErrorRecord`
//! - **[`rate_limit`]** - Sliding-window limiter shared across concurrent operations
//! - **[`error_recovery`]** - Retry policy, executor and per-operation context tracking
//! - **[`config`]** - Layered configuration with validation and atomic refresh
//! - **[`telemetry`]** - Operation record sinks and logging setup
//! - **[`client`]** - Provider-aware facade over all of the above
//!
//! Retryable failures (connection problems and rate limiting) back off and try
//! again up to the provider's attempt limit. Authentication, validation and
//! configuration failures surface immediately.

pub mod client;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod provider;
pub mod rate_limit;
pub mod telemetry;
pub mod utils;
pub mod validation;

pub use client::{ResilientClient, SeriesRequest};
pub use config::{ConfigManager, ConfigResolver, ResolvedConfig};
pub use error::{Classify, ErrorKind, ErrorRecord, EtlError, FailureSignal, SubKind};
pub use error_recovery::{OperationCall, OperationContext, RetryExecutor, RetryPolicy};
pub use provider::Provider;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use telemetry::{MemorySink, OperationRecord, Outcome, RecordSink, TracingSink};

pub type Result<T> = std::result::Result<T, EtlError>;
