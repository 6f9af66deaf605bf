//! # xping-core
//!
//! Delivery pipeline for the Xping test-observability SDK.
//!
//! This library provides:
//! - Stable test identities derived from names and parameter values
//! - A buffering collector that batches executions in the background
//! - An HTTP delivery client with retries, a circuit breaker and gzip
//! - A disk-backed offline queue for batches that could not be delivered
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Executions flow through three stages:
//! - **Collect:** framework adapters call [`Collector::record`]; nothing blocks on I/O
//! - **Deliver:** batches are uploaded by the [`DeliveryClient`]
//! - **Persist:** anything not delivered lands in the [`OfflineQueue`] and is
//!   re-sent later by the [`Dispatcher`]
//!
//! Delivery problems never surface as errors. They are reported through
//! [`UploadResult`], [`FlushSummary`] and [`ShutdownSummary`], and logged.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use xping_core::{identity, Collector, Config, TestExecution, TestOutcome};
//!
//! # async fn run() -> xping_core::Result<()> {
//! let config = Config::load()?.apply_env_overrides();
//! let Some(collector) = Collector::from_config(&config)? else {
//!     return Ok(()); // uploads disabled
//! };
//!
//! let id = identity::generate(
//!     "Acme.Tests.CartTests.AddsItem",
//!     "Acme.Tests",
//!     &[3i64.into(), "apple".into()],
//!     None,
//!     None,
//! )?;
//! collector.record(TestExecution::builder(id, TestOutcome::Passed).build()?);
//!
//! collector.shutdown(Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use adapter::{EnvironmentProvider, ExecutionSink, NoRetries, RetryProbe, SystemEnvironment};
pub use collector::{BlockingCollector, Collector, FlushSummary, RecordStatus, ShutdownSummary};
pub use config::Config;
pub use delivery::{BatchSender, CircuitState, DeliveryClient};
pub use error::{Error, Result};
pub use identity::ParamValue;
pub use pipeline::{DeliveryOutcome, Dispatcher, PipelineStats};
pub use queue::OfflineQueue;
pub use types::*;

// Public modules
pub mod adapter;
pub mod collector;
pub mod config;
pub mod delivery;
pub mod error;
pub mod identity;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod types;
