//! Upload of test execution batches to the Xping service
//!
//! ## Architecture
//!
//! Delivery never raises errors to the caller:
//! - [`DeliveryClient`] turns every HTTP outcome into an [`crate::UploadResult`]
//! - Transient failures are retried with exponential backoff and jitter
//! - A circuit breaker stops calls after repeated transient failures and
//!   admits a single probe once the cool-down has elapsed
//!
//! ## Usage
//!
//! Credentials live in `~/.config/xping/config.toml`:
//!
//! ```toml
//! [client]
//! endpoint = "https://upload.xping.io/api/v1/test-executions"
//! api_key = "xp_live_xxxxxxxxxxxx"
//! project_id = "my-project"
//! ```

mod client;
mod payload;
mod policy;

pub use client::{BatchSender, DeliveryClient};
pub use policy::{Admission, CircuitBreaker, CircuitState, RetryPolicy};

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::BatchSender;
    use crate::types::{TestBatch, UploadErrorKind, UploadResult};

    /// Sender that records batches and replays scripted results.
    ///
    /// Once the script runs out every batch succeeds.
    #[derive(Default)]
    pub(crate) struct MockSender {
        script: Mutex<VecDeque<UploadResult>>,
        sent: Mutex<Vec<TestBatch>>,
        delay: Option<Duration>,
    }

    impl MockSender {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_results(results: Vec<UploadResult>) -> Self {
            Self {
                script: Mutex::new(results.into()),
                ..Self::default()
            }
        }

        /// Every send takes `delay` before answering
        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub(crate) fn failing(kind: UploadErrorKind, times: usize) -> Self {
            Self::with_results(
                (0..times)
                    .map(|_| UploadResult::failure(kind, "scripted failure", None, 1))
                    .collect(),
            )
        }

        pub(crate) fn sent(&self) -> Vec<TestBatch> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn sent_records(&self) -> usize {
            self.sent.lock().unwrap().iter().map(TestBatch::len).sum()
        }
    }

    #[async_trait]
    impl BatchSender for MockSender {
        async fn send(&self, batch: &TestBatch) -> UploadResult {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.sent.lock().unwrap().push(batch.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| UploadResult::success(batch.len(), None, 1))
        }
    }
}
