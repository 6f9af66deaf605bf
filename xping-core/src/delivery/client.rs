//! HTTP client for the Xping collection endpoint
//!
//! One `send` is one logical upload: serialize, maybe compress, then up to
//! `max_attempts` POSTs gated by the circuit breaker. Every outcome is
//! returned as an [`UploadResult`]; nothing here writes to disk.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER,
    USER_AGENT,
};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::types::{SessionMetadata, TestBatch, UploadErrorKind, UploadResult};

use super::payload::{self, EncodedPayload, UploadResponse};
use super::policy::{Admission, CircuitBreaker, CircuitState, RetryPolicy};

const USER_AGENT_VALUE: &str = concat!("xping-sdk-rust/", env!("CARGO_PKG_VERSION"));

/// Something that can deliver a batch.
///
/// Implemented by [`DeliveryClient`]; the dispatcher only depends on this.
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send(&self, batch: &TestBatch) -> UploadResult;
}

/// HTTP client for the collection endpoint
pub struct DeliveryClient {
    config: ClientConfig,
    http_client: reqwest::Client,
    session: SessionMetadata,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

/// A single failed attempt
#[derive(Debug)]
struct Failure {
    kind: UploadErrorKind,
    message: String,
    status: Option<u16>,
    retry_after: Option<Duration>,
}

impl Failure {
    fn into_result(self, attempts: u32) -> UploadResult {
        UploadResult::failure(self.kind, self.message, self.status, attempts)
    }
}

impl DeliveryClient {
    /// Create a new delivery client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing credentials.
    pub fn new(config: ClientConfig, session: SessionMetadata) -> Result<Self> {
        config.validate()?;

        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Config("client.api_key is required".to_string()))?;
        let project_id = config
            .project_id
            .as_deref()
            .ok_or_else(|| Error::Config("client.project_id is required".to_string()))?;

        // Build default headers
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let auth_value = format!("Bearer {}", api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value)
                .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
        );

        headers.insert(
            "X-Project-Id",
            HeaderValue::from_str(project_id)
                .map_err(|e| Error::Config(format!("invalid project_id: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Delivery(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            retry: RetryPolicy::from_config(&config),
            breaker: CircuitBreaker::from_config(&config),
            config,
            http_client,
            session,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn session(&self) -> &SessionMetadata {
        &self.session
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    fn compression_threshold(&self) -> Option<usize> {
        self.config
            .compression_enabled
            .then_some(self.config.compression_threshold_bytes)
    }

    /// Upload `batch` under the retry and circuit breaker policies.
    pub async fn send_batch(&self, batch: &TestBatch) -> UploadResult {
        let payload = match payload::encode(&self.session, batch, self.compression_threshold()) {
            Ok(payload) => payload,
            Err(e) => {
                return UploadResult::failure(
                    UploadErrorKind::Unknown,
                    format!("failed to serialize batch: {}", e),
                    None,
                    0,
                )
            }
        };

        let max_attempts = self.retry.max_attempts();
        let mut attempts = 0;
        let mut last_failure: Option<Failure> = None;

        while attempts < max_attempts {
            if let Admission::Rejected { retry_in } = self.breaker.try_acquire() {
                return match last_failure {
                    // Opened by this call's own failures: stop spending retries
                    Some(failure) => {
                        let message = format!(
                            "{} (circuit opened after {} attempts, remaining retries skipped)",
                            failure.message, attempts
                        );
                        UploadResult::failure(failure.kind, message, failure.status, attempts)
                    }
                    None => {
                        debug!(
                            batch_id = %batch.batch_id,
                            retry_in_ms = retry_in.as_millis() as u64,
                            "Circuit open, skipping upload"
                        );
                        UploadResult::failure(
                            UploadErrorKind::CircuitOpen,
                            format!(
                                "circuit open: upload skipped, next probe in {} ms",
                                retry_in.as_millis()
                            ),
                            None,
                            0,
                        )
                    }
                };
            }

            attempts += 1;
            match self.send_once(batch, &payload).await {
                Ok(response) => {
                    self.breaker.record_success();
                    debug!(
                        batch_id = %batch.batch_id,
                        sent = batch.len(),
                        accepted = response.total_records,
                        attempts,
                        compressed = payload.compressed,
                        "Uploaded batch"
                    );
                    return UploadResult::success(
                        response.total_records,
                        response.receipt_id,
                        attempts,
                    );
                }
                Err(failure) if !failure.kind.is_transient() => {
                    self.breaker.record_reachable();
                    warn!(
                        batch_id = %batch.batch_id,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Upload failed, not retrying"
                    );
                    return failure.into_result(attempts);
                }
                Err(failure) => {
                    let opened = self.breaker.record_failure();
                    warn!(
                        batch_id = %batch.batch_id,
                        kind = %failure.kind,
                        error = %failure.message,
                        attempt = attempts,
                        max_attempts,
                        circuit_opened = opened,
                        "Transient upload failure"
                    );
                    if attempts < max_attempts && !opened {
                        let delay = self.retry.delay_for(attempts, failure.retry_after);
                        debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
                        tokio::time::sleep(delay).await;
                    }
                    last_failure = Some(failure);
                }
            }
        }

        match last_failure {
            Some(failure) => failure.into_result(attempts),
            None => UploadResult::failure(
                UploadErrorKind::Unknown,
                "no upload attempt was made",
                None,
                attempts,
            ),
        }
    }

    /// One POST, mapped to success or a classified failure
    async fn send_once(
        &self,
        batch: &TestBatch,
        payload: &EncodedPayload,
    ) -> std::result::Result<UploadResponse, Failure> {
        let mut request = self
            .http_client
            .post(&self.config.endpoint)
            .header("X-Batch-Id", batch.batch_id.to_string())
            .body(payload.body.clone());
        if payload.compressed {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = request.send().await.map_err(|e| self.transport_failure(&e))?;
        let status = response.status();

        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| self.transport_failure(&e))?;
            return serde_json::from_slice::<UploadResponse>(&body).map_err(|e| Failure {
                kind: UploadErrorKind::MalformedResponse,
                message: format!("HTTP {}: failed to parse response: {}", status.as_u16(), e),
                status: Some(status.as_u16()),
                retry_after: None,
            });
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        let snippet: String = error_text.chars().take(200).collect();

        Err(Failure {
            kind: UploadErrorKind::from_status(status.as_u16()),
            message: format!("API error ({}): {}", status, snippet),
            status: Some(status.as_u16()),
            retry_after,
        })
    }

    fn transport_failure(&self, error: &reqwest::Error) -> Failure {
        let (kind, class) = if error.is_timeout() {
            (UploadErrorKind::Timeout, "timeout")
        } else if error.is_connect() {
            (UploadErrorKind::NetworkError, "connection failed")
        } else if error.is_body() || error.is_decode() {
            (UploadErrorKind::NetworkError, "response body error")
        } else {
            (UploadErrorKind::NetworkError, "request failed")
        };

        Failure {
            kind,
            message: format!("HTTP request failed ({}): {}", class, error),
            status: error.status().map(|s| s.as_u16()),
            retry_after: None,
        }
    }
}

#[async_trait]
impl BatchSender for DeliveryClient {
    async fn send(&self, batch: &TestBatch) -> UploadResult {
        self.send_batch(batch).await
    }
}
