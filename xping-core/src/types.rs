//! Core domain types for the Xping SDK
//!
//! These types describe what flows through the delivery pipeline:
//!
//! | Term | Definition |
//! |------|------------|
//! | **TestIdentity** | Stable fingerprint of a test plus its naming breakdown |
//! | **TestExecution** | One observed run of a test |
//! | **TestBatch** | Ordered, bounded group of executions flushed together |
//! | **UploadResult** | Outcome of one upload; failures are data, not errors |
//! | **SessionMetadata** | Environment description attached to every upload |
//!
//! Executions are immutable once built: their fields are private and only set
//! through [`TestExecutionBuilder`]. All types serialize as camelCase JSON,
//! which is both the wire format and the offline queue slot format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::adapter::RetryProbe;
use crate::error::{Error, Result};

// ============================================
// Test Identity
// ============================================

/// Where a test is declared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub file: String,
    pub line: Option<u32>,
}

/// Stable identity of a test, produced by [`crate::identity::generate`].
///
/// The fingerprint (`test_id`) is the cross-run join key: identical qualified
/// name and parameters always produce the same 64-character hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestIdentity {
    pub(crate) test_id: String,
    pub(crate) fully_qualified_name: String,
    pub(crate) namespace: String,
    pub(crate) class_name: String,
    pub(crate) method_name: String,
    pub(crate) module_name: String,
    pub(crate) parameter_hash: Option<String>,
    pub(crate) display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) source: Option<SourceLocation>,
}

impl TestIdentity {
    /// Lowercase hex SHA-256 fingerprint
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn fully_qualified_name(&self) -> &str {
        &self.fully_qualified_name
    }

    /// Everything before the class segment; empty for `Class.Method` names
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Owning module (assembly, crate, package)
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Fingerprint of the canonical parameter string, if parameterized
    pub fn parameter_hash(&self) -> Option<&str> {
        self.parameter_hash.as_deref()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn source(&self) -> Option<&SourceLocation> {
        self.source.as_ref()
    }
}

// ============================================
// Outcomes, errors, retries
// ============================================

/// Result of a single test execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Inconclusive,
    NotExecuted,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "passed",
            TestOutcome::Failed => "failed",
            TestOutcome::Skipped => "skipped",
            TestOutcome::Inconclusive => "inconclusive",
            TestOutcome::NotExecuted => "notExecuted",
        }
    }
}

impl std::fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Summary of a failure, with content hashes for server-side grouping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub error_type: Option<String>,
    pub message: Option<String>,
    pub stack_trace: Option<String>,
    pub message_hash: Option<String>,
    pub stack_trace_hash: Option<String>,
}

impl ErrorInfo {
    /// Build an error summary, hashing message and stack trace.
    pub fn new(
        error_type: Option<String>,
        message: Option<String>,
        stack_trace: Option<String>,
    ) -> Self {
        let message_hash = message.as_deref().map(content_hash);
        let stack_trace_hash = stack_trace.as_deref().map(content_hash);
        Self {
            error_type,
            message,
            stack_trace,
            message_hash,
            stack_trace_hash,
        }
    }
}

/// Lowercase hex SHA-256 of a text blob
pub(crate) fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Retry metadata reported by the test framework adapter.
///
/// Frameworks that never retry leave this at [`RetryInfo::FirstAttempt`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RetryInfo {
    #[default]
    FirstAttempt,
    #[serde(rename_all = "camelCase")]
    Retried {
        /// 1-based attempt number of this execution
        attempt: u32,
        max_retries: u32,
        passed_after_retry: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl RetryInfo {
    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        match self {
            RetryInfo::FirstAttempt => 1,
            RetryInfo::Retried { attempt, .. } => *attempt,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, RetryInfo::Retried { attempt, .. } if *attempt > 1)
    }
}

/// Free-form classification attached by the adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMetadata {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

// ============================================
// Test Execution
// ============================================

/// One observed run of a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExecution {
    execution_id: Uuid,
    identity: TestIdentity,
    outcome: TestOutcome,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
    #[serde(default)]
    retry: RetryInfo,
    #[serde(default)]
    metadata: TestMetadata,
}

impl TestExecution {
    /// Start building an execution for `identity`.
    pub fn builder(identity: TestIdentity, outcome: TestOutcome) -> TestExecutionBuilder {
        TestExecutionBuilder::new(identity, outcome)
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn identity(&self) -> &TestIdentity {
        &self.identity
    }

    pub fn outcome(&self) -> TestOutcome {
        self.outcome
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn retry(&self) -> &RetryInfo {
        &self.retry
    }

    pub fn metadata(&self) -> &TestMetadata {
        &self.metadata
    }
}

/// Builder for [`TestExecution`]
#[derive(Debug, Clone)]
pub struct TestExecutionBuilder {
    identity: TestIdentity,
    outcome: TestOutcome,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<ErrorInfo>,
    retry: RetryInfo,
    metadata: TestMetadata,
}

impl TestExecutionBuilder {
    fn new(identity: TestIdentity, outcome: TestOutcome) -> Self {
        Self {
            identity,
            outcome,
            started_at: None,
            completed_at: None,
            error: None,
            retry: RetryInfo::default(),
            metadata: TestMetadata::default(),
        }
    }

    pub fn started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn completed_at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = Some(completed_at);
        self
    }

    pub fn error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn retry(mut self, retry: RetryInfo) -> Self {
        self.retry = retry;
        self
    }

    /// Take retry metadata from a framework probe
    pub fn retry_from<P: RetryProbe + ?Sized>(self, probe: &P) -> Self {
        let retry = probe.retry_info(&self.identity);
        self.retry(retry)
    }

    pub fn metadata(mut self, metadata: TestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Finish the execution.
    ///
    /// Missing timestamps default to now. Fails with `InvalidArgument` when
    /// the completion time precedes the start time.
    pub fn build(self) -> Result<TestExecution> {
        let now = Utc::now();
        let started_at = self.started_at.unwrap_or(now);
        let completed_at = self.completed_at.unwrap_or(started_at.max(now));

        let duration_ms = completed_at
            .signed_duration_since(started_at)
            .num_milliseconds();
        if duration_ms < 0 || completed_at < started_at {
            return Err(Error::InvalidArgument(format!(
                "completed_at ({}) precedes started_at ({})",
                completed_at.to_rfc3339(),
                started_at.to_rfc3339()
            )));
        }

        Ok(TestExecution {
            execution_id: Uuid::new_v4(),
            identity: self.identity,
            outcome: self.outcome,
            started_at,
            completed_at,
            duration_ms: duration_ms as u64,
            error: self.error,
            retry: self.retry,
            metadata: self.metadata,
        })
    }
}

// ============================================
// Batches
// ============================================

/// Ordered group of executions flushed together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBatch {
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub executions: Vec<TestExecution>,
}

impl TestBatch {
    /// Wrap executions in a new batch, preserving their order
    pub fn new(executions: Vec<TestExecution>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            created_at: Utc::now(),
            executions,
        }
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn into_executions(self) -> Vec<TestExecution> {
        self.executions
    }
}

// ============================================
// Upload results
// ============================================

/// Classification of a failed upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadErrorKind {
    /// 401/403: credential rejected
    AuthenticationError,
    /// 404: endpoint does not exist
    EndpointError,
    /// 429
    RateLimited,
    /// 5xx
    ServerError,
    /// Transport failure before a response arrived
    NetworkError,
    /// Request timed out (client side or HTTP 408)
    Timeout,
    /// Call rejected locally by the circuit breaker
    CircuitOpen,
    /// 2xx whose body could not be parsed
    MalformedResponse,
    /// Any other status
    Unknown,
}

impl UploadErrorKind {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UploadErrorKind::RateLimited
                | UploadErrorKind::ServerError
                | UploadErrorKind::NetworkError
                | UploadErrorKind::Timeout
        )
    }

    /// Map an HTTP status that is not a success into a failure class
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => UploadErrorKind::AuthenticationError,
            404 => UploadErrorKind::EndpointError,
            408 => UploadErrorKind::Timeout,
            429 => UploadErrorKind::RateLimited,
            500..=599 => UploadErrorKind::ServerError,
            _ => UploadErrorKind::Unknown,
        }
    }
}

impl std::fmt::Display for UploadErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UploadErrorKind::AuthenticationError => "authentication error",
            UploadErrorKind::EndpointError => "endpoint error",
            UploadErrorKind::RateLimited => "rate limited",
            UploadErrorKind::ServerError => "server error",
            UploadErrorKind::NetworkError => "network error",
            UploadErrorKind::Timeout => "timeout",
            UploadErrorKind::CircuitOpen => "circuit open",
            UploadErrorKind::MalformedResponse => "malformed response",
            UploadErrorKind::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// Outcome of one upload. Never an error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub success: bool,
    /// Records the server accepted (may be fewer than sent)
    pub total_records: usize,
    pub receipt_id: Option<String>,
    pub error_kind: Option<UploadErrorKind>,
    pub error_message: Option<String>,
    /// Last HTTP status seen, if a response arrived
    pub status_code: Option<u16>,
    /// Network attempts made (0 when the circuit was open)
    pub attempts: u32,
}

impl UploadResult {
    pub fn success(total_records: usize, receipt_id: Option<String>, attempts: u32) -> Self {
        Self {
            success: true,
            total_records,
            receipt_id,
            error_kind: None,
            error_message: None,
            status_code: Some(200),
            attempts,
        }
    }

    pub fn failure(
        kind: UploadErrorKind,
        message: impl Into<String>,
        status_code: Option<u16>,
        attempts: u32,
    ) -> Self {
        Self {
            success: false,
            total_records: 0,
            receipt_id: None,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            status_code,
            attempts,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

// ============================================
// Session metadata
// ============================================

/// Environment description sent with every upload.
///
/// Produced by an [`crate::adapter::EnvironmentProvider`]; the pipeline treats
/// it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub sdk_version: String,
    pub os: String,
    pub architecture: String,
    pub machine_name: Option<String>,
    pub is_ci: bool,
    pub ci_provider: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}
