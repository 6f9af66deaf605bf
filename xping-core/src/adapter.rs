//! Seams between the pipeline and a test framework integration
//!
//! A framework adapter supplies the environment description and retry
//! metadata, and hands finished executions to an [`ExecutionSink`]. The
//! pipeline never inspects framework state directly.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::collector::{FlushSummary, RecordStatus, ShutdownSummary};
use crate::types::{RetryInfo, SessionMetadata, TestExecution, TestIdentity};

const SDK_VERSION: &str = concat!("xping-sdk-rust/", env!("CARGO_PKG_VERSION"));

/// CI systems detected from their marker environment variables, first match wins
const CI_PROVIDERS: &[(&str, &str)] = &[
    ("GITHUB_ACTIONS", "GitHub Actions"),
    ("TF_BUILD", "Azure Pipelines"),
    ("GITLAB_CI", "GitLab CI"),
    ("JENKINS_URL", "Jenkins"),
    ("CIRCLECI", "CircleCI"),
    ("TRAVIS", "Travis CI"),
    ("BUILDKITE", "Buildkite"),
    ("TEAMCITY_VERSION", "TeamCity"),
    ("BITBUCKET_BUILD_NUMBER", "Bitbucket Pipelines"),
];

/// Describes the machine and run that executions come from
pub trait EnvironmentProvider: Send + Sync {
    fn session_metadata(&self) -> SessionMetadata;
}

/// Reads the host environment of the current process.
#[derive(Debug, Clone, Default)]
pub struct SystemEnvironment {
    properties: BTreeMap<String, String>,
}

impl SystemEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a free-form property to every session
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn describe(&self, lookup: impl Fn(&str) -> Option<String>) -> SessionMetadata {
        let ci_provider = detect_ci(&lookup);
        let machine_name = lookup("HOSTNAME")
            .or_else(|| lookup("COMPUTERNAME"))
            .filter(|name| !name.trim().is_empty());

        SessionMetadata {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            sdk_version: SDK_VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            machine_name,
            is_ci: ci_provider.is_some(),
            ci_provider: ci_provider.map(str::to_string),
            properties: self.properties.clone(),
        }
    }
}

impl EnvironmentProvider for SystemEnvironment {
    fn session_metadata(&self) -> SessionMetadata {
        self.describe(|key| std::env::var(key).ok())
    }
}

fn detect_ci(lookup: &impl Fn(&str) -> Option<String>) -> Option<&'static str> {
    let set = |key: &str| {
        lookup(key)
            .map(|v| !v.is_empty() && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false)
    };

    CI_PROVIDERS
        .iter()
        .find(|(key, _)| set(key))
        .map(|(_, name)| *name)
        .or_else(|| set("CI").then_some("Unknown CI"))
}

/// Reports whether an execution was a framework-level retry
///
/// Consulted through [`TestExecutionBuilder::retry_from`](crate::TestExecutionBuilder::retry_from).
pub trait RetryProbe: Send + Sync {
    fn retry_info(&self, identity: &TestIdentity) -> RetryInfo;
}

/// Probe for frameworks without retry support
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetries;

impl RetryProbe for NoRetries {
    fn retry_info(&self, _identity: &TestIdentity) -> RetryInfo {
        RetryInfo::FirstAttempt
    }
}

impl<F> RetryProbe for F
where
    F: Fn(&TestIdentity) -> RetryInfo + Send + Sync,
{
    fn retry_info(&self, identity: &TestIdentity) -> RetryInfo {
        self(identity)
    }
}

/// Where adapters hand finished executions
///
/// Implemented by [`crate::Collector`].
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    /// Buffer one execution; never blocks on the network
    fn record(&self, execution: TestExecution) -> RecordStatus;

    async fn flush(&self) -> FlushSummary;

    async fn shutdown(&self, timeout: Duration) -> ShutdownSummary;
}
