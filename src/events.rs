//! Normalized pipeline events and the dashboard event channel.
//!
//! `NormalizedPipelineEvent` is the provider-agnostic representation every
//! webhook payload is converted into before it touches the core.
//! `DashboardPublisher` fans structured stage events out to SSE consumers
//! over a broadcast channel; publishing is best-effort and never fails a
//! pipeline stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

// ── Normalized events ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CiProvider {
    GithubActions,
    GitlabCi,
    Jenkins,
    Circleci,
    AzureDevops,
}

impl CiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GithubActions => "github_actions",
            Self::GitlabCi => "gitlab_ci",
            Self::Jenkins => "jenkins",
            Self::Circleci => "circleci",
            Self::AzureDevops => "azure_devops",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "github_actions" | "github" => Ok(Self::GithubActions),
            "gitlab_ci" | "gitlab" => Ok(Self::GitlabCi),
            "jenkins" => Ok(Self::Jenkins),
            "circleci" => Ok(Self::Circleci),
            "azure_devops" | "azuredevops" => Ok(Self::AzureDevops),
            _ => Err(format!("Invalid CI provider: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Build,
    Test,
    Deploy,
    Timeout,
    Infrastructure,
    Unknown,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Deploy => "deploy",
            Self::Timeout => "timeout",
            Self::Infrastructure => "infrastructure",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "build" => Ok(Self::Build),
            "test" => Ok(Self::Test),
            "deploy" => Ok(Self::Deploy),
            "timeout" => Ok(Self::Timeout),
            "infrastructure" => Ok(Self::Infrastructure),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid failure type: {}", s)),
        }
    }
}

/// Provider-agnostic pipeline failure event, the canonical ingest format.
///
/// The idempotency key is `{provider}:{repo}:{run_id}:{job_id}:{attempt}`;
/// providers compute it during normalization so dedup happens before any
/// database write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedPipelineEvent {
    pub idempotency_key: String,
    pub ci_provider: CiProvider,
    pub pipeline_id: String,
    pub repo: String,
    pub commit_sha: String,
    pub branch: String,
    pub stage: String,
    pub failure_type: FailureType,
    pub error_message: Option<String>,
    pub event_timestamp: DateTime<Utc>,
    pub raw_payload: Value,
    pub correlation_id: Option<String>,
}

// ── Dashboard events ─────────────────────────────────────────────────

/// Structured event pushed to dashboard stream subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub stage: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl DashboardEvent {
    pub fn new(event_type: &str, stage: &str, status: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            stage: stage.to_string(),
            status: status.to_string(),
            timestamp: Utc::now(),
            failure_id: None,
            run_id: None,
            correlation_id: None,
            metadata: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_failure_id(mut self, failure_id: impl Into<String>) -> Self {
        self.failure_id = Some(failure_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Best-effort fan-out of dashboard events. Subscribers that lag are
/// dropped by the broadcast channel; no subscriber affects pipeline
/// progress.
#[derive(Debug, Clone)]
pub struct DashboardPublisher {
    tx: broadcast::Sender<DashboardEvent>,
}

impl DashboardPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Send errors (no subscribers) are ignored.
    pub fn publish(&self, event: DashboardEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(error = %e, "No dashboard subscribers for event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.tx.subscribe()
    }
}

impl Default for DashboardPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}
