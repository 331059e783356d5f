//! Stored entity types and status enums.
//!
//! `RunStatus` is the canonical status set for fix pipeline runs. Statuses
//! carry a rank so the store can reject backwards transitions; terminal
//! statuses never transition again except `monitoring`, which resolves to
//! `merged` or `escalated`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Pipeline event ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Dispatched,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid event status: {}", s)),
        }
    }
}

/// A stored, normalized CI failure event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEventRow {
    pub id: String,
    pub idempotency_key: String,
    pub ci_provider: String,
    pub pipeline_id: String,
    pub repo: String,
    pub commit_sha: String,
    pub branch: String,
    pub stage: String,
    pub failure_type: String,
    pub error_message: Option<String>,
    pub status: EventStatus,
    pub correlation_id: Option<String>,
    pub raw_payload: Value,
    pub event_timestamp: String,
    pub created_at: String,
    pub updated_at: Option<String>,
}

// ── Webhook delivery ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryRow {
    pub id: String,
    pub delivery_id: String,
    pub event_type: String,
    pub repository: Option<String>,
    pub status: String,
    pub details: Option<String>,
    pub received_at: String,
}

// ── Fix pipeline run ─────────────────────────────────────────────────

/// Canonical status set for a fix pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    ContextBuilt,
    RcaReady,
    PlanBlocked,
    PlanReady,
    CriticReady,
    ConsensusReady,
    PatchBlocked,
    PatchReady,
    ValidationFailed,
    ValidationPassed,
    PrFailed,
    PrCreated,
    AwaitingApproval,
    Monitoring,
    Merged,
    Escalated,
    Blocked,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ContextBuilt => "context_built",
            Self::RcaReady => "rca_ready",
            Self::PlanBlocked => "plan_blocked",
            Self::PlanReady => "plan_ready",
            Self::CriticReady => "critic_ready",
            Self::ConsensusReady => "consensus_ready",
            Self::PatchBlocked => "patch_blocked",
            Self::PatchReady => "patch_ready",
            Self::ValidationFailed => "validation_failed",
            Self::ValidationPassed => "validation_passed",
            Self::PrFailed => "pr_failed",
            Self::PrCreated => "pr_created",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Monitoring => "monitoring",
            Self::Merged => "merged",
            Self::Escalated => "escalated",
            Self::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "created" => Ok(Self::Created),
            "context_built" => Ok(Self::ContextBuilt),
            "rca_ready" => Ok(Self::RcaReady),
            "plan_blocked" => Ok(Self::PlanBlocked),
            "plan_ready" => Ok(Self::PlanReady),
            "critic_ready" => Ok(Self::CriticReady),
            "consensus_ready" => Ok(Self::ConsensusReady),
            "patch_blocked" => Ok(Self::PatchBlocked),
            "patch_ready" => Ok(Self::PatchReady),
            "validation_failed" => Ok(Self::ValidationFailed),
            "validation_passed" => Ok(Self::ValidationPassed),
            "pr_failed" => Ok(Self::PrFailed),
            "pr_created" => Ok(Self::PrCreated),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "monitoring" => Ok(Self::Monitoring),
            "merged" => Ok(Self::Merged),
            "escalated" => Ok(Self::Escalated),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }

    /// Position in the forward order of the state graph. A transition is
    /// legal only to a strictly greater rank (except re-entry skips,
    /// which the runner treats as no-ops before calling the store).
    /// `plan_blocked` sits above `critic_ready` because a consensus
    /// rejection also lands there.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::ContextBuilt => 1,
            Self::RcaReady => 2,
            Self::PlanReady => 3,
            Self::CriticReady => 4,
            Self::PlanBlocked | Self::ConsensusReady => 5,
            Self::PatchBlocked | Self::PatchReady => 6,
            Self::ValidationFailed | Self::ValidationPassed => 7,
            Self::PrFailed | Self::AwaitingApproval => 8,
            Self::PrCreated => 9,
            Self::Monitoring => 10,
            Self::Merged | Self::Escalated => 11,
            Self::Blocked => 12,
        }
    }

    /// Statuses that never advance again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PlanBlocked
                | Self::PatchBlocked
                | Self::ValidationFailed
                | Self::PrFailed
                | Self::Merged
                | Self::Escalated
                | Self::Blocked
        )
    }
}

/// Automation mode for a repository installation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutomationMode {
    Suggest,
    AutoPr,
    AutoMerge,
}

impl AutomationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suggest => "suggest",
            Self::AutoPr => "auto_pr",
            Self::AutoMerge => "auto_merge",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "suggest" => Ok(Self::Suggest),
            "auto_pr" => Ok(Self::AutoPr),
            "auto_merge" => Ok(Self::AutoMerge),
            _ => Err(format!("Invalid automation mode: {}", s)),
        }
    }
}

/// JSON stage output columns on a run. One column per stage so each
/// transition persists exactly its own blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageField {
    Context,
    Rca,
    Detection,
    IssueGraph,
    Plan,
    PlanPolicy,
    Critic,
    Consensus,
    PatchStats,
    PatchPolicy,
    Validation,
    Pr,
    Merge,
    PostMergeMonitor,
    Artifact,
}

impl StageField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Context => "context_json",
            Self::Rca => "rca_json",
            Self::Detection => "detection_json",
            Self::IssueGraph => "issue_graph_json",
            Self::Plan => "plan_json",
            Self::PlanPolicy => "plan_policy_json",
            Self::Critic => "critic_json",
            Self::Consensus => "consensus_json",
            Self::PatchStats => "patch_stats_json",
            Self::PatchPolicy => "patch_policy_json",
            Self::Validation => "validation_json",
            Self::Pr => "pr_json",
            Self::Merge => "merge_json",
            Self::PostMergeMonitor => "post_merge_monitor_json",
            Self::Artifact => "artifact_json",
        }
    }
}

/// A fix pipeline run with its stage outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRunRow {
    pub id: String,
    pub event_id: String,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub context_json: Option<Value>,
    pub rca_json: Option<Value>,
    pub detection_json: Option<Value>,
    pub issue_graph_json: Option<Value>,
    pub plan_json: Option<Value>,
    pub plan_policy_json: Option<Value>,
    pub critic_json: Option<Value>,
    pub consensus_json: Option<Value>,
    pub patch_diff: Option<String>,
    pub patch_stats_json: Option<Value>,
    pub patch_policy_json: Option<Value>,
    pub validation_json: Option<Value>,
    pub pr_json: Option<Value>,
    pub merge_json: Option<Value>,
    pub post_merge_monitor_json: Option<Value>,
    pub artifact_json: Option<Value>,
    pub adapter_name: Option<String>,
    pub sbom_path: Option<String>,
    pub sbom_sha256: Option<String>,
    pub sbom_size_bytes: Option<i64>,
    pub run_key: Option<String>,
    pub attempt_count: u32,
    pub retry_limit_snapshot: u32,
    pub blocked_reason: Option<String>,
    pub last_pr_url: Option<String>,
    pub last_pr_created_at: Option<String>,
    pub automation_mode: AutomationMode,
    pub manual_review_required: bool,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl FixRunRow {
    pub fn stage_json(&self, field: StageField) -> Option<&Value> {
        match field {
            StageField::Context => self.context_json.as_ref(),
            StageField::Rca => self.rca_json.as_ref(),
            StageField::Detection => self.detection_json.as_ref(),
            StageField::IssueGraph => self.issue_graph_json.as_ref(),
            StageField::Plan => self.plan_json.as_ref(),
            StageField::PlanPolicy => self.plan_policy_json.as_ref(),
            StageField::Critic => self.critic_json.as_ref(),
            StageField::Consensus => self.consensus_json.as_ref(),
            StageField::PatchStats => self.patch_stats_json.as_ref(),
            StageField::PatchPolicy => self.patch_policy_json.as_ref(),
            StageField::Validation => self.validation_json.as_ref(),
            StageField::Pr => self.pr_json.as_ref(),
            StageField::Merge => self.merge_json.as_ref(),
            StageField::PostMergeMonitor => self.post_merge_monitor_json.as_ref(),
            StageField::Artifact => self.artifact_json.as_ref(),
        }
    }
}

// ── App installation ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInstallationRow {
    pub id: String,
    pub user_id: String,
    pub repo_id: String,
    pub installation_id: i64,
    pub repo_full_name: String,
    pub automation_mode: AutomationMode,
    pub created_at: String,
}
