//! The fix pipeline state machine.
//!
//! A worker advances one run by exactly one state per `advance` call.
//! Each transition persists its stage blob and status in one store
//! transaction; dashboard events and counters are best-effort side
//! effects. Retriable errors re-enqueue with exponential backoff under
//! the attempt cap; everything else resolves to a terminal branch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::adapters::AdapterRegistry;
use crate::artifact::{Redactor, build_provenance_artifact, store_sbom};
use crate::config::Settings;
use crate::consensus::{self, ConsensusState, ConsensusThresholds};
use crate::context::{ContextBuilder, FailureContextBundle};
use crate::errors::StageError;
use crate::events::{DashboardEvent, DashboardPublisher};
use crate::intel::schemas::{CriticDecision, FixPlan, RcaResult};
use crate::intel::{IncidentIndex, LlmProvider, PlanCritic, PlanGenerator, RcaEngine};
use crate::kv::KvStore;
use crate::metrics::Metrics;
use crate::patch::{PatchGenerator, validate_python_sources};
use crate::pipeline::backoff::{compute_backoff_seconds, derive_run_key};
use crate::pipeline::lease::RepoLease;
use crate::pipeline::monitor::PostMergeMonitor;
use crate::safety::{PlanIntent, PolicyDecision, PolicyEngine};
use crate::sandbox::{SandboxRunner, ValidationRequest, ValidationStatus};
use crate::store::{
    AutomationMode, EventStatus, FixRunRow, PipelineEventRow, RunStatus, StageField, Store,
    TransitionUpdate,
};
use crate::vcs::VcsClient;

/// One unit of queued work: advance the run belonging to an event.
#[derive(Debug, Clone)]
pub struct Job {
    pub event_id: String,
    pub correlation_id: Option<String>,
}

/// The authenticated caller of an external mutation (`approve_run`).
#[derive(Debug, Clone)]
pub struct ActorIdentity {
    pub id: String,
    pub display_name: String,
}

/// Result of a single worker step.
#[derive(Debug)]
pub enum StepOutcome {
    /// Moved one state forward; call again.
    Advanced(RunStatus),
    /// Reached a terminal branch.
    Terminal(RunStatus),
    /// Waiting on an external approval.
    AwaitingApproval,
    /// Per-repo concurrency cap reached; reschedule after the delay.
    Throttled { delay: Duration },
    /// Retriable failure; reschedule after the backoff delay.
    Retry { delay: Duration },
    /// Nothing to do (already terminal, monitoring, or awaiting).
    Skipped,
}

const STAGE_DEADLINE: Duration = Duration::from_secs(180);
const LEASE_TTL: Duration = Duration::from_secs(600);

pub struct PipelineRunner {
    store: Arc<Store>,
    kv: KvStore,
    metrics: Metrics,
    publisher: DashboardPublisher,
    llm: Arc<dyn LlmProvider>,
    incidents: Arc<dyn IncidentIndex>,
    vcs: Arc<dyn VcsClient>,
    sandbox: Arc<dyn SandboxRunner>,
    adapters: AdapterRegistry,
    policy: Arc<PolicyEngine>,
    redactor: Arc<Redactor>,
    monitor: Arc<PostMergeMonitor>,
    settings: Settings,
}

#[allow(clippy::too_many_arguments)]
impl PipelineRunner {
    pub fn new(
        store: Arc<Store>,
        kv: KvStore,
        metrics: Metrics,
        publisher: DashboardPublisher,
        llm: Arc<dyn LlmProvider>,
        incidents: Arc<dyn IncidentIndex>,
        vcs: Arc<dyn VcsClient>,
        sandbox: Arc<dyn SandboxRunner>,
        adapters: AdapterRegistry,
        policy: Arc<PolicyEngine>,
        redactor: Arc<Redactor>,
        monitor: Arc<PostMergeMonitor>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            kv,
            metrics,
            publisher,
            llm,
            incidents,
            vcs,
            sandbox,
            adapters,
            policy,
            redactor,
            monitor,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<PostMergeMonitor> {
        &self.monitor
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn workspace_dir(&self, run_id: &str) -> PathBuf {
        self.settings.artifacts_dir.join("workspaces").join(run_id)
    }

    fn publish_stage(&self, run: &FixRunRow, event: &PipelineEventRow, stage: &str, status: &str) {
        self.publisher.publish(
            DashboardEvent::new("fix_pipeline", stage, status)
                .with_run_id(&run.id)
                .with_failure_id(&event.id)
                .with_correlation_id(event.correlation_id.clone().unwrap_or_default()),
        );
    }

    /// Drain a job: advance until the run parks or terminates.
    pub async fn run_job(&self, job: &Job) {
        self.metrics
            .worker_tasks_total
            .with_label_values(&["process_pipeline_event", "started"])
            .inc();
        let mut spins = 0u32;
        let outcome_label = loop {
            spins += 1;
            if spins > 200 {
                tracing::warn!(event_id = %job.event_id, "Job loop cap reached, parking");
                break "parked";
            }
            match self.advance(&job.event_id).await {
                Ok(StepOutcome::Advanced(_)) => continue,
                Ok(StepOutcome::Retry { delay }) | Ok(StepOutcome::Throttled { delay }) => {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Ok(StepOutcome::Terminal(status)) => break status.as_str(),
                Ok(StepOutcome::AwaitingApproval) => break "awaiting_approval",
                Ok(StepOutcome::Skipped) => break "skipped",
                Err(e) => {
                    tracing::error!(event_id = %job.event_id, error = %e, "Job failed");
                    break "error";
                }
            }
        };
        self.metrics
            .worker_tasks_total
            .with_label_values(&["process_pipeline_event", outcome_label])
            .inc();
    }

    /// Advance the run for `event_id` by one state.
    pub async fn advance(&self, event_id: &str) -> Result<StepOutcome, StageError> {
        let event = self
            .store
            .get_event(event_id)?
            .ok_or_else(|| StageError::failed(format!("unknown event {}", event_id)))?;

        let run = match self.store.get_run_by_event(event_id)? {
            Some(run) => run,
            None => {
                let mode = self.store.automation_mode_for_repo(&event.repo)?;
                self.store.create_run(
                    event_id,
                    None,
                    mode,
                    self.settings.max_pipeline_attempts,
                )?
            }
        };

        if run.status.is_terminal()
            || run.status == RunStatus::Monitoring
            || run.status == RunStatus::AwaitingApproval
        {
            return Ok(StepOutcome::Skipped);
        }

        let Some(_lease) = RepoLease::try_acquire(
            &self.kv,
            &event.repo,
            self.settings.repo_pipeline_concurrency_limit as usize,
            LEASE_TTL,
        ) else {
            self.metrics.pipeline_throttled_total.inc();
            return Ok(StepOutcome::Throttled {
                delay: Duration::from_secs(compute_backoff_seconds(
                    1,
                    self.settings.base_backoff_seconds,
                    self.settings.max_backoff_seconds,
                )),
            });
        };

        // Attempt accounting on entry from `created`.
        if run.status == RunStatus::Created {
            let attempts = self.store.increment_attempt(&run.id)?;
            if attempts > run.retry_limit_snapshot {
                return self.block_run(&event, &run, "max_attempts");
            }
            let _ = self.store.update_event_status(&event.id, EventStatus::Processing);
        }

        let stage_result = match run.status {
            RunStatus::Created => self.stage_context(&event, &run).await,
            RunStatus::ContextBuilt => self.stage_rca(&event, &run).await,
            RunStatus::RcaReady => self.stage_plan(&event, &run).await,
            RunStatus::PlanReady => self.stage_critic(&event, &run).await,
            RunStatus::CriticReady => self.stage_consensus(&event, &run).await,
            RunStatus::ConsensusReady => self.stage_patch(&event, &run).await,
            RunStatus::PatchReady => self.stage_validation(&event, &run).await,
            RunStatus::ValidationPassed => self.stage_pr(&event, &run).await,
            RunStatus::PrCreated => self.stage_monitor(&event, &run).await,
            other => {
                return Err(StageError::failed(format!(
                    "no stage handler for status {}",
                    other.as_str()
                )));
            }
        };

        match stage_result {
            Ok(new_status) => self.after_transition(&event, &run, new_status),
            Err(StageError::StateConflict { .. }) => Ok(StepOutcome::Skipped),
            Err(e) if e.is_retriable() => {
                self.metrics.pipeline_retry_total.inc();
                let attempts = self.store.increment_attempt(&run.id)?;
                if attempts > run.retry_limit_snapshot {
                    // A retriable validation error past the cap resolves to
                    // the stage's failure branch, not the loop breaker.
                    if run.status == RunStatus::PatchReady {
                        return self.fail_stage(&event, &run, &e);
                    }
                    return self.block_run(&event, &run, "max_attempts");
                }
                tracing::warn!(
                    run_id = %run.id,
                    attempt = attempts,
                    error = %e,
                    "Retriable stage failure, rescheduling"
                );
                Ok(StepOutcome::Retry {
                    delay: Duration::from_secs(compute_backoff_seconds(
                        attempts,
                        self.settings.base_backoff_seconds,
                        self.settings.max_backoff_seconds,
                    )),
                })
            }
            Err(e) => self.fail_stage(&event, &run, &e),
        }
    }

    fn after_transition(
        &self,
        event: &PipelineEventRow,
        run: &FixRunRow,
        new_status: RunStatus,
    ) -> Result<StepOutcome, StageError> {
        self.publish_stage(run, event, stage_name(new_status), new_status.as_str());

        if new_status == RunStatus::AwaitingApproval {
            return Ok(StepOutcome::AwaitingApproval);
        }
        if new_status == RunStatus::PrCreated {
            self.metrics
                .pipeline_runs_total
                .with_label_values(&[new_status.as_str()])
                .inc();
            let _ = self.store.update_event_status(&event.id, EventStatus::Completed);
        }
        if new_status.is_terminal() || new_status == RunStatus::Monitoring {
            self.emit_artifact(event, &run.id);
        }
        if new_status.is_terminal() {
            self.metrics
                .pipeline_runs_total
                .with_label_values(&[new_status.as_str()])
                .inc();
            let event_status = if matches!(new_status, RunStatus::Merged) {
                EventStatus::Completed
            } else {
                EventStatus::Failed
            };
            let _ = self.store.update_event_status(&event.id, event_status);
            return Ok(StepOutcome::Terminal(new_status));
        }
        Ok(StepOutcome::Advanced(new_status))
    }

    fn emit_artifact(&self, event: &PipelineEventRow, run_id: &str) {
        let Ok(Some(run)) = self.store.get_run(run_id) else {
            return;
        };
        let artifact = build_provenance_artifact(&run, &event.id, &event.repo, &self.redactor);
        if let Err(e) = self.store.set_artifact(run_id, &artifact) {
            tracing::warn!(run_id, error = %e, "Failed to persist provenance artifact");
        }
    }

    fn block_run(
        &self,
        event: &PipelineEventRow,
        run: &FixRunRow,
        reason: &str,
    ) -> Result<StepOutcome, StageError> {
        self.store.transition(
            &run.id,
            RunStatus::Blocked,
            TransitionUpdate {
                blocked_reason: Some(reason),
                ..Default::default()
            },
        )?;
        self.metrics
            .pipeline_loop_blocked_total
            .with_label_values(&[reason])
            .inc();
        self.metrics
            .pipeline_runs_total
            .with_label_values(&["blocked"])
            .inc();
        let _ = self.store.update_event_status(&event.id, EventStatus::Failed);
        self.publish_stage(run, event, "loop_detector", "blocked");
        self.emit_artifact(event, &run.id);
        Ok(StepOutcome::Terminal(RunStatus::Blocked))
    }

    fn fail_stage(
        &self,
        event: &PipelineEventRow,
        run: &FixRunRow,
        error: &StageError,
    ) -> Result<StepOutcome, StageError> {
        let (status, reason) = failure_branch(run.status, error);
        let message = self.redactor.redact_text(&error.to_string());
        self.store.transition(
            &run.id,
            status,
            TransitionUpdate {
                error_message: Some(&message),
                blocked_reason: Some(&reason),
                ..Default::default()
            },
        )?;
        self.publish_stage(run, event, stage_name(status), "failed");
        self.metrics
            .pipeline_runs_total
            .with_label_values(&[status.as_str()])
            .inc();
        let _ = self.store.update_event_status(&event.id, EventStatus::Failed);
        self.emit_artifact(event, &run.id);
        Ok(StepOutcome::Terminal(status))
    }

    // ── Stages ───────────────────────────────────────────────────────

    async fn stage_context(
        &self,
        event: &PipelineEventRow,
        run: &FixRunRow,
    ) -> Result<RunStatus, StageError> {
        let workspace = self.workspace_dir(&run.id);
        if !workspace.exists() {
            self.vcs
                .materialize_checkout(&event.repo, &event.commit_sha, &workspace)
                .await?;
        }

        let raw_log = with_deadline(
            STAGE_DEADLINE,
            self.vcs.fetch_job_logs(&event.repo, &event.pipeline_id, None),
        )
        .await?;
        // Kept beside the checkout for evidence extraction.
        let _ = std::fs::write(workspace.join(".remedy-build.log"), &raw_log);

        let builder = ContextBuilder::new(self.settings.log_max_size_mb as usize * 1024 * 1024);
        let bundle = builder.build(
            &event.id,
            &event.repo,
            &event.commit_sha,
            &event.branch,
            &event.pipeline_id,
            &event.stage,
            &raw_log,
        );

        // Loop/cooldown: one run per failure signature.
        let run_key = derive_run_key(
            &event.repo,
            &event.branch,
            &event.failure_type,
            &bundle.significant_lines(5),
        );
        if let Some(owner) = self.store.get_run_by_key(&run_key)? {
            if owner.id != run.id && pr_within_cooldown(&owner, self.settings.cooldown_seconds) {
                self.block_run(event, run, "cooldown")?;
                return Err(StageError::StateConflict {
                    current: RunStatus::Blocked.as_str().to_string(),
                });
            }
        } else {
            self.store.assign_run_key(&run.id, &run_key)?;
        }

        let repo_files = list_repo_files(&workspace);
        let (adapter_name, detection_json) =
            match self.adapters.select(&raw_log, &repo_files) {
                Some(selected) => (
                    Some(selected.adapter.name().to_string()),
                    serde_json::to_value(&selected.detection)
                        .map_err(|e| StageError::failed(e.to_string()))?,
                ),
                None => (None, Value::Null),
            };
        if !detection_json.is_null() {
            self.store
                .set_stage_json(&run.id, StageField::Detection, &detection_json)?;
        }

        let context_value =
            serde_json::to_value(&bundle).map_err(|e| StageError::failed(e.to_string()))?;
        self.store.transition(
            &run.id,
            RunStatus::ContextBuilt,
            TransitionUpdate {
                stage: Some((StageField::Context, &context_value)),
                adapter_name: adapter_name.as_deref(),
                ..Default::default()
            },
        )?;
        Ok(RunStatus::ContextBuilt)
    }

    async fn stage_rca(
        &self,
        _event: &PipelineEventRow,
        run: &FixRunRow,
    ) -> Result<RunStatus, StageError> {
        let context = load_context(run)?;
        let engine = RcaEngine::new(
            self.llm.as_ref(),
            self.incidents.as_ref(),
            self.settings.llm_max_tokens,
            self.settings.llm_max_retries,
        );
        let rca = with_deadline(STAGE_DEADLINE, engine.analyze(&context)).await?;
        let rca_value = serde_json::to_value(&rca).map_err(|e| StageError::failed(e.to_string()))?;
        self.store.transition(
            &run.id,
            RunStatus::RcaReady,
            TransitionUpdate {
                stage: Some((StageField::Rca, &rca_value)),
                ..Default::default()
            },
        )?;
        Ok(RunStatus::RcaReady)
    }

    async fn stage_plan(
        &self,
        _event: &PipelineEventRow,
        run: &FixRunRow,
    ) -> Result<RunStatus, StageError> {
        let context = load_context(run)?;
        let rca = load_rca(run)?;
        let generator = PlanGenerator::new(
            self.llm.as_ref(),
            self.settings.llm_max_tokens,
            self.settings.llm_max_retries,
        );
        let plan = with_deadline(STAGE_DEADLINE, generator.generate(&rca, &context)).await?;

        let intent = PlanIntent {
            target_files: plan.files.clone(),
            category: Some(plan.category.clone()),
            operation_types: plan
                .operations
                .iter()
                .map(|op| op.op_type.as_str().to_string())
                .collect(),
        };
        let decision = self.policy.evaluate_plan(&intent);
        self.count_violations(&decision);

        let plan_value =
            serde_json::to_value(&plan).map_err(|e| StageError::failed(e.to_string()))?;
        self.store
            .set_stage_json(&run.id, StageField::Plan, &plan_value)?;
        let policy_value =
            serde_json::to_value(&decision).map_err(|e| StageError::failed(e.to_string()))?;

        if !decision.allowed {
            let reason = blocking_reason(&decision);
            self.store.transition(
                &run.id,
                RunStatus::PlanBlocked,
                TransitionUpdate {
                    stage: Some((StageField::PlanPolicy, &policy_value)),
                    blocked_reason: Some(&reason),
                    ..Default::default()
                },
            )?;
            return Ok(RunStatus::PlanBlocked);
        }

        self.store.transition(
            &run.id,
            RunStatus::PlanReady,
            TransitionUpdate {
                stage: Some((StageField::PlanPolicy, &policy_value)),
                ..Default::default()
            },
        )?;
        Ok(RunStatus::PlanReady)
    }

    async fn stage_critic(
        &self,
        _event: &PipelineEventRow,
        run: &FixRunRow,
    ) -> Result<RunStatus, StageError> {
        let context = load_context(run)?;
        let rca = load_rca(run)?;
        let plan = load_plan(run)?;
        let critic = PlanCritic::new(
            self.llm.as_ref(),
            self.settings.llm_max_tokens,
            self.settings.llm_max_retries,
        );
        // A critic that cannot produce valid output counts as a
        // disagreement downstream, not a stage failure.
        let critic_value =
            match with_deadline(STAGE_DEADLINE, critic.review(&rca, &context, &plan)).await {
                Ok(decision) => {
                    serde_json::to_value(&decision).map_err(|e| StageError::failed(e.to_string()))?
                }
                Err(StageError::Parse { message, .. }) => json!({"parse_error": message}),
                Err(e) => return Err(e),
            };
        self.store.transition(
            &run.id,
            RunStatus::CriticReady,
            TransitionUpdate {
                stage: Some((StageField::Critic, &critic_value)),
                ..Default::default()
            },
        )?;
        Ok(RunStatus::CriticReady)
    }

    async fn stage_consensus(
        &self,
        _event: &PipelineEventRow,
        run: &FixRunRow,
    ) -> Result<RunStatus, StageError> {
        let context = load_context(run)?;
        let rca = load_rca(run)?;
        let plan = load_plan(run).ok();
        let critic: Option<CriticDecision> = run
            .critic_json
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let policy: PolicyDecision = run
            .plan_policy_json
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| StageError::failed("plan policy decision missing"))?;

        let graph = consensus::build_issue_graph(&context, &rca);
        let graph_value =
            serde_json::to_value(&graph).map_err(|e| StageError::failed(e.to_string()))?;
        self.store
            .set_stage_json(&run.id, StageField::IssueGraph, &graph_value)?;

        let decision = consensus::decide(
            &graph,
            plan.as_ref(),
            critic.as_ref(),
            &policy,
            ConsensusThresholds {
                min_agreement: self.settings.consensus_min_agreement,
                min_confidence: self.settings.consensus_min_confidence,
                danger_veto: self.settings.consensus_danger_veto,
            },
        );
        let decision_value =
            serde_json::to_value(&decision).map_err(|e| StageError::failed(e.to_string()))?;

        let manual_review = critic
            .as_ref()
            .map(|c| c.requires_manual_review)
            .unwrap_or(true);

        if decision.state != ConsensusState::Accepted {
            let reason = format!("consensus:{}", decision.state.as_str());
            self.store.transition(
                &run.id,
                RunStatus::PlanBlocked,
                TransitionUpdate {
                    stage: Some((StageField::Consensus, &decision_value)),
                    blocked_reason: Some(&reason),
                    ..Default::default()
                },
            )?;
            return Ok(RunStatus::PlanBlocked);
        }

        self.store.transition(
            &run.id,
            RunStatus::ConsensusReady,
            TransitionUpdate {
                stage: Some((StageField::Consensus, &decision_value)),
                manual_review_required: Some(manual_review),
                ..Default::default()
            },
        )?;
        Ok(RunStatus::ConsensusReady)
    }

    async fn stage_patch(
        &self,
        _event: &PipelineEventRow,
        run: &FixRunRow,
    ) -> Result<RunStatus, StageError> {
        let plan = load_plan(run)?;
        let workspace = self.workspace_dir(&run.id);

        let adapter_diff = run
            .adapter_name
            .as_deref()
            .and_then(|name| self.adapters.get(name))
            .and_then(|adapter| adapter.deterministic_patch(&plan, &workspace));
        let diff = match adapter_diff {
            Some(diff) => diff,
            None => {
                let generator = PatchGenerator::new(
                    Some(self.llm.as_ref()),
                    self.settings.llm_max_tokens,
                );
                generator.generate(&plan, &workspace).await?
            }
        };
        if diff.trim().is_empty() {
            return Err(StageError::failed("patch generator produced an empty diff"));
        }

        let (decision, parsed) = self.policy.evaluate_patch(&diff);
        self.count_violations(&decision);
        let policy_value =
            serde_json::to_value(&decision).map_err(|e| StageError::failed(e.to_string()))?;
        let stats_value =
            serde_json::to_value(&parsed).map_err(|e| StageError::failed(e.to_string()))?;
        self.store
            .set_stage_json(&run.id, StageField::PatchStats, &stats_value)?;

        if !decision.allowed {
            let reason = blocking_reason(&decision);
            self.store.transition(
                &run.id,
                RunStatus::PatchBlocked,
                TransitionUpdate {
                    stage: Some((StageField::PatchPolicy, &policy_value)),
                    blocked_reason: Some(&reason),
                    patch_diff: Some(&diff),
                    ..Default::default()
                },
            )?;
            return Ok(RunStatus::PatchBlocked);
        }

        // Apply to the checkout, then gate on source parseability.
        crate::vcs::apply_diff(&workspace, &diff)?;
        let touched: Vec<String> = parsed.files.iter().map(|f| f.path.clone()).collect();
        let ast = validate_python_sources(&workspace, &touched);
        if !ast.passed {
            let message = ast
                .issues
                .iter()
                .map(|i| format!("{}: {}", i.file, i.message))
                .collect::<Vec<_>>()
                .join("; ");
            self.store.transition(
                &run.id,
                RunStatus::PatchBlocked,
                TransitionUpdate {
                    stage: Some((StageField::PatchPolicy, &policy_value)),
                    blocked_reason: Some("post_patch_parse"),
                    error_message: Some(&message),
                    patch_diff: Some(&diff),
                    ..Default::default()
                },
            )?;
            return Ok(RunStatus::PatchBlocked);
        }

        self.store.transition(
            &run.id,
            RunStatus::PatchReady,
            TransitionUpdate {
                stage: Some((StageField::PatchPolicy, &policy_value)),
                patch_diff: Some(&diff),
                ..Default::default()
            },
        )?;
        Ok(RunStatus::PatchReady)
    }

    async fn stage_validation(
        &self,
        event: &PipelineEventRow,
        run: &FixRunRow,
    ) -> Result<RunStatus, StageError> {
        let workspace = self.workspace_dir(&run.id);
        let diff = run
            .patch_diff
            .clone()
            .ok_or_else(|| StageError::failed("patch diff missing"))?;
        let steps = run
            .adapter_name
            .as_deref()
            .and_then(|name| self.adapters.get(name))
            .map(|adapter| adapter.build_validation_steps(&workspace));

        let request = ValidationRequest {
            fix_id: run.id.clone(),
            event_id: event.id.clone(),
            repo_url: event.repo.clone(),
            branch: event.branch.clone(),
            commit_sha: event.commit_sha.clone(),
            diff,
            adapter_name: run.adapter_name.clone(),
            validation_steps: steps,
        };
        let deadline =
            Duration::from_secs(self.settings.sandbox_timeout_seconds.saturating_add(120));
        let mut result =
            with_deadline(deadline, self.sandbox.validate(&request, &workspace)).await?;

        // Persist the SBOM (gzipped) and fold the reference into the
        // scan summary before the blob is stored.
        if let Some(document) = result.sbom_document.take() {
            match store_sbom(&self.settings.artifacts_dir, &run.id, &document) {
                Ok(sbom) => {
                    self.store
                        .set_sbom(&run.id, &sbom.path, &sbom.sha256, sbom.size_bytes as i64)?;
                    if let Some(scans) = result.scans.as_mut() {
                        scans.sbom.path = Some(sbom.path);
                        scans.sbom.sha256 = Some(sbom.sha256);
                        scans.sbom.size_bytes = Some(sbom.size_bytes);
                    }
                }
                Err(e) => tracing::warn!(run_id = %run.id, error = %e, "SBOM store failed"),
            }
        }
        result.logs = self.redactor.redact_text(&result.logs);

        let value =
            serde_json::to_value(&result).map_err(|e| StageError::failed(e.to_string()))?;
        if result.status == ValidationStatus::Passed {
            self.store.transition(
                &run.id,
                RunStatus::ValidationPassed,
                TransitionUpdate {
                    stage: Some((StageField::Validation, &value)),
                    ..Default::default()
                },
            )?;
            Ok(RunStatus::ValidationPassed)
        } else {
            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| "validation failed".to_string());
            let message = self.redactor.redact_text(&message);
            self.store.transition(
                &run.id,
                RunStatus::ValidationFailed,
                TransitionUpdate {
                    stage: Some((StageField::Validation, &value)),
                    error_message: Some(&message),
                    blocked_reason: Some("validation_failed"),
                    ..Default::default()
                },
            )?;
            Ok(RunStatus::ValidationFailed)
        }
    }

    async fn stage_pr(
        &self,
        event: &PipelineEventRow,
        run: &FixRunRow,
    ) -> Result<RunStatus, StageError> {
        if run.automation_mode == AutomationMode::Suggest || run.manual_review_required {
            self.store
                .transition(&run.id, RunStatus::AwaitingApproval, TransitionUpdate::default())?;
            return Ok(RunStatus::AwaitingApproval);
        }
        self.create_pr(event, run).await
    }

    /// Open the fix PR, exactly once per run.
    async fn create_pr(
        &self,
        event: &PipelineEventRow,
        run: &FixRunRow,
    ) -> Result<RunStatus, StageError> {
        if let Some(existing_url) = &run.last_pr_url {
            tracing::info!(run_id = %run.id, url = %existing_url, "PR already exists, reusing");
            self.store.transition(
                &run.id,
                RunStatus::PrCreated,
                TransitionUpdate::default(),
            )?;
            return Ok(RunStatus::PrCreated);
        }

        let plan = load_plan(run)?;
        let label = run
            .patch_policy_json
            .as_ref()
            .and_then(|p| p.get("pr_label"))
            .and_then(|l| l.as_str())
            .unwrap_or("needs-review")
            .to_string();
        let branch = format!("remedy/fix-{}", &run.id[..8.min(run.id.len())]);
        let title = format!("fix: {}", truncate(&plan.root_cause, 72));
        let body = pr_body(run, &plan);
        let workspace = self.workspace_dir(&run.id);

        let info = with_deadline(
            STAGE_DEADLINE,
            self.vcs.open_fix_pr(
                &event.repo,
                &workspace,
                &branch,
                &event.branch,
                &title,
                &body,
                &[label],
            ),
        )
        .await?;

        let pr_value =
            serde_json::to_value(&info).map_err(|e| StageError::failed(e.to_string()))?;
        self.store.transition(
            &run.id,
            RunStatus::PrCreated,
            TransitionUpdate {
                stage: Some((StageField::Pr, &pr_value)),
                pr_url: Some(&info.url),
                ..Default::default()
            },
        )?;

        if run.automation_mode == AutomationMode::AutoMerge {
            match self.vcs.merge(&event.repo, info.number).await {
                Ok(()) => {
                    let merge_value = json!({"merged": true, "pr_number": info.number});
                    self.store
                        .set_stage_json(&run.id, StageField::Merge, &merge_value)?;
                }
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %e, "Auto-merge failed, PR left open");
                }
            }
        }
        Ok(RunStatus::PrCreated)
    }

    async fn stage_monitor(
        &self,
        event: &PipelineEventRow,
        run: &FixRunRow,
    ) -> Result<RunStatus, StageError> {
        let pr_number = run
            .pr_json
            .as_ref()
            .and_then(|p| p.get("number"))
            .and_then(|n| n.as_u64());
        self.monitor
            .register(&run.id, &event.repo, &event.branch, pr_number)?;
        Ok(RunStatus::Monitoring)
    }

    /// External approval path: the only legal exit from
    /// `awaiting_approval`.
    pub async fn approve_run(
        &self,
        run_id: &str,
        actor: &ActorIdentity,
    ) -> Result<FixRunRow, StageError> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| StageError::failed(format!("unknown run {}", run_id)))?;
        if run.status != RunStatus::AwaitingApproval {
            return Err(StageError::StateConflict {
                current: run.status.as_str().to_string(),
            });
        }
        let event = self
            .store
            .get_event(&run.event_id)?
            .ok_or_else(|| StageError::failed("event missing for run"))?;

        tracing::info!(run_id, approver = %actor.id, "Run approved, creating PR");
        self.publisher.publish(
            DashboardEvent::new("fix_pipeline", "approval", "approved")
                .with_run_id(run_id)
                .with_metadata(json!({"approved_by": actor.id})),
        );

        self.create_pr(&event, &run).await?;
        // Approval implies merge intent; register the monitor directly.
        let updated = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| StageError::failed(format!("unknown run {}", run_id)))?;
        self.stage_monitor(&event, &updated).await?;
        self.store
            .get_run(run_id)?
            .ok_or_else(|| StageError::failed(format!("unknown run {}", run_id)))
    }

    fn count_violations(&self, decision: &PolicyDecision) {
        for violation in &decision.violations {
            self.metrics
                .policy_violations_total
                .with_label_values(&[violation.code.as_str()])
                .inc();
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T, StageError>>,
) -> Result<T, StageError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(StageError::transient("timeout")),
    }
}

fn load_context(run: &FixRunRow) -> Result<FailureContextBundle, StageError> {
    let value = run
        .context_json
        .as_ref()
        .ok_or_else(|| StageError::failed("context bundle missing"))?;
    serde_json::from_value(value.clone())
        .map_err(|e| StageError::failed(format!("context bundle unreadable: {}", e)))
}

fn load_rca(run: &FixRunRow) -> Result<RcaResult, StageError> {
    let value = run
        .rca_json
        .as_ref()
        .ok_or_else(|| StageError::failed("rca result missing"))?;
    serde_json::from_value(value.clone())
        .map_err(|e| StageError::failed(format!("rca result unreadable: {}", e)))
}

fn load_plan(run: &FixRunRow) -> Result<FixPlan, StageError> {
    let value = run
        .plan_json
        .as_ref()
        .ok_or_else(|| StageError::failed("fix plan missing"))?;
    serde_json::from_value(value.clone())
        .map_err(|e| StageError::failed(format!("fix plan unreadable: {}", e)))
}

fn pr_within_cooldown(run: &FixRunRow, cooldown_seconds: u64) -> bool {
    let Some(created_at) = run.last_pr_created_at.as_deref() else {
        return false;
    };
    let Ok(created) = chrono::DateTime::parse_from_rfc3339(created_at) else {
        return false;
    };
    let age = chrono::Utc::now().signed_duration_since(created.with_timezone(&chrono::Utc));
    age.num_seconds() >= 0 && (age.num_seconds() as u64) < cooldown_seconds
}

fn blocking_reason(decision: &PolicyDecision) -> String {
    decision
        .blocking_violations()
        .next()
        .map(|v| v.code.clone())
        .unwrap_or_else(|| "policy_blocked".to_string())
}

/// Which stage name a status belongs to, for dashboard events.
fn stage_name(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Created => "created",
        RunStatus::ContextBuilt => "context",
        RunStatus::RcaReady => "rca",
        RunStatus::PlanBlocked | RunStatus::PlanReady => "plan",
        RunStatus::CriticReady => "critic",
        RunStatus::ConsensusReady => "consensus",
        RunStatus::PatchBlocked | RunStatus::PatchReady => "patch",
        RunStatus::ValidationFailed | RunStatus::ValidationPassed => "validation",
        RunStatus::PrFailed | RunStatus::PrCreated | RunStatus::AwaitingApproval => "pr",
        RunStatus::Monitoring | RunStatus::Merged | RunStatus::Escalated => "post_merge",
        RunStatus::Blocked => "loop_detector",
    }
}

/// Map a hard stage failure onto the graph's failure branch for the
/// stage the run was in.
fn failure_branch(current: RunStatus, error: &StageError) -> (RunStatus, String) {
    let reason = match error {
        StageError::Parse { .. } => "parse_error".to_string(),
        StageError::PolicyBlocked { reason } => reason.clone(),
        StageError::ConsensusRejected { state } => format!("consensus:{}", state),
        _ => "stage_failed".to_string(),
    };
    let status = match current {
        RunStatus::Created | RunStatus::ContextBuilt | RunStatus::RcaReady | RunStatus::PlanReady => {
            RunStatus::PlanBlocked
        }
        RunStatus::CriticReady | RunStatus::ConsensusReady => RunStatus::PatchBlocked,
        RunStatus::PatchReady => RunStatus::ValidationFailed,
        RunStatus::ValidationPassed => RunStatus::PrFailed,
        _ => RunStatus::Blocked,
    };
    (status, reason)
}

fn list_repo_files(workspace: &std::path::Path) -> Vec<String> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(workspace)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(workspace) {
            files.push(rel.to_string_lossy().replace('\\', "/"));
        }
        if files.len() >= 5000 {
            break;
        }
    }
    files.sort();
    files
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn pr_body(run: &FixRunRow, plan: &FixPlan) -> String {
    let mut body = String::from("Automated fix proposed by the self-healing pipeline.\n\n");
    body.push_str(&format!("**Root cause**: {}\n", plan.root_cause));
    body.push_str(&format!("**Category**: {}\n", plan.category));
    body.push_str(&format!("**Confidence**: {:.2}\n", plan.confidence));
    if let Some(stats) = &run.patch_stats_json {
        body.push_str(&format!(
            "**Changes**: {} file(s), +{} / -{}\n",
            stats["total_files"], stats["total_lines_added"], stats["total_lines_removed"]
        ));
    }
    if let Some(policy) = &run.patch_policy_json {
        body.push_str(&format!(
            "**Danger score**: {} ({})\n",
            policy["danger_score"], policy["pr_label"]
        ));
    }
    body.push_str(&format!("\nRun: `{}`\n", run.id));
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_branch_maps_stages_to_graph_branches() {
        let parse = StageError::Parse {
            message: "bad".to_string(),
            raw_output: String::new(),
        };
        assert_eq!(
            failure_branch(RunStatus::RcaReady, &parse).0,
            RunStatus::PlanBlocked
        );
        assert_eq!(
            failure_branch(RunStatus::ConsensusReady, &parse).0,
            RunStatus::PatchBlocked
        );
        assert_eq!(
            failure_branch(RunStatus::PatchReady, &parse).0,
            RunStatus::ValidationFailed
        );
        assert_eq!(
            failure_branch(RunStatus::ValidationPassed, &parse).0,
            RunStatus::PrFailed
        );
    }

    #[test]
    fn failure_branch_carries_policy_reason() {
        let blocked = StageError::PolicyBlocked {
            reason: "nondeterministic_unsupported".to_string(),
        };
        let (status, reason) = failure_branch(RunStatus::ConsensusReady, &blocked);
        assert_eq!(status, RunStatus::PatchBlocked);
        assert_eq!(reason, "nondeterministic_unsupported");
    }

    #[test]
    fn cooldown_check_reads_rfc3339() {
        use crate::store::AutomationMode;
        let mut run = FixRunRow {
            id: "r".to_string(),
            event_id: "e".to_string(),
            status: RunStatus::PrCreated,
            error_message: None,
            context_json: None,
            rca_json: None,
            detection_json: None,
            issue_graph_json: None,
            plan_json: None,
            plan_policy_json: None,
            critic_json: None,
            consensus_json: None,
            patch_diff: None,
            patch_stats_json: None,
            patch_policy_json: None,
            validation_json: None,
            pr_json: None,
            merge_json: None,
            post_merge_monitor_json: None,
            artifact_json: None,
            adapter_name: None,
            sbom_path: None,
            sbom_sha256: None,
            sbom_size_bytes: None,
            run_key: None,
            attempt_count: 1,
            retry_limit_snapshot: 3,
            blocked_reason: None,
            last_pr_url: Some("u".to_string()),
            last_pr_created_at: Some(chrono::Utc::now().to_rfc3339()),
            automation_mode: AutomationMode::AutoPr,
            manual_review_required: false,
            created_at: String::new(),
            updated_at: None,
        };
        assert!(pr_within_cooldown(&run, 3600));
        run.last_pr_created_at =
            Some((chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339());
        assert!(!pr_within_cooldown(&run, 3600));
        run.last_pr_created_at = None;
        assert!(!pr_within_cooldown(&run, 3600));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 5), "hello");
    }
}
