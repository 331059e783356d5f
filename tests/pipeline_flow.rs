//! End-to-end pipeline scenarios with injected LLM, VCS, and sandbox
//! handles. Each test drives the state machine through `advance` exactly
//! as a worker would.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use git2::{IndexAddOption, Repository, Signature};
use serde_json::json;
use tempfile::TempDir;

use remedy::adapters::AdapterRegistry;
use remedy::artifact::Redactor;
use remedy::config::Settings;
use remedy::errors::StageError;
use remedy::events::{
    CiProvider, DashboardPublisher, FailureType, NormalizedPipelineEvent,
};
use remedy::ingest::{IngestOutcome, Ingestor};
use remedy::intel::{IncidentIndex, MockLlm, NoIncidentIndex};
use remedy::kv::KvStore;
use remedy::metrics::Metrics;
use remedy::pipeline::{Job, PipelineRunner, PostMergeMonitor, StepOutcome};
use remedy::safety::{PolicyEngine, SafetyPolicy};
use remedy::sandbox::scanners::{
    SbomResult, ScanStatus, gitleaks_result, trivy_result,
};
use remedy::sandbox::{
    SandboxRunner, ScanSummary, ValidationRequest, ValidationResult, ValidationStatus,
};
use remedy::store::{RunStatus, Store};
use remedy::vcs::{PullRequestInfo, VcsClient};

// ── Mock collaborators ───────────────────────────────────────────────

struct MockVcs {
    log: String,
    fail_log_fetch: AtomicBool,
    pr_count: AtomicUsize,
    merge_count: AtomicUsize,
}

impl MockVcs {
    fn new(log: &str) -> Self {
        Self {
            log: log.to_string(),
            fail_log_fetch: AtomicBool::new(false),
            pr_count: AtomicUsize::new(0),
            merge_count: AtomicUsize::new(0),
        }
    }

    fn seed_checkout(dest: &Path) {
        std::fs::create_dir_all(dest).unwrap();
        let repo = Repository::init(dest).unwrap();
        std::fs::write(
            dest.join("pyproject.toml"),
            "[tool.poetry]\nname = \"app\"\n\n[tool.poetry.dependencies]\npython = \"^3.11\"\n",
        )
        .unwrap();
        std::fs::create_dir_all(dest.join("src/app")).unwrap();
        std::fs::write(dest.join("src/app/main.py"), "import requests\n").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("seed", "seed@test.invalid").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "seed", &tree, &[])
            .unwrap();
    }
}

#[async_trait]
impl VcsClient for MockVcs {
    async fn fetch_job_logs(
        &self,
        _repo: &str,
        _run_id: &str,
        _job_id: Option<&str>,
    ) -> Result<String, StageError> {
        if self.fail_log_fetch.load(Ordering::SeqCst) {
            return Err(StageError::transient("connection reset while fetching logs"));
        }
        Ok(self.log.clone())
    }

    async fn materialize_checkout(
        &self,
        _repo: &str,
        _commit_sha: &str,
        dest: &Path,
    ) -> Result<(), StageError> {
        Self::seed_checkout(dest);
        Ok(())
    }

    async fn open_fix_pr(
        &self,
        repo: &str,
        _workspace: &Path,
        branch: &str,
        _base_branch: &str,
        _title: &str,
        _body: &str,
        _labels: &[String],
    ) -> Result<PullRequestInfo, StageError> {
        let n = self.pr_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PullRequestInfo {
            number: n as u64,
            url: format!("https://github.com/{}/pull/{}", repo, n),
            head_branch: branch.to_string(),
        })
    }

    async fn comment(&self, _repo: &str, _pr: u64, _body: &str) -> Result<(), StageError> {
        Ok(())
    }

    async fn merge(&self, _repo: &str, _pr: u64) -> Result<(), StageError> {
        self.merge_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockSandbox {
    calls: AtomicUsize,
    pass: bool,
}

impl MockSandbox {
    fn passing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            pass: true,
        }
    }
}

#[async_trait]
impl SandboxRunner for MockSandbox {
    async fn validate(
        &self,
        request: &ValidationRequest,
        _workspace: &Path,
    ) -> Result<ValidationResult, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let status = if self.pass {
            ValidationStatus::Passed
        } else {
            ValidationStatus::Failed
        };
        Ok(ValidationResult {
            fix_id: request.fix_id.clone(),
            event_id: request.event_id.clone(),
            validation_id: "v-1".to_string(),
            status,
            tests_passed: 3,
            tests_failed: if self.pass { 0 } else { 1 },
            tests_skipped: 0,
            tests_total: 3,
            execution_time_seconds: 1.5,
            steps_completed: vec!["pytest".to_string()],
            logs: "===== 3 passed in 1.5s =====".to_string(),
            error_message: None,
            framework_detected: "pytest".to_string(),
            docker_image: Some("python:3.11-slim".to_string()),
            scans: Some(ScanSummary {
                gitleaks: gitleaks_result("[]", Some("8.18.0".to_string()), 0.2),
                trivy: trivy_result("{}", "HIGH", Some("0.50.1".to_string()), 0.3),
                sbom: SbomResult {
                    status: ScanStatus::Generated,
                    version: Some("1.0.0".to_string()),
                    duration_seconds: 0.1,
                    path: None,
                    sha256: None,
                    size_bytes: None,
                    format: "syft-json".to_string(),
                    error_message: None,
                },
            }),
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            sbom_document: Some(r#"{"artifacts": []}"#.to_string()),
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────

const PY_LOG: &str = r#"collecting tests
Traceback (most recent call last):
  File "src/app/main.py", line 1, in <module>
    import requests
ModuleNotFoundError: No module named 'requests'
"#;

fn rca_json() -> String {
    json!({
        "classification": {
            "category": "dependency",
            "confidence": 0.92,
            "reasoning": "missing module at import time",
            "indicators": ["ModuleNotFoundError"]
        },
        "primary_hypothesis": {
            "description": "requests is not declared in pyproject.toml",
            "confidence": 0.9,
            "evidence": ["No module named 'requests'"],
            "suggested_fix": "add requests to the dependency table"
        },
        "alternative_hypotheses": [],
        "affected_files": [],
        "similar_incidents": []
    })
    .to_string()
}

fn plan_json(confidence: f64, file: &str) -> String {
    json!({
        "root_cause": "requests missing from dependency table",
        "category": "python_missing_dependency",
        "confidence": confidence,
        "files": [file],
        "operations": [{
            "type": "add_dependency",
            "file": file,
            "details": {"package": "requests", "version": "^2.31.0"},
            "rationale": "import fails at startup",
            "evidence": ["No module named 'requests'"]
        }]
    })
    .to_string()
}

fn critic_json(allowed: bool) -> String {
    json!({
        "allowed": allowed,
        "hallucination_risk": 0.05,
        "reasoning_consistency": 0.95,
        "issues": [],
        "requires_manual_review": false,
        "recommended_label": "safe"
    })
    .to_string()
}

struct Harness {
    store: Arc<Store>,
    runner: Arc<PipelineRunner>,
    ingestor: Ingestor,
    jobs_rx: tokio::sync::mpsc::UnboundedReceiver<Job>,
    vcs: Arc<MockVcs>,
    sandbox: Arc<MockSandbox>,
    metrics: Metrics,
    publisher: DashboardPublisher,
    _tmp: TempDir,
}

fn harness(llm_responses: Vec<String>, vcs: MockVcs, sandbox: MockSandbox) -> Harness {
    let tmp = TempDir::new().unwrap();
    let settings = Settings {
        artifacts_dir: tmp.path().to_path_buf(),
        base_backoff_seconds: 0,
        max_backoff_seconds: 0,
        max_pipeline_attempts: 3,
        ..Settings::default()
    };
    let store = Arc::new(Store::new_in_memory().unwrap());
    let kv = KvStore::new();
    let metrics = Metrics::new().unwrap();
    let publisher = DashboardPublisher::default();
    let policy = Arc::new(PolicyEngine::new(SafetyPolicy::default()));
    let redactor = Arc::new(Redactor::from_policy(policy.policy()));
    let monitor = Arc::new(PostMergeMonitor::new(
        store.clone(),
        kv.clone(),
        metrics.clone(),
        publisher.clone(),
        std::time::Duration::from_secs(7200),
    ));
    let vcs = Arc::new(vcs);
    let sandbox = Arc::new(sandbox);
    let incidents: Arc<dyn IncidentIndex> = Arc::new(NoIncidentIndex);

    let runner = Arc::new(PipelineRunner::new(
        store.clone(),
        kv,
        metrics.clone(),
        publisher.clone(),
        Arc::new(MockLlm::new(llm_responses)),
        incidents,
        vcs.clone(),
        sandbox.clone(),
        AdapterRegistry::with_builtins(),
        policy,
        redactor,
        monitor,
        settings,
    ));

    let (jobs_tx, jobs_rx) = tokio::sync::mpsc::unbounded_channel();
    let ingestor = Ingestor::new(store.clone(), metrics.clone(), jobs_tx);

    Harness {
        store,
        runner,
        ingestor,
        jobs_rx,
        vcs,
        sandbox,
        metrics,
        publisher,
        _tmp: tmp,
    }
}

fn sample_event(key_suffix: &str) -> NormalizedPipelineEvent {
    NormalizedPipelineEvent {
        idempotency_key: format!("github_actions:org/app:100:0:{}", key_suffix),
        ci_provider: CiProvider::GithubActions,
        pipeline_id: "100".to_string(),
        repo: "org/app".to_string(),
        commit_sha: "a".repeat(40),
        branch: "main".to_string(),
        stage: "test-unit".to_string(),
        failure_type: FailureType::Test,
        error_message: Some("tests failed".to_string()),
        event_timestamp: Utc::now(),
        raw_payload: json!({"workflow_run": {"id": 100}}),
        correlation_id: Some("corr-1".to_string()),
    }
}

/// Advance until the run parks; return the final run status.
async fn drive(harness: &Harness, event_id: &str) -> RunStatus {
    for _ in 0..50 {
        match harness.runner.advance(event_id).await.unwrap() {
            StepOutcome::Advanced(_) => continue,
            StepOutcome::Retry { .. } | StepOutcome::Throttled { .. } => continue,
            StepOutcome::Terminal(status) => return status,
            StepOutcome::AwaitingApproval => return RunStatus::AwaitingApproval,
            StepOutcome::Skipped => break,
        }
    }
    harness
        .store
        .get_run_by_event(event_id)
        .unwrap()
        .unwrap()
        .status
}

// ── Scenario 1: python missing-module happy path ─────────────────────

#[tokio::test]
async fn python_missing_module_happy_path() {
    let mut h = harness(
        vec![rca_json(), plan_json(0.9, "pyproject.toml"), critic_json(true)],
        MockVcs::new(PY_LOG),
        MockSandbox::passing(),
    );

    let outcome = h
        .ingestor
        .ingest(&sample_event("1"), "delivery-1", "workflow_run")
        .unwrap();
    let IngestOutcome::Accepted { event_id } = outcome else {
        panic!("expected Accepted");
    };
    let job = h.jobs_rx.recv().await.unwrap();
    assert_eq!(job.event_id, event_id);

    let status = drive(&h, &event_id).await;
    assert_eq!(status, RunStatus::Monitoring);

    let run = h.store.get_run_by_event(&event_id).unwrap().unwrap();
    assert_eq!(run.adapter_name.as_deref(), Some("python"));
    assert_eq!(
        run.detection_json.unwrap()["category"],
        "python_missing_dependency"
    );

    let plan = run.plan_json.unwrap();
    assert_eq!(plan["operations"].as_array().unwrap().len(), 1);
    assert_eq!(plan["operations"][0]["type"], "add_dependency");
    assert_eq!(plan["operations"][0]["file"], "pyproject.toml");

    let diff = run.patch_diff.unwrap();
    assert!(diff.contains("+requests = \"^2.31.0\""));

    let plan_policy = run.plan_policy_json.unwrap();
    assert_eq!(plan_policy["allowed"], true);
    assert_eq!(plan_policy["pr_label"], "safe");

    let validation = run.validation_json.unwrap();
    assert_eq!(validation["status"], "passed");
    assert!(run.sbom_path.is_some());
    assert!(run.sbom_sha256.is_some());

    assert_eq!(h.vcs.pr_count.load(Ordering::SeqCst), 1);
    assert!(run.last_pr_url.is_some());
    assert!(run.run_key.is_some());

    // Monitor entry registered.
    assert_eq!(
        run.post_merge_monitor_json.unwrap()["status"],
        "monitoring"
    );

    // Re-delivering the same webhook: deduped, no second PR.
    let replay = h
        .ingestor
        .ingest(&sample_event("1"), "delivery-1", "workflow_run")
        .unwrap();
    assert_eq!(replay, IngestOutcome::DuplicateDelivery);
    assert_eq!(h.metrics.webhook_deduped_total.get(), 1);

    // Same event under a fresh delivery id: also no second PR.
    let replay2 = h
        .ingestor
        .ingest(&sample_event("1"), "delivery-2", "workflow_run")
        .unwrap();
    assert!(matches!(replay2, IngestOutcome::DuplicateEvent { .. }));
    let status = drive(&h, &event_id).await;
    assert_eq!(status, RunStatus::Monitoring);
    assert_eq!(h.vcs.pr_count.load(Ordering::SeqCst), 1);
}

// ── Scenario 2: forbidden path blocks the plan ───────────────────────

#[tokio::test]
async fn forbidden_path_plan_is_blocked_before_sandbox() {
    let mut h = harness(
        vec![
            rca_json(),
            plan_json(0.9, ".github/workflows/ci.yml"),
            critic_json(true),
        ],
        MockVcs::new(PY_LOG),
        MockSandbox::passing(),
    );

    let IngestOutcome::Accepted { event_id } = h
        .ingestor
        .ingest(&sample_event("2"), "delivery-20", "workflow_run")
        .unwrap()
    else {
        panic!()
    };
    h.jobs_rx.recv().await.unwrap();

    let status = drive(&h, &event_id).await;
    assert_eq!(status, RunStatus::PlanBlocked);

    let run = h.store.get_run_by_event(&event_id).unwrap().unwrap();
    assert_eq!(run.blocked_reason.as_deref(), Some("forbidden_path"));
    let policy = run.plan_policy_json.unwrap();
    assert_eq!(policy["allowed"], false);
    assert_eq!(policy["violations"][0]["code"], "forbidden_path");

    // No sandbox run, no PR.
    assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.vcs.pr_count.load(Ordering::SeqCst), 0);
    assert!(
        h.metrics
            .policy_violations_total
            .with_label_values(&["forbidden_path"])
            .get()
            >= 1
    );
}

// ── Scenario 3: secret in diff blocks the patch ──────────────────────

#[tokio::test]
async fn secret_in_diff_blocks_patch_and_artifact_is_redacted() {
    // modify_code routes through the LLM diff fallback; the model
    // returns a diff that adds a credential.
    let rogue_diff = r#"diff --git a/src/app/settings.py b/src/app/settings.py
--- a/src/app/settings.py
+++ b/src/app/settings.py
@@ -1 +1,2 @@
 DEBUG = False
+password = "hunter2"
"#;
    let plan = json!({
        "root_cause": "settings misconfigured",
        "category": "configuration",
        "confidence": 0.9,
        "files": ["src/app/settings.py"],
        "operations": [{
            "type": "modify_code",
            "file": "src/app/settings.py",
            "details": {},
            "rationale": "adjust settings",
            "evidence": []
        }]
    })
    .to_string();

    let mut h = harness(
        vec![
            rca_json(),
            plan,
            critic_json(true),
            rogue_diff.to_string(),
        ],
        MockVcs::new(PY_LOG),
        MockSandbox::passing(),
    );

    let IngestOutcome::Accepted { event_id } = h
        .ingestor
        .ingest(&sample_event("3"), "delivery-30", "workflow_run")
        .unwrap()
    else {
        panic!()
    };
    h.jobs_rx.recv().await.unwrap();

    let status = drive(&h, &event_id).await;
    assert_eq!(status, RunStatus::PatchBlocked);

    let run = h.store.get_run_by_event(&event_id).unwrap().unwrap();
    assert_eq!(run.blocked_reason.as_deref(), Some("secret_pattern"));

    // The provenance artifact never leaks the secret.
    let artifact = run.artifact_json.unwrap();
    let rendered = artifact.to_string();
    assert!(!rendered.contains("hunter2"));
    assert_eq!(artifact["status"], "patch_blocked");

    assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.vcs.pr_count.load(Ordering::SeqCst), 0);
}

// ── Scenario 4: consensus low agreement ──────────────────────────────

#[tokio::test]
async fn low_agreement_rejects_at_consensus() {
    let mut h = harness(
        vec![
            rca_json(),
            plan_json(0.4, "pyproject.toml"),
            critic_json(false),
        ],
        MockVcs::new(PY_LOG),
        MockSandbox::passing(),
    );

    let IngestOutcome::Accepted { event_id } = h
        .ingestor
        .ingest(&sample_event("4"), "delivery-40", "workflow_run")
        .unwrap()
    else {
        panic!()
    };
    h.jobs_rx.recv().await.unwrap();

    let status = drive(&h, &event_id).await;
    assert_eq!(status, RunStatus::PlanBlocked);

    let run = h.store.get_run_by_event(&event_id).unwrap().unwrap();
    assert!(
        run.blocked_reason
            .as_deref()
            .unwrap()
            .contains("consensus")
    );
    let consensus = run.consensus_json.unwrap();
    assert_eq!(consensus["state"], "rejected_low_agreement");
    assert!(consensus["agreement_rate"].as_f64().unwrap() < 0.75);
    assert_eq!(h.vcs.pr_count.load(Ordering::SeqCst), 0);
}

// ── Scenario 5: loop break at max attempts ───────────────────────────

#[tokio::test]
async fn repeated_transient_failures_hit_the_loop_breaker() {
    let vcs = MockVcs::new(PY_LOG);
    vcs.fail_log_fetch.store(true, Ordering::SeqCst);
    let mut h = harness(vec![rca_json()], vcs, MockSandbox::passing());

    let IngestOutcome::Accepted { event_id } = h
        .ingestor
        .ingest(&sample_event("5"), "delivery-50", "workflow_run")
        .unwrap()
    else {
        panic!()
    };
    h.jobs_rx.recv().await.unwrap();

    let status = drive(&h, &event_id).await;
    assert_eq!(status, RunStatus::Blocked);

    let run = h.store.get_run_by_event(&event_id).unwrap().unwrap();
    assert_eq!(run.blocked_reason.as_deref(), Some("max_attempts"));
    assert!(run.attempt_count > run.retry_limit_snapshot);
    assert_eq!(
        h.metrics
            .pipeline_loop_blocked_total
            .with_label_values(&["max_attempts"])
            .get(),
        1
    );
}

// ── Scenario 6: post-merge regression ────────────────────────────────

#[tokio::test]
async fn post_merge_regression_escalates() {
    let mut h = harness(
        vec![rca_json(), plan_json(0.9, "pyproject.toml"), critic_json(true)],
        MockVcs::new(PY_LOG),
        MockSandbox::passing(),
    );
    let mut events = h.publisher.subscribe();

    let IngestOutcome::Accepted { event_id } = h
        .ingestor
        .ingest(&sample_event("6"), "delivery-60", "workflow_run")
        .unwrap()
    else {
        panic!()
    };
    h.jobs_rx.recv().await.unwrap();
    let status = drive(&h, &event_id).await;
    assert_eq!(status, RunStatus::Monitoring);

    // Next CI run on the same branch fails.
    let resolved = h
        .runner
        .monitor()
        .process_outcome("org/app", "main", "failure")
        .unwrap();
    let run = h.store.get_run_by_event(&event_id).unwrap().unwrap();
    assert_eq!(resolved.as_deref(), Some(run.id.as_str()));
    assert_eq!(run.status, RunStatus::Escalated);
    assert_eq!(run.blocked_reason.as_deref(), Some("post_merge_regression"));
    assert_eq!(
        h.metrics
            .pipeline_loop_blocked_total
            .with_label_values(&["post_merge_regression"])
            .get(),
        1
    );

    // The regressed event reached the dashboard stream.
    let mut saw_regressed = false;
    while let Ok(event) = events.try_recv() {
        if event.status == "regressed" {
            saw_regressed = true;
        }
    }
    assert!(saw_regressed);
}

// ── Approval gate ────────────────────────────────────────────────────

#[tokio::test]
async fn suggest_mode_waits_for_approval() {
    let mut h = harness(
        vec![rca_json(), plan_json(0.9, "pyproject.toml"), critic_json(true)],
        MockVcs::new(PY_LOG),
        MockSandbox::passing(),
    );
    // Repo installation pins automation to suggest-only.
    h.store
        .upsert_installation(
            "user-1",
            "repo-1",
            42,
            "org/app",
            remedy::store::AutomationMode::Suggest,
        )
        .unwrap();

    let IngestOutcome::Accepted { event_id } = h
        .ingestor
        .ingest(&sample_event("7"), "delivery-70", "workflow_run")
        .unwrap()
    else {
        panic!()
    };
    h.jobs_rx.recv().await.unwrap();

    let status = drive(&h, &event_id).await;
    assert_eq!(status, RunStatus::AwaitingApproval);
    assert_eq!(h.vcs.pr_count.load(Ordering::SeqCst), 0);

    // Approval is the only way out, and it opens exactly one PR.
    let run = h.store.get_run_by_event(&event_id).unwrap().unwrap();
    let actor = remedy::pipeline::ActorIdentity {
        id: "user-1".to_string(),
        display_name: "User One".to_string(),
    };
    let approved = h.runner.approve_run(&run.id, &actor).await.unwrap();
    assert_eq!(approved.status, RunStatus::Monitoring);
    assert_eq!(h.vcs.pr_count.load(Ordering::SeqCst), 1);

    // Approving again conflicts.
    let err = h.runner.approve_run(&run.id, &actor).await.unwrap_err();
    assert!(matches!(err, StageError::StateConflict { .. }));
}

// ── Idempotent worker re-entry ───────────────────────────────────────

#[tokio::test]
async fn advancing_a_parked_run_is_a_noop() {
    let mut h = harness(
        vec![rca_json(), plan_json(0.9, "pyproject.toml"), critic_json(true)],
        MockVcs::new(PY_LOG),
        MockSandbox::passing(),
    );
    let IngestOutcome::Accepted { event_id } = h
        .ingestor
        .ingest(&sample_event("8"), "delivery-80", "workflow_run")
        .unwrap()
    else {
        panic!()
    };
    h.jobs_rx.recv().await.unwrap();
    drive(&h, &event_id).await;

    // At-least-once delivery means a second worker may pick the job up.
    for _ in 0..3 {
        let outcome = h.runner.advance(&event_id).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Skipped));
    }
    assert_eq!(h.vcs.pr_count.load(Ordering::SeqCst), 1);
}
