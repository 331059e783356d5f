//! Sandbox validation orchestration.
//!
//! `SandboxRunner` is the seam the pipeline depends on; `DockerValidator`
//! is the production implementation: apply the diff to the host checkout,
//! bind-mount it into an ephemeral container, run the adapter's steps in
//! order, then run the supply-chain scanners.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapters::ValidationStep;
use crate::errors::StageError;

use super::scanners::{
    GitleaksScanResult, SbomResult, ScanStatus, TrivyScanResult, extract_version,
    gitleaks_result, trivy_result,
};
use super::{DockerSandbox, SandboxContainer};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Cloning,
    Patching,
    Installing,
    Running,
    Passed,
    Failed,
    Error,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub gitleaks: GitleaksScanResult,
    pub trivy: TrivyScanResult,
    pub sbom: SbomResult,
}

impl ScanSummary {
    /// Whether any scan gate failed.
    pub fn any_failed(&self) -> bool {
        self.gitleaks.status == ScanStatus::Fail || self.trivy.status == ScanStatus::Fail
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub fix_id: String,
    pub event_id: String,
    pub repo_url: String,
    pub branch: String,
    pub commit_sha: String,
    pub diff: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_steps: Option<Vec<ValidationStep>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub fix_id: String,
    pub event_id: String,
    pub validation_id: String,
    pub status: ValidationStatus,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_skipped: u32,
    pub tests_total: u32,
    pub execution_time_seconds: f64,
    pub steps_completed: Vec<String>,
    pub logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub framework_detected: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scans: Option<ScanSummary>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Raw SBOM document; stored separately (gzipped) and never
    /// serialized into the stage blob.
    #[serde(skip)]
    pub sbom_document: Option<String>,
}

impl ValidationResult {
    pub fn is_successful(&self) -> bool {
        self.status == ValidationStatus::Passed
    }
}

/// Seam between the orchestrator and the sandbox machinery.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn validate(
        &self,
        request: &ValidationRequest,
        workspace: &Path,
    ) -> Result<ValidationResult, StageError>;
}

const LOG_CEILING_BYTES: usize = 64 * 1024;

pub struct DockerValidator {
    sandbox: DockerSandbox,
    fail_on_severity: String,
    scanner_timeout: Duration,
}

impl DockerValidator {
    pub fn new(sandbox: DockerSandbox, fail_on_severity: &str) -> Self {
        Self {
            sandbox,
            fail_on_severity: fail_on_severity.to_string(),
            scanner_timeout: Duration::from_secs(120),
        }
    }

    async fn run_scans(&self, container: &SandboxContainer) -> (ScanSummary, Option<String>) {
        let gitleaks = self.run_gitleaks(container).await;
        let trivy = self.run_trivy(container).await;
        let (sbom, document) = self.run_syft(container).await;
        (
            ScanSummary {
                gitleaks,
                trivy,
                sbom,
            },
            document,
        )
    }

    async fn run_gitleaks(&self, container: &SandboxContainer) -> GitleaksScanResult {
        let started = std::time::Instant::now();
        let version = match container
            .run_command("gitleaks version", self.scanner_timeout)
            .await
        {
            Ok(r) if r.exit_code == 0 => extract_version(&r.stdout),
            _ => {
                return GitleaksScanResult {
                    status: ScanStatus::Skipped,
                    version: None,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    findings_count: 0,
                    findings: vec![],
                    error_message: Some("gitleaks unavailable".to_string()),
                };
            }
        };
        let _ = container
            .run_command(
                "gitleaks detect --source . --no-git --redact --report-format json --report-path /tmp/gitleaks.json",
                self.scanner_timeout,
            )
            .await;
        let report = container
            .run_command("cat /tmp/gitleaks.json || true", Duration::from_secs(10))
            .await
            .map(|r| r.stdout)
            .unwrap_or_default();
        gitleaks_result(&report, version, started.elapsed().as_secs_f64())
    }

    async fn run_trivy(&self, container: &SandboxContainer) -> TrivyScanResult {
        let started = std::time::Instant::now();
        let version = match container
            .run_command("trivy --version", self.scanner_timeout)
            .await
        {
            Ok(r) if r.exit_code == 0 => extract_version(&r.stdout),
            _ => {
                return TrivyScanResult {
                    status: ScanStatus::Skipped,
                    version: None,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    total_vulnerabilities: 0,
                    severity_counts: Default::default(),
                    top_packages: vec![],
                    threshold: self.fail_on_severity.clone(),
                    error_message: Some("trivy unavailable".to_string()),
                };
            }
        };
        let report = container
            .run_command(
                "trivy fs --quiet --format json . || true",
                self.scanner_timeout,
            )
            .await
            .map(|r| r.stdout)
            .unwrap_or_default();
        trivy_result(
            &report,
            &self.fail_on_severity,
            version,
            started.elapsed().as_secs_f64(),
        )
    }

    async fn run_syft(&self, container: &SandboxContainer) -> (SbomResult, Option<String>) {
        let started = std::time::Instant::now();
        let version = match container
            .run_command("syft version", self.scanner_timeout)
            .await
        {
            Ok(r) if r.exit_code == 0 => extract_version(&r.stdout),
            _ => {
                return (
                    SbomResult {
                        status: ScanStatus::Skipped,
                        version: None,
                        duration_seconds: started.elapsed().as_secs_f64(),
                        path: None,
                        sha256: None,
                        size_bytes: None,
                        format: "syft-json".to_string(),
                        error_message: Some("syft unavailable".to_string()),
                    },
                    None,
                );
            }
        };
        let output = container
            .run_command("syft -q -o json . || true", self.scanner_timeout)
            .await;
        let document = output
            .ok()
            .filter(|r| !r.stdout.trim().is_empty())
            .map(|r| r.stdout);
        (
            SbomResult {
                status: if document.is_some() {
                    ScanStatus::Generated
                } else {
                    ScanStatus::Error
                },
                version,
                duration_seconds: started.elapsed().as_secs_f64(),
                path: None,
                sha256: None,
                size_bytes: None,
                format: "syft-json".to_string(),
                error_message: None,
            },
            document,
        )
    }
}

#[async_trait]
impl SandboxRunner for DockerValidator {
    async fn validate(
        &self,
        request: &ValidationRequest,
        workspace: &Path,
    ) -> Result<ValidationResult, StageError> {
        let validation_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let mut logs = String::new();
        let mut steps_completed = Vec::new();

        // The workspace arrives already patched (the AST gate ran against
        // it); the container gets it as a bind mount.
        let container = self
            .sandbox
            .start_with_workspace(&request.fix_id, workspace)
            .await
            .map_err(|e| StageError::Sandbox {
                message: format!("container start failed: {}", e),
            })?;

        let steps = request.validation_steps.clone().unwrap_or_default();
        let step_timeout = Duration::from_secs(self.sandbox.settings().timeout_seconds);
        let mut status = ValidationStatus::Passed;
        let mut error_message = None;

        for step in &steps {
            let timeout = step
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(step_timeout);
            let result = match container.run_command(&step.command, timeout).await {
                Ok(r) => r,
                Err(e) => {
                    status = ValidationStatus::Error;
                    error_message = Some(format!("step '{}' failed to execute: {}", step.name, e));
                    break;
                }
            };
            logs.push_str(&format!("$ {}\n", step.command));
            logs.push_str(&result.stdout);
            logs.push_str(&result.stderr);
            if result.timed_out {
                status = ValidationStatus::Timeout;
                error_message = Some(format!("step '{}' timed out", step.name));
                break;
            }
            if result.exit_code != 0 {
                status = ValidationStatus::Failed;
                error_message = Some(format!(
                    "step '{}' exited with code {}",
                    step.name, result.exit_code
                ));
                break;
            }
            steps_completed.push(step.name.clone());
        }

        let (scans, sbom_document) = self.run_scans(&container).await;
        let _ = container.stop().await;

        if status == ValidationStatus::Passed && scans.any_failed() {
            status = ValidationStatus::Failed;
            error_message = Some("supply-chain scan gate failed".to_string());
        }

        let counts = parse_test_counts(&logs);
        let (truncated_logs, _) = crate::context::parser::truncate_log(&logs, LOG_CEILING_BYTES);

        Ok(ValidationResult {
            fix_id: request.fix_id.clone(),
            event_id: request.event_id.clone(),
            validation_id,
            status,
            tests_passed: counts.passed,
            tests_failed: counts.failed,
            tests_skipped: counts.skipped,
            tests_total: counts.total,
            execution_time_seconds: started.elapsed().as_secs_f64(),
            steps_completed,
            logs: truncated_logs,
            error_message,
            framework_detected: detect_framework(&steps, &logs),
            docker_image: Some(self.sandbox.settings().image.clone()),
            scans: Some(scans),
            created_at: started_at,
            completed_at: Some(Utc::now()),
            sbom_document,
        })
    }
}

static PYTEST_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (passed|failed|skipped)").unwrap());

static JEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tests:\s+(?:(\d+) failed, )?(?:(\d+) skipped, )?(\d+) passed, (\d+) total")
        .unwrap()
});

/// Pull test counts out of step output. Understands pytest and jest
/// summary lines; anything else reports zeros.
pub fn parse_test_counts(logs: &str) -> TestCounts {
    if let Some(cap) = JEST_SUMMARY.captures(logs) {
        let failed = cap.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let skipped = cap.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let passed = cap.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let total = cap.get(4).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        return TestCounts {
            passed,
            failed,
            skipped,
            total,
        };
    }

    let mut counts = TestCounts::default();
    for cap in PYTEST_SUMMARY.captures_iter(logs) {
        let n: u32 = cap[1].parse().unwrap_or(0);
        match &cap[2] {
            "passed" => counts.passed = n,
            "failed" => counts.failed = n,
            "skipped" => counts.skipped = n,
            _ => {}
        }
    }
    counts.total = counts.passed + counts.failed + counts.skipped;
    counts
}

fn detect_framework(steps: &[ValidationStep], logs: &str) -> String {
    let commands: String = steps.iter().map(|s| s.command.as_str()).collect::<Vec<_>>().join(" ");
    if commands.contains("pytest") || logs.contains("pytest") {
        "pytest".to_string()
    } else if commands.contains("npm test") || logs.contains("Tests:") {
        "jest".to_string()
    } else if commands.contains("go test") {
        "go_test".to_string()
    } else if commands.contains("mvn") {
        "maven".to_string()
    } else if commands.contains("gradle") {
        "gradle".to_string()
    } else if commands.contains("cargo") {
        "cargo".to_string()
    } else {
        "unknown".to_string()
    }
}
