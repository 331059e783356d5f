//! Provider payload normalization.
//!
//! Converts each CI provider's webhook payload into the canonical
//! `NormalizedPipelineEvent`. A payload that does not describe a failed
//! run normalizes to `None` (ignored at the boundary). The idempotency
//! key is `{provider}:{repo}:{run_id}:{job_id}:{attempt}`.

use chrono::Utc;
use serde_json::Value;

use crate::errors::IngestError;
use crate::events::{CiProvider, FailureType, NormalizedPipelineEvent};

/// A CI conclusion relevant to the post-merge monitor, extracted from
/// any payload regardless of success or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiOutcome {
    pub repo: String,
    pub branch: String,
    pub conclusion: String,
}

fn strip_ref(branch: &str) -> String {
    branch
        .strip_prefix("refs/heads/")
        .unwrap_or(branch)
        .to_string()
}

fn str_field<'v>(value: &'v Value, pointer: &str) -> Option<&'v str> {
    value.pointer(pointer).and_then(|v| v.as_str())
}

fn failure_type_for(stage: &str, conclusion: &str) -> FailureType {
    if conclusion == "timed_out" {
        return FailureType::Timeout;
    }
    let stage = stage.to_ascii_lowercase();
    if stage.contains("test") {
        FailureType::Test
    } else if stage.contains("deploy") {
        FailureType::Deploy
    } else if stage.contains("build") || stage.contains("compile") {
        FailureType::Build
    } else {
        FailureType::Unknown
    }
}

/// Normalize a provider payload into a pipeline event.
///
/// Returns `Ok(None)` when the payload is well-formed but not a failure
/// (the webhook responds `ignored`).
pub fn normalize(
    provider: CiProvider,
    payload: &Value,
    correlation_id: Option<&str>,
) -> Result<Option<NormalizedPipelineEvent>, IngestError> {
    match provider {
        CiProvider::GithubActions => normalize_github(payload, correlation_id),
        CiProvider::GitlabCi => normalize_gitlab(payload, correlation_id),
        CiProvider::Jenkins => normalize_jenkins(payload, correlation_id),
        CiProvider::Circleci => normalize_circleci(payload, correlation_id),
        CiProvider::AzureDevops => normalize_azure(payload, correlation_id),
    }
}

/// Extract the run conclusion for post-merge correlation, successes
/// included. Only providers that report a conclusion participate.
pub fn extract_ci_outcome(provider: CiProvider, payload: &Value) -> Option<CiOutcome> {
    match provider {
        CiProvider::GithubActions => {
            let conclusion = str_field(payload, "/workflow_run/conclusion")?;
            Some(CiOutcome {
                repo: str_field(payload, "/repository/full_name")?.to_string(),
                branch: strip_ref(str_field(payload, "/workflow_run/head_branch")?),
                conclusion: conclusion.to_ascii_lowercase(),
            })
        }
        CiProvider::GitlabCi => {
            let status = str_field(payload, "/object_attributes/status")?;
            let conclusion = match status {
                "success" => "success",
                "failed" => "failure",
                "canceled" | "cancelled" => "cancelled",
                other => other,
            };
            Some(CiOutcome {
                repo: str_field(payload, "/project/path_with_namespace")?.to_string(),
                branch: strip_ref(str_field(payload, "/object_attributes/ref")?),
                conclusion: conclusion.to_string(),
            })
        }
        _ => None,
    }
}

fn make_event(
    provider: CiProvider,
    repo: &str,
    run_id: &str,
    job_id: &str,
    attempt: u64,
    pipeline_id: &str,
    commit_sha: &str,
    branch: &str,
    stage: &str,
    failure_type: FailureType,
    error_message: Option<String>,
    payload: &Value,
    correlation_id: Option<&str>,
) -> NormalizedPipelineEvent {
    NormalizedPipelineEvent {
        idempotency_key: format!(
            "{}:{}:{}:{}:{}",
            provider.as_str(),
            repo,
            run_id,
            job_id,
            attempt
        ),
        ci_provider: provider,
        pipeline_id: pipeline_id.to_string(),
        repo: repo.to_string(),
        commit_sha: commit_sha.to_string(),
        branch: strip_ref(branch),
        stage: stage.to_string(),
        failure_type,
        error_message,
        event_timestamp: Utc::now(),
        raw_payload: payload.clone(),
        correlation_id: correlation_id.map(str::to_string),
    }
}

fn normalize_github(
    payload: &Value,
    correlation_id: Option<&str>,
) -> Result<Option<NormalizedPipelineEvent>, IngestError> {
    let run = payload
        .get("workflow_run")
        .ok_or_else(|| IngestError::MalformedPayload("missing workflow_run".to_string()))?;
    let conclusion = run
        .get("conclusion")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if !matches!(conclusion, "failure" | "timed_out") {
        return Ok(None);
    }
    let repo = str_field(payload, "/repository/full_name")
        .ok_or_else(|| IngestError::MalformedPayload("missing repository".to_string()))?;
    let run_id = run
        .get("id")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| IngestError::MalformedPayload("missing workflow_run.id".to_string()))?;
    let name = run.get("name").and_then(|v| v.as_str()).unwrap_or("build");
    let attempt = run.get("run_attempt").and_then(|v| v.as_u64()).unwrap_or(1);
    let sha = run.get("head_sha").and_then(|v| v.as_str()).unwrap_or("");
    let branch = run
        .get("head_branch")
        .and_then(|v| v.as_str())
        .unwrap_or("main");

    Ok(Some(make_event(
        CiProvider::GithubActions,
        repo,
        &run_id.to_string(),
        "0",
        attempt,
        &run_id.to_string(),
        sha,
        branch,
        name,
        failure_type_for(name, conclusion),
        Some(format!("workflow '{}' concluded {}", name, conclusion)),
        payload,
        correlation_id,
    )))
}

fn normalize_gitlab(
    payload: &Value,
    correlation_id: Option<&str>,
) -> Result<Option<NormalizedPipelineEvent>, IngestError> {
    let attrs = payload
        .get("object_attributes")
        .ok_or_else(|| IngestError::MalformedPayload("missing object_attributes".to_string()))?;
    if attrs.get("status").and_then(|v| v.as_str()) != Some("failed") {
        return Ok(None);
    }
    let repo = str_field(payload, "/project/path_with_namespace")
        .ok_or_else(|| IngestError::MalformedPayload("missing project".to_string()))?;
    let pipeline_id = attrs
        .get("id")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| IngestError::MalformedPayload("missing pipeline id".to_string()))?;
    let sha = attrs.get("sha").and_then(|v| v.as_str()).unwrap_or("");
    let branch = attrs.get("ref").and_then(|v| v.as_str()).unwrap_or("main");

    // First failed build names the stage and job.
    let failed_build = payload
        .get("builds")
        .and_then(|b| b.as_array())
        .and_then(|builds| {
            builds
                .iter()
                .find(|b| b.get("status").and_then(|s| s.as_str()) == Some("failed"))
        });
    let stage = failed_build
        .and_then(|b| b.get("stage"))
        .and_then(|v| v.as_str())
        .unwrap_or("pipeline");
    let job_id = failed_build
        .and_then(|b| b.get("id"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    Ok(Some(make_event(
        CiProvider::GitlabCi,
        repo,
        &pipeline_id.to_string(),
        &job_id.to_string(),
        1,
        &pipeline_id.to_string(),
        sha,
        branch,
        stage,
        failure_type_for(stage, "failure"),
        Some(format!("pipeline stage '{}' failed", stage)),
        payload,
        correlation_id,
    )))
}

fn normalize_jenkins(
    payload: &Value,
    correlation_id: Option<&str>,
) -> Result<Option<NormalizedPipelineEvent>, IngestError> {
    let build = payload
        .get("build")
        .ok_or_else(|| IngestError::MalformedPayload("missing build".to_string()))?;
    let status = build.get("status").and_then(|v| v.as_str()).unwrap_or("");
    if status != "FAILURE" && status != "ABORTED" {
        return Ok(None);
    }
    let job_name = payload
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| IngestError::MalformedPayload("missing job name".to_string()))?;
    let number = build.get("number").and_then(|v| v.as_u64()).unwrap_or(0);
    let sha = str_field(build, "/scm/commit").unwrap_or("");
    let branch = str_field(build, "/scm/branch").unwrap_or("main");
    let repo = str_field(build, "/scm/url")
        .map(|url| {
            url.trim_end_matches(".git")
                .rsplit('/')
                .take(2)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_else(|| job_name.to_string());

    Ok(Some(make_event(
        CiProvider::Jenkins,
        &repo,
        &number.to_string(),
        job_name,
        1,
        &number.to_string(),
        sha,
        branch,
        job_name,
        failure_type_for(job_name, "failure"),
        Some(format!("jenkins build #{} {}", number, status)),
        payload,
        correlation_id,
    )))
}

fn normalize_circleci(
    payload: &Value,
    correlation_id: Option<&str>,
) -> Result<Option<NormalizedPipelineEvent>, IngestError> {
    let job = payload
        .get("job")
        .ok_or_else(|| IngestError::MalformedPayload("missing job".to_string()))?;
    if job.get("status").and_then(|v| v.as_str()) != Some("failed") {
        return Ok(None);
    }
    let slug = str_field(payload, "/project/slug")
        .ok_or_else(|| IngestError::MalformedPayload("missing project slug".to_string()))?;
    // Slug form: "gh/org/repo".
    let repo = slug.splitn(2, '/').nth(1).unwrap_or(slug).to_string();
    let workflow_id = str_field(payload, "/workflow/id").unwrap_or("0");
    let job_name = job.get("name").and_then(|v| v.as_str()).unwrap_or("job");
    let job_number = job.get("number").and_then(|v| v.as_u64()).unwrap_or(0);
    let sha = str_field(payload, "/pipeline/vcs/revision").unwrap_or("");
    let branch = str_field(payload, "/pipeline/vcs/branch").unwrap_or("main");

    Ok(Some(make_event(
        CiProvider::Circleci,
        &repo,
        workflow_id,
        &job_number.to_string(),
        1,
        workflow_id,
        sha,
        branch,
        job_name,
        failure_type_for(job_name, "failure"),
        Some(format!("circleci job '{}' failed", job_name)),
        payload,
        correlation_id,
    )))
}

fn normalize_azure(
    payload: &Value,
    correlation_id: Option<&str>,
) -> Result<Option<NormalizedPipelineEvent>, IngestError> {
    let resource = payload
        .get("resource")
        .ok_or_else(|| IngestError::MalformedPayload("missing resource".to_string()))?;
    let result = resource.get("result").and_then(|v| v.as_str()).unwrap_or("");
    if result != "failed" && result != "partiallySucceeded" {
        return Ok(None);
    }
    let build_id = resource.get("id").and_then(|v| v.as_u64()).unwrap_or(0);
    let definition = str_field(resource, "/definition/name").unwrap_or("build");
    let repo = str_field(resource, "/repository/name")
        .or_else(|| str_field(payload, "/resourceContainers/project/id"))
        .ok_or_else(|| IngestError::MalformedPayload("missing repository".to_string()))?;
    let sha = resource
        .get("sourceVersion")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let branch = resource
        .get("sourceBranch")
        .and_then(|v| v.as_str())
        .unwrap_or("main");

    Ok(Some(make_event(
        CiProvider::AzureDevops,
        repo,
        &build_id.to_string(),
        "0",
        1,
        &build_id.to_string(),
        sha,
        branch,
        definition,
        failure_type_for(definition, "failure"),
        Some(format!("azure build '{}' {}", definition, result)),
        payload,
        correlation_id,
    )))
}
