//! Provenance artifacts, SBOM storage, and evidence extraction.
//!
//! The provenance artifact is the run's immutable, redacted evidence
//! record: identity, stage summaries, an ordered timeline, evidence
//! lines, and the SBOM reference. Everything passes through the redactor
//! before it leaves the persistence layer.

pub mod redact;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use flate2::Compression;
use flate2::write::GzEncoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::errors::StageError;
use crate::store::{FixRunRow, StageField};

pub use redact::{REDACTED, Redactor};

// ── Timeline ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineStep {
    pub step: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Stage order for the timeline; a step appears once its blob exists.
const TIMELINE_STAGES: &[(&str, StageField)] = &[
    ("context", StageField::Context),
    ("rca", StageField::Rca),
    ("plan", StageField::Plan),
    ("plan_policy", StageField::PlanPolicy),
    ("critic", StageField::Critic),
    ("consensus", StageField::Consensus),
    ("patch", StageField::PatchStats),
    ("patch_policy", StageField::PatchPolicy),
    ("validation", StageField::Validation),
    ("pr", StageField::Pr),
    ("post_merge", StageField::PostMergeMonitor),
];

pub fn build_timeline(run: &FixRunRow) -> Vec<TimelineStep> {
    TIMELINE_STAGES
        .iter()
        .map(|(name, field)| TimelineStep {
            step: name.to_string(),
            status: if run.stage_json(*field).is_some() {
                "completed".to_string()
            } else {
                "skipped".to_string()
            },
            started_at: None,
            completed_at: None,
            duration_ms: None,
        })
        .collect()
}

// ── SBOM storage ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbomRef {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub format: String,
}

/// Gzip the SBOM document under `artifacts/sbom/{run_id}.syft.json.gz`
/// and record its digest and size.
pub fn store_sbom(
    artifacts_dir: &Path,
    run_id: &str,
    sbom_json: &str,
) -> Result<SbomRef, StageError> {
    let sbom_dir = artifacts_dir.join("sbom");
    std::fs::create_dir_all(&sbom_dir)
        .map_err(|e| StageError::failed(format!("create sbom dir: {}", e)))?;
    let path: PathBuf = sbom_dir.join(format!("{}.syft.json.gz", run_id));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(sbom_json.as_bytes())
        .map_err(|e| StageError::failed(format!("gzip sbom: {}", e)))?;
    let compressed = encoder
        .finish()
        .map_err(|e| StageError::failed(format!("gzip sbom: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(&compressed);
    let sha256 = hex::encode(hasher.finalize());
    let size_bytes = compressed.len() as u64;

    std::fs::write(&path, compressed)
        .map_err(|e| StageError::failed(format!("write sbom: {}", e)))?;

    Ok(SbomRef {
        path: path.to_string_lossy().to_string(),
        sha256,
        size_bytes,
        format: "syft-json".to_string(),
    })
}

// ── Evidence extraction ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceLine {
    pub idx: usize,
    pub line: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_idx: Option<usize>,
}

static TAG_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    let table: &[(&str, &str)] = &[
        ("root-cause", r"(?i)ModuleNotFoundError: No module named"),
        ("root-cause", r#"(?i)No module named ['"][^'"]+['"]"#),
        ("root-cause", r#"(?i)Cannot find module ['"][^'"]+['"]"#),
        ("root-cause", r"(?i)missing go\.sum entry"),
        ("root-cause", r"(?i)no required module provides package"),
        ("root-cause", r"(?i)dependencies\.dependency\.version.*is missing"),
        ("root-cause", r"(?i)failed to solve:"),
        ("test-failure", r"(?i)^FAILED\b"),
        ("test-failure", r"\bFAIL\b"),
        ("npm", r"(?i)\bnpm ERR!"),
        ("go", r"(?i)^\s*go:\s"),
        ("maven", r"(?i)^\[ERROR\]"),
        ("docker", r"(?i)\bdocker build\b"),
    ];
    table
        .iter()
        .map(|(tag, pattern)| (*tag, Regex::new(pattern).expect("static regex")))
        .collect()
});

fn tag_priority(tag: &str) -> u8 {
    match tag {
        "root-cause" => 0,
        "stack-trace" => 1,
        "test-failure" => 2,
        "maven" | "go" | "npm" | "docker" => 3,
        _ => 10,
    }
}

/// Extract tagged, redacted evidence lines from a raw log. Lines are
/// ranked by tag priority then source order and deduped by line index.
pub fn extract_evidence_lines(
    log_text: &str,
    redactor: &Redactor,
    max_lines: usize,
) -> Vec<EvidenceLine> {
    let lines: Vec<&str> = log_text.lines().collect();
    let mut candidates: Vec<EvidenceLine> = Vec::new();

    for (i, raw) in lines.iter().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        for (tag, pattern) in TAG_PATTERNS.iter() {
            if pattern.is_match(raw) {
                candidates.push(EvidenceLine {
                    idx: i + 1,
                    line: redactor.redact_text(raw),
                    tag: tag.to_string(),
                    operation_idx: None,
                });
                break;
            }
        }
    }

    for (i, raw) in lines.iter().enumerate() {
        if raw.contains("Traceback (most recent call last)") {
            let end = (i + 20).min(lines.len());
            for (j, line) in lines.iter().enumerate().take(end).skip(i) {
                if !line.trim().is_empty() {
                    candidates.push(EvidenceLine {
                        idx: j + 1,
                        line: redactor.redact_text(line),
                        tag: "stack-trace".to_string(),
                        operation_idx: None,
                    });
                }
            }
            break;
        }
    }

    candidates.sort_by_key(|e| (tag_priority(&e.tag), e.idx));
    let mut seen = std::collections::HashSet::new();
    let mut ranked = Vec::new();
    for candidate in candidates {
        if !seen.insert(candidate.idx) {
            continue;
        }
        ranked.push(candidate);
        if ranked.len() >= max_lines {
            break;
        }
    }
    ranked
}

/// Link evidence lines to plan operations whose evidence tokens appear
/// in the line.
pub fn attach_operation_links(
    evidence: Vec<EvidenceLine>,
    operations: &[Value],
) -> Vec<EvidenceLine> {
    let mut by_token: Vec<(usize, Vec<String>)> = Vec::new();
    for (op_idx, op) in operations.iter().enumerate() {
        let tokens: Vec<String> = op
            .get("evidence")
            .and_then(|e| e.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if !tokens.is_empty() {
            by_token.push((op_idx, tokens));
        }
    }

    evidence
        .into_iter()
        .map(|mut line| {
            line.operation_idx = by_token
                .iter()
                .find(|(_, tokens)| tokens.iter().any(|t| line.line.contains(t.as_str())))
                .map(|(idx, _)| *idx);
            line
        })
        .collect()
}

// ── Provenance assembly ──────────────────────────────────────────────

/// Assemble the redacted provenance artifact for a run. The result is
/// immutable once persisted; the store ignores later writes.
pub fn build_provenance_artifact(
    run: &FixRunRow,
    failure_id: &str,
    repo: &str,
    redactor: &Redactor,
) -> Value {
    let sbom = run.sbom_path.as_ref().map(|path| {
        json!({
            "path": path,
            "sha256": run.sbom_sha256,
            "size_bytes": run.sbom_size_bytes,
            "format": "syft-json",
        })
    });

    let artifact = json!({
        "run_id": run.id,
        "failure_id": failure_id,
        "repo": repo,
        "status": run.status.as_str(),
        "started_at": run.created_at,
        "error_message": run.error_message,
        "blocked_reason": run.blocked_reason,
        "adapter": run.adapter_name,
        "plan": run.plan_json,
        "plan_policy": run.plan_policy_json,
        "patch_stats": run.patch_stats_json,
        "patch_policy": run.patch_policy_json,
        "validation": run.validation_json,
        "consensus": run.consensus_json,
        "pr": run.pr_json,
        "timeline": build_timeline(run),
        "sbom": sbom,
    });

    redactor.redact_value(&artifact)
}
