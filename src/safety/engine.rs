//! Pure policy evaluation over plan intents and unified diffs.
//!
//! `PolicyEngine` is deterministic and side-effect free: the same policy
//! and input always produce the same `PolicyDecision`. The engine holds
//! compiled globs and regexes so repeated evaluations are cheap; the
//! handle is built once per policy and rebuilt on config change.

use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::danger::{PlanIntent, score_patch, score_plan_intent};
use super::diff::{ParsedDiff, added_lines, parse_unified_diff};
use super::policy::{
    DangerReason, PolicySeverity, PolicyViolation, SafetyPolicy, normalize_path,
};

pub const LABEL_SAFE: &str = "safe";
pub const LABEL_NEEDS_REVIEW: &str = "needs-review";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub violations: Vec<PolicyViolation>,
    pub danger_score: u32,
    pub danger_reasons: Vec<DangerReason>,
    pub pr_label: String,
}

impl PolicyDecision {
    pub fn blocking_violations(&self) -> impl Iterator<Item = &PolicyViolation> {
        self.violations
            .iter()
            .filter(|v| v.severity == PolicySeverity::Block)
    }
}

pub struct PolicyEngine {
    policy: SafetyPolicy,
    allowed_globs: Vec<Pattern>,
    forbidden_globs: Vec<Pattern>,
    secret_patterns: Vec<Regex>,
}

impl PolicyEngine {
    pub fn new(policy: SafetyPolicy) -> Self {
        let compile_globs = |globs: &[String]| {
            globs
                .iter()
                .filter_map(|g| match Pattern::new(g) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        tracing::warn!(glob = %g, error = %e, "Skipping invalid policy glob");
                        None
                    }
                })
                .collect::<Vec<_>>()
        };
        let allowed_globs = compile_globs(&policy.paths.allowed);
        let forbidden_globs = compile_globs(&policy.paths.forbidden);
        let secret_patterns = policy
            .secrets
            .forbidden_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "Skipping invalid secret regex");
                    None
                }
            })
            .collect();
        Self {
            policy,
            allowed_globs,
            forbidden_globs,
            secret_patterns,
        }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    fn path_violations(&self, paths: &[String]) -> Vec<PolicyViolation> {
        let mut violations = Vec::new();
        for path in paths {
            if self.forbidden_globs.iter().any(|g| g.matches(path)) {
                violations.push(PolicyViolation {
                    code: "forbidden_path".to_string(),
                    severity: PolicySeverity::Block,
                    message: format!("Path is forbidden by policy: {}", path),
                    file_path: Some(path.clone()),
                });
                continue;
            }
            if !self.allowed_globs.iter().any(|g| g.matches(path)) {
                violations.push(PolicyViolation {
                    code: "path_not_allowed".to_string(),
                    severity: PolicySeverity::Block,
                    message: format!("Path is outside the allowed set: {}", path),
                    file_path: Some(path.clone()),
                });
            }
        }
        violations
    }

    fn decide(
        &self,
        mut violations: Vec<PolicyViolation>,
        danger_score: u32,
        danger_reasons: Vec<DangerReason>,
    ) -> PolicyDecision {
        violations.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.code.cmp(&b.code))
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        let allowed = !violations
            .iter()
            .any(|v| v.severity == PolicySeverity::Block);
        let pr_label = if allowed && danger_score <= self.policy.danger.safe_max {
            LABEL_SAFE
        } else {
            LABEL_NEEDS_REVIEW
        };
        PolicyDecision {
            allowed,
            violations,
            danger_score,
            danger_reasons,
            pr_label: pr_label.to_string(),
        }
    }

    /// Evaluate a plan before any patch exists: path policy + intent-level
    /// danger score.
    pub fn evaluate_plan(&self, intent: &PlanIntent) -> PolicyDecision {
        let paths: Vec<String> = intent
            .target_files
            .iter()
            .map(|p| normalize_path(p))
            .collect();
        let violations = self.path_violations(&paths);
        let (danger_score, danger_reasons) = score_plan_intent(intent, &self.policy.danger);
        self.decide(violations, danger_score, danger_reasons)
    }

    /// Evaluate a unified diff: path policy, secret scan over added lines,
    /// patch limits, and patch-level danger score.
    pub fn evaluate_patch(&self, diff_text: &str) -> (PolicyDecision, ParsedDiff) {
        let parsed = parse_unified_diff(diff_text);
        let paths: Vec<String> = parsed.files.iter().map(|f| f.path.clone()).collect();
        let mut violations = self.path_violations(&paths);

        for (file, line) in added_lines(diff_text) {
            if self.secret_patterns.iter().any(|re| re.is_match(&line)) {
                violations.push(PolicyViolation {
                    code: "secret_pattern".to_string(),
                    severity: PolicySeverity::Block,
                    message: "Added line matches a forbidden secret pattern".to_string(),
                    file_path: Some(file),
                });
            }
        }

        let limits = &self.policy.patch_limits;
        if parsed.total_files > limits.max_files {
            violations.push(PolicyViolation {
                code: "max_files".to_string(),
                severity: PolicySeverity::Block,
                message: format!(
                    "Patch touches {} files (limit {})",
                    parsed.total_files, limits.max_files
                ),
                file_path: None,
            });
        }
        if parsed.total_lines_added > limits.max_lines_added {
            violations.push(PolicyViolation {
                code: "max_lines_added".to_string(),
                severity: PolicySeverity::Block,
                message: format!(
                    "Patch adds {} lines (limit {})",
                    parsed.total_lines_added, limits.max_lines_added
                ),
                file_path: None,
            });
        }
        if parsed.total_lines_removed > limits.max_lines_removed {
            violations.push(PolicyViolation {
                code: "max_lines_removed".to_string(),
                severity: PolicySeverity::Block,
                message: format!(
                    "Patch removes {} lines (limit {})",
                    parsed.total_lines_removed, limits.max_lines_removed
                ),
                file_path: None,
            });
        }
        if parsed.diff_bytes > limits.max_diff_bytes {
            violations.push(PolicyViolation {
                code: "max_diff_bytes".to_string(),
                severity: PolicySeverity::Block,
                message: format!(
                    "Diff is {} bytes (limit {})",
                    parsed.diff_bytes, limits.max_diff_bytes
                ),
                file_path: None,
            });
        }

        let (danger_score, danger_reasons) = score_patch(&parsed, &self.policy.danger);
        (self.decide(violations, danger_score, danger_reasons), parsed)
    }
}
