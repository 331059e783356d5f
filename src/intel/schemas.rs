//! Schemas for LLM-shaped stage outputs.
//!
//! All of these deserialize with `deny_unknown_fields`: extra keys in the
//! model output are a validation failure, which sends the stage through
//! the repair loop rather than silently accepting drift.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::safety::normalize_path;

// ── RCA ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Infrastructure,
    Dependency,
    Code,
    Configuration,
    Test,
    Flaky,
    Security,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Infrastructure => "infrastructure",
            Self::Dependency => "dependency",
            Self::Code => "code",
            Self::Configuration => "configuration",
            Self::Test => "test",
            Self::Flaky => "flaky",
            Self::Security => "security",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Classification {
    pub category: FailureCategory,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub indicators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_category: Option<FailureCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RcaHypothesis {
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AffectedFile {
    pub filename: String,
    pub relevance_score: f64,
    pub reason: String,
    #[serde(default)]
    pub is_in_stack_trace: bool,
    #[serde(default)]
    pub is_recently_changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimilarIncident {
    pub incident_id: String,
    pub similarity_score: f64,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RcaResult {
    pub classification: Classification,
    pub primary_hypothesis: RcaHypothesis,
    #[serde(default)]
    pub alternative_hypotheses: Vec<RcaHypothesis>,
    #[serde(default)]
    pub affected_files: Vec<AffectedFile>,
    #[serde(default)]
    pub similar_incidents: Vec<SimilarIncident>,
}

fn unit_range(name: &str, value: f64) -> Result<(), String> {
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

impl RcaResult {
    /// Range checks that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        unit_range("classification.confidence", self.classification.confidence)?;
        unit_range(
            "primary_hypothesis.confidence",
            self.primary_hypothesis.confidence,
        )?;
        for h in &self.alternative_hypotheses {
            unit_range("alternative_hypothesis.confidence", h.confidence)?;
        }
        for f in &self.affected_files {
            unit_range("affected_file.relevance_score", f.relevance_score)?;
        }
        Ok(())
    }
}

// ── Fix plan ─────────────────────────────────────────────────────────

pub const MAX_PLAN_OPERATIONS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FixOperationType {
    AddDependency,
    PinDependency,
    UpdateConfig,
    ModifyCode,
    RemoveUnused,
}

impl FixOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddDependency => "add_dependency",
            Self::PinDependency => "pin_dependency",
            Self::UpdateConfig => "update_config",
            Self::ModifyCode => "modify_code",
            Self::RemoveUnused => "remove_unused",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixOperation {
    #[serde(rename = "type")]
    pub op_type: FixOperationType,
    pub file: String,
    #[serde(default)]
    pub details: Value,
    pub rationale: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixPlan {
    pub root_cause: String,
    pub category: String,
    pub confidence: f64,
    pub files: Vec<String>,
    pub operations: Vec<FixOperation>,
}

impl FixPlan {
    /// Normalize and validate the plan in place:
    /// - paths normalized, files deduped and sorted
    /// - every operation file must be a member of `files`
    /// - at most `MAX_PLAN_OPERATIONS` operations, sorted by (file, type)
    pub fn normalize_and_validate(&mut self) -> Result<(), String> {
        unit_range("plan.confidence", self.confidence)?;

        let mut seen = std::collections::HashSet::new();
        let mut files = Vec::new();
        for f in &self.files {
            let normalized = normalize_path(f);
            if normalized.is_empty() || !seen.insert(normalized.clone()) {
                continue;
            }
            files.push(normalized);
        }
        files.sort();
        self.files = files;

        if self.operations.len() > MAX_PLAN_OPERATIONS {
            return Err(format!(
                "plan.operations exceeds max of {}",
                MAX_PLAN_OPERATIONS
            ));
        }
        for op in &mut self.operations {
            op.file = normalize_path(&op.file);
            op.evidence = op
                .evidence
                .iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect();
            if !self.files.contains(&op.file) {
                return Err(format!(
                    "operation file {} is not a member of plan.files",
                    op.file
                ));
            }
        }
        self.operations
            .sort_by(|a, b| a.file.cmp(&b.file).then(a.op_type.cmp(&b.op_type)));
        Ok(())
    }
}

// ── Critic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CriticIssue {
    pub code: String,
    #[serde(default = "default_issue_severity")]
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

fn default_issue_severity() -> String {
    "warn".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CriticDecision {
    pub allowed: bool,
    #[serde(default)]
    pub hallucination_risk: f64,
    #[serde(default = "default_consistency")]
    pub reasoning_consistency: f64,
    #[serde(default)]
    pub issues: Vec<CriticIssue>,
    #[serde(default)]
    pub requires_manual_review: bool,
    #[serde(default = "default_label")]
    pub recommended_label: String,
}

fn default_consistency() -> f64 {
    1.0
}

fn default_label() -> String {
    "needs-review".to_string()
}

impl CriticDecision {
    pub fn validate(&self) -> Result<(), String> {
        unit_range("critic.hallucination_risk", self.hallucination_risk)?;
        unit_range("critic.reasoning_consistency", self.reasoning_consistency)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = json!({
            "allowed": true,
            "surprise": "extra"
        });
        assert!(serde_json::from_value::<CriticDecision>(raw).is_err());
    }

    #[test]
    fn plan_normalizes_and_sorts() {
        let mut plan = FixPlan {
            root_cause: "missing dep".to_string(),
            category: "python_missing_dependency".to_string(),
            confidence: 0.9,
            files: vec![
                "./src/b.py".to_string(),
                "pyproject.toml".to_string(),
                "src\\b.py".to_string(),
            ],
            operations: vec![
                FixOperation {
                    op_type: FixOperationType::RemoveUnused,
                    file: "./src/b.py".to_string(),
                    details: json!({}),
                    rationale: "unused import".to_string(),
                    evidence: vec!["  F401  ".to_string(), "".to_string()],
                },
                FixOperation {
                    op_type: FixOperationType::AddDependency,
                    file: "pyproject.toml".to_string(),
                    details: json!({"package": "requests"}),
                    rationale: "module missing".to_string(),
                    evidence: vec![],
                },
            ],
        };
        plan.normalize_and_validate().unwrap();
        assert_eq!(plan.files, vec!["pyproject.toml", "src/b.py"]);
        // Operations sorted by file then type.
        assert_eq!(plan.operations[0].file, "pyproject.toml");
        assert_eq!(plan.operations[1].file, "src/b.py");
        assert_eq!(plan.operations[0].evidence.len(), 0);
        assert_eq!(plan.operations[1].evidence, vec!["F401"]);
    }

    #[test]
    fn plan_rejects_operation_outside_files() {
        let mut plan = FixPlan {
            root_cause: "x".to_string(),
            category: "c".to_string(),
            confidence: 0.5,
            files: vec!["a.py".to_string()],
            operations: vec![FixOperation {
                op_type: FixOperationType::ModifyCode,
                file: "other.py".to_string(),
                details: json!({}),
                rationale: "r".to_string(),
                evidence: vec![],
            }],
        };
        assert!(plan.normalize_and_validate().is_err());
    }

    #[test]
    fn plan_rejects_too_many_operations() {
        let ops: Vec<FixOperation> = (0..11)
            .map(|_| FixOperation {
                op_type: FixOperationType::ModifyCode,
                file: "a.py".to_string(),
                details: json!({}),
                rationale: "r".to_string(),
                evidence: vec![],
            })
            .collect();
        let mut plan = FixPlan {
            root_cause: "x".to_string(),
            category: "c".to_string(),
            confidence: 0.5,
            files: vec!["a.py".to_string()],
            operations: ops,
        };
        assert!(plan.normalize_and_validate().is_err());
    }

    #[test]
    fn plan_rejects_out_of_range_confidence() {
        let mut plan = FixPlan {
            root_cause: "x".to_string(),
            category: "c".to_string(),
            confidence: 1.3,
            files: vec![],
            operations: vec![],
        };
        assert!(plan.normalize_and_validate().is_err());
    }

    #[test]
    fn rca_validate_checks_ranges() {
        let rca = RcaResult {
            classification: Classification {
                category: FailureCategory::Dependency,
                confidence: 2.0,
                reasoning: "r".to_string(),
                indicators: vec![],
                secondary_category: None,
            },
            primary_hypothesis: RcaHypothesis {
                description: "d".to_string(),
                confidence: 0.8,
                evidence: vec![],
                suggested_fix: None,
            },
            alternative_hypotheses: vec![],
            affected_files: vec![],
            similar_incidents: vec![],
        };
        assert!(rca.validate().is_err());
    }

    #[test]
    fn critic_defaults_fill_in() {
        let decision: CriticDecision =
            serde_json::from_value(json!({"allowed": true})).unwrap();
        assert!((decision.reasoning_consistency - 1.0).abs() < f64::EPSILON);
        assert_eq!(decision.recommended_label, "needs-review");
        assert!(!decision.requires_manual_review);
        decision.validate().unwrap();
    }

    #[test]
    fn operation_type_round_trips() {
        let op: FixOperationType = serde_json::from_value(json!("add_dependency")).unwrap();
        assert_eq!(op, FixOperationType::AddDependency);
        assert_eq!(
            serde_json::to_value(FixOperationType::RemoveUnused).unwrap(),
            json!("remove_unused")
        );
    }
}
