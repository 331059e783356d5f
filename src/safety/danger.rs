//! Danger scoring for plan intents and parsed patches.
//!
//! The score is a 0–100 heuristic summing weighted contributions from
//! risky-path matches, file counts, 50-line buckets, and 10kB buckets.

use glob::Pattern;

use super::diff::ParsedDiff;
use super::policy::{DangerPolicy, DangerReason, normalize_path};

/// Intent-level description of a plan, scored before any diff exists.
#[derive(Debug, Clone, Default)]
pub struct PlanIntent {
    pub target_files: Vec<String>,
    pub category: Option<String>,
    pub operation_types: Vec<String>,
}

fn operation_weight(op_type: &str) -> u32 {
    match op_type {
        "modify_code" => 15,
        "update_config" => 8,
        "remove_unused" | "add_dependency" | "pin_dependency" => 5,
        _ => 0,
    }
}

fn risky_path_reasons(
    danger: &DangerPolicy,
    paths: impl Iterator<Item = String> + Clone,
) -> (u32, Vec<DangerReason>) {
    let mut score = 0;
    let mut reasons = Vec::new();
    for rule in &danger.risky_paths {
        let Ok(pattern) = Pattern::new(&rule.glob) else {
            continue;
        };
        if paths.clone().any(|p| pattern.matches(&p)) {
            score += rule.weight;
            reasons.push(DangerReason {
                code: "risky_path".to_string(),
                weight: rule.weight,
                message: rule.message.clone(),
            });
        }
    }
    (score, reasons)
}

/// Score a plan intent: risky paths, file count, operation types.
pub fn score_plan_intent(intent: &PlanIntent, danger: &DangerPolicy) -> (u32, Vec<DangerReason>) {
    let normalized: Vec<String> = intent
        .target_files
        .iter()
        .map(|p| normalize_path(p))
        .collect();
    let (mut score, mut reasons) = risky_path_reasons(danger, normalized.iter().cloned());

    if danger.per_file_weight > 0 && !intent.target_files.is_empty() {
        let weight = danger.per_file_weight * intent.target_files.len() as u32;
        score += weight;
        reasons.push(DangerReason {
            code: "file_count".to_string(),
            weight,
            message: "Files proposed for change".to_string(),
        });
    }

    for op_type in &intent.operation_types {
        let weight = operation_weight(op_type);
        if weight > 0 {
            score += weight;
            reasons.push(DangerReason {
                code: "operation_type".to_string(),
                weight,
                message: format!("Operation: {}", op_type),
            });
        }
    }

    (score.min(100), reasons)
}

/// Score a parsed patch: risky paths, file count, line buckets, size buckets.
pub fn score_patch(parsed: &ParsedDiff, danger: &DangerPolicy) -> (u32, Vec<DangerReason>) {
    let (mut score, mut reasons) =
        risky_path_reasons(danger, parsed.files.iter().map(|f| f.path.clone()));

    if danger.per_file_weight > 0 && parsed.total_files > 0 {
        let weight = danger.per_file_weight * parsed.total_files as u32;
        score += weight;
        reasons.push(DangerReason {
            code: "file_count".to_string(),
            weight,
            message: "Files changed".to_string(),
        });
    }

    let lines_changed = parsed.total_lines_added + parsed.total_lines_removed;
    if danger.per_50_lines_changed_weight > 0 && lines_changed > 0 {
        let buckets = lines_changed.div_ceil(50) as u32;
        let weight = danger.per_50_lines_changed_weight * buckets;
        score += weight;
        reasons.push(DangerReason {
            code: "lines_changed".to_string(),
            weight,
            message: "Lines changed".to_string(),
        });
    }

    if danger.per_10kb_diff_weight > 0 && parsed.diff_bytes > 0 {
        let buckets = parsed.diff_bytes.div_ceil(10_240) as u32;
        let weight = danger.per_10kb_diff_weight * buckets;
        score += weight;
        reasons.push(DangerReason {
            code: "diff_size".to_string(),
            weight,
            message: "Diff size".to_string(),
        });
    }

    (score.min(100), reasons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::diff::parse_unified_diff;

    #[test]
    fn plan_intent_scores_files_and_operations() {
        let danger = DangerPolicy::default();
        let intent = PlanIntent {
            target_files: vec!["pyproject.toml".to_string()],
            category: Some("python_missing_dependency".to_string()),
            operation_types: vec!["add_dependency".to_string()],
        };
        let (score, reasons) = score_plan_intent(&intent, &danger);
        // 1 file * 5 + add_dependency 5
        assert_eq!(score, 10);
        assert_eq!(reasons.len(), 2);
        assert_eq!(reasons[0].code, "file_count");
        assert_eq!(reasons[1].code, "operation_type");
    }

    #[test]
    fn risky_path_adds_rule_weight() {
        let danger = DangerPolicy::default();
        let intent = PlanIntent {
            target_files: vec!["Dockerfile".to_string()],
            category: None,
            operation_types: vec!["update_config".to_string()],
        };
        let (score, reasons) = score_plan_intent(&intent, &danger);
        // Dockerfile 25 + 1 file * 5 + update_config 8
        assert_eq!(score, 38);
        assert!(reasons.iter().any(|r| r.code == "risky_path"));
    }

    #[test]
    fn modify_code_weighs_heaviest() {
        assert_eq!(operation_weight("modify_code"), 15);
        assert_eq!(operation_weight("update_config"), 8);
        assert_eq!(operation_weight("add_dependency"), 5);
        assert_eq!(operation_weight("unknown_op"), 0);
    }

    #[test]
    fn patch_score_uses_line_and_size_buckets() {
        let danger = DangerPolicy::default();
        let mut body = String::from("+++ b/src/big.py\n@@ -0,0 +1,60 @@\n");
        for i in 0..60 {
            body.push_str(&format!("+line {}\n", i));
        }
        let parsed = parse_unified_diff(&body);
        let (score, reasons) = score_patch(&parsed, &danger);
        // 1 file * 5 + ceil(60/50)=2 buckets * 5 + 1 size bucket * 3
        assert_eq!(score, 18);
        assert!(reasons.iter().any(|r| r.code == "lines_changed"));
        assert!(reasons.iter().any(|r| r.code == "diff_size"));
    }

    #[test]
    fn score_is_clamped_to_100() {
        let danger = DangerPolicy::default();
        let intent = PlanIntent {
            target_files: (0..40).map(|i| format!("file{}.py", i)).collect(),
            category: None,
            operation_types: vec![],
        };
        let (score, _) = score_plan_intent(&intent, &danger);
        assert_eq!(score, 100);
    }

    #[test]
    fn empty_patch_scores_only_its_bytes() {
        let danger = DangerPolicy::default();
        let parsed = parse_unified_diff("");
        let (score, reasons) = score_patch(&parsed, &danger);
        assert_eq!(score, 0);
        assert!(reasons.is_empty());
    }
}
