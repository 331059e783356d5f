//! Go ecosystem adapter.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::{Adapter, DetectionResult, ValidationStep};

static MISSING_MODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"no required module provides package\s+([^\s;]+)").unwrap());

pub struct GoAdapter;

impl Adapter for GoAdapter {
    fn name(&self) -> &'static str {
        "go"
    }

    fn detect(&self, log_text: &str, repo_files: &[String]) -> Option<DetectionResult> {
        let has_go_mod = repo_files.iter().any(|p| p.ends_with("go.mod"));
        let looks_like_go = log_text.contains("go test")
            || log_text.contains("go: ")
            || log_text.contains("go.mod");
        if !(has_go_mod || looks_like_go) {
            return None;
        }

        let mut evidence: Vec<String> = Vec::new();
        let mut category = "go_unknown";
        let mut confidence: f64 = if has_go_mod { 0.6 } else { 0.35 };

        for line in log_text.lines() {
            let s = line.trim();
            if s.contains("missing go.sum entry") {
                evidence.push(s.to_string());
                category = "go_mod_tidy";
                confidence = 0.85;
                break;
            }
        }

        if category == "go_unknown"
            && let Some(m) = MISSING_MODULE.find(log_text)
        {
            evidence.push(m.as_str().to_string());
            category = "go_add_missing_module";
            confidence = 0.8;
        }

        if category == "go_unknown" {
            for line in log_text.lines() {
                let s = line.trim();
                if s.starts_with("go: ") && s.contains("module") && s.contains("found") {
                    evidence.push(s.to_string());
                    confidence = confidence.max(0.6);
                    break;
                }
            }
        }

        evidence.truncate(8);
        Some(DetectionResult {
            repo_language: "go".to_string(),
            category: category.to_string(),
            evidence_lines: evidence,
            confidence,
        })
    }

    fn build_validation_steps(&self, _repo_root: &Path) -> Vec<ValidationStep> {
        vec![
            ValidationStep::new("go mod tidy", "go mod tidy"),
            ValidationStep::new("go test", "go test ./..."),
        ]
    }

    fn allowed_fix_types(&self) -> HashSet<&'static str> {
        HashSet::from(["update_config", "pin_dependency"])
    }

    fn allowed_categories(&self) -> HashSet<&'static str> {
        HashSet::from(["go_mod_tidy", "go_add_missing_module"])
    }
}
