//! Node / JavaScript ecosystem adapter.

use std::collections::HashSet;
use std::path::Path;

use super::{Adapter, DetectionResult, ValidationStep};

pub struct NodeAdapter;

impl Adapter for NodeAdapter {
    fn name(&self) -> &'static str {
        "node"
    }

    fn detect(&self, log_text: &str, repo_files: &[String]) -> Option<DetectionResult> {
        let has_package_json = repo_files.iter().any(|p| p.ends_with("package.json"));
        let looks_like_node = log_text.contains("npm ERR!")
            || log_text.contains("Cannot find module")
            || log_text.contains("ERR_PNPM");
        if !(has_package_json || looks_like_node) {
            return None;
        }

        let mut evidence: Vec<String> = Vec::new();
        let mut category = "node_unknown";
        let mut confidence: f64 = if has_package_json { 0.55 } else { 0.35 };

        for line in log_text.lines() {
            let s = line.trim();
            if s.contains("npm ERR!") || s.contains("ERR_PNPM") {
                evidence.push(s.to_string());
                confidence = confidence.max(0.6);
            }
            if s.contains("Cannot find module") || s.contains("ERR_MODULE_NOT_FOUND") {
                evidence.push(s.to_string());
                category = "node_missing_dependency";
                confidence = 0.9;
                break;
            }
        }

        if category == "node_unknown" {
            for line in log_text.lines() {
                let s = line.trim();
                if s.contains("package-lock.json")
                    && (s.contains("out of date") || s.contains("npm ci"))
                {
                    evidence.push(s.to_string());
                    category = "node_lockfile_mismatch";
                    confidence = 0.75;
                    break;
                }
            }
        }

        evidence.truncate(8);
        Some(DetectionResult {
            repo_language: "node".to_string(),
            category: category.to_string(),
            evidence_lines: evidence,
            confidence,
        })
    }

    fn build_validation_steps(&self, repo_root: &Path) -> Vec<ValidationStep> {
        let mut steps = vec![
            ValidationStep::new("npm ci", "npm ci"),
            ValidationStep::new("npm test", "npm test"),
        ];
        let has_lint = std::fs::read_to_string(repo_root.join("package.json"))
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .and_then(|pkg| pkg.get("scripts")?.get("lint").cloned())
            .is_some();
        if has_lint {
            steps.push(ValidationStep::new("npm run lint", "npm run lint"));
        }
        steps
    }

    fn allowed_fix_types(&self) -> HashSet<&'static str> {
        HashSet::from(["add_dependency", "pin_dependency", "update_config"])
    }

    fn allowed_categories(&self) -> HashSet<&'static str> {
        HashSet::from(["node_missing_dependency", "node_lockfile_mismatch"])
    }
}
