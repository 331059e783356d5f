//! Python ecosystem adapter.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::{Adapter, DetectionResult, ValidationStep};

static MISSING_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:ModuleNotFoundError: )?No module named ['"]([^'"]+)['"]"#).unwrap()
});

pub struct PythonAdapter;

impl Adapter for PythonAdapter {
    fn name(&self) -> &'static str {
        "python"
    }

    fn detect(&self, log_text: &str, repo_files: &[String]) -> Option<DetectionResult> {
        let has_pyproject = repo_files.iter().any(|p| p.ends_with("pyproject.toml"));
        let has_requirements = repo_files.iter().any(|p| p.ends_with("requirements.txt"));
        let looks_like_python = log_text.contains("Traceback (most recent call last)")
            || log_text.contains("ModuleNotFoundError");
        if !(has_pyproject || has_requirements || looks_like_python) {
            return None;
        }

        let mut evidence: Vec<String> = Vec::new();
        let mut category = "unknown";
        let mut confidence = if has_pyproject || has_requirements {
            0.55
        } else {
            0.35
        };

        for line in log_text.lines() {
            if MISSING_MODULE.is_match(line) {
                evidence.push(line.trim().to_string());
                category = "python_missing_dependency";
                confidence = 0.9;
                break;
            }
        }

        if category == "unknown" {
            for line in log_text.lines() {
                if line.contains("F401") && line.contains("imported but unused") {
                    evidence.push(line.trim().to_string());
                    category = "lint_format";
                    confidence = 0.7;
                    break;
                }
            }
        }

        evidence.truncate(5);
        Some(DetectionResult {
            repo_language: "python".to_string(),
            category: category.to_string(),
            evidence_lines: evidence,
            confidence,
        })
    }

    fn build_validation_steps(&self, repo_root: &Path) -> Vec<ValidationStep> {
        let mut steps = Vec::new();
        if repo_root.join("pyproject.toml").exists() {
            steps.push(ValidationStep::new("pip install", "pip install -e ."));
        } else if repo_root.join("requirements.txt").exists() {
            steps.push(ValidationStep::new(
                "pip install",
                "pip install -r requirements.txt",
            ));
        }
        steps.push(ValidationStep::new("pytest", "pytest -x -q"));
        steps
    }

    fn allowed_fix_types(&self) -> HashSet<&'static str> {
        HashSet::from(["add_dependency", "pin_dependency", "remove_unused"])
    }

    fn allowed_categories(&self) -> HashSet<&'static str> {
        HashSet::from(["python_missing_dependency", "lint_format"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_module_detected_at_high_confidence() {
        let detection = PythonAdapter
            .detect(
                "ModuleNotFoundError: No module named 'requests'",
                &["pyproject.toml".to_string()],
            )
            .unwrap();
        assert_eq!(detection.category, "python_missing_dependency");
        assert!((detection.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(detection.evidence_lines.len(), 1);
    }

    #[test]
    fn unused_import_maps_to_lint_format() {
        let detection = PythonAdapter
            .detect(
                "src/app.py:1:1: F401: 'os' imported but unused",
                &["requirements.txt".to_string()],
            )
            .unwrap();
        assert_eq!(detection.category, "lint_format");
        assert!((detection.confidence - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn manifest_presence_floors_confidence() {
        let detection = PythonAdapter
            .detect("some noise", &["pyproject.toml".to_string()])
            .unwrap();
        assert_eq!(detection.category, "unknown");
        assert!((detection.confidence - 0.55).abs() < f64::EPSILON);
    }

    #[test]
    fn no_python_signals_returns_none() {
        assert!(
            PythonAdapter
                .detect("npm ERR! broken", &["package.json".to_string()])
                .is_none()
        );
    }

    #[test]
    fn validation_steps_prefer_pyproject_install() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[project]\n").unwrap();
        let steps = PythonAdapter.build_validation_steps(dir.path());
        assert_eq!(steps[0].command, "pip install -e .");
        assert_eq!(steps[1].command, "pytest -x -q");
    }
}
