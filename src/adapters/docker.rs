//! Docker build adapter.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::{Adapter, DetectionResult, ValidationStep};

static PULL_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"pull access denied|manifest for .* not found|not found: manifest").unwrap()
});

pub struct DockerAdapter;

impl Adapter for DockerAdapter {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn detect(&self, log_text: &str, repo_files: &[String]) -> Option<DetectionResult> {
        let has_dockerfile = repo_files.iter().any(|p| p.ends_with("Dockerfile"));
        let looks_like_docker =
            log_text.contains("failed to solve") || log_text.contains("docker build");
        if !(has_dockerfile || looks_like_docker) {
            return None;
        }

        let mut evidence: Vec<String> = Vec::new();
        let mut category = "docker_unknown";
        let mut confidence: f64 = if has_dockerfile { 0.65 } else { 0.35 };

        for line in log_text.lines() {
            let s = line.trim();
            if s.contains("failed to solve") || s.contains("Dockerfile") {
                evidence.push(s.to_string());
                confidence = confidence.max(0.65);
            }
            if s.contains("apt-get")
                && (s.contains("failed") || s.contains("Unable to locate package"))
            {
                evidence.push(s.to_string());
                category = "docker_apt_get_cleanup";
                confidence = 0.75;
                break;
            }
            if PULL_FAILURE.is_match(s) {
                evidence.push(s.to_string());
                category = "docker_pin_base_image";
                confidence = 0.75;
                break;
            }
        }

        evidence.truncate(8);
        Some(DetectionResult {
            repo_language: "docker".to_string(),
            category: category.to_string(),
            evidence_lines: evidence,
            confidence,
        })
    }

    fn build_validation_steps(&self, _repo_root: &Path) -> Vec<ValidationStep> {
        vec![ValidationStep::new(
            "docker build",
            "docker build -t remedy-validate .",
        )]
    }

    fn allowed_fix_types(&self) -> HashSet<&'static str> {
        HashSet::from(["update_config"])
    }

    fn allowed_categories(&self) -> HashSet<&'static str> {
        HashSet::from(["docker_pin_base_image", "docker_apt_get_cleanup"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apt_get_failure_detected() {
        let detection = DockerAdapter
            .detect(
                "E: Unable to locate package libfoo, apt-get failed",
                &["Dockerfile".to_string()],
            )
            .unwrap();
        assert_eq!(detection.category, "docker_apt_get_cleanup");
    }

    #[test]
    fn pull_access_denied_maps_to_pin_base_image() {
        let detection = DockerAdapter
            .detect(
                "failed to solve: pull access denied for internal/base",
                &["Dockerfile".to_string()],
            )
            .unwrap();
        assert_eq!(detection.category, "docker_pin_base_image");
        assert!((detection.confidence - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn dockerfile_presence_floors_confidence() {
        let detection = DockerAdapter
            .detect("nothing interesting", &["Dockerfile".to_string()])
            .unwrap();
        assert_eq!(detection.category, "docker_unknown");
        assert!((detection.confidence - 0.65).abs() < f64::EPSILON);
    }
}
