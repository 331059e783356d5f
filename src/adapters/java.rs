//! Java (Maven / Gradle) ecosystem adapter.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::{Adapter, DetectionResult, ValidationStep};

static MISSING_DEP_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"dependencies\.dependency\.version.*?for\s+([A-Za-z0-9_.-]+):([A-Za-z0-9_.-]+)\s+is missing",
    )
    .unwrap()
});

static MISSING_PLUGIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Plugin\s+([A-Za-z0-9_.-]+):([A-Za-z0-9_.-]+):([A-Za-z0-9_.-]+)\s+or one of its dependencies could not be resolved",
    )
    .unwrap()
});

pub struct JavaAdapter;

impl Adapter for JavaAdapter {
    fn name(&self) -> &'static str {
        "java"
    }

    fn detect(&self, log_text: &str, repo_files: &[String]) -> Option<DetectionResult> {
        let has_maven = repo_files.iter().any(|p| p.ends_with("pom.xml"));
        let has_gradle = repo_files
            .iter()
            .any(|p| p.ends_with("build.gradle") || p.ends_with("build.gradle.kts"));
        let looks_like_java = log_text.contains("mvn")
            || log_text.contains("gradle")
            || log_text.contains("Could not resolve dependencies");
        if !(has_maven || has_gradle || looks_like_java) {
            return None;
        }

        let mut evidence: Vec<String> = Vec::new();
        let mut category = "java_unknown";
        let mut confidence: f64 = if has_maven || has_gradle { 0.6 } else { 0.35 };

        if let Some(m) = MISSING_DEP_VERSION.find(log_text) {
            evidence.push(m.as_str().to_string());
            category = "java_dependency_version_missing";
            confidence = 0.85;
        } else if let Some(m) = MISSING_PLUGIN.find(log_text) {
            evidence.push(m.as_str().to_string());
            category = "java_plugin_version_missing";
            confidence = 0.75;
        }

        for line in log_text.lines() {
            let s = line.trim();
            if (s.contains("[ERROR]") && s.contains("Could not resolve dependencies"))
                || s.contains("Could not find artifact")
            {
                evidence.push(s.to_string());
                confidence = confidence.max(0.6);
                break;
            }
        }

        evidence.truncate(8);
        Some(DetectionResult {
            repo_language: "java".to_string(),
            category: category.to_string(),
            evidence_lines: evidence,
            confidence,
        })
    }

    fn build_validation_steps(&self, repo_root: &Path) -> Vec<ValidationStep> {
        if repo_root.join("pom.xml").exists() {
            return vec![ValidationStep::new("mvn test", "mvn -q test")];
        }
        if repo_root.join("gradlew").exists() {
            return vec![ValidationStep::new("gradle test", "./gradlew test")];
        }
        vec![ValidationStep::new("gradle test", "gradle test")]
    }

    fn allowed_fix_types(&self) -> HashSet<&'static str> {
        HashSet::from(["pin_dependency", "update_config"])
    }

    fn allowed_categories(&self) -> HashSet<&'static str> {
        HashSet::from(["java_dependency_version_missing", "java_plugin_version_missing"])
    }
}
