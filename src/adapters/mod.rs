//! Language adapters.
//!
//! Each adapter is a deterministic rules table over log text and repo
//! files: it detects whether the failure belongs to its ecosystem,
//! classifies it into a category, and proposes the validation steps the
//! sandbox should run. Selection picks the strictly highest confidence;
//! ties go to registration order.

pub mod docker;
pub mod golang;
pub mod java;
pub mod node;
pub mod python;

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::intel::schemas::FixPlan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub repo_language: String,
    pub category: String,
    pub evidence_lines: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationStep {
    pub name: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

impl ValidationStep {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            timeout_seconds: None,
            workdir: None,
        }
    }
}

pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, log_text: &str, repo_files: &[String]) -> Option<DetectionResult>;

    fn build_validation_steps(&self, repo_root: &Path) -> Vec<ValidationStep>;

    fn allowed_fix_types(&self) -> HashSet<&'static str>;

    fn allowed_categories(&self) -> HashSet<&'static str>;

    /// Adapter-specific deterministic patch for a plan, when one exists.
    fn deterministic_patch(&self, _plan: &FixPlan, _repo_root: &Path) -> Option<String> {
        None
    }
}

pub struct SelectedAdapter<'a> {
    pub adapter: &'a dyn Adapter,
    pub detection: DetectionResult,
}

pub struct AdapterRegistry {
    adapters: Vec<Box<dyn Adapter>>,
}

impl AdapterRegistry {
    /// Registry with the built-in adapters in canonical order.
    pub fn with_builtins() -> Self {
        Self {
            adapters: vec![
                Box::new(python::PythonAdapter),
                Box::new(node::NodeAdapter),
                Box::new(java::JavaAdapter),
                Box::new(golang::GoAdapter),
                Box::new(docker::DockerAdapter),
            ],
        }
    }

    pub fn new(adapters: Vec<Box<dyn Adapter>>) -> Self {
        Self { adapters }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Adapter> {
        self.adapters
            .iter()
            .find(|a| a.name() == name)
            .map(|a| a.as_ref())
    }

    /// Run every adapter's `detect`; the strictly greatest confidence
    /// wins, ties broken by registration order.
    pub fn select(&self, log_text: &str, repo_files: &[String]) -> Option<SelectedAdapter<'_>> {
        let mut best: Option<SelectedAdapter<'_>> = None;
        for adapter in &self.adapters {
            let Some(detection) = adapter.detect(log_text, repo_files) else {
                continue;
            };
            let better = match &best {
                Some(current) => detection.confidence > current.detection.confidence,
                None => true,
            };
            if better {
                best = Some(SelectedAdapter {
                    adapter: adapter.as_ref(),
                    detection,
                });
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_wins_on_missing_module_log() {
        let registry = AdapterRegistry::with_builtins();
        let selected = registry
            .select(
                "ModuleNotFoundError: No module named 'requests'",
                &["pyproject.toml".to_string()],
            )
            .unwrap();
        assert_eq!(selected.adapter.name(), "python");
        assert_eq!(selected.detection.category, "python_missing_dependency");
        assert!((selected.detection.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn strictly_highest_confidence_wins() {
        let registry = AdapterRegistry::with_builtins();
        let selected = registry
            .select(
                "build step crashed",
                &["pyproject.toml".to_string(), "go.mod".to_string()],
            )
            .unwrap();
        // go floors at 0.6 with go.mod present, python at 0.55.
        assert_eq!(selected.adapter.name(), "go");
    }

    #[test]
    fn ties_break_to_registration_order() {
        // python and node both floor at 0.55 when only their manifests
        // are present; python is registered first.
        let registry = AdapterRegistry::with_builtins();
        let selected = registry
            .select(
                "no recognizable failure output",
                &["pyproject.toml".to_string(), "package.json".to_string()],
            )
            .unwrap();
        assert_eq!(selected.adapter.name(), "python");
    }

    #[test]
    fn no_adapter_matches_unrelated_log() {
        let registry = AdapterRegistry::with_builtins();
        assert!(
            registry
                .select("everything is fine", &["README.md".to_string()])
                .is_none()
        );
    }

    #[test]
    fn get_finds_adapters_by_name() {
        let registry = AdapterRegistry::with_builtins();
        for name in ["python", "node", "java", "go", "docker"] {
            assert!(registry.get(name).is_some(), "missing adapter {}", name);
        }
        assert!(registry.get("ruby").is_none());
    }
}
