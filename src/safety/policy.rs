//! Safety policy models and file loader.
//!
//! The defaults here are the shipped policy; a YAML or JSON file at
//! `SAFETY_POLICY_PATH` overrides any subset of them.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PolicySeverity {
    Info,
    Warn,
    Block,
}

impl PolicySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Warn => "warn",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyViolation {
    pub code: String,
    pub severity: PolicySeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DangerReason {
    pub code: String,
    pub weight: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchLimits {
    pub max_files: usize,
    pub max_lines_added: usize,
    pub max_lines_removed: usize,
    pub max_diff_bytes: usize,
}

impl Default for PatchLimits {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_lines_added: 200,
            max_lines_removed: 200,
            max_diff_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathPolicy {
    pub allowed: Vec<String>,
    pub forbidden: Vec<String>,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self {
            allowed: vec!["**".to_string()],
            forbidden: vec![
                ".git/**".to_string(),
                ".github/workflows/**".to_string(),
                ".github/actions/**".to_string(),
                ".env".to_string(),
                ".env.*".to_string(),
                "**/*.pem".to_string(),
                "**/*.key".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretPolicy {
    pub forbidden_patterns: Vec<String>,
}

impl Default for SecretPolicy {
    fn default() -> Self {
        Self {
            forbidden_patterns: vec![
                r#"(?i)password\s*[=:]\s*['"][^'"]+['"]"#.to_string(),
                r#"(?i)api[_-]?key\s*[=:]\s*['"][^'"]+['"]"#.to_string(),
                r#"(?i)secret\s*[=:]\s*['"][^'"]+['"]"#.to_string(),
                r#"(?i)token\s*[=:]\s*['"][^'"]+['"]"#.to_string(),
                r"(?i)aws_access_key_id\s*[=:]".to_string(),
                r"(?i)aws_secret_access_key\s*[=:]".to_string(),
                r"ghp_[a-zA-Z0-9]{36}".to_string(),
                r"sk-[a-zA-Z0-9]{48}".to_string(),
                r"-----BEGIN\s+(RSA\s+)?PRIVATE\s+KEY-----".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskyPathRule {
    pub glob: String,
    pub weight: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DangerPolicy {
    pub safe_max: u32,
    pub per_file_weight: u32,
    pub per_50_lines_changed_weight: u32,
    pub per_10kb_diff_weight: u32,
    pub risky_paths: Vec<RiskyPathRule>,
}

impl Default for DangerPolicy {
    fn default() -> Self {
        Self {
            safe_max: 20,
            per_file_weight: 5,
            per_50_lines_changed_weight: 5,
            per_10kb_diff_weight: 3,
            risky_paths: vec![
                RiskyPathRule {
                    glob: "Dockerfile".to_string(),
                    weight: 25,
                    message: "Touches Dockerfile".to_string(),
                },
                RiskyPathRule {
                    glob: "docker-compose.yml".to_string(),
                    weight: 25,
                    message: "Touches docker-compose.yml".to_string(),
                },
                RiskyPathRule {
                    glob: ".github/**".to_string(),
                    weight: 30,
                    message: "Touches GitHub configuration".to_string(),
                },
                RiskyPathRule {
                    glob: "**/infra/**".to_string(),
                    weight: 30,
                    message: "Touches infra directory".to_string(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SafetyPolicy {
    pub version: Option<u32>,
    pub paths: PathPolicy,
    pub secrets: SecretPolicy,
    pub patch_limits: PatchLimits,
    pub danger: DangerPolicy,
}

/// Load a policy from a YAML or JSON file; the extension picks the format.
pub fn load_policy_from_file(path: &Path) -> Result<SafetyPolicy> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "yaml" | "yml" => {
            serde_yaml::from_str(&raw).context("Failed to parse YAML safety policy")
        }
        "json" => serde_json::from_str(&raw).context("Failed to parse JSON safety policy"),
        other => bail!("Unsupported policy file format: .{}", other),
    }
}

/// Load from file if it exists; fall back to defaults with a warning.
pub fn load_policy_or_default(path: &Path) -> SafetyPolicy {
    match load_policy_from_file(path) {
        Ok(policy) => policy,
        Err(e) => {
            tracing::warn!(
                policy_path = %path.display(),
                error = %e,
                "Failed to load safety policy; using defaults"
            );
            SafetyPolicy::default()
        }
    }
}

/// Normalize a repo-relative path: backslashes become slashes, a leading
/// `./` is stripped.
pub fn normalize_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized
        .strip_prefix("./")
        .map(str::to_string)
        .unwrap_or(normalized)
}
