//! Post-patch AST gate.
//!
//! Every touched Python file must still parse after the patch is applied.
//! The check is conservative: any read or parse failure blocks the run
//! before sandbox validation spends a container on it.

use std::path::Path;

use rustpython_parser::{Mode, parse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AstIssue {
    pub file: String,
    pub phase: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AstCheckResult {
    pub passed: bool,
    pub checked_files: Vec<String>,
    pub issues: Vec<AstIssue>,
}

/// Parse every touched `.py` file under `repo_root`.
pub fn validate_python_sources(repo_root: &Path, touched_files: &[String]) -> AstCheckResult {
    let mut checked = Vec::new();
    let mut issues = Vec::new();

    let mut files: Vec<&String> = touched_files
        .iter()
        .filter(|f| f.ends_with(".py"))
        .collect();
    files.sort();
    files.dedup();

    for rel_path in files {
        checked.push(rel_path.clone());
        let abs_path = repo_root.join(rel_path);
        let content = match std::fs::read_to_string(&abs_path) {
            Ok(content) => content,
            Err(e) => {
                issues.push(AstIssue {
                    file: rel_path.clone(),
                    phase: "post_patch_read".to_string(),
                    message: format!("Failed to read file for AST validation: {}", e),
                });
                continue;
            }
        };
        if let Err(e) = parse(&content, Mode::Module, rel_path) {
            issues.push(AstIssue {
                file: rel_path.clone(),
                phase: "post_patch_parse".to_string(),
                message: format!("Python parse failed: {}", e),
            });
        }
    }

    AstCheckResult {
        passed: issues.is_empty(),
        checked_files: checked,
        issues,
    }
}
