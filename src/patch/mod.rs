//! Patch generation.
//!
//! Deterministic text editors cover the well-known operation types on
//! dependency manifests plus unused-import removal; everything else falls
//! back to asking the LLM for a unified diff constrained to the plan's
//! files. The generator is byte-stable: identical plan + checkout always
//! produce the identical diff.

pub mod ast_gate;

use std::collections::BTreeMap;
use std::path::Path;

use similar::TextDiff;

use crate::errors::StageError;
use crate::intel::schemas::{FixOperation, FixOperationType, FixPlan};
use crate::intel::{LlmProvider, extract_json_object};
use crate::safety::parse_unified_diff;

pub use ast_gate::{AstCheckResult, AstIssue, validate_python_sources};

pub const REASON_NONDETERMINISTIC_UNSUPPORTED: &str = "nondeterministic_unsupported";
pub const REASON_DIFF_OUTSIDE_PLAN: &str = "diff_outside_plan";

pub struct PatchGenerator<'a> {
    llm: Option<&'a dyn LlmProvider>,
    llm_max_tokens: u32,
}

impl<'a> PatchGenerator<'a> {
    pub fn new(llm: Option<&'a dyn LlmProvider>, llm_max_tokens: u32) -> Self {
        Self { llm, llm_max_tokens }
    }

    /// Produce a unified diff implementing the plan against `repo_root`.
    ///
    /// Operation order follows the plan's deterministic sort; edits are
    /// applied in memory and diffed per file in path order.
    pub async fn generate(&self, plan: &FixPlan, repo_root: &Path) -> Result<String, StageError> {
        let mut deterministic: Vec<&FixOperation> = Vec::new();
        let mut fallback: Vec<&FixOperation> = Vec::new();
        for op in &plan.operations {
            if is_deterministic(op) {
                deterministic.push(op);
            } else {
                fallback.push(op);
            }
        }

        let mut edited: BTreeMap<String, (String, String)> = BTreeMap::new();
        for op in deterministic {
            let (original, current) = match edited.remove(&op.file) {
                Some(pair) => pair,
                None => {
                    let original = read_repo_file(repo_root, &op.file)?;
                    (original.clone(), original)
                }
            };
            let updated = apply_deterministic(op, &current)?;
            edited.insert(op.file.clone(), (original, updated));
        }

        let mut diff = String::new();
        for (path, (original, updated)) in &edited {
            if original != updated {
                diff.push_str(&render_file_diff(path, original, updated));
            }
        }

        if !fallback.is_empty() {
            let llm_diff = self.llm_fallback(plan, &fallback).await?;
            diff.push_str(&llm_diff);
        }

        Ok(diff)
    }

    async fn llm_fallback(
        &self,
        plan: &FixPlan,
        operations: &[&FixOperation],
    ) -> Result<String, StageError> {
        let Some(llm) = self.llm else {
            return Err(StageError::PolicyBlocked {
                reason: REASON_NONDETERMINISTIC_UNSUPPORTED.to_string(),
            });
        };
        let prompt = build_diff_prompt(plan, operations);
        let raw = llm.generate(&prompt, self.llm_max_tokens, 0.0).await?;
        let diff = extract_diff_text(&raw);
        let parsed = parse_unified_diff(&diff);
        if parsed.total_files == 0 {
            return Err(StageError::Parse {
                message: "LLM output contained no unified diff".to_string(),
                raw_output: raw,
            });
        }
        for file in &parsed.files {
            if !plan.files.contains(&file.path) {
                return Err(StageError::PolicyBlocked {
                    reason: format!("{}:{}", REASON_DIFF_OUTSIDE_PLAN, file.path),
                });
            }
        }
        Ok(diff)
    }
}

fn is_deterministic(op: &FixOperation) -> bool {
    match op.op_type {
        FixOperationType::AddDependency | FixOperationType::PinDependency => matches!(
            manifest_kind(&op.file),
            Some(
                ManifestKind::Pyproject
                    | ManifestKind::Requirements
                    | ManifestKind::PackageJson
                    | ManifestKind::GoMod
                    | ManifestKind::PomXml
            )
        ),
        FixOperationType::RemoveUnused => true,
        FixOperationType::UpdateConfig | FixOperationType::ModifyCode => false,
    }
}

enum ManifestKind {
    Pyproject,
    Requirements,
    PackageJson,
    GoMod,
    PomXml,
}

fn manifest_kind(path: &str) -> Option<ManifestKind> {
    let name = path.rsplit('/').next()?;
    match name {
        "pyproject.toml" => Some(ManifestKind::Pyproject),
        "requirements.txt" => Some(ManifestKind::Requirements),
        "package.json" => Some(ManifestKind::PackageJson),
        "go.mod" => Some(ManifestKind::GoMod),
        "pom.xml" => Some(ManifestKind::PomXml),
        _ => None,
    }
}

fn read_repo_file(repo_root: &Path, rel: &str) -> Result<String, StageError> {
    std::fs::read_to_string(repo_root.join(rel))
        .map_err(|e| StageError::failed(format!("cannot read {}: {}", rel, e)))
}

fn op_detail<'v>(op: &'v FixOperation, key: &str) -> Option<&'v str> {
    op.details.get(key).and_then(|v| v.as_str())
}

fn apply_deterministic(op: &FixOperation, content: &str) -> Result<String, StageError> {
    match op.op_type {
        FixOperationType::AddDependency | FixOperationType::PinDependency => {
            let package = op_detail(op, "package")
                .ok_or_else(|| StageError::failed("dependency operation missing 'package'"))?;
            let version = op_detail(op, "version").unwrap_or("*");
            match manifest_kind(&op.file) {
                Some(ManifestKind::Pyproject) => Ok(edit_pyproject(content, package, version)),
                Some(ManifestKind::Requirements) => {
                    Ok(edit_requirements(content, package, version))
                }
                Some(ManifestKind::PackageJson) => edit_package_json(content, package, version),
                Some(ManifestKind::GoMod) => Ok(edit_go_mod(content, package, version)),
                Some(ManifestKind::PomXml) => Ok(edit_pom_xml(content, package, version)),
                None => Err(StageError::failed(format!(
                    "no deterministic editor for {}",
                    op.file
                ))),
            }
        }
        FixOperationType::RemoveUnused => {
            let import = op_detail(op, "import")
                .ok_or_else(|| StageError::failed("remove_unused operation missing 'import'"))?;
            Ok(remove_import(content, import))
        }
        _ => Err(StageError::failed("operation is not deterministic")),
    }
}

/// Insert or update a dependency in the `[tool.poetry.dependencies]`
/// section, creating the section when absent.
fn edit_pyproject(content: &str, package: &str, version: &str) -> String {
    let dep_line = format!("{} = \"{}\"", package, version);
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    let mut in_section = false;
    let mut section_start = None;
    let mut section_end = None;
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim().to_string();
        if trimmed == "[tool.poetry.dependencies]" {
            in_section = true;
            section_start = Some(i);
            section_end = Some(i + 1);
            i += 1;
            continue;
        }
        if in_section {
            if trimmed.starts_with('[') {
                break;
            }
            let existing = trimmed.split('=').next().unwrap_or("").trim().to_string();
            if existing == package {
                lines[i] = dep_line;
                return finish_lines(lines);
            }
            if !trimmed.is_empty() {
                section_end = Some(i + 1);
            }
        }
        i += 1;
    }

    match (section_start, section_end) {
        (Some(_), Some(end)) => {
            lines.insert(end, dep_line);
        }
        _ => {
            if !lines.last().map(|l| l.is_empty()).unwrap_or(true) {
                lines.push(String::new());
            }
            lines.push("[tool.poetry.dependencies]".to_string());
            lines.push(dep_line);
        }
    }
    finish_lines(lines)
}

fn edit_requirements(content: &str, package: &str, version: &str) -> String {
    let spec = if version == "*" {
        package.to_string()
    } else {
        format!("{}=={}", package, version.trim_start_matches(['^', '~', '=']))
    };
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    for i in 0..lines.len() {
        let name = lines[i]
            .split(['=', '<', '>', '~', '!', '['])
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if name == package {
            lines[i] = spec;
            return finish_lines(lines);
        }
    }
    lines.push(spec);
    finish_lines(lines)
}

/// Parse-edit-reserialize. Key order is the sorted order serde_json
/// gives; deterministic output matters more than preserving the
/// author's ordering.
fn edit_package_json(content: &str, package: &str, version: &str) -> Result<String, StageError> {
    let mut root: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| StageError::failed(format!("package.json parse error: {}", e)))?;
    let deps = root
        .as_object_mut()
        .ok_or_else(|| StageError::failed("package.json is not an object"))?
        .entry("dependencies")
        .or_insert_with(|| serde_json::json!({}));
    let deps = deps
        .as_object_mut()
        .ok_or_else(|| StageError::failed("package.json dependencies is not an object"))?;
    deps.insert(
        package.to_string(),
        serde_json::Value::String(version.to_string()),
    );
    let mut out = serde_json::to_string_pretty(&root)
        .map_err(|e| StageError::failed(format!("package.json serialize error: {}", e)))?;
    out.push('\n');
    Ok(out)
}

fn edit_go_mod(content: &str, package: &str, version: &str) -> String {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    for i in 0..lines.len() {
        let trimmed = lines[i].trim();
        let inline = trimmed.strip_prefix("require ").unwrap_or(trimmed);
        if inline.split_whitespace().next() != Some(package) {
            continue;
        }
        let indent_len = lines[i].len() - lines[i].trim_start().len();
        let indent = lines[i][..indent_len].to_string();
        let prefix = if lines[i].trim_start().starts_with("require ") {
            "require "
        } else {
            ""
        };
        lines[i] = format!("{}{}{} {}", indent, prefix, package, version);
        return finish_lines(lines);
    }
    lines.push(format!("require {} {}", package, version));
    finish_lines(lines)
}

fn edit_pom_xml(content: &str, package: &str, version: &str) -> String {
    // package is group:artifact for Maven coordinates.
    let (group, artifact) = match package.split_once(':') {
        Some((g, a)) => (g, a),
        None => ("", package),
    };
    let artifact_tag = format!("<artifactId>{}</artifactId>", artifact);
    if let Some(artifact_pos) = content.find(&artifact_tag) {
        // Pin: replace the nearest following <version> tag.
        let rest = &content[artifact_pos..];
        if let Some(v_start) = rest.find("<version>")
            && let Some(v_end) = rest.find("</version>")
            && v_end > v_start
        {
            let abs_start = artifact_pos + v_start + "<version>".len();
            let abs_end = artifact_pos + v_end;
            let mut out = String::with_capacity(content.len());
            out.push_str(&content[..abs_start]);
            out.push_str(version);
            out.push_str(&content[abs_end..]);
            return out;
        }
    }
    // Add: insert a dependency block before </dependencies>.
    let block = format!(
        "        <dependency>\n            <groupId>{}</groupId>\n            <artifactId>{}</artifactId>\n            <version>{}</version>\n        </dependency>\n",
        group, artifact, version
    );
    match content.find("</dependencies>") {
        Some(pos) => {
            let mut out = String::with_capacity(content.len() + block.len());
            out.push_str(&content[..pos]);
            out.push_str(&block);
            out.push_str(&content[pos..]);
            out
        }
        None => format!(
            "{}\n    <dependencies>\n{}    </dependencies>\n",
            content.trim_end(),
            block
        ),
    }
}

/// Remove `import X` / `from X import …` lines for the named module,
/// leaving every other line untouched.
fn remove_import(content: &str, import: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        let is_plain = trimmed == format!("import {}", import)
            || trimmed.starts_with(&format!("import {} as ", import));
        let is_from = trimmed.starts_with(&format!("from {} import", import));
        if is_plain || is_from {
            continue;
        }
        out.push(line);
    }
    finish_lines(out.into_iter().map(str::to_string).collect())
}

fn finish_lines(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn render_file_diff(path: &str, original: &str, updated: &str) -> String {
    let text_diff = TextDiff::from_lines(original, updated);
    let unified = text_diff
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", path), &format!("b/{}", path))
        .to_string();
    format!("diff --git a/{} b/{}\n{}", path, path, unified)
}

fn extract_diff_text(raw: &str) -> String {
    let mut text = raw.trim();
    if text.starts_with("```") {
        text = text.trim_matches('`').trim();
        text = text.strip_prefix("diff").map(str::trim_start).unwrap_or(text);
    }
    for marker in ["diff --git ", "--- ", "+++ "] {
        if let Some(pos) = text.find(marker) {
            return text[pos..].trim_end().to_string() + "\n";
        }
    }
    // Fall back to a JSON envelope {"diff": "..."} some models produce.
    let json_text = extract_json_object(text);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json_text)
        && let Some(diff) = value.get("diff").and_then(|d| d.as_str())
    {
        return diff.trim_end().to_string() + "\n";
    }
    text.to_string()
}

fn build_diff_prompt(plan: &FixPlan, operations: &[&FixOperation]) -> String {
    let mut prompt = String::from(
        "Produce a unified diff (git format) implementing the operations below. Only \
         touch the listed files. Output the diff and nothing else.\n\n",
    );
    prompt.push_str(&format!("Files: {}\n\nOperations:\n", plan.files.join(", ")));
    for op in operations {
        prompt.push_str(&format!(
            "- {} on {}: {}\n",
            op.op_type.as_str(),
            op.file,
            op.rationale
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::MockLlm;
    use serde_json::json;

    fn dep_op(file: &str, op_type: FixOperationType, package: &str, version: &str) -> FixOperation {
        FixOperation {
            op_type,
            file: file.to_string(),
            details: json!({"package": package, "version": version}),
            rationale: "missing dependency".to_string(),
            evidence: vec![],
        }
    }

    fn plan_with(files: Vec<&str>, operations: Vec<FixOperation>) -> FixPlan {
        FixPlan {
            root_cause: "rc".to_string(),
            category: "python_missing_dependency".to_string(),
            confidence: 0.9,
            files: files.into_iter().map(str::to_string).collect(),
            operations,
        }
    }

    #[test]
    fn pyproject_insert_into_existing_section() {
        let content = "[tool.poetry]\nname = \"app\"\n\n[tool.poetry.dependencies]\npython = \"^3.11\"\n\n[tool.poetry.dev-dependencies]\npytest = \"^8\"\n";
        let updated = edit_pyproject(content, "requests", "^2.31.0");
        assert!(updated.contains("python = \"^3.11\"\nrequests = \"^2.31.0\""));
        // Dev section untouched.
        assert!(updated.contains("pytest = \"^8\""));
    }

    #[test]
    fn pyproject_pin_replaces_existing_entry() {
        let content = "[tool.poetry.dependencies]\nrequests = \"^2.0\"\n";
        let updated = edit_pyproject(content, "requests", "^2.31.0");
        assert!(updated.contains("requests = \"^2.31.0\""));
        assert!(!updated.contains("\"^2.0\""));
    }

    #[test]
    fn pyproject_creates_section_when_missing() {
        let updated = edit_pyproject("[tool.poetry]\nname = \"app\"\n", "requests", "*");
        assert!(updated.contains("[tool.poetry.dependencies]\nrequests = \"*\""));
    }

    #[test]
    fn requirements_append_and_replace() {
        let updated = edit_requirements("flask==2.0\n", "requests", "^2.31.0");
        assert!(updated.contains("requests==2.31.0"));
        let repinned = edit_requirements(&updated, "requests", "2.32.0");
        assert!(repinned.contains("requests==2.32.0"));
        assert!(!repinned.contains("2.31.0"));
    }

    #[test]
    fn package_json_adds_dependency() {
        let updated =
            edit_package_json(r#"{"name": "app", "dependencies": {"left-pad": "1.0.0"}}"#, "express", "^4.18.0")
                .unwrap();
        let value: serde_json::Value = serde_json::from_str(&updated).unwrap();
        assert_eq!(value["dependencies"]["express"], "^4.18.0");
        assert_eq!(value["dependencies"]["left-pad"], "1.0.0");
        assert!(updated.ends_with('\n'));
    }

    #[test]
    fn go_mod_pin_and_add() {
        let content = "module example.com/app\n\ngo 1.22\n\nrequire github.com/pkg/errors v0.8.0\n";
        let pinned = edit_go_mod(content, "github.com/pkg/errors", "v0.9.1");
        assert!(pinned.contains("require github.com/pkg/errors v0.9.1"));
        let added = edit_go_mod(content, "github.com/gorilla/mux", "v1.8.1");
        assert!(added.contains("require github.com/gorilla/mux v1.8.1"));
    }

    #[test]
    fn pom_xml_pins_existing_artifact_version() {
        let content = "<project><dependencies><dependency><groupId>com.google.guava</groupId><artifactId>guava</artifactId><version>30.0-jre</version></dependency></dependencies></project>";
        let updated = edit_pom_xml(content, "com.google.guava:guava", "32.1.3-jre");
        assert!(updated.contains("<version>32.1.3-jre</version>"));
        assert!(!updated.contains("30.0-jre"));
    }

    #[test]
    fn pom_xml_adds_missing_dependency_block() {
        let content = "<project>\n    <dependencies>\n    </dependencies>\n</project>\n";
        let updated = edit_pom_xml(content, "org.slf4j:slf4j-api", "2.0.9");
        assert!(updated.contains("<artifactId>slf4j-api</artifactId>"));
        assert!(updated.contains("<version>2.0.9</version>"));
    }

    #[test]
    fn remove_import_strips_only_the_named_module() {
        let content = "import os\nimport sys\nfrom os import path\nprint(sys.argv)\n";
        let updated = remove_import(content, "os");
        assert!(!updated.contains("import os"));
        assert!(!updated.contains("from os import"));
        assert!(updated.contains("import sys"));
    }

    #[tokio::test]
    async fn generator_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            "[tool.poetry.dependencies]\npython = \"^3.11\"\n",
        )
        .unwrap();
        let plan = plan_with(
            vec!["pyproject.toml"],
            vec![dep_op(
                "pyproject.toml",
                FixOperationType::AddDependency,
                "requests",
                "^2.31.0",
            )],
        );
        let generator = PatchGenerator::new(None, 1200);
        let d1 = generator.generate(&plan, dir.path()).await.unwrap();
        let d2 = generator.generate(&plan, dir.path()).await.unwrap();
        assert_eq!(d1, d2);
        assert!(d1.contains("+requests = \"^2.31.0\""));
        assert!(d1.contains("diff --git a/pyproject.toml b/pyproject.toml"));
    }

    #[tokio::test]
    async fn generated_diff_parses_back_to_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("requirements.txt"),
            "flask==2.0\n",
        )
        .unwrap();
        let plan = plan_with(
            vec!["requirements.txt"],
            vec![dep_op(
                "requirements.txt",
                FixOperationType::AddDependency,
                "requests",
                "2.31.0",
            )],
        );
        let generator = PatchGenerator::new(None, 1200);
        let diff = generator.generate(&plan, dir.path()).await.unwrap();
        let parsed = parse_unified_diff(&diff);
        assert_eq!(parsed.total_files, 1);
        assert_eq!(parsed.files[0].path, "requirements.txt");
        assert_eq!(parsed.files[0].lines_added, 1);
    }

    #[tokio::test]
    async fn modify_code_without_llm_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_with(
            vec!["src/app.py"],
            vec![FixOperation {
                op_type: FixOperationType::ModifyCode,
                file: "src/app.py".to_string(),
                details: json!({}),
                rationale: "rework handler".to_string(),
                evidence: vec![],
            }],
        );
        let generator = PatchGenerator::new(None, 1200);
        let err = generator.generate(&plan, dir.path()).await.unwrap_err();
        match err {
            StageError::PolicyBlocked { reason } => {
                assert_eq!(reason, REASON_NONDETERMINISTIC_UNSUPPORTED)
            }
            other => panic!("expected PolicyBlocked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn llm_diff_outside_plan_files_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rogue = "\
diff --git a/.github/workflows/ci.yml b/.github/workflows/ci.yml
--- a/.github/workflows/ci.yml
+++ b/.github/workflows/ci.yml
@@ -1 +1 @@
-old
+new
";
        let provider = MockLlm::new(vec![rogue.to_string()]);
        let plan = plan_with(
            vec!["src/app.py"],
            vec![FixOperation {
                op_type: FixOperationType::ModifyCode,
                file: "src/app.py".to_string(),
                details: json!({}),
                rationale: "rework".to_string(),
                evidence: vec![],
            }],
        );
        let generator = PatchGenerator::new(Some(&provider), 1200);
        let err = generator.generate(&plan, dir.path()).await.unwrap_err();
        match err {
            StageError::PolicyBlocked { reason } => {
                assert!(reason.starts_with(REASON_DIFF_OUTSIDE_PLAN))
            }
            other => panic!("expected PolicyBlocked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn llm_diff_inside_plan_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let good = "\
diff --git a/src/app.py b/src/app.py
--- a/src/app.py
+++ b/src/app.py
@@ -1 +1 @@
-x = 1
+x = 2
";
        let provider = MockLlm::new(vec![good.to_string()]);
        let plan = plan_with(
            vec!["src/app.py"],
            vec![FixOperation {
                op_type: FixOperationType::ModifyCode,
                file: "src/app.py".to_string(),
                details: json!({}),
                rationale: "bump".to_string(),
                evidence: vec![],
            }],
        );
        let generator = PatchGenerator::new(Some(&provider), 1200);
        let diff = generator.generate(&plan, dir.path()).await.unwrap();
        assert!(diff.contains("+x = 2"));
    }
}
