//! Unified diff parsing.
//!
//! Tallies per-file added/removed content lines from standard unified
//! diff text. Header lines (`+++`, `---`, `@@`) and the
//! `\ No newline at end of file` marker are excluded from the counts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::policy::normalize_path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedDiffFile {
    pub path: String,
    pub lines_added: usize,
    pub lines_removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedDiff {
    pub files: Vec<ParsedDiffFile>,
    pub total_files: usize,
    pub total_lines_added: usize,
    pub total_lines_removed: usize,
    pub diff_bytes: usize,
}

impl ParsedDiff {
    pub fn any_path_matches(&self, pattern: &glob::Pattern) -> bool {
        self.files.iter().any(|f| pattern.matches(&f.path))
    }
}

/// Parse unified diff text into per-file line tallies.
pub fn parse_unified_diff(diff_text: &str) -> ParsedDiff {
    let diff_bytes = diff_text.len();
    let mut current_file: Option<String> = None;
    let mut added: BTreeMap<String, usize> = BTreeMap::new();
    let mut removed: BTreeMap<String, usize> = BTreeMap::new();

    for raw_line in diff_text.lines() {
        let line = raw_line.trim_end_matches('\n');

        if let Some(rest) = line.strip_prefix("diff --git ") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 2 {
                let b_path = parts[1].strip_prefix("b/").unwrap_or(parts[1]);
                let path = normalize_path(b_path);
                added.entry(path.clone()).or_insert(0);
                removed.entry(path.clone()).or_insert(0);
                current_file = Some(path);
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("+++ ") {
            let path_part = rest.split_whitespace().next().unwrap_or("");
            let path_part = path_part.strip_prefix("b/").unwrap_or(path_part);
            if !path_part.is_empty() && path_part != "/dev/null" {
                let path = normalize_path(path_part);
                added.entry(path.clone()).or_insert(0);
                removed.entry(path.clone()).or_insert(0);
                current_file = Some(path);
            }
            continue;
        }

        let Some(file) = current_file.as_ref() else {
            continue;
        };

        if line.starts_with("--- ") || line.starts_with("@@") || line.starts_with('\\') {
            continue;
        }

        if line.starts_with('+') {
            *added.entry(file.clone()).or_insert(0) += 1;
        } else if line.starts_with('-') {
            *removed.entry(file.clone()).or_insert(0) += 1;
        }
    }

    let mut paths: Vec<String> = added.keys().chain(removed.keys()).cloned().collect();
    paths.sort();
    paths.dedup();

    let files: Vec<ParsedDiffFile> = paths
        .into_iter()
        .map(|path| ParsedDiffFile {
            lines_added: added.get(&path).copied().unwrap_or(0),
            lines_removed: removed.get(&path).copied().unwrap_or(0),
            path,
        })
        .collect();

    ParsedDiff {
        total_files: files.len(),
        total_lines_added: files.iter().map(|f| f.lines_added).sum(),
        total_lines_removed: files.iter().map(|f| f.lines_removed).sum(),
        diff_bytes,
        files,
    }
}

/// Added content lines of a diff, paired with the file they land in.
/// Used by the policy engine's secret scan.
pub fn added_lines(diff_text: &str) -> Vec<(String, String)> {
    let mut current_file: Option<String> = None;
    let mut out = Vec::new();

    for line in diff_text.lines() {
        if let Some(rest) = line.strip_prefix("+++ ") {
            let path_part = rest.split_whitespace().next().unwrap_or("");
            let path_part = path_part.strip_prefix("b/").unwrap_or(path_part);
            if !path_part.is_empty() && path_part != "/dev/null" {
                current_file = Some(normalize_path(path_part));
            }
            continue;
        }
        if line.starts_with("diff --git ") || line.starts_with("--- ") || line.starts_with("@@") {
            continue;
        }
        if let Some(content) = line.strip_prefix('+')
            && let Some(file) = current_file.as_ref()
        {
            out.push((file.clone(), content.to_string()));
        }
    }
    out
}
