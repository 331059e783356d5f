//! Supply-chain scanner report parsing.
//!
//! Gitleaks, Trivy, and Syft run inside the sandbox; these helpers turn
//! their JSON reports into redaction-safe summaries. File paths from
//! gitleaks findings are hashed, never stored raw.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pass,
    Fail,
    Error,
    Skipped,
    Generated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitleaksFinding {
    pub rule_id: String,
    pub file_path_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitleaksScanResult {
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub duration_seconds: f64,
    pub findings_count: usize,
    pub findings: Vec<GitleaksFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrivyPackageSummary {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrivyScanResult {
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub duration_seconds: f64,
    pub total_vulnerabilities: usize,
    pub severity_counts: HashMap<String, usize>,
    pub top_packages: Vec<TrivyPackageSummary>,
    pub threshold: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbomResult {
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract a `x.y.z` version string from tool output.
pub fn extract_version(output: &str) -> Option<String> {
    let re = regex::Regex::new(r"(\d+\.\d+\.\d+)").ok()?;
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse a gitleaks JSON report (array of findings).
pub fn parse_gitleaks_report(json_text: &str) -> Vec<GitleaksFinding> {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(json_text) else {
        return Vec::new();
    };
    let mut findings = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else { continue };
        let rule_id = obj
            .get("RuleID")
            .or_else(|| obj.get("RuleId"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let file_path = obj
            .get("File")
            .or_else(|| obj.get("FilePath"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if file_path.is_empty() {
            continue;
        }
        findings.push(GitleaksFinding {
            rule_id: rule_id.to_string(),
            file_path_hash: sha256_hex(file_path),
        });
    }
    findings
}

/// Any gitleaks finding fails the scan.
pub fn gitleaks_result(
    report_json: &str,
    version: Option<String>,
    duration_seconds: f64,
) -> GitleaksScanResult {
    let findings = parse_gitleaks_report(report_json);
    GitleaksScanResult {
        status: if findings.is_empty() {
            ScanStatus::Pass
        } else {
            ScanStatus::Fail
        },
        version,
        duration_seconds,
        findings_count: findings.len(),
        findings,
        error_message: None,
    }
}

fn severity_rank(severity: &str) -> u8 {
    match severity.to_ascii_uppercase().as_str() {
        "CRITICAL" => 4,
        "HIGH" => 3,
        "MEDIUM" => 2,
        "LOW" => 1,
        _ => 0,
    }
}

/// Parse a trivy JSON report and gate on the configured severity
/// threshold: any vulnerability at or above the threshold fails the scan.
pub fn trivy_result(
    report_json: &str,
    threshold: &str,
    version: Option<String>,
    duration_seconds: f64,
) -> TrivyScanResult {
    let mut severity_counts: HashMap<String, usize> = HashMap::new();
    let mut package_counts: HashMap<String, usize> = HashMap::new();
    let mut total = 0usize;

    if let Ok(value) = serde_json::from_str::<Value>(report_json)
        && let Some(results) = value.get("Results").and_then(|r| r.as_array())
    {
        for result in results {
            let Some(vulns) = result.get("Vulnerabilities").and_then(|v| v.as_array()) else {
                continue;
            };
            for vuln in vulns {
                total += 1;
                let severity = vuln
                    .get("Severity")
                    .and_then(|s| s.as_str())
                    .unwrap_or("UNKNOWN")
                    .to_ascii_uppercase();
                *severity_counts.entry(severity).or_insert(0) += 1;
                if let Some(pkg) = vuln.get("PkgName").and_then(|p| p.as_str()) {
                    *package_counts.entry(pkg.to_string()).or_insert(0) += 1;
                }
            }
        }
    }

    let threshold_rank = severity_rank(threshold);
    let breaching = severity_counts
        .iter()
        .filter(|(sev, _)| severity_rank(sev) >= threshold_rank)
        .map(|(_, n)| n)
        .sum::<usize>();

    let mut top_packages: Vec<TrivyPackageSummary> = package_counts
        .into_iter()
        .map(|(name, count)| TrivyPackageSummary { name, count })
        .collect();
    top_packages.sort_by(|a, b| b.count.cmp(&a.count).then(a.name.cmp(&b.name)));
    top_packages.truncate(5);

    TrivyScanResult {
        status: if breaching > 0 {
            ScanStatus::Fail
        } else {
            ScanStatus::Pass
        },
        version,
        duration_seconds,
        total_vulnerabilities: total,
        severity_counts,
        top_packages,
        threshold: threshold.to_ascii_uppercase(),
        error_message: None,
    }
}
