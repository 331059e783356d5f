//! Exponential backoff and run-key derivation.

use sha2::{Digest, Sha256};

/// `min(base * 2^(attempt-1), max)` seconds; attempt 1 returns the base.
pub fn compute_backoff_seconds(attempt: u32, base: u64, max: u64) -> u64 {
    if attempt <= 1 {
        return base.min(max);
    }
    let exponent = (attempt - 1).min(32);
    base.saturating_mul(1u64 << exponent).min(max)
}

/// Stable signature over `(repo, failure)`: repo prefix for operator
/// legibility plus 16 hex chars of a sha256 over repo, branch, failure
/// type, and the first significant error lines.
pub fn derive_run_key(
    repo: &str,
    branch: &str,
    failure_type: &str,
    significant_lines: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(branch.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(failure_type.as_bytes());
    for line in significant_lines.iter().take(5) {
        hasher.update(b"\x1f");
        hasher.update(line.trim().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}:{}", repo, &digest[..16])
}
