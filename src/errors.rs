//! Typed error hierarchy for the fix pipeline.
//!
//! Three top-level enums cover the three subsystems:
//! - `IngestError` — webhook boundary rejections (signature, payload shape)
//! - `StoreError` — persistence failures, with busy/locked flagged retriable
//! - `StageError` — per-stage pipeline outcomes the orchestrator matches on

use thiserror::Error;

/// Errors raised at the webhook ingestion boundary. All of these map to a
/// 4xx response and never reach the orchestrator.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Missing {0} header")]
    MissingHeader(&'static str),

    #[error("Invalid signature format")]
    InvalidSignatureFormat,

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database is busy")]
    Busy,

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Transition rejected: run is already at {current}")]
    Conflict { current: String },

    #[error("Database error: {0}")]
    Sql(rusqlite::Error),

    #[error("Stage JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                StoreError::Busy
            }
            _ => StoreError::Sql(err),
        }
    }
}

impl StoreError {
    /// True when retrying the same call later can reasonably succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Busy)
    }
}

/// Outcome of a single pipeline stage, matched on by the orchestrator.
///
/// The variants mirror the error taxonomy the status machine needs:
/// blocked outcomes halt the run with a `*_blocked` status, transient
/// outcomes re-enqueue with backoff, everything else fails the stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Policy blocked: {reason}")]
    PolicyBlocked { reason: String },

    #[error("Consensus rejected: {state}")]
    ConsensusRejected { state: String },

    #[error("Parse failure after retries: {message}")]
    Parse { message: String, raw_output: String },

    #[error("Transient failure: {message}")]
    Transient { message: String },

    #[error("Sandbox failure: {message}")]
    Sandbox { message: String },

    #[error("State conflict: run already at {current}")]
    StateConflict { current: String },

    #[error("VCS failure: {message}")]
    Vcs { message: String },

    #[error("Stage failed: {message}")]
    Failed { message: String },
}

impl StageError {
    /// Whether the orchestrator should re-enqueue with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StageError::Transient { .. } | StageError::Sandbox { .. }
        )
    }

    pub fn transient(message: impl Into<String>) -> Self {
        StageError::Transient {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        StageError::Failed {
            message: message.into(),
        }
    }
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { current } => StageError::StateConflict { current },
            err if err.is_retriable() => StageError::Transient {
                message: err.to_string(),
            },
            err => StageError::Failed {
                message: err.to_string(),
            },
        }
    }
}

/// Fatal configuration problems detected at startup. These are the only
/// errors allowed to escape the pipeline and terminate the process.
#[derive(Debug, Error)]
pub enum FatalConfigError {
    #[error("GITHUB_WEBHOOK_SECRET must be set in production")]
    MissingWebhookSecret,

    #[error("Safety policy file not found at {0}")]
    MissingSafetyPolicy(String),

    #[error("Invalid configuration for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_busy_is_retriable() {
        assert!(StoreError::Busy.is_retriable());
        assert!(!StoreError::NotFound("run".into()).is_retriable());
    }

    #[test]
    fn stage_error_retriable_variants() {
        assert!(StageError::transient("redis connection reset").is_retriable());
        assert!(
            StageError::Sandbox {
                message: "container died".into()
            }
            .is_retriable()
        );
        assert!(
            !StageError::PolicyBlocked {
                reason: "forbidden_path".into()
            }
            .is_retriable()
        );
        assert!(!StageError::failed("bad plan").is_retriable());
    }

    #[test]
    fn busy_store_error_maps_to_transient_stage_error() {
        let stage: StageError = StoreError::Busy.into();
        assert!(stage.is_retriable());
    }

    #[test]
    fn ingest_error_messages_name_the_problem() {
        let err = IngestError::MissingHeader("X-Hub-Signature-256");
        assert!(err.to_string().contains("X-Hub-Signature-256"));
    }
}
