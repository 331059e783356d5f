//! Post-merge monitor.
//!
//! After a fix PR is created (and merged on the auto-merge path), the run
//! is registered under `post_merge:{repo}:{branch}` with a TTL. The next
//! CI outcome for that `(repo, branch)` resolves the run: success means
//! `merged`, failure means `escalated` with a regression counter bump.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::errors::StageError;
use crate::events::{DashboardEvent, DashboardPublisher};
use crate::kv::KvStore;
use crate::metrics::Metrics;
use crate::store::{RunStatus, StageField, Store, TransitionUpdate};

pub struct PostMergeMonitor {
    store: Arc<Store>,
    kv: KvStore,
    metrics: Metrics,
    publisher: DashboardPublisher,
    ttl: Duration,
}

impl PostMergeMonitor {
    pub fn new(
        store: Arc<Store>,
        kv: KvStore,
        metrics: Metrics,
        publisher: DashboardPublisher,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            kv,
            metrics,
            publisher,
            ttl,
        }
    }

    fn cache_key(repo: &str, branch: &str) -> String {
        format!("post_merge:{}:{}", repo, branch)
    }

    /// Register a merged (or just-created, on the auto paths) fix PR for
    /// correlation with the next CI outcome on its branch.
    pub fn register(
        &self,
        run_id: &str,
        repo: &str,
        branch: &str,
        pr_number: Option<u64>,
    ) -> Result<(), StageError> {
        let payload = json!({
            "run_id": run_id,
            "repo": repo,
            "branch": branch,
            "pr_number": pr_number,
            "status": "monitoring",
        });
        self.kv
            .set_json(&Self::cache_key(repo, branch), payload.clone(), Some(self.ttl));
        self.store.transition(
            run_id,
            RunStatus::Monitoring,
            TransitionUpdate {
                stage: Some((StageField::PostMergeMonitor, &payload)),
                ..Default::default()
            },
        )?;
        self.publisher.publish(
            DashboardEvent::new("post_merge_monitor", "post_merge", "monitoring")
                .with_run_id(run_id)
                .with_metadata(json!({"repo": repo, "branch": branch})),
        );
        Ok(())
    }

    /// Correlate a CI conclusion with a monitored run, if any.
    ///
    /// Returns the resolved run id when a monitor entry matched.
    pub fn process_outcome(
        &self,
        repo: &str,
        branch: &str,
        conclusion: &str,
    ) -> Result<Option<String>, StageError> {
        let key = Self::cache_key(repo, branch);
        let Some(mut entry) = self.kv.get_json(&key) else {
            return Ok(None);
        };
        let Some(run_id) = entry["run_id"].as_str().map(str::to_string) else {
            return Ok(None);
        };

        let normalized = conclusion.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "success" | "neutral" => {
                entry["status"] = json!("stabilized");
                self.kv.delete(&key);
                self.store.transition(
                    &run_id,
                    RunStatus::Merged,
                    TransitionUpdate {
                        stage: Some((StageField::PostMergeMonitor, &entry)),
                        ..Default::default()
                    },
                )?;
                self.publisher.publish(
                    DashboardEvent::new("post_merge_monitor", "post_merge", "stabilized")
                        .with_run_id(&run_id)
                        .with_metadata(json!({"repo": repo, "branch": branch})),
                );
                Ok(Some(run_id))
            }
            "failure" | "timed_out" | "cancelled" => {
                entry["status"] = json!("regressed");
                entry["conclusion"] = json!(normalized);
                self.kv.delete(&key);
                self.store.transition(
                    &run_id,
                    RunStatus::Escalated,
                    TransitionUpdate {
                        stage: Some((StageField::PostMergeMonitor, &entry)),
                        blocked_reason: Some("post_merge_regression"),
                        ..Default::default()
                    },
                )?;
                self.metrics
                    .pipeline_loop_blocked_total
                    .with_label_values(&["post_merge_regression"])
                    .inc();
                self.publisher.publish(
                    DashboardEvent::new("post_merge_monitor", "post_merge", "regressed")
                        .with_run_id(&run_id)
                        .with_metadata(json!({
                            "repo": repo,
                            "branch": branch,
                            "conclusion": normalized,
                        })),
                );
                Ok(Some(run_id))
            }
            other => {
                tracing::debug!(repo, branch, conclusion = other, "Ignoring post-merge outcome");
                Ok(None)
            }
        }
    }
}
