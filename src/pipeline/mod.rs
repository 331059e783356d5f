//! Fix pipeline orchestration.
//!
//! The stage machine lives in [`runner`]; [`backoff`] derives run keys
//! and retry delays, [`lease`] bounds per-repo concurrency, and
//! [`monitor`] correlates post-merge CI outcomes with recently merged
//! fixes.

pub mod backoff;
pub mod lease;
pub mod monitor;
pub mod runner;

use std::sync::Arc;

use tokio::sync::mpsc;

pub use backoff::{compute_backoff_seconds, derive_run_key};
pub use lease::RepoLease;
pub use monitor::PostMergeMonitor;
pub use runner::{ActorIdentity, Job, PipelineRunner, StepOutcome};

/// Periodically re-dispatch events left `pending` by a failed enqueue.
pub fn spawn_recovery_sweep(
    store: Arc<crate::store::Store>,
    jobs: mpsc::UnboundedSender<Job>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ids = match store.list_event_ids_by_status(crate::store::EventStatus::Pending, 100)
            {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::warn!(error = %e, "Recovery sweep query failed");
                    continue;
                }
            };
            for event_id in ids {
                if jobs
                    .send(Job {
                        event_id: event_id.clone(),
                        correlation_id: None,
                    })
                    .is_ok()
                {
                    let _ = store.mark_event_dispatched(&event_id);
                    tracing::info!(event_id, "Recovered pending event");
                }
            }
        }
    })
}

/// Spawn a pool of workers draining the job queue. Each job advances its
/// run to a parked or terminal state before the worker takes the next.
pub fn spawn_workers(
    runner: Arc<PipelineRunner>,
    rx: mpsc::UnboundedReceiver<Job>,
    count: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..count.max(1))
        .map(|worker_idx| {
            let runner = runner.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        let job = guard.recv().await;
                        runner
                            .metrics()
                            .queue_depth
                            .with_label_values(&["pipeline"])
                            .set(guard.len() as i64);
                        job
                    };
                    let Some(job) = job else { break };
                    tracing::debug!(worker = worker_idx, event_id = %job.event_id, "Job picked up");
                    runner.run_job(&job).await;
                }
            })
        })
        .collect()
}
