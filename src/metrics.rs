//! Prometheus counter registry.
//!
//! The metric names are the external contract; the handle is injected
//! wherever a component needs to count. Registration failures are
//! impossible with distinct names, so construction returns `Result` only
//! to surface programming errors early.

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub pipeline_runs_total: IntCounterVec,
    pub pipeline_retry_total: IntCounter,
    pub pipeline_throttled_total: IntCounter,
    pub pipeline_loop_blocked_total: IntCounterVec,
    pub policy_violations_total: IntCounterVec,
    pub webhook_deduped_total: IntCounter,
    pub worker_tasks_total: IntCounterVec,
    pub queue_depth: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("sre_agent_http_requests_total", "HTTP requests served"),
            &["method", "route", "status"],
        )?;
        let pipeline_runs_total = IntCounterVec::new(
            Opts::new(
                "sre_agent_pipeline_runs_total",
                "Fix pipeline runs by terminal status",
            ),
            &["status"],
        )?;
        let pipeline_retry_total = IntCounter::new(
            "sre_agent_pipeline_retry_total",
            "Pipeline stage retries scheduled",
        )?;
        let pipeline_throttled_total = IntCounter::new(
            "sre_agent_pipeline_throttled_total",
            "Jobs rescheduled because the per-repo concurrency cap was reached",
        )?;
        let pipeline_loop_blocked_total = IntCounterVec::new(
            Opts::new(
                "sre_agent_pipeline_loop_blocked_total",
                "Runs blocked by the loop detector",
            ),
            &["reason"],
        )?;
        let policy_violations_total = IntCounterVec::new(
            Opts::new(
                "sre_agent_policy_violations_total",
                "Safety policy violations by code",
            ),
            &["code"],
        )?;
        let webhook_deduped_total = IntCounter::new(
            "sre_agent_webhook_deduped_total",
            "Duplicate webhook deliveries ignored",
        )?;
        let worker_tasks_total = IntCounterVec::new(
            Opts::new("sre_agent_celery_tasks_total", "Worker jobs by outcome"),
            &["task", "status"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Pending jobs per queue"),
            &["queue"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(pipeline_runs_total.clone()))?;
        registry.register(Box::new(pipeline_retry_total.clone()))?;
        registry.register(Box::new(pipeline_throttled_total.clone()))?;
        registry.register(Box::new(pipeline_loop_blocked_total.clone()))?;
        registry.register(Box::new(policy_violations_total.clone()))?;
        registry.register(Box::new(webhook_deduped_total.clone()))?;
        registry.register(Box::new(worker_tasks_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            pipeline_runs_total,
            pipeline_retry_total,
            pipeline_throttled_total,
            pipeline_loop_blocked_total,
            policy_violations_total,
            webhook_deduped_total,
            worker_tasks_total,
            queue_depth,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .context("Failed to encode metrics")?;
        String::from_utf8(buf).context("Metrics output was not UTF-8")
    }
}
