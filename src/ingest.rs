//! Webhook ingestion: signature verification, deduplication, dispatch.
//!
//! Every delivery is recorded against its `delivery_id`; every event is
//! inserted against its idempotency key. A duplicate on either key is
//! counted and dropped without enqueueing work.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::{IngestError, StoreError};
use crate::events::NormalizedPipelineEvent;
use crate::metrics::Metrics;
use crate::pipeline::Job;
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

/// Verify a `sha256=<hex>` signature header against the raw body.
/// Comparison is constant-time via the MAC verify.
pub fn verify_signature(
    payload: &[u8],
    signature_header: Option<&str>,
    secret: &str,
) -> Result<(), IngestError> {
    let header = signature_header.ok_or(IngestError::MissingHeader("X-Hub-Signature-256"))?;
    let hex_digest = header
        .strip_prefix("sha256=")
        .ok_or(IngestError::InvalidSignatureFormat)?;
    let expected = hex::decode(hex_digest).map_err(|_| IngestError::InvalidSignatureFormat)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| IngestError::SignatureMismatch)?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| IngestError::SignatureMismatch)
}

/// Compute the signature header value for a body (used by tests and the
/// outbound webhook replayer).
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Stable fallback delivery id for providers that omit a delivery
/// header: sha256 over `{provider, payload}`.
pub fn fallback_delivery_id(provider: &str, payload: &Value) -> String {
    let stable = serde_json::json!({"provider": provider, "payload": payload});
    let mut hasher = Sha256::new();
    hasher.update(stable.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New event stored and dispatched.
    Accepted { event_id: String },
    /// Event already known (idempotency key conflict).
    DuplicateEvent { event_id: String },
    /// Delivery already processed (delivery_id conflict).
    DuplicateDelivery,
}

pub struct Ingestor {
    store: std::sync::Arc<Store>,
    metrics: Metrics,
    jobs: tokio::sync::mpsc::UnboundedSender<Job>,
}

impl Ingestor {
    pub fn new(
        store: std::sync::Arc<Store>,
        metrics: Metrics,
        jobs: tokio::sync::mpsc::UnboundedSender<Job>,
    ) -> Self {
        Self {
            store,
            metrics,
            jobs,
        }
    }

    /// Store the event and dispatch an orchestrator job.
    ///
    /// Dedup happens in two layers: the delivery id (at-least-once
    /// webhook transport) and the event idempotency key (provider
    /// retries with fresh delivery ids). Only a genuinely new event is
    /// enqueued; if enqueueing fails the event stays `pending` for the
    /// recovery sweep.
    pub fn ingest(
        &self,
        event: &NormalizedPipelineEvent,
        delivery_id: &str,
        event_type: &str,
    ) -> Result<IngestOutcome, StoreError> {
        let is_new_delivery =
            self.store
                .record_delivery(delivery_id, event_type, Some(&event.repo), None)?;
        if !is_new_delivery {
            self.metrics.webhook_deduped_total.inc();
            tracing::info!(
                delivery_id,
                repo = %event.repo,
                "Duplicate webhook delivery ignored"
            );
            return Ok(IngestOutcome::DuplicateDelivery);
        }

        let (event_id, is_new) = self.store.insert_event(event)?;
        if !is_new {
            tracing::info!(
                event_id,
                idempotency_key = %event.idempotency_key,
                "Duplicate pipeline event ignored"
            );
            return Ok(IngestOutcome::DuplicateEvent { event_id });
        }

        let job = Job {
            event_id: event_id.clone(),
            correlation_id: event.correlation_id.clone(),
        };
        match self.jobs.send(job) {
            Ok(()) => {
                self.store.mark_event_dispatched(&event_id)?;
                tracing::info!(event_id, repo = %event.repo, "Event dispatched to pipeline");
            }
            Err(e) => {
                // Stays pending; the recovery sweep will re-dispatch.
                tracing::warn!(event_id, error = %e, "Enqueue failed, event left pending");
            }
        }
        Ok(IngestOutcome::Accepted { event_id })
    }
}
