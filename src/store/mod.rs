//! Relational persistence layer.
//!
//! One row per pipeline event, one row per webhook delivery, one row per
//! fix pipeline run (owning its stage JSON blobs), one row per repository
//! installation. All idempotency guarantees live here.

pub mod db;
pub mod models;

pub use db::{Store, TransitionUpdate};
pub use models::{
    AppInstallationRow, AutomationMode, EventStatus, FixRunRow, PipelineEventRow, RunStatus,
    StageField, WebhookDeliveryRow,
};
