//! SQLite persistence for events, deliveries, runs, and installations.
//!
//! Every mutation is a single transaction. The three idempotency keys
//! (`idempotency_key`, `delivery_id`, `run_key`) are UNIQUE columns, and
//! the insert paths treat conflicts as "return the existing row" so
//! concurrent workers converge on one row per key.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::events::NormalizedPipelineEvent;

use super::models::*;

pub struct Store {
    conn: Mutex<Connection>,
}

/// Field updates applied atomically with a status transition.
#[derive(Default)]
pub struct TransitionUpdate<'a> {
    pub stage: Option<(StageField, &'a Value)>,
    pub error_message: Option<&'a str>,
    pub blocked_reason: Option<&'a str>,
    pub patch_diff: Option<&'a str>,
    pub adapter_name: Option<&'a str>,
    pub manual_review_required: Option<bool>,
    pub pr_url: Option<&'a str>,
}

const RUN_COLUMNS: &str = "id, event_id, status, error_message, context_json, rca_json, \
     detection_json, issue_graph_json, plan_json, plan_policy_json, critic_json, \
     consensus_json, patch_diff, patch_stats_json, patch_policy_json, validation_json, \
     pr_json, merge_json, post_merge_monitor_json, artifact_json, adapter_name, \
     sbom_path, sbom_sha256, sbom_size_bytes, run_key, attempt_count, \
     retry_limit_snapshot, blocked_reason, last_pr_url, last_pr_created_at, \
     automation_mode, manual_review_required, created_at, updated_at";

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pipeline_events (
                id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                ci_provider TEXT NOT NULL,
                pipeline_id TEXT NOT NULL,
                repo TEXT NOT NULL,
                commit_sha TEXT NOT NULL,
                branch TEXT NOT NULL,
                stage TEXT NOT NULL,
                failure_type TEXT NOT NULL,
                error_message TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                correlation_id TEXT,
                raw_payload TEXT NOT NULL,
                event_timestamp TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS webhook_deliveries (
                id TEXT PRIMARY KEY,
                delivery_id TEXT NOT NULL UNIQUE,
                event_type TEXT NOT NULL,
                repository TEXT,
                status TEXT NOT NULL DEFAULT 'received',
                details TEXT,
                received_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS fix_pipeline_runs (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL UNIQUE REFERENCES pipeline_events(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'created',
                error_message TEXT,
                context_json TEXT,
                rca_json TEXT,
                detection_json TEXT,
                issue_graph_json TEXT,
                plan_json TEXT,
                plan_policy_json TEXT,
                critic_json TEXT,
                consensus_json TEXT,
                patch_diff TEXT,
                patch_stats_json TEXT,
                patch_policy_json TEXT,
                validation_json TEXT,
                pr_json TEXT,
                merge_json TEXT,
                post_merge_monitor_json TEXT,
                artifact_json TEXT,
                adapter_name TEXT,
                sbom_path TEXT,
                sbom_sha256 TEXT,
                sbom_size_bytes INTEGER,
                run_key TEXT UNIQUE,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                retry_limit_snapshot INTEGER NOT NULL DEFAULT 3,
                blocked_reason TEXT,
                last_pr_url TEXT,
                last_pr_created_at TEXT,
                automation_mode TEXT NOT NULL DEFAULT 'auto_pr',
                manual_review_required INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS app_installations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                repo_id TEXT NOT NULL,
                installation_id INTEGER NOT NULL UNIQUE,
                repo_full_name TEXT NOT NULL,
                automation_mode TEXT NOT NULL DEFAULT 'suggest',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(user_id, repo_id)
            );

            CREATE INDEX IF NOT EXISTS idx_pipeline_events_repo_created
                ON pipeline_events(repo, created_at);
            CREATE INDEX IF NOT EXISTS idx_pipeline_events_status_created
                ON pipeline_events(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_fix_runs_status ON fix_pipeline_runs(status);
            CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_repo
                ON webhook_deliveries(repository, received_at);
            CREATE INDEX IF NOT EXISTS idx_installations_repo
                ON app_installations(repo_full_name);
            ",
        )?;
        Ok(())
    }

    // ── Pipeline events ──────────────────────────────────────────────

    /// Insert a normalized event. Returns `(event_id, is_new)`; a
    /// conflicting `idempotency_key` returns the existing row's id with
    /// `is_new = false`.
    pub fn insert_event(
        &self,
        event: &NormalizedPipelineEvent,
    ) -> Result<(String, bool), StoreError> {
        let conn = self.lock();
        let id = Uuid::new_v4().to_string();
        let inserted = conn.execute(
            "INSERT INTO pipeline_events
                (id, idempotency_key, ci_provider, pipeline_id, repo, commit_sha, branch,
                 stage, failure_type, error_message, status, correlation_id, raw_payload,
                 event_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', ?11, ?12, ?13)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                id,
                event.idempotency_key,
                event.ci_provider.as_str(),
                event.pipeline_id,
                event.repo,
                event.commit_sha,
                event.branch,
                event.stage,
                event.failure_type.as_str(),
                event.error_message,
                event.correlation_id,
                serde_json::to_string(&event.raw_payload)?,
                event.event_timestamp.to_rfc3339(),
            ],
        )?;
        if inserted > 0 {
            return Ok((id, true));
        }
        let existing: String = conn.query_row(
            "SELECT id FROM pipeline_events WHERE idempotency_key = ?1",
            params![event.idempotency_key],
            |row| row.get(0),
        )?;
        Ok((existing, false))
    }

    pub fn get_event(&self, id: &str) -> Result<Option<PipelineEventRow>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, idempotency_key, ci_provider, pipeline_id, repo, commit_sha,
                        branch, stage, failure_type, error_message, status, correlation_id,
                        raw_payload, event_timestamp, created_at, updated_at
                 FROM pipeline_events WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, String>(12)?,
                        row.get::<_, String>(13)?,
                        row.get::<_, String>(14)?,
                        row.get::<_, Option<String>>(15)?,
                    ))
                },
            )
            .optional()?;
        let Some(r) = row else { return Ok(None) };
        let status = EventStatus::from_str(&r.10)
            .map_err(|e| StoreError::NotFound(format!("event status: {}", e)))?;
        Ok(Some(PipelineEventRow {
            id: r.0,
            idempotency_key: r.1,
            ci_provider: r.2,
            pipeline_id: r.3,
            repo: r.4,
            commit_sha: r.5,
            branch: r.6,
            stage: r.7,
            failure_type: r.8,
            error_message: r.9,
            status,
            correlation_id: r.11,
            raw_payload: serde_json::from_str(&r.12)?,
            event_timestamp: r.13,
            created_at: r.14,
            updated_at: r.15,
        }))
    }

    pub fn update_event_status(&self, id: &str, status: EventStatus) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE pipeline_events SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("event {}", id)));
        }
        Ok(())
    }

    /// Transition pending → dispatched. Used inside the ingest path so
    /// dispatch shares the delivery transaction boundary.
    pub fn mark_event_dispatched(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE pipeline_events SET status = 'dispatched', updated_at = datetime('now')
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(())
    }

    /// Event ids sitting in a given status, oldest first. Used by the
    /// recovery sweep to re-dispatch events whose enqueue failed.
    pub fn list_event_ids_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM pipeline_events WHERE status = ?1 ORDER BY created_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    // ── Webhook deliveries ───────────────────────────────────────────

    /// Record a delivery. Returns `true` when the delivery is new,
    /// `false` when the `delivery_id` was already seen.
    pub fn record_delivery(
        &self,
        delivery_id: &str,
        event_type: &str,
        repository: Option<&str>,
        details: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT INTO webhook_deliveries (id, delivery_id, event_type, repository, details)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(delivery_id) DO NOTHING",
            params![
                Uuid::new_v4().to_string(),
                delivery_id,
                event_type,
                repository,
                details
            ],
        )?;
        Ok(inserted > 0)
    }

    // ── Fix pipeline runs ────────────────────────────────────────────

    /// Create (or find) the run for an event. Idempotent under concurrent
    /// workers: a second caller reads the existing row. When the run key
    /// already names a live run for the same failure signature, that run
    /// is returned instead so attempt accounting accumulates on one row.
    pub fn create_run(
        &self,
        event_id: &str,
        run_key: Option<&str>,
        automation_mode: AutomationMode,
        retry_limit: u32,
    ) -> Result<FixRunRow, StoreError> {
        {
            let conn = self.lock();
            if let Some(existing) = Self::query_run_where(&conn, "event_id = ?1", event_id)? {
                drop(conn);
                if existing.run_key.is_none()
                    && let Some(key) = run_key
                {
                    self.fill_run_key(&existing.id, key)?;
                    return self
                        .get_run(&existing.id)?
                        .ok_or_else(|| StoreError::NotFound(format!("run {}", existing.id)));
                }
                return Ok(existing);
            }
            if let Some(key) = run_key
                && let Some(existing) = Self::query_run_where(&conn, "run_key = ?1", key)?
            {
                return Ok(existing);
            }

            let id = Uuid::new_v4().to_string();
            let inserted = conn.execute(
                "INSERT INTO fix_pipeline_runs
                    (id, event_id, run_key, automation_mode, retry_limit_snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(event_id) DO NOTHING",
                params![
                    id,
                    event_id,
                    run_key,
                    automation_mode.as_str(),
                    retry_limit
                ],
            );
            match inserted {
                Ok(n) if n > 0 => {
                    if let Some(run) = Self::query_run_where(&conn, "id = ?1", &id)? {
                        return Ok(run);
                    }
                }
                // run_key collision from a concurrent writer: fall through
                // to the lookups below.
                Ok(_) | Err(_) => {}
            }
            if let Some(run) = Self::query_run_where(&conn, "event_id = ?1", event_id)? {
                return Ok(run);
            }
            if let Some(key) = run_key
                && let Some(run) = Self::query_run_where(&conn, "run_key = ?1", key)?
            {
                return Ok(run);
            }
        }
        Err(StoreError::NotFound(format!("run for event {}", event_id)))
    }

    pub fn get_run(&self, id: &str) -> Result<Option<FixRunRow>, StoreError> {
        let conn = self.lock();
        Self::query_run_where(&conn, "id = ?1", id)
    }

    pub fn get_run_by_event(&self, event_id: &str) -> Result<Option<FixRunRow>, StoreError> {
        let conn = self.lock();
        Self::query_run_where(&conn, "event_id = ?1", event_id)
    }

    pub fn get_run_by_key(&self, run_key: &str) -> Result<Option<FixRunRow>, StoreError> {
        let conn = self.lock();
        Self::query_run_where(&conn, "run_key = ?1", run_key)
    }

    fn query_run_where(
        conn: &Connection,
        predicate: &str,
        value: &str,
    ) -> Result<Option<FixRunRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM fix_pipeline_runs WHERE {}",
            RUN_COLUMNS, predicate
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![value])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::run_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn json_col(row: &rusqlite::Row<'_>, idx: usize) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = row.get(idx)?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    fn run_from_row(row: &rusqlite::Row<'_>) -> Result<FixRunRow, StoreError> {
        let status_raw: String = row.get(2)?;
        let status = RunStatus::from_str(&status_raw)
            .map_err(|e| StoreError::NotFound(format!("run status: {}", e)))?;
        let mode_raw: String = row.get(30)?;
        let automation_mode = AutomationMode::from_str(&mode_raw)
            .map_err(|e| StoreError::NotFound(format!("automation mode: {}", e)))?;
        Ok(FixRunRow {
            id: row.get(0)?,
            event_id: row.get(1)?,
            status,
            error_message: row.get(3)?,
            context_json: Self::json_col(row, 4)?,
            rca_json: Self::json_col(row, 5)?,
            detection_json: Self::json_col(row, 6)?,
            issue_graph_json: Self::json_col(row, 7)?,
            plan_json: Self::json_col(row, 8)?,
            plan_policy_json: Self::json_col(row, 9)?,
            critic_json: Self::json_col(row, 10)?,
            consensus_json: Self::json_col(row, 11)?,
            patch_diff: row.get(12)?,
            patch_stats_json: Self::json_col(row, 13)?,
            patch_policy_json: Self::json_col(row, 14)?,
            validation_json: Self::json_col(row, 15)?,
            pr_json: Self::json_col(row, 16)?,
            merge_json: Self::json_col(row, 17)?,
            post_merge_monitor_json: Self::json_col(row, 18)?,
            artifact_json: Self::json_col(row, 19)?,
            adapter_name: row.get(20)?,
            sbom_path: row.get(21)?,
            sbom_sha256: row.get(22)?,
            sbom_size_bytes: row.get(23)?,
            run_key: row.get(24)?,
            attempt_count: row.get::<_, i64>(25)? as u32,
            retry_limit_snapshot: row.get::<_, i64>(26)? as u32,
            blocked_reason: row.get(27)?,
            last_pr_url: row.get(28)?,
            last_pr_created_at: row.get(29)?,
            automation_mode,
            manual_review_required: row.get::<_, i64>(31)? != 0,
            created_at: row.get(32)?,
            updated_at: row.get(33)?,
        })
    }

    fn fill_run_key(&self, run_id: &str, run_key: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        // Best effort: another run may already own this key.
        let _ = conn.execute(
            "UPDATE fix_pipeline_runs SET run_key = ?1, updated_at = datetime('now')
             WHERE id = ?2 AND run_key IS NULL",
            params![run_key, run_id],
        );
        Ok(())
    }

    /// Assign a run key derived after context parsing. No-op when the
    /// run already has a key or another run owns this one.
    pub fn assign_run_key(&self, run_id: &str, run_key: &str) -> Result<(), StoreError> {
        self.fill_run_key(run_id, run_key)
    }

    /// Advance a run to `new_status`, persisting the stage blob and any
    /// companion fields in the same transaction. Rejects transitions that
    /// do not move strictly forward in the state graph.
    pub fn transition(
        &self,
        run_id: &str,
        new_status: RunStatus,
        update: TransitionUpdate<'_>,
    ) -> Result<FixRunRow, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current_raw: String = tx
            .query_row(
                "SELECT status FROM fix_pipeline_runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))?;
        let current = RunStatus::from_str(&current_raw)
            .map_err(|e| StoreError::NotFound(format!("run status: {}", e)))?;
        // The loop detector may push any non-blocked run to `blocked`;
        // every other transition must move strictly forward.
        let blocking = new_status == RunStatus::Blocked;
        if (current.is_terminal() && !blocking) || new_status.rank() <= current.rank() {
            return Err(StoreError::Conflict {
                current: current_raw,
            });
        }

        tx.execute(
            "UPDATE fix_pipeline_runs SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![new_status.as_str(), run_id],
        )?;
        if let Some((field, value)) = update.stage {
            let sql = format!(
                "UPDATE fix_pipeline_runs SET {} = ?1 WHERE id = ?2",
                field.column()
            );
            tx.execute(&sql, params![serde_json::to_string(value)?, run_id])?;
        }
        if let Some(message) = update.error_message {
            tx.execute(
                "UPDATE fix_pipeline_runs SET error_message = ?1 WHERE id = ?2",
                params![message, run_id],
            )?;
        }
        if let Some(reason) = update.blocked_reason {
            tx.execute(
                "UPDATE fix_pipeline_runs SET blocked_reason = ?1 WHERE id = ?2",
                params![reason, run_id],
            )?;
        }
        if let Some(diff) = update.patch_diff {
            tx.execute(
                "UPDATE fix_pipeline_runs SET patch_diff = ?1 WHERE id = ?2",
                params![diff, run_id],
            )?;
        }
        if let Some(name) = update.adapter_name {
            tx.execute(
                "UPDATE fix_pipeline_runs SET adapter_name = ?1 WHERE id = ?2",
                params![name, run_id],
            )?;
        }
        if let Some(required) = update.manual_review_required {
            tx.execute(
                "UPDATE fix_pipeline_runs SET manual_review_required = ?1 WHERE id = ?2",
                params![required as i64, run_id],
            )?;
        }
        if let Some(url) = update.pr_url {
            tx.execute(
                "UPDATE fix_pipeline_runs SET last_pr_url = ?1, last_pr_created_at = ?2
                 WHERE id = ?3",
                params![url, Utc::now().to_rfc3339(), run_id],
            )?;
        }
        tx.commit()?;

        drop(conn);
        self.get_run(run_id)?
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))
    }

    /// Bump the attempt counter; returns the new value.
    pub fn increment_attempt(&self, run_id: &str) -> Result<u32, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE fix_pipeline_runs
             SET attempt_count = attempt_count + 1, updated_at = datetime('now')
             WHERE id = ?1",
            params![run_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("run {}", run_id)));
        }
        let count: i64 = conn.query_row(
            "SELECT attempt_count FROM fix_pipeline_runs WHERE id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn set_sbom(
        &self,
        run_id: &str,
        path: &str,
        sha256: &str,
        size_bytes: i64,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE fix_pipeline_runs
             SET sbom_path = ?1, sbom_sha256 = ?2, sbom_size_bytes = ?3,
                 updated_at = datetime('now')
             WHERE id = ?4",
            params![path, sha256, size_bytes, run_id],
        )?;
        Ok(())
    }

    /// Persist the provenance artifact. Immutable once emitted: a second
    /// write for the same run is ignored.
    pub fn set_artifact(&self, run_id: &str, artifact: &Value) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE fix_pipeline_runs SET artifact_json = ?1, updated_at = datetime('now')
             WHERE id = ?2 AND artifact_json IS NULL",
            params![serde_json::to_string(artifact)?, run_id],
        )?;
        Ok(())
    }

    /// Persist a stage blob without a status change (monitor bookkeeping).
    pub fn set_stage_json(
        &self,
        run_id: &str,
        field: StageField,
        value: &Value,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        let sql = format!(
            "UPDATE fix_pipeline_runs SET {} = ?1, updated_at = datetime('now') WHERE id = ?2",
            field.column()
        );
        conn.execute(&sql, params![serde_json::to_string(value)?, run_id])?;
        Ok(())
    }

    // ── App installations ────────────────────────────────────────────

    pub fn upsert_installation(
        &self,
        user_id: &str,
        repo_id: &str,
        installation_id: i64,
        repo_full_name: &str,
        automation_mode: AutomationMode,
    ) -> Result<AppInstallationRow, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO app_installations
                (id, user_id, repo_id, installation_id, repo_full_name, automation_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, repo_id) DO UPDATE SET
                installation_id = ?4,
                repo_full_name = ?5,
                automation_mode = ?6",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                repo_id,
                installation_id,
                repo_full_name,
                automation_mode.as_str()
            ],
        )?;
        let row = conn.query_row(
            "SELECT id, user_id, repo_id, installation_id, repo_full_name, automation_mode,
                    created_at
             FROM app_installations WHERE user_id = ?1 AND repo_id = ?2",
            params![user_id, repo_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )?;
        let mode = AutomationMode::from_str(&row.5)
            .map_err(|e| StoreError::NotFound(format!("automation mode: {}", e)))?;
        Ok(AppInstallationRow {
            id: row.0,
            user_id: row.1,
            repo_id: row.2,
            installation_id: row.3,
            repo_full_name: row.4,
            automation_mode: mode,
            created_at: row.6,
        })
    }

    /// Automation mode configured for a repository, defaulting to auto_pr
    /// when the repo has no installation row.
    pub fn automation_mode_for_repo(&self, repo: &str) -> Result<AutomationMode, StoreError> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT automation_mode FROM app_installations
                 WHERE repo_full_name = ?1 ORDER BY created_at DESC LIMIT 1",
                params![repo],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => AutomationMode::from_str(&s)
                .map_err(|e| StoreError::NotFound(format!("automation mode: {}", e))),
            None => Ok(AutomationMode::AutoPr),
        }
    }
}
