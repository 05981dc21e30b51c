//! State Store (§4.1): a single local embedded SQL engine (SQLite via
//! `rusqlite`) backing durable job/row/audit persistence. The one guarantee
//! every other component leans on is that [`StateStore::transition_row`]
//! and the job-level counter update it implies happen in one transaction —
//! that atomic unit is what makes crash recovery correct.
//!
//! Schema version is stamped in a `schema_meta` table at creation time;
//! opening a database from an unsupported future version is refused rather
//! than silently misreading it.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use shipagent_types::{Actor, AuditEntry, ErrorRecord, FilterSpec, Job, JobRow, JobStatus, RowStatus};
use thiserror::Error;
use uuid::Uuid;

pub const CURRENT_SCHEMA_VERSION: i64 = 1;
pub const MINIMUM_SUPPORTED_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("row ({job_id}, {row_number}) not found")]
    RowNotFound { job_id: Uuid, row_number: u32 },
    #[error("stale transition on job {id}: expected `{expected}`, found `{actual}`")]
    StaleJobTransition {
        id: Uuid,
        expected: String,
        actual: String,
    },
    #[error("stale transition on row ({job_id}, {row_number}): expected `{expected}`, found `{actual}`")]
    StaleRowTransition {
        job_id: Uuid,
        row_number: u32,
        expected: String,
        actual: String,
    },
    #[error("database schema version {found} is newer than the {supported} this build understands")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for shipagent_errors::ShipAgentError {
    fn from(err: StoreError) -> Self {
        use shipagent_errors::SystemError;
        match err {
            StoreError::StaleJobTransition { expected, actual, .. } => {
                shipagent_errors::ShipAgentError::System(SystemError::StaleTransition { expected, actual })
            }
            StoreError::StaleRowTransition { expected, actual, .. } => {
                shipagent_errors::ShipAgentError::System(SystemError::StaleTransition { expected, actual })
            }
            other => shipagent_errors::ShipAgentError::System(SystemError::Store(other.to_string())),
        }
    }
}

/// Fields a caller may set while transitioning a job; `None` leaves the
/// existing column untouched.
#[derive(Debug, Default, Clone)]
pub struct JobStatusUpdate {
    pub approval_token_hash: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_rows: Option<u32>,
    pub succeeded_rows: Option<u32>,
    pub failed_rows: Option<u32>,
    pub skipped_rows: Option<u32>,
    pub cost_minor_units: Option<i64>,
    pub filter: Option<FilterSpec>,
    pub generation: Option<u32>,
}

/// Fields a caller may set while transitioning a row.
#[derive(Debug, Default, Clone)]
pub struct RowStatusUpdate {
    pub payload_snapshot: Option<serde_json::Value>,
    pub rated_cost: Option<i64>,
    pub tracking_number: Option<String>,
    pub label_ref: Option<String>,
    pub error: Option<ErrorRecord>,
    pub bump_attempt: bool,
}

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Opens (creating if absent) the SQLite database at `path` and ensures
    /// its schema is at least created and no newer than this build
    /// understands.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests and by any embedder that wants crash
    /// recovery semantics without durability.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL);

             CREATE TABLE IF NOT EXISTS jobs (
                 id TEXT PRIMARY KEY,
                 command_text TEXT NOT NULL,
                 source_signature TEXT NOT NULL,
                 filter_spec TEXT,
                 service_code TEXT NOT NULL,
                 status TEXT NOT NULL,
                 total_rows INTEGER NOT NULL DEFAULT 0,
                 succeeded_rows INTEGER NOT NULL DEFAULT 0,
                 failed_rows INTEGER NOT NULL DEFAULT 0,
                 skipped_rows INTEGER NOT NULL DEFAULT 0,
                 cost_minor_units INTEGER NOT NULL DEFAULT 0,
                 generation INTEGER NOT NULL DEFAULT 0,
                 approval_token_hash TEXT,
                 created_at TEXT NOT NULL,
                 approved_at TEXT,
                 started_at TEXT,
                 completed_at TEXT
             );

             CREATE TABLE IF NOT EXISTS job_rows (
                 job_id TEXT NOT NULL,
                 row_number INTEGER NOT NULL,
                 checksum TEXT NOT NULL,
                 order_record TEXT NOT NULL,
                 payload_snapshot TEXT,
                 status TEXT NOT NULL,
                 rated_cost INTEGER,
                 tracking_number TEXT,
                 label_ref TEXT,
                 error TEXT,
                 attempt INTEGER NOT NULL DEFAULT 0,
                 updated_at TEXT NOT NULL,
                 PRIMARY KEY (job_id, row_number)
             );
             CREATE INDEX IF NOT EXISTS idx_job_rows_status ON job_rows (job_id, status);

             CREATE TABLE IF NOT EXISTS audit (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 job_id TEXT NOT NULL,
                 row_number INTEGER,
                 kind TEXT NOT NULL,
                 from_status TEXT,
                 to_status TEXT NOT NULL,
                 ts TEXT NOT NULL,
                 actor TEXT NOT NULL,
                 digest TEXT
             );",
        )?;

        let version: Option<i64> = self
            .conn
            .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| row.get(0))
            .optional()?;
        match version {
            None => {
                self.conn.execute(
                    "INSERT INTO schema_meta (version) VALUES (?1)",
                    params![CURRENT_SCHEMA_VERSION],
                )?;
            }
            Some(found) if found > CURRENT_SCHEMA_VERSION => {
                return Err(StoreError::UnsupportedSchemaVersion {
                    found,
                    supported: CURRENT_SCHEMA_VERSION,
                });
            }
            Some(_) => {}
        }
        Ok(())
    }

    pub fn create_job(&self, job: &Job) -> Result<()> {
        self.conn.execute(
            "INSERT INTO jobs (id, command_text, source_signature, filter_spec, service_code,
                status, total_rows, succeeded_rows, failed_rows, skipped_rows, cost_minor_units,
                generation, approval_token_hash, created_at, approved_at, started_at, completed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                job.id.to_string(),
                job.command_text,
                job.source_signature,
                job.filter.as_ref().map(serde_json::to_string).transpose()?,
                job.service_code,
                status_to_str(job.status),
                job.total_rows,
                job.succeeded_rows,
                job.failed_rows,
                job.skipped_rows,
                job.cost_minor_units,
                job.generation,
                job.approval_token_hash,
                job.created_at.to_rfc3339(),
                job.approved_at.map(|t| t.to_rfc3339()),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Result<Job> {
        self.conn
            .query_row(
                "SELECT id, command_text, source_signature, filter_spec, service_code, status,
                    total_rows, succeeded_rows, failed_rows, skipped_rows, cost_minor_units,
                    generation, approval_token_hash, created_at, approved_at, started_at, completed_at
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
                row_to_job,
            )
            .optional()?
            .ok_or(StoreError::JobNotFound(id))
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut stmt = if status.is_some() {
            self.conn.prepare(
                "SELECT id, command_text, source_signature, filter_spec, service_code, status,
                    total_rows, succeeded_rows, failed_rows, skipped_rows, cost_minor_units,
                    generation, approval_token_hash, created_at, approved_at, started_at, completed_at
                 FROM jobs WHERE status = ?1 ORDER BY created_at",
            )?
        } else {
            self.conn.prepare(
                "SELECT id, command_text, source_signature, filter_spec, service_code, status,
                    total_rows, succeeded_rows, failed_rows, skipped_rows, cost_minor_units,
                    generation, approval_token_hash, created_at, approved_at, started_at, completed_at
                 FROM jobs ORDER BY created_at",
            )?
        };
        let rows = if let Some(status) = status {
            stmt.query_map(params![status_to_str(status)], row_to_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            stmt.query_map([], row_to_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    /// Compare-and-set on `jobs.status`. All job status changes go through
    /// this primitive; it is also where the row counters are written, in
    /// the same transaction as the status flip.
    pub fn update_job_status(
        &mut self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        fields: JobStatusUpdate,
    ) -> Result<Job> {
        let tx = self.conn.transaction()?;
        let current: String = tx.query_row(
            "SELECT status FROM jobs WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        if current != status_to_str(from) {
            return Err(StoreError::StaleJobTransition {
                id,
                expected: status_to_str(from).to_string(),
                actual: current,
            });
        }

        tx.execute(
            "UPDATE jobs SET
                status = ?2,
                approval_token_hash = COALESCE(?3, approval_token_hash),
                approved_at = COALESCE(?4, approved_at),
                started_at = COALESCE(?5, started_at),
                completed_at = COALESCE(?6, completed_at),
                total_rows = COALESCE(?7, total_rows),
                succeeded_rows = COALESCE(?8, succeeded_rows),
                failed_rows = COALESCE(?9, failed_rows),
                skipped_rows = COALESCE(?10, skipped_rows),
                cost_minor_units = COALESCE(?11, cost_minor_units),
                filter_spec = COALESCE(?12, filter_spec),
                generation = COALESCE(?13, generation)
             WHERE id = ?1",
            params![
                id.to_string(),
                status_to_str(to),
                fields.approval_token_hash,
                fields.approved_at.map(|t| t.to_rfc3339()),
                fields.started_at.map(|t| t.to_rfc3339()),
                fields.completed_at.map(|t| t.to_rfc3339()),
                fields.total_rows,
                fields.succeeded_rows,
                fields.failed_rows,
                fields.skipped_rows,
                fields.cost_minor_units,
                fields
                    .filter
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                fields.generation,
            ],
        )?;

        let job = tx.query_row(
            "SELECT id, command_text, source_signature, filter_spec, service_code, status,
                total_rows, succeeded_rows, failed_rows, skipped_rows, cost_minor_units,
                generation, approval_token_hash, created_at, approved_at, started_at, completed_at
             FROM jobs WHERE id = ?1",
            params![id.to_string()],
            row_to_job,
        )?;
        tx.commit()?;
        Ok(job)
    }

    /// Bulk insert, idempotent by `(job_id, row_number)`. Used once at
    /// preview-materialization time.
    pub fn insert_rows(&mut self, job_id: Uuid, rows: &[JobRow]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT OR IGNORE INTO job_rows
                    (job_id, row_number, checksum, order_record, payload_snapshot, status,
                     rated_cost, tracking_number, label_ref, error, attempt, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    job_id.to_string(),
                    row.row_number,
                    row.checksum,
                    row.order_record.to_string(),
                    row.payload_snapshot.as_ref().map(|v| v.to_string()),
                    row_status_to_str(row.status),
                    row.rated_cost,
                    row.tracking_number,
                    row.label_ref,
                    row.error.as_ref().map(serde_json::to_string).transpose()?,
                    row.attempt,
                    row.updated_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// CAS on a row's status. Idempotent when `from == to` and `fields`
    /// matches what is already stored (the engine relies on this for
    /// restart-safe re-dispatch).
    pub fn transition_row(
        &mut self,
        job_id: Uuid,
        row_number: u32,
        from: RowStatus,
        to: RowStatus,
        fields: RowStatusUpdate,
    ) -> Result<JobRow> {
        let tx = self.conn.transaction()?;
        let current: String = tx
            .query_row(
                "SELECT status FROM job_rows WHERE job_id = ?1 AND row_number = ?2",
                params![job_id.to_string(), row_number],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::RowNotFound { job_id, row_number })?;

        if current != row_status_to_str(from) {
            return Err(StoreError::StaleRowTransition {
                job_id,
                row_number,
                expected: row_status_to_str(from).to_string(),
                actual: current,
            });
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE job_rows SET
                status = ?3,
                payload_snapshot = COALESCE(?4, payload_snapshot),
                rated_cost = COALESCE(?5, rated_cost),
                tracking_number = COALESCE(?6, tracking_number),
                label_ref = COALESCE(?7, label_ref),
                error = COALESCE(?8, error),
                attempt = attempt + ?9,
                updated_at = ?10
             WHERE job_id = ?1 AND row_number = ?2",
            params![
                job_id.to_string(),
                row_number,
                row_status_to_str(to),
                fields.payload_snapshot.as_ref().map(|v| v.to_string()),
                fields.rated_cost,
                fields.tracking_number,
                fields.label_ref,
                fields.error.as_ref().map(serde_json::to_string).transpose()?,
                if fields.bump_attempt { 1 } else { 0 },
                now,
            ],
        )?;

        let row = tx.query_row(
            "SELECT job_id, row_number, checksum, order_record, payload_snapshot, status,
                rated_cost, tracking_number, label_ref, error, attempt, updated_at
             FROM job_rows WHERE job_id = ?1 AND row_number = ?2",
            params![job_id.to_string(), row_number],
            row_to_job_row,
        )?;
        tx.commit()?;
        Ok(row)
    }

    /// Never silently drops an entry: callers decide how to apply
    /// back-pressure if the underlying write fails.
    pub fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO audit (job_id, row_number, kind, from_status, to_status, ts, actor, digest)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                entry.job_id.to_string(),
                entry.row_number,
                entry.kind,
                entry.from_status,
                entry.to_status,
                entry.timestamp.to_rfc3339(),
                actor_to_str(entry.actor),
                entry.payload_digest,
            ],
        )?;
        Ok(())
    }

    /// Restartable, ordered by row number. `status_filter` narrows to one
    /// status; pass `None` for all rows.
    pub fn iter_rows(&self, job_id: Uuid, status_filter: Option<RowStatus>) -> Result<Vec<JobRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, row_number, checksum, order_record, payload_snapshot, status,
                rated_cost, tracking_number, label_ref, error, attempt, updated_at
             FROM job_rows WHERE job_id = ?1 ORDER BY row_number",
        )?;
        let rows: Vec<JobRow> = stmt
            .query_map(params![job_id.to_string()], row_to_job_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(match status_filter {
            Some(status) => rows.into_iter().filter(|r| r.status == status).collect(),
            None => rows,
        })
    }
}

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Created => "created",
        JobStatus::Previewing => "previewing",
        JobStatus::Previewed => "previewed",
        JobStatus::Approved => "approved",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn row_status_to_str(status: RowStatus) -> &'static str {
    match status {
        RowStatus::Pending => "pending",
        RowStatus::Rated => "rated",
        RowStatus::Shipping => "shipping",
        RowStatus::Shipped => "shipped",
        RowStatus::Voided => "voided",
        RowStatus::Failed => "failed",
        RowStatus::Skipped => "skipped",
    }
}

fn actor_to_str(actor: Actor) -> &'static str {
    match actor {
        Actor::System => "system",
        Actor::User => "user",
        Actor::Hook => "hook",
    }
}

fn job_status_from_str(s: &str) -> JobStatus {
    match s {
        "previewing" => JobStatus::Previewing,
        "previewed" => JobStatus::Previewed,
        "approved" => JobStatus::Approved,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        _ => JobStatus::Created,
    }
}

fn row_status_from_str(s: &str) -> RowStatus {
    match s {
        "rated" => RowStatus::Rated,
        "shipping" => RowStatus::Shipping,
        "shipped" => RowStatus::Shipped,
        "voided" => RowStatus::Voided,
        "failed" => RowStatus::Failed,
        "skipped" => RowStatus::Skipped,
        _ => RowStatus::Pending,
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let filter_spec: Option<String> = row.get(3)?;
    let filter = filter_spec
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(Job {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).expect("stored uuid is well-formed"),
        command_text: row.get(1)?,
        source_signature: row.get(2)?,
        filter,
        service_code: row.get(4)?,
        status: job_status_from_str(&row.get::<_, String>(5)?),
        total_rows: row.get(6)?,
        succeeded_rows: row.get(7)?,
        failed_rows: row.get(8)?,
        skipped_rows: row.get(9)?,
        cost_minor_units: row.get(10)?,
        generation: row.get(11)?,
        approval_token_hash: row.get(12)?,
        created_at: parse_rfc3339(row.get::<_, String>(13)?),
        approved_at: row.get::<_, Option<String>>(14)?.map(parse_rfc3339),
        started_at: row.get::<_, Option<String>>(15)?.map(parse_rfc3339),
        completed_at: row.get::<_, Option<String>>(16)?.map(parse_rfc3339),
    })
}

fn row_to_job_row(row: &rusqlite::Row) -> rusqlite::Result<JobRow> {
    let order_record: String = row.get(3)?;
    let payload_snapshot: Option<String> = row.get(4)?;
    let error: Option<String> = row.get(9)?;
    Ok(JobRow {
        job_id: Uuid::parse_str(&row.get::<_, String>(0)?).expect("stored uuid is well-formed"),
        row_number: row.get(1)?,
        checksum: row.get(2)?,
        order_record: serde_json::from_str(&order_record).unwrap_or(serde_json::Value::Null),
        payload_snapshot: payload_snapshot.map(|s| serde_json::from_str(&s).unwrap_or(serde_json::Value::Null)),
        status: row_status_from_str(&row.get::<_, String>(5)?),
        rated_cost: row.get(6)?,
        tracking_number: row.get(7)?,
        label_ref: row.get(8)?,
        error: error.and_then(|s| serde_json::from_str(&s).ok()),
        attempt: row.get(10)?,
        updated_at: parse_rfc3339(row.get::<_, String>(11)?),
    })
}

fn parse_rfc3339(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .expect("stored timestamp is well-formed")
        .with_timezone(&Utc)
}
