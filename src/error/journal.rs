/// SQLite job journal for crash detection
///
/// A row is written when a job starts and updated when it ends, stamped with the
/// owning process id and the kernel boot id. Rows still `in_progress` whose owner
/// is gone (another boot, or a pid that no longer exists) belong to a process that
/// died mid-job; they are marked `aborted` and reported, never resumed.
use crate::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

const INTERRUPTED_DETAIL: &str = "process ended before the job completed";
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";
const ENTRY_COLUMNS: &str = "job_id, device_id, method_id, operator, state, outcome, detail, \
                             started_at, updated_at, owner_pid, boot_id";

/// Process that recorded a job as started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOwner {
    pub pid: u32,
    /// Kernel boot id; empty when the platform does not expose one
    pub boot_id: String,
}

impl JobOwner {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            boot_id: current_boot_id(),
        }
    }

    /// Whether the owning process may still be running the job.
    pub fn is_alive(&self) -> bool {
        // A pid recorded on another boot names some other process now
        if self.boot_id != current_boot_id() {
            return false;
        }
        let Ok(raw) = i32::try_from(self.pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // Signal 0 checks existence; EPERM means it exists under another user
        matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }
}

fn current_boot_id() -> String {
    std::fs::read_to_string(BOOT_ID_PATH)
        .map(|id| id.trim().to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalState {
    InProgress,
    Completed,
    Aborted,
}

impl JournalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalState::InProgress => "in_progress",
            JournalState::Completed => "completed",
            JournalState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for JournalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JournalState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(JournalState::InProgress),
            "completed" => Ok(JournalState::Completed),
            "aborted" => Ok(JournalState::Aborted),
            other => Err(EngineError::Journal(format!("unknown job state '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub job_id: Uuid,
    pub device_id: String,
    pub method_id: String,
    pub operator: String,
    pub state: JournalState,
    /// Final job outcome, once known
    pub outcome: Option<String>,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Missing on rows written before owners were recorded
    pub owner: Option<JobOwner>,
}

pub struct JobJournal {
    conn: Connection,
    path: PathBuf,
}

impl JobJournal {
    /// Open or create the journal database at `path`.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EngineError::Journal(format!(
                        "failed to create journal directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(&path)?;
        // WAL keeps the last committed row intact if the process dies mid-write
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn, path)
    }

    /// Journal that lives only as long as the process.
    pub fn in_memory() -> EngineResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn with_connection(conn: Connection, path: PathBuf) -> EngineResult<Self> {
        let journal = Self { conn, path };
        journal.initialize_schema()?;
        Ok(journal)
    }

    fn initialize_schema(&self) -> EngineResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY NOT NULL,
                device_id TEXT NOT NULL,
                method_id TEXT NOT NULL,
                operator TEXT NOT NULL,
                state TEXT NOT NULL,
                outcome TEXT,
                detail TEXT,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                owner_pid INTEGER,
                boot_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            CREATE INDEX IF NOT EXISTS idx_jobs_device ON jobs(device_id);
            "#,
        )?;
        self.migrate_owner_columns()
    }

    /// Journals created before owners were recorded lack the owner columns.
    fn migrate_owner_columns(&self) -> EngineResult<()> {
        let columns = {
            let mut stmt = self.conn.prepare("PRAGMA table_info(jobs)")?;
            let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
            names.collect::<Result<Vec<_>, _>>()?
        };
        for (column, sql_type) in [("owner_pid", "INTEGER"), ("boot_id", "TEXT")] {
            if !columns.iter().any(|c| c == column) {
                self.conn
                    .execute_batch(&format!("ALTER TABLE jobs ADD COLUMN {} {}", column, sql_type))?;
                tracing::info!(column, "Journal schema upgraded");
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a job as started by this process.
    pub fn record_started(
        &mut self,
        job_id: Uuid,
        device_id: &str,
        method_id: &str,
        operator: &str,
    ) -> EngineResult<()> {
        self.record_started_by(job_id, device_id, method_id, operator, &JobOwner::current())
    }

    pub fn record_started_by(
        &mut self,
        job_id: Uuid,
        device_id: &str,
        method_id: &str,
        operator: &str,
        owner: &JobOwner,
    ) -> EngineResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            r#"
            INSERT INTO jobs (
                job_id, device_id, method_id, operator, state,
                outcome, detail, started_at, updated_at, owner_pid, boot_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6, ?6, ?7, ?8)
            ON CONFLICT(job_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at,
                owner_pid = excluded.owner_pid,
                boot_id = excluded.boot_id
            "#,
            params![
                job_id.to_string(),
                device_id,
                method_id,
                operator,
                JournalState::InProgress.as_str(),
                now,
                owner.pid,
                owner.boot_id,
            ],
        )?;
        tracing::debug!(job_id = %job_id, device = device_id, pid = owner.pid, "Job recorded in journal");
        Ok(())
    }

    pub fn record_finished(
        &mut self,
        job_id: Uuid,
        state: JournalState,
        outcome: &str,
        detail: Option<&str>,
    ) -> EngineResult<()> {
        let updated = self.conn.execute(
            "UPDATE jobs SET state = ?2, outcome = ?3, detail = ?4, updated_at = ?5 WHERE job_id = ?1",
            params![
                job_id.to_string(),
                state.as_str(),
                outcome,
                detail,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(EngineError::Journal(format!(
                "job {} was never recorded as started",
                job_id
            )));
        }
        Ok(())
    }

    /// Mark every `in_progress` job whose owning process is gone as aborted.
    ///
    /// Jobs still owned by a live process on this boot, this one included, are left alone.
    pub fn recover_interrupted(&mut self) -> EngineResult<Vec<JournalEntry>> {
        let tx = self.conn.transaction()?;
        let in_progress = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM jobs WHERE state = ?1 ORDER BY started_at",
                ENTRY_COLUMNS
            ))?;
            let rows = stmt.query_map(params![JournalState::InProgress.as_str()], Self::row_to_entry)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let (running, interrupted): (Vec<_>, Vec<_>) = in_progress
            .into_iter()
            .partition(|entry| entry.owner.as_ref().is_some_and(JobOwner::is_alive));
        for entry in &running {
            tracing::debug!(job_id = %entry.job_id, device = %entry.device_id, "Journaled job still has a live owner");
        }

        let now = Utc::now();
        for entry in &interrupted {
            tx.execute(
                "UPDATE jobs SET state = ?1, outcome = ?2, detail = ?3, updated_at = ?4 \
                 WHERE job_id = ?5 AND state = ?6",
                params![
                    JournalState::Aborted.as_str(),
                    "aborted",
                    INTERRUPTED_DETAIL,
                    now.to_rfc3339(),
                    entry.job_id.to_string(),
                    JournalState::InProgress.as_str(),
                ],
            )?;
        }
        tx.commit()?;

        let recovered: Vec<JournalEntry> = interrupted
            .into_iter()
            .map(|mut entry| {
                entry.state = JournalState::Aborted;
                entry.outcome = Some("aborted".to_string());
                entry.detail = Some(INTERRUPTED_DETAIL.to_string());
                entry.updated_at = now;
                entry
            })
            .collect();

        for entry in &recovered {
            tracing::warn!(
                job_id = %entry.job_id,
                device = %entry.device_id,
                method = %entry.method_id,
                "Interrupted job marked aborted"
            );
        }
        Ok(recovered)
    }

    pub fn entry(&self, job_id: Uuid) -> EngineResult<Option<JournalEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE job_id = ?1", ENTRY_COLUMNS),
                params![job_id.to_string()],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// All journal rows, most recent first
    pub fn entries(&self) -> EngineResult<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM jobs ORDER BY started_at DESC",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::row_to_entry)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<JournalEntry> {
        let job_id: String = row.get(0)?;
        let state: String = row.get(4)?;
        let started_at: String = row.get(7)?;
        let updated_at: String = row.get(8)?;
        let owner_pid: Option<u32> = row.get(9)?;
        let boot_id: Option<String> = row.get(10)?;
        Ok(JournalEntry {
            job_id: Uuid::parse_str(&job_id).map_err(|e| conversion_error(0, e))?,
            device_id: row.get(1)?,
            method_id: row.get(2)?,
            operator: row.get(3)?,
            state: state.parse().map_err(|e| conversion_error(4, e))?,
            outcome: row.get(5)?,
            detail: row.get(6)?,
            started_at: parse_timestamp(7, &started_at)?,
            updated_at: parse_timestamp(8, &updated_at)?,
            owner: owner_pid.map(|pid| JobOwner {
                pid,
                boot_id: boot_id.unwrap_or_default(),
            }),
        })
    }
}

fn parse_timestamp(column: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}
