use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{Connection, Result as SqliteResult};
use std::path::Path;
use std::str::FromStr;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `database_url`. `":memory:"` gives a
    /// private in-memory database.
    pub fn new(database_url: &str) -> SqliteResult<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = Path::new(database_url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let conn = Connection::open(database_url)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init(&self) -> SqliteResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        // Cron jobs
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cron_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                cron_expression TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                prompt TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                max_retries INTEGER NOT NULL DEFAULT 0,
                timeout_ms INTEGER NOT NULL,
                last_run_at TEXT,
                next_run_at TEXT,
                run_count INTEGER NOT NULL DEFAULT 0,
                last_status TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cron_jobs_owner ON cron_jobs(owner_user_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cron_jobs_status ON cron_jobs(last_status, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cron_jobs_due ON cron_jobs(enabled, next_run_at)",
            [],
        )?;

        // Execution ledger
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cron_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cron_job_id INTEGER NOT NULL REFERENCES cron_jobs(id) ON DELETE CASCADE,
                owner_user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER,
                output_summary TEXT,
                error TEXT,
                error_kind TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                tool_calls_count INTEGER NOT NULL DEFAULT 0,
                sub_agent_id TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cron_executions_owner ON cron_executions(owner_user_id, started_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cron_executions_status ON cron_executions(status, started_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cron_executions_job ON cron_executions(cron_job_id, started_at)",
            [],
        )?;
        // At most one running execution per job
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_cron_executions_one_running
             ON cron_executions(cron_job_id) WHERE status = 'running'",
            [],
        )?;

        // Task queue
        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_user_id TEXT NOT NULL,
                conversation_id TEXT,
                parent_task_id INTEGER REFERENCES agent_tasks(id) ON DELETE SET NULL,
                title TEXT NOT NULL,
                input TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                priority INTEGER NOT NULL DEFAULT 0,
                assigned_sub_agent_id TEXT,
                timeout_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                result_summary TEXT,
                result_full TEXT,
                error TEXT,
                artifacts TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_tasks_owner ON agent_tasks(owner_user_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_tasks_status ON agent_tasks(status, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_tasks_claim ON agent_tasks(status, priority, created_at, id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_tasks_parent ON agent_tasks(parent_task_id)",
            [],
        )?;

        // Sub-agent registry
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sub_agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sub_agent_id TEXT UNIQUE NOT NULL,
                parent_session_id TEXT,
                owner_user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'idle',
                assigned_task TEXT NOT NULL,
                task_result TEXT,
                error TEXT,
                step_count INTEGER NOT NULL DEFAULT 0,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sub_agents_owner ON sub_agents(owner_user_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sub_agents_status ON sub_agents(status, created_at)",
            [],
        )?;

        Ok(())
    }
}

/// Timestamps are stored with fixed millisecond precision so that string
/// comparison in SQL matches chronological order.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> SqliteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a nullable timestamp column
pub(crate) fn get_opt_ts(row: &rusqlite::Row, idx: usize) -> SqliteResult<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_ts(idx, &raw).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn get_ts(row: &rusqlite::Row, idx: usize) -> SqliteResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

/// Read a text column holding a strum-serialized enum
pub(crate) fn get_enum<T>(row: &rusqlite::Row, idx: usize) -> SqliteResult<T>
where
    T: FromStr<Err = strum::ParseError>,
{
    let raw: String = row.get(idx)?;
    T::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn get_opt_enum<T>(row: &rusqlite::Row, idx: usize) -> SqliteResult<Option<T>>
where
    T: FromStr<Err = strum::ParseError>,
{
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => T::from_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}
