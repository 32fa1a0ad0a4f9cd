//! Execution ledger: one row per cron job run

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::super::{fmt_ts, get_enum, get_opt_enum, get_opt_ts, get_ts, Database, ScopedQuery, TenantScope};
use super::cron_jobs::{map_cron_job_row, CRON_JOB_COLUMNS};
use crate::error::{OrchestratorError, Result};
use crate::models::{CronExecution, CronJob, ExecutionOutcome, ExecutionStatus, FailureKind};
use crate::scheduler::cron_eval;

const EXECUTION_COLUMNS: &str = "id, cron_job_id, owner_user_id, status, started_at, completed_at, duration_ms,
     output_summary, error, error_kind, attempts, input_tokens, output_tokens, tool_calls_count, sub_agent_id";

fn map_execution_row(row: &rusqlite::Row) -> rusqlite::Result<CronExecution> {
    Ok(CronExecution {
        id: row.get(0)?,
        cron_job_id: row.get(1)?,
        owner_user_id: row.get(2)?,
        status: get_enum(row, 3)?,
        started_at: get_ts(row, 4)?,
        completed_at: get_opt_ts(row, 5)?,
        duration_ms: row.get(6)?,
        output_summary: row.get(7)?,
        error: row.get(8)?,
        error_kind: get_opt_enum(row, 9)?,
        attempts: row.get(10)?,
        input_tokens: row.get(11)?,
        output_tokens: row.get(12)?,
        tool_calls_count: row.get(13)?,
        sub_agent_id: row.get(14)?,
    })
}

/// How a claim was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimTrigger {
    /// Regular tick: the job must still be enabled and due
    Schedule,
    /// Manual "run now": only the running-execution check applies
    Manual,
}

impl Database {
    /// Atomically claim a job for execution.
    ///
    /// In one immediate transaction: re-check that no execution is running,
    /// insert the `running` execution and advance the job's `last_run_at`,
    /// `next_run_at` and `last_status`. Losing a race to another claimer
    /// yields `ClaimConflict`.
    pub fn claim_cron_job(
        &self,
        job_id: i64,
        trigger: ClaimTrigger,
        now: DateTime<Utc>,
    ) -> Result<(CronJob, CronExecution)> {
        let system = TenantScope::system();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = ScopedQuery::new(&system, format!("SELECT {} FROM cron_jobs", CRON_JOB_COLUMNS))
            .and_where("id = ?", job_id)
            .query_row(&tx, map_cron_job_row)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Cron job {}", job_id)))?;

        if trigger == ClaimTrigger::Schedule && !job.is_due(now) {
            return Err(OrchestratorError::ClaimConflict(job_id));
        }

        let running: Option<i64> = tx
            .query_row(
                "SELECT id FROM cron_executions WHERE cron_job_id = ?1 AND status = 'running'",
                [job_id],
                |row| row.get(0),
            )
            .optional()?;
        if running.is_some() {
            return Err(OrchestratorError::ClaimConflict(job_id));
        }

        let now_str = fmt_ts(now);
        let inserted = tx.execute(
            "INSERT INTO cron_executions (cron_job_id, owner_user_id, status, started_at, attempts)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![job_id, job.owner_user_id, ExecutionStatus::Running.to_string(), now_str],
        );
        if let Err(e) = inserted {
            let err = OrchestratorError::from(e);
            return Err(if err.is_constraint_violation() {
                OrchestratorError::ClaimConflict(job_id)
            } else {
                err
            });
        }
        let execution_id = tx.last_insert_rowid();

        let next_run_at = if job.enabled {
            match cron_eval::next_fire_time(&job.cron_expression, &job.timezone, now) {
                Ok(next) => Some(fmt_ts(next)),
                Err(e) => {
                    log::error!("[SCHEDULER] Job {} has an unusable schedule: {}", job_id, e);
                    None
                }
            }
        } else {
            None
        };

        tx.execute(
            "UPDATE cron_jobs SET last_run_at = ?1, next_run_at = ?2, last_status = ?3, updated_at = ?1
             WHERE id = ?4",
            params![now_str, next_run_at, ExecutionStatus::Running.to_string(), job_id],
        )?;

        let job = ScopedQuery::new(&system, format!("SELECT {} FROM cron_jobs", CRON_JOB_COLUMNS))
            .and_where("id = ?", job_id)
            .query_row(&tx, map_cron_job_row)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Cron job {}", job_id)))?;
        let execution = ScopedQuery::new(&system, format!("SELECT {} FROM cron_executions", EXECUTION_COLUMNS))
            .and_where("id = ?", execution_id)
            .query_row(&tx, map_execution_row)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Execution {}", execution_id)))?;

        tx.commit()?;
        Ok((job, execution))
    }

    /// Link the sub-agent that performs a run
    pub fn set_execution_sub_agent(&self, execution_id: i64, sub_agent_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE cron_executions SET sub_agent_id = ?1 WHERE id = ?2",
            params![sub_agent_id, execution_id],
        )?;
        Ok(())
    }

    /// Resolve a running execution and fold the result into its job.
    ///
    /// Compare-and-set from `running`: returns `false` if the row was already
    /// resolved (e.g. by the orphan sweep). `next_run_at` is never touched here.
    pub fn complete_cron_execution(
        &self,
        execution_id: i64,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(i64, String)> = tx
            .query_row(
                "SELECT cron_job_id, started_at FROM cron_executions WHERE id = ?1 AND status = 'running'",
                [execution_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((job_id, started_at)) = row else {
            return Ok(false);
        };

        let duration_ms = DateTime::parse_from_rfc3339(&started_at)
            .map(|started| (now - started.with_timezone(&Utc)).num_milliseconds().max(0))
            .ok();
        let status = if outcome.success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        let now_str = fmt_ts(now);

        tx.execute(
            "UPDATE cron_executions SET status = ?1, completed_at = ?2, duration_ms = ?3, output_summary = ?4,
                error = ?5, error_kind = ?6, attempts = ?7, input_tokens = ?8, output_tokens = ?9,
                tool_calls_count = ?10
             WHERE id = ?11 AND status = 'running'",
            params![
                status.to_string(),
                now_str,
                duration_ms,
                outcome.output_summary,
                outcome.error,
                outcome.error_kind.map(|k| k.to_string()),
                outcome.attempts,
                outcome.input_tokens,
                outcome.output_tokens,
                outcome.tool_calls_count,
                execution_id,
            ],
        )?;

        tx.execute(
            "UPDATE cron_jobs SET run_count = run_count + 1, last_status = ?1, last_error = ?2, updated_at = ?3
             WHERE id = ?4",
            params![
                status.to_string(),
                if outcome.success { None } else { outcome.error.clone() },
                now_str,
                job_id
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    pub fn get_cron_execution(&self, scope: &TenantScope, id: i64) -> Result<Option<CronExecution>> {
        let conn = self.conn();
        let execution = ScopedQuery::new(scope, format!("SELECT {} FROM cron_executions", EXECUTION_COLUMNS))
            .and_where("id = ?", id)
            .query_row(&conn, map_execution_row)?;
        Ok(execution)
    }

    /// Newest first, optionally for one job
    pub fn list_cron_executions(
        &self,
        scope: &TenantScope,
        job_id: Option<i64>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CronExecution>> {
        let conn = self.conn();
        let executions = ScopedQuery::new(scope, format!("SELECT {} FROM cron_executions", EXECUTION_COLUMNS))
            .and_where_opt("cron_job_id = ?", job_id)
            .order_by("started_at DESC, id DESC")
            .page(limit, offset)
            .query_map(&conn, map_execution_row)?;
        Ok(executions)
    }

    /// Currently running executions across all tenants
    pub fn list_running_cron_executions(&self) -> Result<Vec<CronExecution>> {
        let system = TenantScope::system();
        let conn = self.conn();
        let executions = ScopedQuery::new(&system, format!("SELECT {} FROM cron_executions", EXECUTION_COLUMNS))
            .and_where("status = ?", ExecutionStatus::Running.to_string())
            .order_by("started_at ASC")
            .query_map(&conn, map_execution_row)?;
        Ok(executions)
    }

    /// Fail executions left `running` by a previous process. Safe to repeat.
    pub fn fail_orphaned_cron_executions(&self, now: DateTime<Utc>) -> Result<usize> {
        let system = TenantScope::system();
        let now_str = fmt_ts(now);
        let conn = self.conn();
        let count = ScopedQuery::new(
            &system,
            "UPDATE cron_executions SET status = ?, completed_at = ?,
                duration_ms = MAX(0, CAST(ROUND((julianday(?) - julianday(started_at)) * 86400000) AS INTEGER)),
                error = ?, error_kind = ?",
        )
        .bind(ExecutionStatus::Failed.to_string())
        .bind(now_str.clone())
        .bind(now_str)
        .bind("Interrupted: process stopped while the run was in flight".to_string())
        .bind(FailureKind::Interrupted.to_string())
        .and_where("status = ?", ExecutionStatus::Running.to_string())
        .execute(&conn)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::super::cron_jobs::tests::{defaults, job_request};
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn setup() -> (Database, TenantScope, CronJob) {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        let job = db
            .create_cron_job(&alice, &job_request("digest", "0 9 * * *"), defaults(), at(8, 0, 0))
            .unwrap();
        (db, alice, job)
    }

    #[test]
    fn test_claim_advances_schedule() {
        let (db, _, job) = setup();
        let (claimed, execution) = db
            .claim_cron_job(job.id, ClaimTrigger::Schedule, at(9, 0, 1))
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(execution.owner_user_id, "alice");
        assert_eq!(claimed.last_run_at, Some(at(9, 0, 1)));
        assert_eq!(
            claimed.next_run_at,
            Some(cron_eval::next_fire_time("0 9 * * *", "UTC", at(9, 0, 1)).unwrap())
        );
        assert_eq!(claimed.last_status, Some(ExecutionStatus::Running));
    }

    #[test]
    fn test_second_claim_conflicts() {
        let (db, _, job) = setup();
        db.claim_cron_job(job.id, ClaimTrigger::Schedule, at(9, 0, 1)).unwrap();
        assert!(matches!(
            db.claim_cron_job(job.id, ClaimTrigger::Manual, at(9, 0, 2)),
            Err(OrchestratorError::ClaimConflict(_))
        ));
        assert_eq!(db.list_running_cron_executions().unwrap().len(), 1);
    }

    #[test]
    fn test_schedule_claim_requires_due_job() {
        let (db, _, job) = setup();
        assert!(matches!(
            db.claim_cron_job(job.id, ClaimTrigger::Schedule, at(8, 30, 0)),
            Err(OrchestratorError::ClaimConflict(_))
        ));
        // A manual run ignores the schedule
        assert!(db.claim_cron_job(job.id, ClaimTrigger::Manual, at(8, 30, 0)).is_ok());
    }

    #[test]
    fn test_unique_index_blocks_second_running_row() {
        let (db, _, job) = setup();
        db.claim_cron_job(job.id, ClaimTrigger::Schedule, at(9, 0, 1)).unwrap();
        let conn = db.conn();
        let err = conn
            .execute(
                "INSERT INTO cron_executions (cron_job_id, owner_user_id, status, started_at)
                 VALUES (?1, 'alice', 'running', '2024-01-01T09:00:02.000Z')",
                [job.id],
            )
            .unwrap_err();
        assert!(OrchestratorError::from(err).is_constraint_violation());
    }

    #[test]
    fn test_completion_updates_job_but_not_next_run() {
        let (db, alice, job) = setup();
        let (claimed, execution) = db
            .claim_cron_job(job.id, ClaimTrigger::Schedule, at(9, 0, 1))
            .unwrap();
        let outcome = ExecutionOutcome {
            success: true,
            output_summary: Some("done".to_string()),
            attempts: 1,
            input_tokens: 10,
            output_tokens: 5,
            tool_calls_count: 2,
            ..Default::default()
        };
        assert!(db.complete_cron_execution(execution.id, &outcome, at(9, 0, 3)).unwrap());
        // Already resolved: no second write
        assert!(!db.complete_cron_execution(execution.id, &outcome, at(9, 0, 4)).unwrap());

        let done = db.get_cron_execution(&alice, execution.id).unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.duration_ms, Some(2_000));
        assert_eq!(done.output_summary.as_deref(), Some("done"));
        assert_eq!(done.tool_calls_count, 2);

        let job = db.get_cron_job(&alice, job.id).unwrap().unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.last_status, Some(ExecutionStatus::Success));
        assert_eq!(job.next_run_at, claimed.next_run_at);
    }

    #[test]
    fn test_failure_records_error() {
        let (db, alice, job) = setup();
        let (_, execution) = db.claim_cron_job(job.id, ClaimTrigger::Manual, at(9, 0, 0)).unwrap();
        let outcome = ExecutionOutcome {
            success: false,
            error: Some("boom".to_string()),
            error_kind: Some(FailureKind::AgentError),
            attempts: 3,
            ..Default::default()
        };
        db.complete_cron_execution(execution.id, &outcome, at(9, 1, 0)).unwrap();
        let job = db.get_cron_job(&alice, job.id).unwrap().unwrap();
        assert_eq!(job.last_status, Some(ExecutionStatus::Failed));
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        let failed = db.get_cron_execution(&alice, execution.id).unwrap().unwrap();
        assert_eq!(failed.error_kind, Some(FailureKind::AgentError));
        assert_eq!(failed.attempts, 3);
    }

    #[test]
    fn test_delete_rejected_while_running_then_cascades() {
        let (db, alice, job) = setup();
        let (_, execution) = db.claim_cron_job(job.id, ClaimTrigger::Manual, at(9, 0, 0)).unwrap();
        assert!(matches!(db.delete_cron_job(&alice, job.id), Err(OrchestratorError::Conflict(_))));

        db.complete_cron_execution(execution.id, &ExecutionOutcome { success: true, ..Default::default() }, at(9, 0, 1))
            .unwrap();
        db.delete_cron_job(&alice, job.id).unwrap();
        assert!(db.get_cron_execution(&alice, execution.id).unwrap().is_none());
    }

    #[test]
    fn test_orphan_sweep_is_idempotent() {
        let (db, alice, job) = setup();
        let (_, execution) = db.claim_cron_job(job.id, ClaimTrigger::Manual, at(9, 0, 0)).unwrap();

        assert_eq!(db.fail_orphaned_cron_executions(at(9, 5, 0)).unwrap(), 1);
        assert_eq!(db.fail_orphaned_cron_executions(at(9, 6, 0)).unwrap(), 0);

        let swept = db.get_cron_execution(&alice, execution.id).unwrap().unwrap();
        assert_eq!(swept.status, ExecutionStatus::Failed);
        assert_eq!(swept.error_kind, Some(FailureKind::Interrupted));
        assert_eq!(swept.completed_at, Some(at(9, 5, 0)));
        assert_eq!(swept.duration_ms, Some(300_000));
    }

    #[test]
    fn test_executions_are_tenant_scoped() {
        let (db, alice, job) = setup();
        db.claim_cron_job(job.id, ClaimTrigger::Manual, at(9, 0, 0)).unwrap();
        let bob = TenantScope::user("bob").unwrap();
        assert!(db.list_cron_executions(&bob, None, 50, 0).unwrap().is_empty());
        assert_eq!(db.list_cron_executions(&alice, Some(job.id), 50, 0).unwrap().len(), 1);
        assert!(db.list_cron_executions(&alice, Some(job.id + 1), 50, 0).unwrap().is_empty());
    }
}
