//! Cron job database operations

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::super::{fmt_ts, get_opt_enum, get_opt_ts, get_ts, Database, ScopedQuery, TenantScope};
use crate::error::{OrchestratorError, Result};
use crate::models::{CreateCronJobRequest, CronJob, ExecutionStatus, UpdateCronJobRequest};
use crate::scheduler::cron_eval;

pub(crate) const CRON_JOB_COLUMNS: &str = "id, owner_user_id, name, description, cron_expression, timezone, prompt,
     enabled, max_retries, timeout_ms, last_run_at, next_run_at, run_count, last_status, last_error,
     created_at, updated_at";

/// Values applied when a create request leaves them out
#[derive(Debug, Clone, Copy)]
pub struct CronJobDefaults {
    pub timeout_ms: u64,
    pub max_retries: u32,
}

pub(crate) fn map_cron_job_row(row: &rusqlite::Row) -> rusqlite::Result<CronJob> {
    Ok(CronJob {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        cron_expression: row.get(4)?,
        timezone: row.get(5)?,
        prompt: row.get(6)?,
        enabled: row.get::<_, i32>(7)? != 0,
        max_retries: row.get(8)?,
        timeout_ms: row.get::<_, i64>(9)?.max(0) as u64,
        last_run_at: get_opt_ts(row, 10)?,
        next_run_at: get_opt_ts(row, 11)?,
        run_count: row.get(12)?,
        last_status: get_opt_enum(row, 13)?,
        last_error: row.get(14)?,
        created_at: get_ts(row, 15)?,
        updated_at: get_ts(row, 16)?,
    })
}

/// `next_run_at` for a job in the given state
fn schedule_next(
    enabled: bool,
    expression: &str,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    if !enabled {
        return Ok(None);
    }
    cron_eval::next_fire_time(expression, timezone, now).map(|next| Some(fmt_ts(next)))
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(OrchestratorError::InvalidRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

impl Database {
    /// Create a cron job owned by the scope's tenant.
    ///
    /// The schedule is validated here, so a bad expression never reaches the engine.
    pub fn create_cron_job(
        &self,
        scope: &TenantScope,
        request: &CreateCronJobRequest,
        defaults: CronJobDefaults,
        now: DateTime<Utc>,
    ) -> Result<CronJob> {
        require_text("name", &request.name)?;
        require_text("prompt", &request.prompt)?;
        super::require_timeout(request.timeout_ms)?;
        let timezone = if request.timezone.trim().is_empty() {
            "UTC".to_string()
        } else {
            request.timezone.trim().to_string()
        };
        let expression = request.cron_expression.trim();
        cron_eval::validate(expression, &timezone)?;
        let next_run_at = schedule_next(request.enabled, expression, &timezone, now)?;

        let conn = self.conn();
        let now_str = fmt_ts(now);
        conn.execute(
            "INSERT INTO cron_jobs (owner_user_id, name, description, cron_expression, timezone, prompt,
                enabled, max_retries, timeout_ms, next_run_at, run_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)",
            params![
                scope.owner_user_id(),
                request.name.trim(),
                request.description,
                expression,
                timezone,
                request.prompt,
                request.enabled as i32,
                request.max_retries.unwrap_or(defaults.max_retries),
                request.timeout_ms.unwrap_or(defaults.timeout_ms) as i64,
                next_run_at,
                now_str,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        log::info!(
            "[SCHEDULER] Created cron job {} '{}' for {} ({})",
            id,
            request.name.trim(),
            scope.owner_user_id(),
            expression
        );
        self.get_cron_job(scope, id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Cron job {}", id)))
    }

    pub fn get_cron_job(&self, scope: &TenantScope, id: i64) -> Result<Option<CronJob>> {
        let conn = self.conn();
        let job = ScopedQuery::new(scope, format!("SELECT {} FROM cron_jobs", CRON_JOB_COLUMNS))
            .and_where("id = ?", id)
            .query_row(&conn, map_cron_job_row)?;
        Ok(job)
    }

    pub fn list_cron_jobs(&self, scope: &TenantScope, limit: u32, offset: u32) -> Result<Vec<CronJob>> {
        let conn = self.conn();
        let jobs = ScopedQuery::new(scope, format!("SELECT {} FROM cron_jobs", CRON_JOB_COLUMNS))
            .order_by("created_at DESC, id DESC")
            .page(limit, offset)
            .query_map(&conn, map_cron_job_row)?;
        Ok(jobs)
    }

    /// Enabled jobs whose `next_run_at` has passed and that have no running execution
    pub fn list_due_cron_jobs(&self, now: DateTime<Utc>) -> Result<Vec<CronJob>> {
        let system = TenantScope::system();
        let conn = self.conn();
        let jobs = ScopedQuery::new(&system, format!("SELECT {} FROM cron_jobs", CRON_JOB_COLUMNS))
            .filter("enabled = 1")
            .and_where("next_run_at IS NOT NULL AND next_run_at <= ?", fmt_ts(now))
            .filter(
                "NOT EXISTS (SELECT 1 FROM cron_executions e
                             WHERE e.cron_job_id = cron_jobs.id AND e.status = 'running')",
            )
            .order_by("next_run_at ASC, id ASC")
            .query_map(&conn, map_cron_job_row)?;
        Ok(jobs)
    }

    /// `(total, enabled)` job counts visible to the scope
    pub fn count_cron_jobs(&self, scope: &TenantScope) -> Result<(i64, i64)> {
        let conn = self.conn();
        let total = ScopedQuery::new(scope, "SELECT COUNT(*) FROM cron_jobs").count(&conn)?;
        let enabled = ScopedQuery::new(scope, "SELECT COUNT(*) FROM cron_jobs")
            .filter("enabled = 1")
            .count(&conn)?;
        Ok((total, enabled))
    }

    /// Apply a partial update. Changing the schedule or the enabled flag
    /// recomputes `next_run_at` from `now`; disabling clears it.
    pub fn update_cron_job(
        &self,
        scope: &TenantScope,
        id: i64,
        request: &UpdateCronJobRequest,
        now: DateTime<Utc>,
    ) -> Result<CronJob> {
        let current = self
            .get_cron_job(scope, id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Cron job {}", id)))?;

        if let Some(name) = &request.name {
            require_text("name", name)?;
        }
        if let Some(prompt) = &request.prompt {
            require_text("prompt", prompt)?;
        }
        super::require_timeout(request.timeout_ms)?;

        let expression = request
            .cron_expression
            .as_deref()
            .map(str::trim)
            .unwrap_or(&current.cron_expression)
            .to_string();
        let timezone = request
            .timezone
            .as_deref()
            .map(str::trim)
            .filter(|tz| !tz.is_empty())
            .unwrap_or(&current.timezone)
            .to_string();
        let enabled = request.enabled.unwrap_or(current.enabled);

        let schedule_changed = expression != current.cron_expression
            || timezone != current.timezone
            || enabled != current.enabled;
        if schedule_changed {
            cron_eval::validate(&expression, &timezone)?;
        }

        let mut sql = String::from(
            "UPDATE cron_jobs SET name = ?, description = ?, cron_expression = ?, timezone = ?,
                prompt = ?, enabled = ?, max_retries = ?, timeout_ms = ?, updated_at = ?",
        );
        if schedule_changed {
            sql.push_str(", next_run_at = ?");
        }
        let mut query = ScopedQuery::new(scope, sql)
            .bind(request.name.as_deref().map(str::trim).unwrap_or(&current.name).to_string())
            .bind(request.description.clone().or(current.description.clone()))
            .bind(expression.clone())
            .bind(timezone.clone())
            .bind(request.prompt.clone().unwrap_or(current.prompt.clone()))
            .bind(enabled as i32)
            .bind(request.max_retries.unwrap_or(current.max_retries))
            .bind(request.timeout_ms.unwrap_or(current.timeout_ms) as i64)
            .bind(fmt_ts(now));
        if schedule_changed {
            query = query.bind(schedule_next(enabled, &expression, &timezone, now)?);
        }

        query.and_where("id = ?", id).execute(&self.conn())?;

        if enabled != current.enabled {
            log::info!(
                "[SCHEDULER] Cron job {} {}",
                id,
                if enabled { "resumed" } else { "paused" }
            );
        }
        self.get_cron_job(scope, id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Cron job {}", id)))
    }

    /// Pause or resume a job
    pub fn set_cron_job_enabled(
        &self,
        scope: &TenantScope,
        id: i64,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<CronJob> {
        let request = UpdateCronJobRequest {
            enabled: Some(enabled),
            ..Default::default()
        };
        self.update_cron_job(scope, id, &request, now)
    }

    /// Delete a job and (by cascade) its executions. Rejected while a run is in flight.
    pub fn delete_cron_job(&self, scope: &TenantScope, id: i64) -> Result<()> {
        let conn = self.conn();
        let exists = ScopedQuery::new(scope, "SELECT COUNT(*) FROM cron_jobs")
            .and_where("id = ?", id)
            .count(&conn)?;
        if exists == 0 {
            return Err(OrchestratorError::NotFound(format!("Cron job {}", id)));
        }

        let running: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cron_executions WHERE cron_job_id = ?1 AND status = 'running'",
            [id],
            |row| row.get(0),
        )?;
        if running > 0 {
            return Err(OrchestratorError::Conflict(format!(
                "Cron job {} has a running execution",
                id
            )));
        }

        ScopedQuery::new(scope, "DELETE FROM cron_jobs")
            .and_where("id = ?", id)
            .execute(&conn)?;
        log::info!("[SCHEDULER] Deleted cron job {}", id);
        Ok(())
    }

    /// Jobs left on `last_status = running` by a previous process
    pub fn reset_interrupted_cron_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let system = TenantScope::system();
        let conn = self.conn();
        let count = ScopedQuery::new(
            &system,
            "UPDATE cron_jobs SET last_status = ?, last_error = ?, updated_at = ?",
        )
        .bind(ExecutionStatus::Failed.to_string())
        .bind("Interrupted by restart".to_string())
        .bind(fmt_ts(now))
        .and_where("last_status = ?", ExecutionStatus::Running.to_string())
        .execute(&conn)?;
        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn defaults() -> CronJobDefaults {
        CronJobDefaults {
            timeout_ms: 60_000,
            max_retries: 0,
        }
    }

    pub(crate) fn job_request(name: &str, expression: &str) -> CreateCronJobRequest {
        CreateCronJobRequest {
            name: name.to_string(),
            description: None,
            cron_expression: expression.to_string(),
            timezone: "UTC".to_string(),
            prompt: format!("run {}", name),
            enabled: true,
            max_retries: None,
            timeout_ms: None,
        }
    }

    fn jan1(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_create_computes_next_run() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        let job = db
            .create_cron_job(&alice, &job_request("digest", "0 9 * * *"), defaults(), jan1(8, 0))
            .unwrap();
        assert_eq!(job.owner_user_id, "alice");
        assert_eq!(job.next_run_at, Some(jan1(9, 0)));
        assert_eq!(job.timeout_ms, 60_000);
        assert_eq!(job.run_count, 0);
        assert!(job.last_status.is_none());
    }

    #[test]
    fn test_create_rejects_bad_schedule() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        let err = db
            .create_cron_job(&alice, &job_request("bad", "0 25 * * *"), defaults(), jan1(8, 0))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidScheduleExpression(_)));

        let mut req = job_request("bad-tz", "0 9 * * *");
        req.timezone = "Nowhere/City".to_string();
        assert!(db.create_cron_job(&alice, &req, defaults(), jan1(8, 0)).is_err());
        assert!(db.list_cron_jobs(&alice, 50, 0).unwrap().is_empty());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        let mut req = job_request("instant", "0 9 * * *");
        req.timeout_ms = Some(0);
        assert!(matches!(
            db.create_cron_job(&alice, &req, defaults(), jan1(8, 0)),
            Err(OrchestratorError::InvalidRequest(_))
        ));

        let job = db
            .create_cron_job(&alice, &job_request("digest", "0 9 * * *"), defaults(), jan1(8, 0))
            .unwrap();
        let update = UpdateCronJobRequest {
            timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            db.update_cron_job(&alice, job.id, &update, jan1(8, 30)),
            Err(OrchestratorError::InvalidRequest(_))
        ));
        assert_eq!(db.get_cron_job(&alice, job.id).unwrap().unwrap().timeout_ms, 60_000);
    }

    #[test]
    fn test_disable_clears_and_enable_recomputes_next_run() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        let job = db
            .create_cron_job(&alice, &job_request("digest", "0 9 * * *"), defaults(), jan1(8, 0))
            .unwrap();

        let paused = db.set_cron_job_enabled(&alice, job.id, false, jan1(8, 30)).unwrap();
        assert!(!paused.enabled);
        assert!(paused.next_run_at.is_none());
        assert!(db.list_due_cron_jobs(jan1(10, 0)).unwrap().is_empty());

        let resumed = db.set_cron_job_enabled(&alice, job.id, true, jan1(10, 0)).unwrap();
        assert_eq!(
            resumed.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_update_keeps_next_run_when_schedule_unchanged() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        let job = db
            .create_cron_job(&alice, &job_request("digest", "0 9 * * *"), defaults(), jan1(8, 0))
            .unwrap();
        let req = UpdateCronJobRequest {
            prompt: Some("new prompt".to_string()),
            ..Default::default()
        };
        let updated = db.update_cron_job(&alice, job.id, &req, jan1(8, 45)).unwrap();
        assert_eq!(updated.prompt, "new prompt");
        assert_eq!(updated.next_run_at, job.next_run_at);

        let req = UpdateCronJobRequest {
            cron_expression: Some("30 8 * * *".to_string()),
            ..Default::default()
        };
        let updated = db.update_cron_job(&alice, job.id, &req, jan1(8, 45)).unwrap();
        assert_eq!(
            updated.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_due_jobs() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        db.create_cron_job(&alice, &job_request("nine", "0 9 * * *"), defaults(), jan1(8, 0))
            .unwrap();
        db.create_cron_job(&alice, &job_request("ten", "0 10 * * *"), defaults(), jan1(8, 0))
            .unwrap();

        assert!(db.list_due_cron_jobs(jan1(8, 59)).unwrap().is_empty());
        let due = db.list_due_cron_jobs(jan1(9, 0)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "nine");
        assert_eq!(db.list_due_cron_jobs(jan1(10, 5)).unwrap().len(), 2);
    }

    #[test]
    fn test_tenant_isolation() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        let bob = TenantScope::user("bob").unwrap();
        let job = db
            .create_cron_job(&alice, &job_request("digest", "0 9 * * *"), defaults(), jan1(8, 0))
            .unwrap();

        assert!(db.get_cron_job(&bob, job.id).unwrap().is_none());
        assert!(db.list_cron_jobs(&bob, 50, 0).unwrap().is_empty());
        assert!(matches!(
            db.set_cron_job_enabled(&bob, job.id, false, jan1(8, 0)),
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(db.delete_cron_job(&bob, job.id), Err(OrchestratorError::NotFound(_))));
        assert_eq!(db.count_cron_jobs(&bob).unwrap(), (0, 0));
        assert_eq!(db.count_cron_jobs(&alice).unwrap(), (1, 1));

        let admin = TenantScope::new("ops", true).unwrap();
        assert!(db.get_cron_job(&admin, job.id).unwrap().is_some());
    }

    #[test]
    fn test_delete() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        let job = db
            .create_cron_job(&alice, &job_request("digest", "0 9 * * *"), defaults(), jan1(8, 0))
            .unwrap();
        db.delete_cron_job(&alice, job.id).unwrap();
        assert!(db.get_cron_job(&alice, job.id).unwrap().is_none());
    }
}
