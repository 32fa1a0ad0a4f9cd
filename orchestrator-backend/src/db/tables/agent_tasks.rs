//! Priority task queue with parent/child decomposition

use chrono::{DateTime, Utc};
use rusqlite::{params, TransactionBehavior};

use super::super::{fmt_ts, get_enum, get_opt_ts, get_ts, Database, ScopedQuery, TenantScope};
use crate::error::{OrchestratorError, Result};
use crate::models::{AgentTask, EnqueueTaskRequest, TaskResult, TaskStatus};

const TASK_COLUMNS: &str = "id, owner_user_id, conversation_id, parent_task_id, title, input, status, priority,
     assigned_sub_agent_id, timeout_ms, created_at, started_at, completed_at, result_summary, result_full,
     error, artifacts";

/// Claim order: lowest priority value, then oldest, then lowest id
const CLAIM_ORDER: &str = "priority ASC, created_at ASC, id ASC";

/// Longest `result_summary` kept on the task row
pub const RESULT_SUMMARY_MAX_CHARS: usize = 2_000;

fn map_task_row(row: &rusqlite::Row) -> rusqlite::Result<AgentTask> {
    let artifacts: String = row.get(16)?;
    Ok(AgentTask {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        conversation_id: row.get(2)?,
        parent_task_id: row.get(3)?,
        title: row.get(4)?,
        input: row.get(5)?,
        status: get_enum(row, 6)?,
        priority: row.get(7)?,
        assigned_sub_agent_id: row.get(8)?,
        timeout_ms: row.get::<_, i64>(9)?.max(0) as u64,
        created_at: get_ts(row, 10)?,
        started_at: get_opt_ts(row, 11)?,
        completed_at: get_opt_ts(row, 12)?,
        result_summary: row.get(13)?,
        result_full: row.get(14)?,
        error: row.get(15)?,
        artifacts: serde_json::from_str(&artifacts).unwrap_or(serde_json::Value::Null),
    })
}

/// Cut `s` to at most `max_chars` characters on a char boundary
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

impl Database {
    /// Add a task to the queue, owned by the scope's tenant.
    ///
    /// The parent, if any, must already exist and belong to the same tenant,
    /// which keeps the task tree acyclic.
    pub fn enqueue_task(
        &self,
        scope: &TenantScope,
        request: &EnqueueTaskRequest,
        default_timeout_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<AgentTask> {
        if request.title.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest("title must not be empty".to_string()));
        }
        if request.input.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest("input must not be empty".to_string()));
        }
        super::require_timeout(request.timeout_ms)?;

        let conn = self.conn();
        if let Some(parent_id) = request.parent_task_id {
            let parent_owner: Option<String> = ScopedQuery::new(scope, "SELECT owner_user_id FROM agent_tasks")
                .and_where("id = ?", parent_id)
                .query_row(&conn, |row| row.get(0))?;
            match parent_owner {
                Some(owner) if owner == scope.owner_user_id() => {}
                _ => {
                    return Err(OrchestratorError::NotFound(format!("Parent task {}", parent_id)));
                }
            }
        }

        conn.execute(
            "INSERT INTO agent_tasks (owner_user_id, conversation_id, parent_task_id, title, input, status,
                priority, timeout_ms, created_at, artifacts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, '{}')",
            params![
                scope.owner_user_id(),
                request.conversation_id,
                request.parent_task_id,
                request.title.trim(),
                request.input,
                TaskStatus::Queued.to_string(),
                request.priority,
                request.timeout_ms.unwrap_or(default_timeout_ms) as i64,
                fmt_ts(now),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        log::info!(
            "[TASK_QUEUE] Enqueued task {} '{}' (priority {}) for {}",
            id,
            request.title.trim(),
            request.priority,
            scope.owner_user_id()
        );
        self.get_task(scope, id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Task {}", id)))
    }

    /// Move the next queued task to `running`, or `None` if nothing is queued
    /// or there is no free worker.
    pub fn claim_next_task(&self, worker_capacity: usize, now: DateTime<Utc>) -> Result<Option<AgentTask>> {
        if worker_capacity == 0 {
            return Ok(None);
        }

        let system = TenantScope::system();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let next_id: Option<i64> = ScopedQuery::new(&system, "SELECT id FROM agent_tasks")
            .and_where("status = ?", TaskStatus::Queued.to_string())
            .order_by(CLAIM_ORDER)
            .page(1, 0)
            .query_row(&tx, |row| row.get(0))?;
        let Some(task_id) = next_id else {
            return Ok(None);
        };

        let updated = ScopedQuery::new(&system, "UPDATE agent_tasks SET status = ?, started_at = ?")
            .bind(TaskStatus::Running.to_string())
            .bind(fmt_ts(now))
            .and_where("id = ?", task_id)
            .and_where("status = ?", TaskStatus::Queued.to_string())
            .execute(&tx)?;
        if updated == 0 {
            return Ok(None);
        }

        let task = ScopedQuery::new(&system, format!("SELECT {} FROM agent_tasks", TASK_COLUMNS))
            .and_where("id = ?", task_id)
            .query_row(&tx, map_task_row)?;
        tx.commit()?;
        Ok(task)
    }

    pub fn assign_task_sub_agent(&self, task_id: i64, sub_agent_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE agent_tasks SET assigned_sub_agent_id = ?1 WHERE id = ?2",
            params![sub_agent_id, task_id],
        )?;
        Ok(())
    }

    /// `running -> completed`. Returns `false` if the task was no longer running.
    pub fn complete_task(&self, task_id: i64, result: &TaskResult, now: DateTime<Utc>) -> Result<bool> {
        let artifacts = result
            .artifacts
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "{}".to_string());
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE agent_tasks SET status = ?1, completed_at = ?2, result_summary = ?3, result_full = ?4,
                artifacts = ?5
             WHERE id = ?6 AND status = ?7",
            params![
                TaskStatus::Completed.to_string(),
                fmt_ts(now),
                truncate_chars(&result.summary, RESULT_SUMMARY_MAX_CHARS),
                result.full,
                artifacts,
                task_id,
                TaskStatus::Running.to_string(),
            ],
        )?;
        Ok(updated > 0)
    }

    /// `running -> failed`. Returns `false` if the task was no longer running.
    pub fn fail_task(&self, task_id: i64, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE agent_tasks SET status = ?1, completed_at = ?2, error = ?3 WHERE id = ?4 AND status = ?5",
            params![
                TaskStatus::Failed.to_string(),
                fmt_ts(now),
                error,
                task_id,
                TaskStatus::Running.to_string(),
            ],
        )?;
        Ok(updated > 0)
    }

    /// Cancel a queued or running task. A running task's worker notices
    /// through its cancellation token; its later completion is a no-op.
    pub fn cancel_task(&self, scope: &TenantScope, task_id: i64, now: DateTime<Utc>) -> Result<AgentTask> {
        let task = self
            .get_task(scope, task_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Task {}", task_id)))?;
        if task.status.is_terminal() {
            return Err(OrchestratorError::Conflict(format!(
                "Task {} is already {}",
                task_id, task.status
            )));
        }

        let updated = ScopedQuery::new(scope, "UPDATE agent_tasks SET status = ?, completed_at = ?, error = ?")
            .bind(TaskStatus::Canceled.to_string())
            .bind(fmt_ts(now))
            .bind("Canceled".to_string())
            .and_where("id = ?", task_id)
            .and_where("status = ?", task.status.to_string())
            .execute(&self.conn())?;
        if updated == 0 {
            return Err(OrchestratorError::Conflict(format!(
                "Task {} changed state while canceling",
                task_id
            )));
        }

        log::info!("[TASK_QUEUE] Canceled task {} (was {})", task_id, task.status);
        self.get_task(scope, task_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Task {}", task_id)))
    }

    pub fn get_task(&self, scope: &TenantScope, task_id: i64) -> Result<Option<AgentTask>> {
        let conn = self.conn();
        let task = ScopedQuery::new(scope, format!("SELECT {} FROM agent_tasks", TASK_COLUMNS))
            .and_where("id = ?", task_id)
            .query_row(&conn, map_task_row)?;
        Ok(task)
    }

    /// Tasks in claim order, optionally filtered by status
    pub fn list_tasks(
        &self,
        scope: &TenantScope,
        status: Option<TaskStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AgentTask>> {
        let conn = self.conn();
        let tasks = ScopedQuery::new(scope, format!("SELECT {} FROM agent_tasks", TASK_COLUMNS))
            .and_where_opt("status = ?", status.map(|s| s.to_string()))
            .order_by(CLAIM_ORDER)
            .page(limit, offset)
            .query_map(&conn, map_task_row)?;
        Ok(tasks)
    }

    pub fn children_of(&self, scope: &TenantScope, parent_task_id: i64) -> Result<Vec<AgentTask>> {
        let conn = self.conn();
        let tasks = ScopedQuery::new(scope, format!("SELECT {} FROM agent_tasks", TASK_COLUMNS))
            .and_where("parent_task_id = ?", parent_task_id)
            .order_by(CLAIM_ORDER)
            .query_map(&conn, map_task_row)?;
        Ok(tasks)
    }

    /// Delete a task. Rejected while it runs or while any child is queued or running.
    ///
    /// The checks and the delete share one immediate transaction, so a tick
    /// cannot claim the task in between.
    pub fn delete_task(&self, scope: &TenantScope, task_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: TaskStatus = ScopedQuery::new(scope, "SELECT status FROM agent_tasks")
            .and_where("id = ?", task_id)
            .query_row(&tx, |row| get_enum(row, 0))?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Task {}", task_id)))?;
        if status == TaskStatus::Running {
            return Err(OrchestratorError::Conflict(format!("Task {} is running", task_id)));
        }

        let active_children: i64 = tx.query_row(
            "SELECT COUNT(*) FROM agent_tasks WHERE parent_task_id = ?1 AND status IN ('queued', 'running')",
            [task_id],
            |row| row.get(0),
        )?;
        if active_children > 0 {
            return Err(OrchestratorError::Conflict(format!(
                "Task {} has {} active child task(s)",
                task_id, active_children
            )));
        }

        let deleted = ScopedQuery::new(scope, "DELETE FROM agent_tasks")
            .and_where("id = ?", task_id)
            .and_where("status != ?", TaskStatus::Running.to_string())
            .execute(&tx)?;
        if deleted == 0 {
            return Err(OrchestratorError::Conflict(format!(
                "Task {} changed state while deleting",
                task_id
            )));
        }
        tx.commit()?;

        log::info!("[TASK_QUEUE] Deleted task {}", task_id);
        Ok(())
    }

    /// Fail tasks left `running` by a previous process. Safe to repeat.
    pub fn fail_orphaned_tasks(&self, now: DateTime<Utc>) -> Result<usize> {
        let system = TenantScope::system();
        let conn = self.conn();
        let count = ScopedQuery::new(&system, "UPDATE agent_tasks SET status = ?, completed_at = ?, error = ?")
            .bind(TaskStatus::Failed.to_string())
            .bind(fmt_ts(now))
            .bind("Interrupted: process stopped while the task was running".to_string())
            .and_where("status = ?", TaskStatus::Running.to_string())
            .execute(&conn)?;
        Ok(count)
    }

    /// Queued task count across all tenants
    pub fn count_queued_tasks(&self) -> Result<i64> {
        let system = TenantScope::system();
        let conn = self.conn();
        let count = ScopedQuery::new(&system, "SELECT COUNT(*) FROM agent_tasks")
            .and_where("status = ?", TaskStatus::Queued.to_string())
            .count(&conn)?;
        Ok(count)
    }
}
