//! Sub-agent registry: lifecycle rows for spawned worker agents

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::super::{fmt_ts, get_enum, get_opt_ts, get_ts, Database, ScopedQuery, TenantScope};
use crate::error::{OrchestratorError, Result};
use crate::models::{AgentType, NewSubAgent, SubAgent, SubAgentStatus, SubAgentUsage};

const SUB_AGENT_COLUMNS: &str = "id, sub_agent_id, parent_session_id, owner_user_id, name, agent_type, status,
     assigned_task, task_result, error, step_count, tokens_used, created_at, started_at, completed_at";

fn map_sub_agent_row(row: &rusqlite::Row) -> rusqlite::Result<SubAgent> {
    Ok(SubAgent {
        id: row.get(0)?,
        sub_agent_id: row.get(1)?,
        parent_session_id: row.get(2)?,
        owner_user_id: row.get(3)?,
        name: row.get(4)?,
        agent_type: get_enum(row, 5)?,
        status: get_enum(row, 6)?,
        assigned_task: row.get(7)?,
        task_result: row.get(8)?,
        error: row.get(9)?,
        step_count: row.get(10)?,
        tokens_used: row.get(11)?,
        created_at: get_ts(row, 12)?,
        started_at: get_opt_ts(row, 13)?,
        completed_at: get_opt_ts(row, 14)?,
    })
}

/// SQL list of the states `next` may be entered from
fn predecessor_list(next: SubAgentStatus) -> String {
    next.allowed_predecessors()
        .iter()
        .map(|s| format!("'{}'", s))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Database {
    /// Register a sub-agent in `idle`, owned by the scope's tenant
    pub fn create_sub_agent(
        &self,
        scope: &TenantScope,
        new: &NewSubAgent,
        now: DateTime<Utc>,
    ) -> Result<SubAgent> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sub_agents (sub_agent_id, parent_session_id, owner_user_id, name, agent_type, status,
                assigned_task, step_count, tokens_used, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8)",
            params![
                new.sub_agent_id,
                new.parent_session_id,
                scope.owner_user_id(),
                new.name,
                new.agent_type.to_string(),
                SubAgentStatus::Idle.to_string(),
                new.assigned_task,
                fmt_ts(now),
            ],
        )?;
        drop(conn);

        log::debug!(
            "[SUBAGENT] Registered {} ({}) for {}",
            new.sub_agent_id,
            new.agent_type,
            scope.owner_user_id()
        );
        self.get_sub_agent(scope, &new.sub_agent_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Sub-agent {}", new.sub_agent_id)))
    }

    /// Move a sub-agent to `next` if its current state allows it.
    ///
    /// Compare-and-set on the current status; returns `false` when the row was
    /// not in a permitted predecessor state.
    fn transition_sub_agent(
        &self,
        sub_agent_id: &str,
        next: SubAgentStatus,
        result: Option<&str>,
        error: Option<&str>,
        usage: Option<&SubAgentUsage>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let predecessors = predecessor_list(next);
        if predecessors.is_empty() {
            return Err(OrchestratorError::Conflict(format!(
                "Sub-agent {} cannot move back to {}",
                sub_agent_id, next
            )));
        }

        let now_str = fmt_ts(now);
        let sql = match next {
            SubAgentStatus::Working => format!(
                "UPDATE sub_agents SET status = ?1, started_at = ?2
                 WHERE sub_agent_id = ?3 AND status IN ({})",
                predecessors
            ),
            _ => format!(
                "UPDATE sub_agents SET status = ?1, completed_at = ?2, task_result = COALESCE(?4, task_result),
                    error = COALESCE(?5, error), step_count = step_count + ?6, tokens_used = tokens_used + ?7
                 WHERE sub_agent_id = ?3 AND status IN ({})",
                predecessors
            ),
        };

        let conn = self.conn();
        let updated = match next {
            SubAgentStatus::Working => conn.execute(&sql, params![next.to_string(), now_str, sub_agent_id])?,
            _ => {
                let usage = usage.cloned().unwrap_or_default();
                conn.execute(
                    &sql,
                    params![
                        next.to_string(),
                        now_str,
                        sub_agent_id,
                        result,
                        error,
                        usage.step_count,
                        usage.tokens_used
                    ],
                )?
            }
        };

        if updated == 0 {
            log::debug!("[SUBAGENT] {} not moved to {}: state changed", sub_agent_id, next);
        }
        Ok(updated > 0)
    }

    /// `idle -> working`
    pub fn mark_sub_agent_working(&self, sub_agent_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.transition_sub_agent(sub_agent_id, SubAgentStatus::Working, None, None, None, now)
    }

    /// `working -> completed`
    pub fn complete_sub_agent(
        &self,
        sub_agent_id: &str,
        result: &str,
        usage: &SubAgentUsage,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.transition_sub_agent(
            sub_agent_id,
            SubAgentStatus::Completed,
            Some(result),
            None,
            Some(usage),
            now,
        )
    }

    /// `idle | working -> error`
    pub fn fail_sub_agent(
        &self,
        sub_agent_id: &str,
        error: &str,
        usage: &SubAgentUsage,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.transition_sub_agent(
            sub_agent_id,
            SubAgentStatus::Error,
            None,
            Some(error),
            Some(usage),
            now,
        )
    }

    pub fn get_sub_agent(&self, scope: &TenantScope, sub_agent_id: &str) -> Result<Option<SubAgent>> {
        let conn = self.conn();
        let agent = ScopedQuery::new(scope, format!("SELECT {} FROM sub_agents", SUB_AGENT_COLUMNS))
            .and_where("sub_agent_id = ?", sub_agent_id.to_string())
            .query_row(&conn, map_sub_agent_row)?;
        Ok(agent)
    }

    /// Newest first, optionally filtered by status and type
    pub fn list_sub_agents(
        &self,
        scope: &TenantScope,
        status: Option<SubAgentStatus>,
        agent_type: Option<AgentType>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SubAgent>> {
        let conn = self.conn();
        let agents = ScopedQuery::new(scope, format!("SELECT {} FROM sub_agents", SUB_AGENT_COLUMNS))
            .and_where_opt("status = ?", status.map(|s| s.to_string()))
            .and_where_opt("agent_type = ?", agent_type.map(|t| t.to_string()))
            .order_by("created_at DESC, id DESC")
            .page(limit, offset)
            .query_map(&conn, map_sub_agent_row)?;
        Ok(agents)
    }

    /// Move sub-agents stuck in a non-terminal state by a previous process to `error`
    pub fn fail_orphaned_sub_agents(&self, now: DateTime<Utc>) -> Result<usize> {
        let system = TenantScope::system();
        let conn = self.conn();
        let count = ScopedQuery::new(&system, "UPDATE sub_agents SET status = ?, completed_at = ?, error = ?")
            .bind(SubAgentStatus::Error.to_string())
            .bind(fmt_ts(now))
            .bind("Interrupted: process stopped while the agent was active".to_string())
            .filter(&format!("status IN ({})", predecessor_list(SubAgentStatus::Error)))
            .execute(&conn)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn new_agent(id: &str, agent_type: AgentType) -> NewSubAgent {
        NewSubAgent {
            sub_agent_id: id.to_string(),
            parent_session_id: Some("cron:1".to_string()),
            name: format!("agent {}", id),
            agent_type,
            assigned_task: "summarize".to_string(),
        }
    }

    #[test]
    fn test_lifecycle_forward_only() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        let agent = db.create_sub_agent(&alice, &new_agent("sa-1", AgentType::Cron), t0()).unwrap();
        assert_eq!(agent.status, SubAgentStatus::Idle);
        assert!(agent.completed_at.is_none());

        // idle cannot jump straight to completed
        assert!(!db.complete_sub_agent("sa-1", "x", &SubAgentUsage::default(), t0()).unwrap());

        assert!(db.mark_sub_agent_working("sa-1", t0()).unwrap());
        assert!(!db.mark_sub_agent_working("sa-1", t0()).unwrap());

        let usage = SubAgentUsage {
            step_count: 4,
            tokens_used: 1_500,
        };
        assert!(db.complete_sub_agent("sa-1", "all done", &usage, t0()).unwrap());
        assert!(!db.fail_sub_agent("sa-1", "late", &usage, t0()).unwrap());

        let agent = db.get_sub_agent(&alice, "sa-1").unwrap().unwrap();
        assert_eq!(agent.status, SubAgentStatus::Completed);
        assert_eq!(agent.task_result.as_deref(), Some("all done"));
        assert_eq!(agent.step_count, 4);
        assert_eq!(agent.tokens_used, 1_500);
        assert!(agent.started_at.is_some());
        assert!(agent.completed_at.is_some());
    }

    #[test]
    fn test_error_from_idle() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        db.create_sub_agent(&alice, &new_agent("sa-1", AgentType::Task), t0()).unwrap();
        assert!(db.fail_sub_agent("sa-1", "never started", &SubAgentUsage::default(), t0()).unwrap());
        let agent = db.get_sub_agent(&alice, "sa-1").unwrap().unwrap();
        assert_eq!(agent.status, SubAgentStatus::Error);
        assert_eq!(agent.error.as_deref(), Some("never started"));
        assert!(agent.completed_at.is_some());
    }

    #[test]
    fn test_filters_and_tenant_scope() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        let bob = TenantScope::user("bob").unwrap();
        db.create_sub_agent(&alice, &new_agent("sa-1", AgentType::Cron), t0()).unwrap();
        db.create_sub_agent(&alice, &new_agent("sa-2", AgentType::Task), t0()).unwrap();
        db.create_sub_agent(&bob, &new_agent("sa-3", AgentType::Task), t0()).unwrap();
        db.mark_sub_agent_working("sa-2", t0()).unwrap();

        assert_eq!(db.list_sub_agents(&alice, None, None, 50, 0).unwrap().len(), 2);
        let working = db
            .list_sub_agents(&alice, Some(SubAgentStatus::Working), None, 50, 0)
            .unwrap();
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].sub_agent_id, "sa-2");
        let tasks = db.list_sub_agents(&alice, None, Some(AgentType::Task), 50, 0).unwrap();
        assert_eq!(tasks.len(), 1);

        assert!(db.get_sub_agent(&bob, "sa-1").unwrap().is_none());
        assert_eq!(db.list_sub_agents(&TenantScope::system(), None, None, 50, 0).unwrap().len(), 3);
    }

    #[test]
    fn test_orphan_sweep_is_idempotent() {
        let db = Database::new(":memory:").unwrap();
        let alice = TenantScope::user("alice").unwrap();
        db.create_sub_agent(&alice, &new_agent("sa-1", AgentType::Cron), t0()).unwrap();
        db.create_sub_agent(&alice, &new_agent("sa-2", AgentType::Cron), t0()).unwrap();
        db.create_sub_agent(&alice, &new_agent("sa-3", AgentType::Cron), t0()).unwrap();
        db.mark_sub_agent_working("sa-2", t0()).unwrap();
        db.mark_sub_agent_working("sa-3", t0()).unwrap();
        db.complete_sub_agent("sa-3", "ok", &SubAgentUsage::default(), t0()).unwrap();

        assert_eq!(db.fail_orphaned_sub_agents(t0()).unwrap(), 2);
        assert_eq!(db.fail_orphaned_sub_agents(t0()).unwrap(), 0);
        let done = db.get_sub_agent(&alice, "sa-3").unwrap().unwrap();
        assert_eq!(done.status, SubAgentStatus::Completed);
    }
}
