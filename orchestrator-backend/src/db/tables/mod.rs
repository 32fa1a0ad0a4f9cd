//! Database model modules - extends Database with domain-specific methods
//!
//! Each module adds `impl Database` blocks with methods for a specific table group.

mod agent_tasks;     // agent_tasks (priority queue, parent/child tree)
mod cron_executions; // cron_executions (execution ledger, claim transaction)
mod cron_jobs;       // cron_jobs
mod sub_agents;      // sub_agents (worker lifecycle registry)

pub use agent_tasks::{truncate_chars, RESULT_SUMMARY_MAX_CHARS};
pub use cron_executions::ClaimTrigger;
pub use cron_jobs::CronJobDefaults;

use crate::error::{OrchestratorError, Result};

/// A run budget of 0 ms would time out every attempt before it starts
fn require_timeout(timeout_ms: Option<u64>) -> Result<()> {
    if timeout_ms == Some(0) {
        return Err(OrchestratorError::InvalidRequest(
            "timeout_ms must be greater than 0".to_string(),
        ));
    }
    Ok(())
}
