//! Executes a claimed cron run or task against the agent loop.
//!
//! The runner owns everything between "claimed" and "resolved": it registers
//! the sub-agent, enforces the per-attempt timeout, applies the retry policy
//! (cron jobs only) and writes the outcome back to the ledger.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::clock::Clock;
use super::retry::{decide, AttemptOutcome, RetryDecision, RetryPolicy};
use crate::agent::{AgentExecutor, AgentOutcome, AgentRequest};
use crate::db::tables::{truncate_chars, RESULT_SUMMARY_MAX_CHARS};
use crate::db::{Database, TenantScope};
use crate::error::OrchestratorError;
use crate::models::{
    AgentTask, AgentType, CronExecution, CronJob, ExecutionOutcome, FailureKind, NewSubAgent,
    SubAgentUsage, TaskResult,
};

/// Cancellation handle for one in-flight run.
///
/// Every run token is a child of the scheduler's shutdown token, so the
/// runner can tell a user cancel from a shutdown.
#[derive(Debug, Clone)]
pub struct RunSignal {
    token: CancellationToken,
    shutdown: CancellationToken,
}

impl RunSignal {
    pub fn new(shutdown: &CancellationToken) -> Self {
        Self {
            token: shutdown.child_token(),
            shutdown: shutdown.clone(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn cancel_kind(&self) -> FailureKind {
        if self.shutdown.is_cancelled() {
            FailureKind::Interrupted
        } else {
            FailureKind::Canceled
        }
    }
}

/// Summary of a resolved run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub success: bool,
    pub attempts: u32,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
}

/// Usage summed over every attempt of a run
#[derive(Debug, Default)]
struct Usage {
    tokens_in: i64,
    tokens_out: i64,
    tool_calls: i64,
    steps: i64,
}

impl Usage {
    fn add(&mut self, outcome: &AgentOutcome) {
        self.tokens_in += outcome.tokens_in;
        self.tokens_out += outcome.tokens_out;
        self.tool_calls += outcome.tool_calls_count;
        self.steps += outcome.steps;
    }

    fn sub_agent(&self) -> SubAgentUsage {
        SubAgentUsage {
            step_count: self.steps,
            tokens_used: self.tokens_in + self.tokens_out,
        }
    }
}

/// Unique handle for a sub-agent, e.g. `cron-12-9f2c4e1a`
fn generate_sub_agent_id(agent_type: AgentType, source_id: i64) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", agent_type, source_id, &uuid[..8])
}

pub struct TaskRunner {
    db: Arc<Database>,
    executor: Arc<dyn AgentExecutor>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl TaskRunner {
    pub fn new(
        db: Arc<Database>,
        executor: Arc<dyn AgentExecutor>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            executor,
            clock,
            retry,
        }
    }

    /// Register an `idle` sub-agent for a run and move it to `working`
    fn spawn_sub_agent(
        &self,
        owner_user_id: &str,
        agent_type: AgentType,
        source_id: i64,
        name: String,
        parent_session_id: Option<String>,
        assigned_task: &str,
    ) -> Option<String> {
        let scope = match TenantScope::user(owner_user_id) {
            Ok(scope) => scope,
            Err(e) => {
                log::error!("[SUBAGENT] Cannot register agent for {} {}: {}", agent_type, source_id, e);
                return None;
            }
        };
        let new = NewSubAgent {
            sub_agent_id: generate_sub_agent_id(agent_type, source_id),
            parent_session_id,
            name,
            agent_type,
            assigned_task: truncate_chars(assigned_task, RESULT_SUMMARY_MAX_CHARS),
        };
        let now = self.clock.now();
        match self.db.create_sub_agent(&scope, &new, now) {
            Ok(agent) => {
                if let Err(e) = self.db.mark_sub_agent_working(&agent.sub_agent_id, now) {
                    log::error!("[SUBAGENT] Failed to start {}: {}", agent.sub_agent_id, e);
                }
                Some(agent.sub_agent_id)
            }
            Err(e) => {
                log::error!("[SUBAGENT] Failed to register agent for {} {}: {}", agent_type, source_id, e);
                None
            }
        }
    }

    fn resolve_sub_agent(&self, sub_agent_id: Option<&str>, report: &RunReport, summary: &str, usage: &Usage) {
        let Some(id) = sub_agent_id else { return };
        let now = self.clock.now();
        let result = if report.success {
            self.db.complete_sub_agent(id, summary, &usage.sub_agent(), now)
        } else {
            let error = report.error.as_deref().unwrap_or("Unknown error");
            self.db.fail_sub_agent(id, error, &usage.sub_agent(), now)
        };
        match result {
            Ok(true) => log::debug!(
                "[SUBAGENT] {} {}",
                id,
                if report.success { "completed" } else { "failed" }
            ),
            Ok(false) => log::debug!("[SUBAGENT] {} was already resolved", id),
            Err(e) => log::error!("[SUBAGENT] Failed to resolve {}: {}", id, e),
        }
    }

    /// One call into the agent loop, bounded by `timeout_ms` and the run signal
    async fn attempt(
        &self,
        request: AgentRequest,
        timeout_ms: u64,
        signal: &RunSignal,
    ) -> (AttemptOutcome, AgentOutcome) {
        let attempt_token = signal.token.child_token();
        let call = self.executor.execute(request, attempt_token.clone());

        let result = tokio::select! {
            r = timeout(Duration::from_millis(timeout_ms), call) => r,
            _ = signal.token.cancelled() => {
                attempt_token.cancel();
                let kind = signal.cancel_kind();
                return (
                    AttemptOutcome::TerminalFailure { kind, error: format!("Run {}", kind) },
                    AgentOutcome::failed(format!("Run {}", kind)),
                );
            }
        };

        match result {
            Err(_) => {
                // Let the agent loop stop its own work
                attempt_token.cancel();
                let error = OrchestratorError::ExecutionTimeout(timeout_ms).to_string();
                (
                    AttemptOutcome::TerminalFailure {
                        kind: FailureKind::Timeout,
                        error: error.clone(),
                    },
                    AgentOutcome::failed(error),
                )
            }
            Ok(outcome) if outcome.success => (AttemptOutcome::Success, outcome),
            Ok(outcome) if signal.is_cancelled() => {
                let kind = signal.cancel_kind();
                (
                    AttemptOutcome::TerminalFailure { kind, error: format!("Run {}", kind) },
                    outcome,
                )
            }
            Ok(outcome) => {
                let error = OrchestratorError::ExternalLoop(
                    outcome.error.clone().unwrap_or_else(|| "agent reported failure".to_string()),
                )
                .to_string();
                (AttemptOutcome::RetryableFailure { error }, outcome)
            }
        }
    }

    /// Run a claimed cron job to completion, retrying agent errors
    pub async fn run_cron(&self, job: CronJob, execution: CronExecution, signal: RunSignal) -> RunReport {
        let started = Utc::now();
        log::info!(
            "[RUNNER] Executing cron job '{}' ({}) as execution {}",
            job.name,
            job.id,
            execution.id
        );

        let sub_agent_id = self.spawn_sub_agent(
            &job.owner_user_id,
            AgentType::Cron,
            job.id,
            format!("Cron: {}", job.name),
            Some(format!("cron:{}", job.id)),
            &job.prompt,
        );
        if let Some(id) = &sub_agent_id {
            if let Err(e) = self.db.set_execution_sub_agent(execution.id, id) {
                log::error!("[RUNNER] Failed to link sub-agent to execution {}: {}", execution.id, e);
            }
        }

        let mut usage = Usage::default();
        let mut attempt = 1u32;
        let (final_outcome, last) = loop {
            let request = AgentRequest {
                sub_agent_id: sub_agent_id.clone().unwrap_or_default(),
                owner_user_id: job.owner_user_id.clone(),
                agent_type: AgentType::Cron,
                source_id: job.id,
                parent_session_id: Some(format!("cron:{}", job.id)),
                prompt: job.prompt.clone(),
                timeout_ms: job.timeout_ms,
                attempt,
            };
            let (outcome, agent_outcome) = self.attempt(request, job.timeout_ms, &signal).await;
            usage.add(&agent_outcome);

            match decide(attempt, job.max_retries, &outcome, &self.retry) {
                RetryDecision::GiveUp => break (outcome, agent_outcome),
                RetryDecision::Retry { delay } => {
                    log::warn!(
                        "[RUNNER] Cron job '{}' attempt {} failed, retrying in {}ms",
                        job.name,
                        attempt,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = signal.token.cancelled() => {
                            let kind = signal.cancel_kind();
                            break (
                                AttemptOutcome::TerminalFailure { kind, error: format!("Run {}", kind) },
                                agent_outcome,
                            );
                        }
                    }
                    attempt += 1;
                }
            }
        };

        let report = RunReport {
            success: final_outcome == AttemptOutcome::Success,
            attempts: attempt,
            error: match &final_outcome {
                AttemptOutcome::Success => None,
                AttemptOutcome::RetryableFailure { error } => Some(error.clone()),
                AttemptOutcome::TerminalFailure { error, .. } => Some(error.clone()),
            },
            error_kind: final_outcome.failure_kind(),
        };

        let summary = last
            .output_summary
            .clone()
            .or_else(|| last.output.clone())
            .unwrap_or_default();
        let outcome = ExecutionOutcome {
            success: report.success,
            output_summary: if summary.is_empty() {
                None
            } else {
                Some(truncate_chars(&summary, RESULT_SUMMARY_MAX_CHARS))
            },
            error: report.error.clone(),
            error_kind: report.error_kind,
            attempts: report.attempts,
            input_tokens: usage.tokens_in,
            output_tokens: usage.tokens_out,
            tool_calls_count: usage.tool_calls,
        };
        match self.db.complete_cron_execution(execution.id, &outcome, self.clock.now()) {
            Ok(true) => {}
            Ok(false) => log::warn!("[RUNNER] Execution {} was already resolved", execution.id),
            Err(e) => log::error!("[RUNNER] Failed to record execution {}: {}", execution.id, e),
        }
        self.resolve_sub_agent(sub_agent_id.as_deref(), &report, &summary, &usage);

        let duration_ms = (Utc::now() - started).num_milliseconds();
        if report.success {
            log::info!(
                "[RUNNER] Cron job '{}' completed in {}ms after {} attempt(s)",
                job.name,
                duration_ms,
                report.attempts
            );
        } else {
            log::warn!(
                "[RUNNER] Cron job '{}' failed in {}ms after {} attempt(s): {}",
                job.name,
                duration_ms,
                report.attempts,
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
        report
    }

    /// Run a claimed task once. Tasks are not retried.
    pub async fn run_task(&self, task: AgentTask, signal: RunSignal) -> RunReport {
        log::info!("[RUNNER] Executing task {} '{}'", task.id, task.title);

        let sub_agent_id = self.spawn_sub_agent(
            &task.owner_user_id,
            AgentType::Task,
            task.id,
            format!("Task: {}", task.title),
            task.conversation_id.clone(),
            &task.input,
        );
        if let Some(id) = &sub_agent_id {
            if let Err(e) = self.db.assign_task_sub_agent(task.id, id) {
                log::error!("[RUNNER] Failed to assign sub-agent to task {}: {}", task.id, e);
            }
        }

        let request = AgentRequest {
            sub_agent_id: sub_agent_id.clone().unwrap_or_default(),
            owner_user_id: task.owner_user_id.clone(),
            agent_type: AgentType::Task,
            source_id: task.id,
            parent_session_id: task.conversation_id.clone(),
            prompt: task.input.clone(),
            timeout_ms: task.timeout_ms,
            attempt: 1,
        };
        let (outcome, agent_outcome) = self.attempt(request, task.timeout_ms, &signal).await;
        let mut usage = Usage::default();
        usage.add(&agent_outcome);

        let report = RunReport {
            success: outcome == AttemptOutcome::Success,
            attempts: 1,
            error: match &outcome {
                AttemptOutcome::Success => None,
                AttemptOutcome::RetryableFailure { error } => Some(error.clone()),
                AttemptOutcome::TerminalFailure { error, .. } => Some(error.clone()),
            },
            error_kind: outcome.failure_kind(),
        };

        let summary = agent_outcome
            .output_summary
            .clone()
            .or_else(|| agent_outcome.output.clone())
            .unwrap_or_default();
        let now = self.clock.now();
        let recorded = if report.success {
            let result = TaskResult {
                summary: summary.clone(),
                full: agent_outcome.output.clone(),
                artifacts: agent_outcome.artifacts.clone(),
            };
            self.db.complete_task(task.id, &result, now)
        } else {
            self.db
                .fail_task(task.id, report.error.as_deref().unwrap_or("Unknown error"), now)
        };
        match recorded {
            Ok(true) => {}
            // Canceled while running: the cancel already resolved the row
            Ok(false) => log::info!("[RUNNER] Task {} was resolved elsewhere", task.id),
            Err(e) => log::error!("[RUNNER] Failed to record task {}: {}", task.id, e),
        }
        self.resolve_sub_agent(sub_agent_id.as_deref(), &report, &summary, &usage);

        if report.success {
            log::info!("[RUNNER] Task {} completed", task.id);
        } else {
            log::warn!(
                "[RUNNER] Task {} failed: {}",
                task.id,
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
        report
    }
}
