use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Status of a single execution (also mirrored on the job as `last_status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

/// Why an execution (or task run) ended in failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Ran past its `timeout_ms` budget
    Timeout,
    /// The agent loop reported an error
    AgentError,
    /// The process went away while the run was in flight
    Interrupted,
    /// Cancelled by a user or by shutdown
    Canceled,
}

/// A scheduled cron job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: i64,
    pub owner_user_id: String,
    pub name: String,
    pub description: Option<String>,
    /// Standard 5-field cron expression
    pub cron_expression: String,
    /// IANA timezone the expression is evaluated in
    pub timezone: String,
    /// The prompt handed to the agent loop
    pub prompt: String,
    pub enabled: bool,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub last_status: Option<ExecutionStatus>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A record of one cron job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronExecution {
    pub id: i64,
    pub cron_job_id: i64,
    pub owner_user_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output_summary: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    /// Agent-loop attempts consumed, retries included
    pub attempts: u32,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub tool_calls_count: i64,
    pub sub_agent_id: Option<String>,
}

/// Terminal outcome written onto a running execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output_summary: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub attempts: u32,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub tool_calls_count: i64,
}

/// Request to create a new cron job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCronJobRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub prompt: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Request to update a cron job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCronJobRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A job together with its most recent executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobWithHistory {
    #[serde(flatten)]
    pub job: CronJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<CronExecution>>,
}

/// Response for cron job operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobResponse {
    pub success: bool,
    pub job: Option<CronJobWithHistory>,
    pub jobs: Option<Vec<CronJobWithHistory>>,
    pub error: Option<String>,
}

/// Response for execution listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronExecutionListResponse {
    pub success: bool,
    pub executions: Vec<CronExecution>,
    pub limit: u32,
    pub offset: u32,
    pub error: Option<String>,
}

impl CronJob {
    /// Check if the job should fire at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= now)
    }
}
