use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    #[strum(to_string = "canceled", serialize = "cancelled")]
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled)
    }
}

/// An ad-hoc unit of agent work in the priority queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: i64,
    pub owner_user_id: String,
    pub conversation_id: Option<String>,
    pub parent_task_id: Option<i64>,
    pub title: String,
    pub input: String,
    pub status: TaskStatus,
    /// Claimed in ascending order; ties go to the oldest task
    pub priority: i64,
    pub assigned_sub_agent_id: Option<String>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    pub result_full: Option<String>,
    pub error: Option<String>,
    /// Opaque JSON produced by the agent
    pub artifacts: serde_json::Value,
}

/// Request to enqueue a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueTaskRequest {
    pub title: String,
    pub input: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub parent_task_id: Option<i64>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Successful task result as recorded by the runner
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub summary: String,
    pub full: Option<String>,
    pub artifacts: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub success: bool,
    pub task: Option<AgentTask>,
    pub tasks: Option<Vec<AgentTask>>,
    pub error: Option<String>,
}
