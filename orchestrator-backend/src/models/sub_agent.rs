use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Lifecycle of a spawned worker agent.
///
/// Forward-only: `idle -> working -> completed`. `error` can be entered from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SubAgentStatus {
    Idle,
    Working,
    Completed,
    Error,
}

impl SubAgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubAgentStatus::Completed | SubAgentStatus::Error)
    }

    /// States a row must currently be in to move into `self`
    pub fn allowed_predecessors(&self) -> &'static [SubAgentStatus] {
        match self {
            SubAgentStatus::Idle => &[],
            SubAgentStatus::Working => &[SubAgentStatus::Idle],
            SubAgentStatus::Completed => &[SubAgentStatus::Working],
            SubAgentStatus::Error => &[SubAgentStatus::Idle, SubAgentStatus::Working],
        }
    }
}

/// What spawned the sub-agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AgentType {
    Cron,
    Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgent {
    pub id: i64,
    /// Stable external handle
    pub sub_agent_id: String,
    pub parent_session_id: Option<String>,
    pub owner_user_id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub status: SubAgentStatus,
    pub assigned_task: String,
    pub task_result: Option<String>,
    pub error: Option<String>,
    pub step_count: i64,
    pub tokens_used: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields needed to register a new sub-agent
#[derive(Debug, Clone)]
pub struct NewSubAgent {
    pub sub_agent_id: String,
    pub parent_session_id: Option<String>,
    pub name: String,
    pub agent_type: AgentType,
    pub assigned_task: String,
}

/// Usage reported back when a sub-agent resolves
#[derive(Debug, Clone, Default)]
pub struct SubAgentUsage {
    pub step_count: i64,
    pub tokens_used: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentListResponse {
    pub success: bool,
    pub sub_agents: Vec<SubAgent>,
    pub limit: u32,
    pub offset: u32,
    pub error: Option<String>,
}
