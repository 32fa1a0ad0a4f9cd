//! Boundary to the external agent loop.
//!
//! The orchestration core never talks to a model directly. Each cron run or
//! task is handed to an [`AgentExecutor`], which drives the tool-calling loop
//! somewhere else and reports back an [`AgentOutcome`].

pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::models::AgentType;

pub use http::HttpAgentExecutor;

/// One unit of work for the agent loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Sub-agent handle registered for this run
    pub sub_agent_id: String,
    pub owner_user_id: String,
    pub agent_type: AgentType,
    /// Cron job id or task id
    pub source_id: i64,
    /// `cron:{job_id}` for cron runs, the conversation id for tasks
    pub parent_session_id: Option<String>,
    pub prompt: String,
    pub timeout_ms: u64,
    /// 1-based attempt number
    pub attempt: u32,
}

/// What the agent loop reported for one attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOutcome {
    pub success: bool,
    pub output_summary: Option<String>,
    /// Full output, kept on tasks as `result_full`
    pub output: Option<String>,
    pub artifacts: Option<serde_json::Value>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub tool_calls_count: i64,
    pub steps: i64,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            output_summary: Some(summary.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Runs one attempt of the agent loop.
///
/// Implementations must return promptly once `cancel` fires; the outcome of
/// a cancelled attempt is discarded.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: AgentRequest, cancel: CancellationToken) -> AgentOutcome;
}
