pub mod agent_task;
pub mod cron_job;
pub mod sub_agent;

pub use agent_task::{AgentTask, EnqueueTaskRequest, TaskResponse, TaskResult, TaskStatus};
pub use cron_job::{
    CreateCronJobRequest, CronExecution, CronExecutionListResponse, CronJob, CronJobResponse,
    CronJobWithHistory, ExecutionOutcome, ExecutionStatus, FailureKind, UpdateCronJobRequest,
};
pub use sub_agent::{
    AgentType, NewSubAgent, SubAgent, SubAgentListResponse, SubAgentStatus, SubAgentUsage,
};
