use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{AgentExecutor, AgentOutcome, AgentRequest};

/// Posts each request as JSON to an agent-loop service and reads back an
/// [`AgentOutcome`]
pub struct HttpAgentExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAgentExecutor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        // Per-run budgets are enforced by the runner, not the HTTP client
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    async fn post(&self, request: &AgentRequest) -> Result<AgentOutcome, String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| format!("Agent loop unreachable: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Agent loop returned {}: {}", status, body));
        }

        response
            .json::<AgentOutcome>()
            .await
            .map_err(|e| format!("Invalid agent loop response: {}", e))
    }
}

#[async_trait]
impl AgentExecutor for HttpAgentExecutor {
    async fn execute(&self, request: AgentRequest, cancel: CancellationToken) -> AgentOutcome {
        log::debug!(
            "[RUNNER] Dispatching {} (attempt {}) to {}",
            request.sub_agent_id,
            request.attempt,
            self.endpoint
        );
        tokio::select! {
            result = self.post(&request) => match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::warn!("[RUNNER] {} failed: {}", request.sub_agent_id, e);
                    AgentOutcome::failed(e)
                }
            },
            _ = cancel.cancelled() => AgentOutcome::failed("Canceled"),
        }
    }
}
