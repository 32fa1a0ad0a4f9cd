use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{AgentExecutor, AgentOutcome, AgentRequest};

/// One scripted reply
#[derive(Debug, Clone)]
pub struct MockStep {
    pub outcome: AgentOutcome,
    pub delay: Duration,
}

/// Agent executor that replays a queue of scripted outcomes.
///
/// With a gate installed every call parks until [`MockAgentExecutor::release`]
/// hands out a permit, which lets tests hold a run open while they poke at
/// the scheduler.
pub struct MockAgentExecutor {
    script: Mutex<VecDeque<MockStep>>,
    calls: Mutex<Vec<AgentRequest>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockAgentExecutor {
    pub fn new(outcomes: Vec<AgentOutcome>) -> Self {
        Self::with_steps(
            outcomes
                .into_iter()
                .map(|outcome| MockStep {
                    outcome,
                    delay: Duration::ZERO,
                })
                .collect(),
        )
    }

    pub fn with_steps(steps: Vec<MockStep>) -> Self {
        Self {
            script: Mutex::new(VecDeque::from(steps)),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Every call sleeps `delay` before answering
    pub fn delayed(outcomes: Vec<AgentOutcome>, delay: Duration) -> Self {
        Self::with_steps(
            outcomes
                .into_iter()
                .map(|outcome| MockStep { outcome, delay })
                .collect(),
        )
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `n` parked calls proceed
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> Vec<AgentRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Poll until at least `n` calls arrived (or two seconds pass)
    pub async fn wait_for_calls(&self, n: usize) -> bool {
        for _ in 0..400 {
            if self.call_count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

#[async_trait]
impl AgentExecutor for MockAgentExecutor {
    async fn execute(&self, request: AgentRequest, cancel: CancellationToken) -> AgentOutcome {
        self.calls.lock().push(request);
        let step = self.script.lock().pop_front().unwrap_or_else(|| MockStep {
            outcome: AgentOutcome::succeeded("(mock exhausted)"),
            delay: Duration::ZERO,
        });

        if let Some(gate) = &self.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = cancel.cancelled() => return AgentOutcome::failed("Canceled"),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(step.delay) => step.outcome,
            _ = cancel.cancelled() => AgentOutcome::failed("Canceled"),
        }
    }
}
