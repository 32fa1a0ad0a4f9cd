//! Polling engine: finds due cron jobs and queued tasks, claims them and
//! hands them to the [`TaskRunner`] on spawned tasks.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::clock::Clock;
use super::retry::RetryPolicy;
use super::runner::{RunSignal, TaskRunner};
use crate::agent::AgentExecutor;
use crate::config::defaults;
use crate::db::tables::ClaimTrigger;
use crate::db::{Database, TenantScope};
use crate::error::{OrchestratorError, Result};
use crate::models::{AgentTask, CronExecution, CronJob};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    /// Cap on simultaneously active runs, cron and tasks combined (0 = unbounded)
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: defaults::POLL_INTERVAL_SECS,
            max_concurrent: defaults::MAX_CONCURRENT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Point-in-time view of the engine for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_jobs: usize,
    pub active_tasks: usize,
    pub total_jobs: i64,
    pub enabled_jobs: i64,
    /// Queue depth across all tenants, only reported to admin scopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_tasks: Option<i64>,
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl SchedulerStatus {
    /// Snapshot for a process whose poll loop is not running
    pub fn offline(db: &Database, scope: &TenantScope, config: &SchedulerConfig) -> Result<Self> {
        let (total_jobs, enabled_jobs) = db.count_cron_jobs(scope)?;
        let queued_tasks = if scope.can_view_all() {
            Some(db.count_queued_tasks()?)
        } else {
            None
        };

        Ok(Self {
            running: false,
            active_jobs: 0,
            active_tasks: 0,
            total_jobs,
            enabled_jobs,
            queued_tasks,
            poll_interval_ms: config.poll_interval_secs.saturating_mul(1000),
            max_concurrent: config.max_concurrent,
            last_tick_at: None,
        })
    }
}

/// Rows touched by [`Scheduler::sweep_orphaned_runs`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub executions: usize,
    pub jobs: usize,
    pub tasks: usize,
    pub sub_agents: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.executions + self.jobs + self.tasks + self.sub_agents
    }
}

/// Runs dispatched by one tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub jobs: usize,
    pub tasks: usize,
}

struct PollLoop {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    db: Arc<Database>,
    runner: Arc<TaskRunner>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    /// In-flight cron runs keyed by job id
    active_jobs: Arc<DashMap<i64, RunSignal>>,
    /// In-flight tasks keyed by task id
    active_tasks: Arc<DashMap<i64, RunSignal>>,
    /// Every spawned run, so shutdown can wait for them
    runs: TaskTracker,
    /// Parent of every run signal; cancelled when `stop` runs out of grace
    shutdown: Mutex<CancellationToken>,
    poll_loop: Mutex<Option<PollLoop>>,
    running: AtomicBool,
    last_tick_at: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        executor: Arc<dyn AgentExecutor>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let permits = if config.max_concurrent == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_concurrent
        };
        let runner = TaskRunner::new(Arc::clone(&db), executor, Arc::clone(&clock), config.retry);

        Self {
            db,
            runner: Arc::new(runner),
            clock,
            config,
            permits: Arc::new(Semaphore::new(permits)),
            active_jobs: Arc::new(DashMap::new()),
            active_tasks: Arc::new(DashMap::new()),
            runs: TaskTracker::new(),
            shutdown: Mutex::new(CancellationToken::new()),
            poll_loop: Mutex::new(None),
            running: AtomicBool::new(false),
            last_tick_at: Mutex::new(None),
        }
    }

    /// Start the polling loop on a background task
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("[SCHEDULER] Already running");
            return;
        }
        {
            let mut shutdown = self.shutdown.lock();
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }

        let stop = CancellationToken::new();
        let loop_stop = stop.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(this.config.poll_interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = loop_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        this.tick().await;
                    }
                }
            }
            log::info!("[SCHEDULER] Poll loop stopped");
        });
        *self.poll_loop.lock() = Some(PollLoop { stop, handle });

        log::info!(
            "[SCHEDULER] Started (poll every {}s, max {} concurrent runs)",
            self.config.poll_interval_secs,
            self.config.max_concurrent
        );
    }

    /// Stop polling, give in-flight runs `grace` to finish, then interrupt the rest
    pub async fn stop(&self, grace: Duration) {
        let poll_loop = self.poll_loop.lock().take();
        if let Some(poll_loop) = poll_loop {
            poll_loop.stop.cancel();
            if let Err(e) = poll_loop.handle.await {
                log::error!("[SCHEDULER] Poll loop ended abnormally: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);

        if self.wait_for_idle(grace).await {
            log::info!("[SCHEDULER] Stopped");
            return;
        }

        log::warn!(
            "[SCHEDULER] {} run(s) still active after {:?}, interrupting",
            self.active_count(),
            grace
        );
        self.shutdown.lock().cancel();
        if !self.wait_for_idle(Duration::from_secs(5)).await {
            log::error!(
                "[SCHEDULER] {} run(s) did not resolve; they will be swept at next startup",
                self.active_count()
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active_jobs.len() + self.active_tasks.len()
    }

    /// Wait until no run is in flight. Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        // A closed tracker's `wait` resolves whenever it is empty; runs can still be spawned
        self.runs.close();
        tokio::time::timeout(timeout, self.runs.wait()).await.is_ok()
    }

    /// One pass of the poll loop: dispatch due cron jobs, then drain the task queue
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now();
        *self.last_tick_at.lock() = Some(now);

        let report = TickReport {
            jobs: self.dispatch_due_jobs(now),
            tasks: self.dispatch_queued_tasks(now),
        };
        if report.jobs + report.tasks > 0 {
            log::debug!(
                "[SCHEDULER] Tick dispatched {} cron run(s) and {} task(s)",
                report.jobs,
                report.tasks
            );
        }
        report
    }

    fn dispatch_due_jobs(&self, now: DateTime<Utc>) -> usize {
        let due = match self.db.list_due_cron_jobs(now) {
            Ok(due) => due,
            Err(e) => {
                log::error!("[SCHEDULER] Failed to load due cron jobs: {}", e);
                return 0;
            }
        };

        let mut dispatched = 0;
        for job in due {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                log::debug!("[SCHEDULER] At capacity, remaining due jobs wait for the next tick");
                break;
            };
            match self.db.claim_cron_job(job.id, ClaimTrigger::Schedule, now) {
                Ok((job, execution)) => {
                    self.spawn_cron_run(job, execution, permit);
                    dispatched += 1;
                }
                Err(OrchestratorError::ClaimConflict(id)) => {
                    log::debug!("[SCHEDULER] Job {} already claimed, skipping", id);
                }
                Err(e) => log::error!("[SCHEDULER] Failed to claim job {}: {}", job.id, e),
            }
        }
        dispatched
    }

    fn dispatch_queued_tasks(&self, now: DateTime<Utc>) -> usize {
        let mut dispatched = 0;
        loop {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            // The permit we hold counts as capacity
            let capacity = self.permits.available_permits() + 1;
            match self.db.claim_next_task(capacity, now) {
                Ok(Some(task)) => {
                    self.spawn_task_run(task, permit);
                    dispatched += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("[SCHEDULER] Failed to claim next task: {}", e);
                    break;
                }
            }
        }
        dispatched
    }

    fn spawn_cron_run(&self, job: CronJob, execution: CronExecution, permit: OwnedSemaphorePermit) {
        let signal = RunSignal::new(&self.shutdown.lock());
        let job_id = job.id;
        self.active_jobs.insert(job_id, signal.clone());

        let runner = Arc::clone(&self.runner);
        let active = Arc::clone(&self.active_jobs);
        self.runs.spawn(async move {
            runner.run_cron(job, execution, signal).await;
            active.remove(&job_id);
            drop(permit);
        });
    }

    fn spawn_task_run(&self, task: AgentTask, permit: OwnedSemaphorePermit) {
        let signal = RunSignal::new(&self.shutdown.lock());
        let task_id = task.id;
        self.active_tasks.insert(task_id, signal.clone());

        let runner = Arc::clone(&self.runner);
        let active = Arc::clone(&self.active_tasks);
        self.runs.spawn(async move {
            runner.run_task(task, signal).await;
            active.remove(&task_id);
            drop(permit);
        });
    }

    /// Trigger a job outside its schedule through the same claim path
    pub fn run_job_now(&self, scope: &TenantScope, job_id: i64) -> Result<CronExecution> {
        self.db
            .get_cron_job(scope, job_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Cron job {}", job_id)))?;
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| OrchestratorError::Conflict("Scheduler is at capacity".to_string()))?;

        let (job, execution) = self
            .db
            .claim_cron_job(job_id, ClaimTrigger::Manual, self.clock.now())?;
        log::info!(
            "[SCHEDULER] Manual run of cron job '{}' ({}) requested by {}",
            job.name,
            job.id,
            scope.owner_user_id()
        );
        self.spawn_cron_run(job, execution.clone(), permit);
        Ok(execution)
    }

    /// Signal the in-flight run of a job. Returns `false` if nothing was running.
    pub fn cancel_job_run(&self, scope: &TenantScope, job_id: i64) -> Result<bool> {
        self.db
            .get_cron_job(scope, job_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Cron job {}", job_id)))?;
        match self.active_jobs.get(&job_id) {
            Some(signal) => {
                signal.cancel();
                log::info!("[SCHEDULER] Canceling in-flight run of cron job {}", job_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel a task in storage and signal its worker if it is running
    pub fn cancel_task(&self, scope: &TenantScope, task_id: i64) -> Result<AgentTask> {
        let task = self.db.cancel_task(scope, task_id, self.clock.now())?;
        if let Some(signal) = self.active_tasks.get(&task_id) {
            signal.cancel();
        }
        Ok(task)
    }

    pub fn status(&self, scope: &TenantScope) -> Result<SchedulerStatus> {
        Ok(SchedulerStatus {
            running: self.is_running(),
            active_jobs: self.active_jobs.len(),
            active_tasks: self.active_tasks.len(),
            last_tick_at: *self.last_tick_at.lock(),
            ..SchedulerStatus::offline(&self.db, scope, &self.config)?
        })
    }

    /// Resolve everything a previous process left `running`. Must run before
    /// [`Scheduler::start`]; a second call finds nothing to do.
    pub fn sweep_orphaned_runs(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        for execution in self.db.list_running_cron_executions()? {
            log::warn!(
                "[SCHEDULER] Execution {} of cron job {} was interrupted (started {})",
                execution.id,
                execution.cron_job_id,
                execution.started_at
            );
        }
        let report = SweepReport {
            executions: self.db.fail_orphaned_cron_executions(now)?,
            jobs: self.db.reset_interrupted_cron_jobs(now)?,
            tasks: self.db.fail_orphaned_tasks(now)?,
            sub_agents: self.db.fail_orphaned_sub_agents(now)?,
        };
        if report.total() > 0 {
            log::warn!(
                "[SCHEDULER] Swept orphaned runs: {} execution(s), {} job(s), {} task(s), {} sub-agent(s)",
                report.executions,
                report.jobs,
                report.tasks,
                report.sub_agents
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::MockAgentExecutor;
    use crate::agent::AgentOutcome;
    use crate::db::tables::tests::{defaults as job_defaults, job_request, task_request};
    use crate::models::{ExecutionStatus, FailureKind, SubAgentStatus, TaskStatus};
    use crate::scheduler::clock::{ManualClock, SystemClock};
    use chrono::TimeZone;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn config(max_concurrent: usize) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_secs: 1,
            max_concurrent,
            retry: RetryPolicy::immediate(),
        }
    }

    fn scheduler(
        db: &Arc<Database>,
        mock: &Arc<MockAgentExecutor>,
        clock: Arc<dyn Clock>,
        max_concurrent: usize,
    ) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(Arc::clone(db), mock.clone(), clock, config(max_concurrent)))
    }

    fn alice() -> TenantScope {
        TenantScope::user("alice").unwrap()
    }

    #[tokio::test]
    async fn test_daily_job_lifecycle() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let clock = Arc::new(ManualClock::new(ts("2024-01-01T08:00:00Z")));
        let mock = Arc::new(MockAgentExecutor::new(vec![AgentOutcome::succeeded("done")]).gated());
        let sched = scheduler(&db, &mock, clock.clone(), 4);

        let job = db
            .create_cron_job(&alice(), &job_request("daily", "0 9 * * *"), job_defaults(), clock.now())
            .unwrap();
        assert_eq!(job.next_run_at, Some(ts("2024-01-01T09:00:00Z")));

        // Not due yet
        assert_eq!(sched.tick().await.jobs, 0);

        clock.set(ts("2024-01-01T09:00:01Z"));
        assert_eq!(sched.tick().await.jobs, 1);
        assert!(mock.wait_for_calls(1).await);

        let running = db.list_cron_executions(&alice(), Some(job.id), 10, 0).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].status, ExecutionStatus::Running);

        // A second tick while the run is in flight does not double-dispatch
        assert_eq!(sched.tick().await.jobs, 0);

        mock.release(1);
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);

        let job = db.get_cron_job(&alice(), job.id).unwrap().unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.last_status, Some(ExecutionStatus::Success));
        assert_eq!(job.last_run_at, Some(ts("2024-01-01T09:00:01Z")));
        assert_eq!(job.next_run_at, Some(ts("2024-01-02T09:00:00Z")));

        let history = db.list_cron_executions(&alice(), Some(job.id), 10, 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Success);
        assert_eq!(history[0].output_summary.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_storage_error_skips_tick_and_polling_recovers() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let clock = Arc::new(ManualClock::new(ts("2024-01-01T08:00:00Z")));
        let mock = Arc::new(MockAgentExecutor::new(vec![
            AgentOutcome::succeeded("job"),
            AgentOutcome::succeeded("task"),
        ]));
        let sched = scheduler(&db, &mock, clock.clone(), 4);

        let job = db
            .create_cron_job(&alice(), &job_request("daily", "0 9 * * *"), job_defaults(), clock.now())
            .unwrap();
        db.enqueue_task(&alice(), &task_request("queued", 0, None), 1_000, clock.now())
            .unwrap();
        clock.set(ts("2024-01-01T09:00:01Z"));

        db.conn()
            .execute_batch(
                "ALTER TABLE cron_executions RENAME TO cron_executions_off;
                 ALTER TABLE agent_tasks RENAME TO agent_tasks_off;",
            )
            .unwrap();
        assert_eq!(sched.tick().await, TickReport { jobs: 0, tasks: 0 });
        assert_eq!(sched.active_count(), 0);

        db.conn()
            .execute_batch(
                "ALTER TABLE cron_executions_off RENAME TO cron_executions;
                 ALTER TABLE agent_tasks_off RENAME TO agent_tasks;",
            )
            .unwrap();
        // Nothing was claimed, so the job is still due
        let job = db.get_cron_job(&alice(), job.id).unwrap().unwrap();
        assert_eq!(job.next_run_at, Some(ts("2024-01-01T09:00:00Z")));

        assert_eq!(sched.tick().await, TickReport { jobs: 1, tasks: 1 });
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
        let job = db.get_cron_job(&alice(), job.id).unwrap().unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.last_status, Some(ExecutionStatus::Success));
    }

    #[tokio::test]
    async fn test_wait_for_idle_tracks_runs_spawned_after_a_wait() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let clock = Arc::new(ManualClock::new(ts("2024-01-01T08:00:00Z")));
        let mock = Arc::new(
            MockAgentExecutor::new(vec![AgentOutcome::succeeded("one"), AgentOutcome::succeeded("two")]).gated(),
        );
        let sched = scheduler(&db, &mock, clock.clone(), 4);
        assert!(sched.wait_for_idle(Duration::from_millis(10)).await);

        db.enqueue_task(&alice(), &task_request("first", 0, None), 60_000, clock.now())
            .unwrap();
        assert_eq!(sched.tick().await.tasks, 1);
        assert!(mock.wait_for_calls(1).await);
        assert!(!sched.wait_for_idle(Duration::from_millis(50)).await);
        mock.release(1);
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
        assert_eq!(sched.active_count(), 0);

        db.enqueue_task(&alice(), &task_request("second", 0, None), 60_000, clock.now())
            .unwrap();
        assert_eq!(sched.tick().await.tasks, 1);
        assert!(mock.wait_for_calls(2).await);
        assert!(!sched.wait_for_idle(Duration::from_millis(50)).await);
        mock.release(1);
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_timeout_fails_run_near_deadline() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let mock = Arc::new(MockAgentExecutor::delayed(
            vec![AgentOutcome::succeeded("too slow")],
            Duration::from_millis(1_000),
        ));
        let sched = scheduler(&db, &mock, Arc::new(SystemClock), 4);

        let mut request = job_request("slow", "*/5 * * * *");
        request.timeout_ms = Some(100);
        let job = db.create_cron_job(&alice(), &request, job_defaults(), Utc::now()).unwrap();

        let started = std::time::Instant::now();
        let execution = sched.run_job_now(&alice(), job.id).unwrap();
        assert!(sched.wait_for_idle(Duration::from_secs(3)).await);
        assert!(started.elapsed() < Duration::from_millis(900));

        let execution = db.get_cron_execution(&alice(), execution.id).unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_kind, Some(FailureKind::Timeout));
        assert_eq!(execution.attempts, 1);
        let duration = execution.duration_ms.unwrap();
        assert!((100..900).contains(&duration), "duration {}ms", duration);
    }

    #[tokio::test]
    async fn test_disabled_mid_run_is_not_redispatched() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let clock = Arc::new(ManualClock::new(ts("2024-01-01T08:00:00Z")));
        let mock = Arc::new(MockAgentExecutor::new(vec![AgentOutcome::succeeded("ok")]).gated());
        let sched = scheduler(&db, &mock, clock.clone(), 4);

        let job = db
            .create_cron_job(&alice(), &job_request("hourly", "0 * * * *"), job_defaults(), clock.now())
            .unwrap();
        clock.set(ts("2024-01-01T09:00:00Z"));
        assert_eq!(sched.tick().await.jobs, 1);
        assert!(mock.wait_for_calls(1).await);

        db.set_cron_job_enabled(&alice(), job.id, false, clock.now()).unwrap();
        mock.release(1);
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);

        let job = db.get_cron_job(&alice(), job.id).unwrap().unwrap();
        assert_eq!(job.last_status, Some(ExecutionStatus::Success));
        assert_eq!(job.next_run_at, None);

        clock.advance(chrono::Duration::days(1));
        assert_eq!(sched.tick().await.jobs, 0);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_defers_jobs_to_later_tick() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let clock = Arc::new(ManualClock::new(ts("2024-01-01T08:00:00Z")));
        let mock = Arc::new(MockAgentExecutor::new(vec![]).gated());
        let sched = scheduler(&db, &mock, clock.clone(), 1);

        for name in ["a", "b"] {
            db.create_cron_job(&alice(), &job_request(name, "0 9 * * *"), job_defaults(), clock.now())
                .unwrap();
        }
        clock.set(ts("2024-01-01T09:00:00Z"));
        assert_eq!(sched.tick().await.jobs, 1);
        assert!(mock.wait_for_calls(1).await);
        assert_eq!(sched.status(&alice()).unwrap().active_jobs, 1);

        // Still at capacity
        assert_eq!(sched.tick().await.jobs, 0);

        mock.release(1);
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
        assert_eq!(sched.tick().await.jobs, 1);
        mock.release(1);
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_tasks_run_in_priority_order() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let mock = Arc::new(MockAgentExecutor::new(vec![]));
        let sched = scheduler(&db, &mock, Arc::new(SystemClock), 1);

        let mut ids = Vec::new();
        for priority in [5, 1, 3] {
            let task = db
                .enqueue_task(&alice(), &task_request(&format!("p{}", priority), priority, None), 5_000, Utc::now())
                .unwrap();
            ids.push(task.id);
        }

        for _ in 0..3 {
            assert_eq!(sched.tick().await.tasks, 1);
            assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
        }
        let order: Vec<i64> = mock.calls().iter().map(|c| c.source_id).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);

        for id in ids {
            assert_eq!(db.get_task(&alice(), id).unwrap().unwrap().status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_child_of_completed_parent_runs() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let mock = Arc::new(MockAgentExecutor::new(vec![]));
        let sched = scheduler(&db, &mock, Arc::new(SystemClock), 4);

        let parent = db
            .enqueue_task(&alice(), &task_request("parent", 0, None), 5_000, Utc::now())
            .unwrap();
        assert_eq!(sched.tick().await.tasks, 1);
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
        assert_eq!(db.get_task(&alice(), parent.id).unwrap().unwrap().status, TaskStatus::Completed);

        let child = db
            .enqueue_task(&alice(), &task_request("child", 0, Some(parent.id)), 5_000, Utc::now())
            .unwrap();
        assert_eq!(sched.tick().await.tasks, 1);
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
        assert_eq!(db.get_task(&alice(), child.id).unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let mock = Arc::new(MockAgentExecutor::new(vec![AgentOutcome::succeeded("late")]).gated());
        let sched = scheduler(&db, &mock, Arc::new(SystemClock), 4);

        let task = db
            .enqueue_task(&alice(), &task_request("long", 0, None), 5_000, Utc::now())
            .unwrap();
        assert_eq!(sched.tick().await.tasks, 1);
        assert!(mock.wait_for_calls(1).await);

        let bob = TenantScope::user("bob").unwrap();
        assert!(matches!(sched.cancel_task(&bob, task.id), Err(OrchestratorError::NotFound(_))));

        let canceled = sched.cancel_task(&alice(), task.id).unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);

        let task = db.get_task(&alice(), task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        let agent = db
            .get_sub_agent(&alice(), task.assigned_sub_agent_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(agent.status, SubAgentStatus::Error);
    }

    #[tokio::test]
    async fn test_manual_run_conflicts_while_running() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let mock = Arc::new(MockAgentExecutor::new(vec![]).gated());
        let sched = scheduler(&db, &mock, Arc::new(SystemClock), 4);

        let job = db
            .create_cron_job(&alice(), &job_request("manual", "0 9 * * *"), job_defaults(), Utc::now())
            .unwrap();
        sched.run_job_now(&alice(), job.id).unwrap();
        assert!(matches!(
            sched.run_job_now(&alice(), job.id),
            Err(OrchestratorError::ClaimConflict(_))
        ));

        let bob = TenantScope::user("bob").unwrap();
        assert!(matches!(sched.run_job_now(&bob, job.id), Err(OrchestratorError::NotFound(_))));

        assert!(sched.cancel_job_run(&alice(), job.id).unwrap());
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
        let history = db.list_cron_executions(&alice(), Some(job.id), 10, 0).unwrap();
        assert_eq!(history[0].error_kind, Some(FailureKind::Canceled));
        assert!(!sched.cancel_job_run(&alice(), job.id).unwrap());
    }

    #[tokio::test]
    async fn test_stop_interrupts_after_grace() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let mock = Arc::new(MockAgentExecutor::new(vec![]).gated());
        let sched = scheduler(&db, &mock, Arc::new(SystemClock), 4);

        let job = db
            .create_cron_job(&alice(), &job_request("stuck", "0 9 * * *"), job_defaults(), Utc::now())
            .unwrap();
        sched.start();
        assert!(sched.is_running());
        let execution = sched.run_job_now(&alice(), job.id).unwrap();
        assert!(mock.wait_for_calls(1).await);

        sched.stop(Duration::from_millis(50)).await;
        assert!(!sched.is_running());
        assert_eq!(sched.active_count(), 0);

        let execution = db.get_cron_execution(&alice(), execution.id).unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_kind, Some(FailureKind::Interrupted));
    }

    #[tokio::test]
    async fn test_status_is_tenant_scoped() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let mock = Arc::new(MockAgentExecutor::new(vec![]));
        let sched = scheduler(&db, &mock, Arc::new(SystemClock), 0);

        let bob = TenantScope::user("bob").unwrap();
        db.create_cron_job(&alice(), &job_request("a1", "0 9 * * *"), job_defaults(), Utc::now())
            .unwrap();
        let mut disabled = job_request("a2", "0 9 * * *");
        disabled.enabled = false;
        db.create_cron_job(&alice(), &disabled, job_defaults(), Utc::now()).unwrap();
        db.create_cron_job(&bob, &job_request("b1", "0 9 * * *"), job_defaults(), Utc::now())
            .unwrap();

        let status = sched.status(&alice()).unwrap();
        assert_eq!((status.total_jobs, status.enabled_jobs), (2, 1));
        assert_eq!(status.queued_tasks, None);
        assert!(!status.running);
        assert_eq!(status.poll_interval_ms, 1_000);

        let admin = TenantScope::new("admin", true).unwrap();
        let status = sched.status(&admin).unwrap();
        assert_eq!((status.total_jobs, status.enabled_jobs), (3, 2));
        assert_eq!(status.queued_tasks, Some(0));
    }

    #[tokio::test]
    async fn test_restart_sweeps_orphans_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("orchestrator.db");
        let url = path.to_string_lossy().to_string();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();

        let (job_id, execution_id, task_id) = {
            let db = Database::new(&url).unwrap();
            let job = db
                .create_cron_job(
                    &alice(),
                    &job_request("nightly", "0 9 * * *"),
                    job_defaults(),
                    start - chrono::Duration::hours(1),
                )
                .unwrap();
            let (_, execution) = db.claim_cron_job(job.id, ClaimTrigger::Schedule, start).unwrap();
            let task = db.enqueue_task(&alice(), &task_request("t", 0, None), 5_000, start).unwrap();
            db.claim_next_task(1, start).unwrap().unwrap();
            (job.id, execution.id, task.id)
        };

        // Process restarts
        let db = Arc::new(Database::new(&url).unwrap());
        let mock = Arc::new(MockAgentExecutor::new(vec![]));
        let clock = Arc::new(ManualClock::new(start + chrono::Duration::minutes(5)));
        let sched = scheduler(&db, &mock, clock, 4);

        let report = sched.sweep_orphaned_runs().unwrap();
        assert_eq!(report.executions, 1);
        assert_eq!(report.jobs, 1);
        assert_eq!(report.tasks, 1);
        assert_eq!(sched.sweep_orphaned_runs().unwrap().total(), 0);

        let execution = db.get_cron_execution(&alice(), execution_id).unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_kind, Some(FailureKind::Interrupted));
        assert_eq!(execution.duration_ms, Some(300_000));

        let job = db.get_cron_job(&alice(), job_id).unwrap().unwrap();
        assert_eq!(job.last_status, Some(ExecutionStatus::Failed));
        assert_eq!(job.next_run_at, Some(ts("2024-01-02T09:00:00Z")));

        assert_eq!(db.get_task(&alice(), task_id).unwrap().unwrap().status, TaskStatus::Failed);
    }
}
