//! Scheduling: cron evaluation, retry policy, the run executor and the
//! polling engine that ties them together.

pub mod clock;
pub mod cron_eval;
pub mod engine;
pub mod retry;
pub mod runner;

pub use engine::{Scheduler, SchedulerConfig, SchedulerStatus};
