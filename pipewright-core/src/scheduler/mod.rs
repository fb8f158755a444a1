//! Scheduling for Pipewright.
//!
//! Computes next-run instants from schedule configs (calendar frequencies and
//! five-field cron expressions, timezone aware) and owns the per-pipeline
//! timers that trigger scheduled runs and delayed retries.

pub mod calendar;
pub mod cron;
pub mod timers;

pub use calendar::{calculate_next_run, next_cron_run, resolve_timezone};
pub use cron::CronExpression;
pub use timers::{Scheduler, TimerKind, TimerTarget};
