//! Cron expressions and schedulers.

mod expression;
mod leader;
mod scheduler;

pub use expression::{CronExpression, CronFields, MAX_SEARCH_MINUTES};
pub use leader::{LeaderConfig, LeaderScheduler, DEFAULT_LEADER_KEY};
pub use scheduler::{job_handler, CronScheduler, JobHandler, MinuteScheduler, SchedulerConfig};
