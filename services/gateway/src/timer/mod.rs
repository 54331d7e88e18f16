//! Time-based execution: the recurring cron engine, the one-shot timer
//! service, and the workday oracle they filter against.

pub mod jobs;
pub mod oneshot;
pub mod recurring;
pub mod workday;
