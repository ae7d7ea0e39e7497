//! Session deadlines
//!
//! Every session gets one scheduled deadline at creation, re-armed if it
//! fires early. The orchestrator also checks the clock before each mutation,
//! so a late or lost fire still cannot let a session run past its ceiling.

pub mod clock;
pub mod monitor;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use monitor::{TimeoutCheck, TimeoutMonitor};
pub use scheduler::{
    DeadlineHandler, ManualScheduler, ScheduledDeadline, Scheduler, SchedulerError,
    SchedulerResult, TokioScheduler,
};
