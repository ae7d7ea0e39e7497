//! Wall-clock ceiling on sessions

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::clock::Clock;
use super::scheduler::{DeadlineHandler, Scheduler, SchedulerResult};

/// Result of checking a session against its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCheck {
    /// Session already ended; nothing to do.
    AlreadyTerminal,
    /// Deadline has not been reached.
    NotYetDue,
    /// Deadline reached; the session must terminate with TIMEOUT.
    Expired,
}

/// Computes, arms and checks session deadlines
#[derive(Clone)]
pub struct TimeoutMonitor {
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl TimeoutMonitor {
    pub fn new(scheduler: Arc<dyn Scheduler>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            scheduler,
            clock,
            timeout,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Deadline for a session created at `created_at`.
    pub fn deadline_for(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + self.timeout
    }

    /// Schedule the single deadline check for a new session.
    pub async fn arm(
        &self,
        session_id: &str,
        deadline: DateTime<Utc>,
        handler: Arc<dyn DeadlineHandler>,
    ) -> SchedulerResult<()> {
        debug!(session_id, deadline = %deadline.to_rfc3339(), "Arming session deadline");
        self.scheduler.schedule(session_id, deadline, handler).await
    }

    pub fn is_expired(&self, deadline: DateTime<Utc>) -> bool {
        self.clock.now() >= deadline
    }

    /// Evaluate a session. Timeout is checked ahead of any other condition.
    pub fn check(&self, deadline: DateTime<Utc>, is_terminal: bool) -> TimeoutCheck {
        if is_terminal {
            TimeoutCheck::AlreadyTerminal
        } else if self.is_expired(deadline) {
            TimeoutCheck::Expired
        } else {
            TimeoutCheck::NotYetDue
        }
    }
}
