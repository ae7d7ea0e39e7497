//! Deadline scheduling contract and backends
//!
//! Delivery is at-least-once: a handler may be invoked more than once for the
//! same session, so handlers must be idempotent.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::clock::Clock;
use crate::state::SessionId;

/// Error type for scheduling
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for scheduling
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Callback invoked when a session deadline fires
#[async_trait]
pub trait DeadlineHandler: Send + Sync {
    async fn on_deadline(&self, session_id: &str);
}

/// Schedules one deadline callback per session
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule(
        &self,
        session_id: &str,
        fire_at: DateTime<Utc>,
        handler: Arc<dyn DeadlineHandler>,
    ) -> SchedulerResult<()>;
}

/// Spawns one sleeping tokio task per deadline
pub struct TokioScheduler {
    clock: Arc<dyn Clock>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Number of deadline tasks still running.
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().filter(|t| !t.is_finished()).count())
            .unwrap_or(0)
    }

    /// Abort every outstanding deadline task.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn schedule(
        &self,
        session_id: &str,
        fire_at: DateTime<Utc>,
        handler: Arc<dyn DeadlineHandler>,
    ) -> SchedulerResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))?;

        // Past deadlines fire immediately
        let delay = (fire_at - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let session_id = session_id.to_string();

        debug!(session_id = %session_id, delay_ms = delay.as_millis() as u64, "Deadline scheduled");

        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            info!(session_id = %session_id, "Session deadline fired");
            handler.on_deadline(&session_id).await;
        });

        let mut tasks = self.tasks.lock().map_err(|_| SchedulerError::LockPoisoned)?;
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        Ok(())
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A recorded, not yet fired deadline
#[derive(Clone)]
pub struct ScheduledDeadline {
    pub session_id: SessionId,
    pub fire_at: DateTime<Utc>,
    handler: Arc<dyn DeadlineHandler>,
}

impl std::fmt::Debug for ScheduledDeadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledDeadline")
            .field("session_id", &self.session_id)
            .field("fire_at", &self.fire_at)
            .finish()
    }
}

/// Scheduler that only fires when asked.
///
/// Used by tests and replay tooling. [`ManualScheduler::fire`] leaves the
/// deadline registered, so calling it twice simulates duplicate delivery.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<ScheduledDeadline>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadlines registered so far, in scheduling order.
    pub fn scheduled(&self) -> Vec<(SessionId, DateTime<Utc>)> {
        self.pending
            .lock()
            .map(|p| {
                p.iter()
                    .map(|d| (d.session_id.clone(), d.fire_at))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Invoke every handler registered for a session. Returns how many fired.
    pub async fn fire(&self, session_id: &str) -> SchedulerResult<usize> {
        let handlers: Vec<Arc<dyn DeadlineHandler>> = {
            let pending = self.pending.lock().map_err(|_| SchedulerError::LockPoisoned)?;
            pending
                .iter()
                .filter(|d| d.session_id == session_id)
                .map(|d| d.handler.clone())
                .collect()
        };

        for handler in &handlers {
            handler.on_deadline(session_id).await;
        }
        Ok(handlers.len())
    }

    /// Fire and drop every deadline at or before `now`.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let due: Vec<ScheduledDeadline> = {
            let mut pending = self.pending.lock().map_err(|_| SchedulerError::LockPoisoned)?;
            let (due, rest) = pending.drain(..).partition(|d| d.fire_at <= now);
            *pending = rest;
            due
        };

        for deadline in &due {
            deadline.handler.on_deadline(&deadline.session_id).await;
        }
        Ok(due.len())
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    async fn schedule(
        &self,
        session_id: &str,
        fire_at: DateTime<Utc>,
        handler: Arc<dyn DeadlineHandler>,
    ) -> SchedulerResult<()> {
        let mut pending = self.pending.lock().map_err(|_| SchedulerError::LockPoisoned)?;
        pending.push(ScheduledDeadline {
            session_id: session_id.to_string(),
            fire_at,
            handler,
        });
        Ok(())
    }
}
