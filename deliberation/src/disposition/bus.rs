//! Disposition bus
//!
//! Fans terminal records out to downstream routers over a Tokio broadcast
//! channel and keeps a bounded history for inspection.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::state::{
    Outcome, PetitionId, SessionId, TerminationReason, TerminationRecord, SCHEMA_VERSION,
};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Records kept in the inspection history
const HISTORY_CAPACITY: usize = 1024;

/// Error type for disposition delivery
#[derive(Debug, thiserror::Error)]
pub enum DispositionError {
    #[error("Failed to deliver disposition: {0}")]
    DeliveryFailed(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for disposition delivery
pub type DispositionResult<T> = Result<T, DispositionError>;

/// The single terminal record a session hands downstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispositionRecord {
    pub schema_version: u32,
    pub session_id: SessionId,
    pub petition_id: PetitionId,
    /// `None` when the session was aborted
    pub outcome: Option<Outcome>,
    pub reason: TerminationReason,
    pub round_count: u32,
    pub decided_at: DateTime<Utc>,
}

impl DispositionRecord {
    pub fn from_termination(session_id: &str, petition_id: &str, record: &TerminationRecord) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: session_id.to_string(),
            petition_id: petition_id.to_string(),
            outcome: record.outcome,
            reason: record.reason,
            round_count: record.round_count,
            decided_at: record.terminated_at,
        }
    }

    /// `COMPLETE(<outcome>)` or `ABORTED`.
    pub fn status(&self) -> String {
        match self.outcome {
            Some(outcome) => format!("COMPLETE({})", outcome),
            None => "ABORTED".to_string(),
        }
    }
}

/// Receives exactly one terminal record per session
#[async_trait]
pub trait DispositionSink: Send + Sync {
    async fn emit(&self, record: DispositionRecord) -> DispositionResult<()>;
}

/// Shared reference to DispositionBus
pub type SharedDispositionBus = Arc<DispositionBus>;

/// Broadcast-backed disposition sink
pub struct DispositionBus {
    sender: broadcast::Sender<DispositionRecord>,
    history: RwLock<VecDeque<DispositionRecord>>,
}

impl DispositionBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Create a shared reference to this bus
    pub fn shared(self) -> SharedDispositionBus {
        Arc::new(self)
    }

    /// Subscribe to receive dispositions
    pub fn subscribe(&self) -> broadcast::Receiver<DispositionRecord> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Dispositions emitted so far, oldest first.
    pub fn history(&self) -> Vec<DispositionRecord> {
        self.history
            .read()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Dispositions emitted for one session.
    pub fn for_session(&self, session_id: &str) -> Vec<DispositionRecord> {
        self.history()
            .into_iter()
            .filter(|r| r.session_id == session_id)
            .collect()
    }
}

impl Default for DispositionBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispositionSink for DispositionBus {
    async fn emit(&self, record: DispositionRecord) -> DispositionResult<()> {
        {
            let mut history = self
                .history
                .write()
                .map_err(|_| DispositionError::LockPoisoned)?;
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        let session_id = record.session_id.clone();
        // No receivers is fine; the history still has it
        match self.sender.send(record) {
            Ok(count) => debug!(session_id = %session_id, receivers = count, "Disposition published"),
            Err(_) => debug!(session_id = %session_id, "Disposition published (no receivers)"),
        }
        Ok(())
    }
}
