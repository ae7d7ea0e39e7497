//! Append-only ledger contract and in-memory backend
//!
//! The ledger has no update or delete operation. The only write is
//! [`Ledger::append`], which assigns a monotonically increasing sequence
//! number. Session assignment records carry a uniqueness constraint on
//! petition id, which is what makes panel assignment exactly-once across
//! orchestrator instances.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::transcript::ContentHash;
use super::types::*;
use crate::witness::WitnessEvent;

/// Current record schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Error type for ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A session already exists for this petition. Carries the winning record.
    #[error("petition {petition_id} already has a session")]
    Duplicate {
        petition_id: PetitionId,
        existing: Box<LedgerRecord>,
    },

    /// The session moved on since the writer last read it.
    #[error("session {session_id} is at sequence {found}, writer expected {expected}")]
    Conflict {
        session_id: SessionId,
        expected: u64,
        found: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unsupported record schema version {found} (max {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Discriminant of a [`RecordPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    SessionAssigned,
    PhaseWitnessed,
    BallotCast,
    RoundAdvanced,
    JurorSubstituted,
    SessionTerminated,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionAssigned => "session_assigned",
            Self::PhaseWitnessed => "phase_witnessed",
            Self::BallotCast => "ballot_cast",
            Self::RoundAdvanced => "round_advanced",
            Self::JurorSubstituted => "juror_substituted",
            Self::SessionTerminated => "session_terminated",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record body, tagged by `event_type` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RecordPayload {
    SessionAssigned(AssignmentRecord),
    PhaseWitnessed(WitnessEvent),
    BallotCast(Vote),
    RoundAdvanced(RoundAdvance),
    JurorSubstituted(SubstitutionRecord),
    SessionTerminated(TerminationRecord),
}

impl RecordPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::SessionAssigned(_) => RecordKind::SessionAssigned,
            Self::PhaseWitnessed(_) => RecordKind::PhaseWitnessed,
            Self::BallotCast(_) => RecordKind::BallotCast,
            Self::RoundAdvanced(_) => RecordKind::RoundAdvanced,
            Self::JurorSubstituted(_) => RecordKind::JurorSubstituted,
            Self::SessionTerminated(_) => RecordKind::SessionTerminated,
        }
    }
}

/// One immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Schema version for forward compatibility
    pub schema_version: u32,
    /// Assigned by the ledger on append; zero before that
    pub sequence: u64,
    pub session_id: SessionId,
    pub petition_id: PetitionId,
    pub recorded_at: DateTime<Utc>,
    pub payload: RecordPayload,
}

impl LedgerRecord {
    /// Create an unsequenced record at the current schema version.
    pub fn new(
        session_id: &str,
        petition_id: &str,
        recorded_at: DateTime<Utc>,
        payload: RecordPayload,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            sequence: 0,
            session_id: session_id.to_string(),
            petition_id: petition_id.to_string(),
            recorded_at,
            payload,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    pub fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Phase or outcome value carried by the record, if any.
    pub fn value(&self) -> Option<String> {
        match &self.payload {
            RecordPayload::PhaseWitnessed(w) => Some(w.phase.to_string()),
            RecordPayload::BallotCast(v) => Some(v.outcome.to_string()),
            RecordPayload::JurorSubstituted(s) => Some(s.phase.to_string()),
            RecordPayload::SessionTerminated(t) => Some(
                t.outcome
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "ABORTED".to_string()),
            ),
            RecordPayload::SessionAssigned(_) | RecordPayload::RoundAdvanced(_) => None,
        }
    }

    /// Own and predecessor content hashes, for witness records.
    pub fn content_hashes(&self) -> Option<(&ContentHash, Option<&ContentHash>)> {
        match &self.payload {
            RecordPayload::PhaseWitnessed(w) => {
                Some((&w.content_hash, w.predecessor_hash.as_ref()))
            }
            _ => None,
        }
    }

    /// Serialize to a JSON line.
    pub fn to_json(&self) -> LedgerResult<String> {
        serde_json::to_string(self).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    /// Deserialize, rejecting records from a newer schema.
    pub fn from_json(json: &str) -> LedgerResult<Self> {
        let record: Self =
            serde_json::from_str(json).map_err(|e| LedgerError::Serialization(e.to_string()))?;
        if record.schema_version > SCHEMA_VERSION {
            return Err(LedgerError::UnsupportedVersion {
                found: record.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(record)
    }
}

/// Read filter. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub session_id: Option<SessionId>,
    pub petition_id: Option<PetitionId>,
    pub kind: Option<RecordKind>,
    /// Only records with a greater sequence
    pub after_sequence: Option<u64>,
}

impl RecordFilter {
    pub fn session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        }
    }

    pub fn petition(petition_id: &str) -> Self {
        Self {
            petition_id: Some(petition_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn after(mut self, sequence: u64) -> Self {
        self.after_sequence = Some(sequence);
        self
    }

    pub fn matches(&self, record: &LedgerRecord) -> bool {
        self.session_id
            .as_deref()
            .map_or(true, |s| s == record.session_id)
            && self
                .petition_id
                .as_deref()
                .map_or(true, |p| p == record.petition_id)
            && self.kind.map_or(true, |k| k == record.kind())
            && self.after_sequence.map_or(true, |s| record.sequence > s)
    }
}

/// Append-only record store consumed by the engine
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Append a record and return its assigned sequence number.
    ///
    /// A `SessionAssigned` record for a petition that already has one fails
    /// with [`LedgerError::Duplicate`] carrying the existing record.
    async fn append(&self, record: LedgerRecord) -> LedgerResult<u64>;

    /// Append only if the session's latest record has sequence
    /// `expected_last`, failing with [`LedgerError::Conflict`] otherwise.
    ///
    /// Writers that validated against a cached session use this so a stale
    /// cache can never append a record that contradicts the history.
    async fn append_after(&self, record: LedgerRecord, expected_last: u64) -> LedgerResult<u64>;

    /// Read matching records in sequence order.
    async fn read(&self, filter: &RecordFilter) -> LedgerResult<Vec<LedgerRecord>>;
}

#[derive(Default)]
struct LedgerInner {
    records: Vec<LedgerRecord>,
    /// petition id -> index of its assignment record
    petitions: HashMap<PetitionId, usize>,
    /// session id -> sequence of its latest record
    heads: HashMap<SessionId, u64>,
}

impl LedgerInner {
    fn insert(&mut self, mut record: LedgerRecord, expected_last: Option<u64>) -> LedgerResult<u64> {
        if let Some(expected) = expected_last {
            let found = self.heads.get(&record.session_id).copied().unwrap_or(0);
            if found != expected {
                return Err(LedgerError::Conflict {
                    session_id: record.session_id.clone(),
                    expected,
                    found,
                });
            }
        }

        if record.kind() == RecordKind::SessionAssigned {
            if let Some(&index) = self.petitions.get(&record.petition_id) {
                return Err(LedgerError::Duplicate {
                    petition_id: record.petition_id.clone(),
                    existing: Box::new(self.records[index].clone()),
                });
            }
        }

        let sequence = self.records.len() as u64 + 1;
        record.sequence = sequence;

        if record.kind() == RecordKind::SessionAssigned {
            let index = self.records.len();
            self.petitions.insert(record.petition_id.clone(), index);
        }
        self.heads.insert(record.session_id.clone(), sequence);

        debug!(
            sequence,
            session_id = %record.session_id,
            event_type = record.event_type(),
            "Record appended"
        );
        self.records.push(record);
        Ok(sequence)
    }
}

/// In-process ledger, the default backend
#[derive(Default)]
pub struct InMemoryLedger {
    inner: RwLock<LedgerInner>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn append(&self, record: LedgerRecord) -> LedgerResult<u64> {
        let mut inner = self.inner.write().map_err(|_| LedgerError::LockPoisoned)?;
        inner.insert(record, None)
    }

    async fn append_after(&self, record: LedgerRecord, expected_last: u64) -> LedgerResult<u64> {
        let mut inner = self.inner.write().map_err(|_| LedgerError::LockPoisoned)?;
        inner.insert(record, Some(expected_last))
    }

    async fn read(&self, filter: &RecordFilter) -> LedgerResult<Vec<LedgerRecord>> {
        let inner = self.inner.read().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(inner
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}
