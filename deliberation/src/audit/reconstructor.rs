//! Audit timeline reconstruction
//!
//! Joins a session's ledger records with the transcript store into one
//! timeline in ledger sequence order. Aborted and timed-out sessions yield a
//! partial timeline; a transcript that cannot be fetched is shown as
//! unretrievable, never dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeliberationError, DeliberationResult};
use crate::state::{
    AssignmentRecord, DissentRecord, Ledger, LedgerRecord, PetitionId, RecordFilter,
    RecordPayload, RoundAdvance, SessionId, SubstitutionRecord, TerminationRecord, Vote,
    VoteTally,
};
use crate::witness::{ChainVerificationReport, WitnessChainBuilder, WitnessEvent};

/// Transcript body attached to a witness entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TranscriptContent {
    Available { content: String },
    Unretrievable { reason: String },
}

impl TranscriptContent {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }
}

/// What happened at one point of the timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum TimelineEvent {
    Assignment(AssignmentRecord),
    PhaseWitnessed {
        event: WitnessEvent,
        transcript: TranscriptContent,
    },
    Ballot(Vote),
    RoundAdvanced(RoundAdvance),
    Substitution(SubstitutionRecord),
    Dissent(DissentRecord),
    Terminated(TerminationRecord),
}

/// One timeline entry, stamped with its source record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TimelineEvent,
}

/// Full audit view of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTimeline {
    pub session_id: SessionId,
    pub petition_id: PetitionId,
    pub entries: Vec<TimelineEntry>,
    /// The unjoined records, in sequence order
    pub records: Vec<LedgerRecord>,
    pub verification: ChainVerificationReport,
}

impl AuditTimeline {
    pub fn witness_events(&self) -> Vec<&WitnessEvent> {
        self.entries
            .iter()
            .filter_map(|e| match &e.event {
                TimelineEvent::PhaseWitnessed { event, .. } => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn witness_count(&self) -> usize {
        self.witness_events().len()
    }

    pub fn terminal(&self) -> Option<&TerminationRecord> {
        match self.entries.last().map(|e| &e.event) {
            Some(TimelineEvent::Terminated(record)) => Some(record),
            _ => None,
        }
    }

    pub fn dissent(&self) -> Option<&DissentRecord> {
        self.entries.iter().find_map(|e| match &e.event {
            TimelineEvent::Dissent(d) => Some(d),
            _ => None,
        })
    }

    /// Vote distribution of every resolved round, in round order.
    pub fn round_tallies(&self) -> Vec<(u32, VoteTally)> {
        let mut tallies = Vec::new();
        for entry in &self.entries {
            match &entry.event {
                TimelineEvent::RoundAdvanced(advance) => {
                    tallies.push((advance.from_round, advance.tally.clone()));
                }
                TimelineEvent::Terminated(TerminationRecord {
                    final_tally: Some(tally),
                    round_count,
                    ..
                }) => tallies.push((*round_count, tally.clone())),
                _ => {}
            }
        }
        tallies
    }

    /// Whether the session ended without ballots deciding it.
    pub fn is_partial(&self) -> bool {
        match self.terminal() {
            Some(t) => t.is_abort() || t.reason == crate::state::TerminationReason::Timeout,
            None => true,
        }
    }
}

/// Builds [`AuditTimeline`]s from the ledger and transcript store
#[derive(Clone)]
pub struct AuditReconstructor {
    ledger: Arc<dyn Ledger>,
    witness: WitnessChainBuilder,
}

impl AuditReconstructor {
    pub fn new(ledger: Arc<dyn Ledger>, witness: WitnessChainBuilder) -> Self {
        Self { ledger, witness }
    }

    /// Reconstruct a session from the ledger.
    pub async fn reconstruct(&self, session_id: &str) -> DeliberationResult<AuditTimeline> {
        let records = self.ledger.read(&RecordFilter::session(session_id)).await?;
        if records.is_empty() {
            return Err(DeliberationError::SessionNotFound(session_id.to_string()));
        }
        Ok(Self::from_records(&self.witness, records).await)
    }

    /// Join already-loaded records (sorted here by sequence).
    pub async fn from_records(
        witness: &WitnessChainBuilder,
        mut records: Vec<LedgerRecord>,
    ) -> AuditTimeline {
        records.sort_by_key(|r| r.sequence);
        let (session_id, petition_id) = records
            .first()
            .map(|r| (r.session_id.clone(), r.petition_id.clone()))
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(records.len() + 1);
        let mut events = Vec::new();

        for record in &records {
            let stamp = |event| TimelineEntry {
                sequence: record.sequence,
                recorded_at: record.recorded_at,
                event,
            };
            match &record.payload {
                RecordPayload::SessionAssigned(a) => {
                    entries.push(stamp(TimelineEvent::Assignment(a.clone())))
                }
                RecordPayload::PhaseWitnessed(event) => {
                    let transcript = Self::fetch_transcript(witness, event).await;
                    events.push(event.clone());
                    entries.push(stamp(TimelineEvent::PhaseWitnessed {
                        event: event.clone(),
                        transcript,
                    }));
                }
                RecordPayload::BallotCast(v) => entries.push(stamp(TimelineEvent::Ballot(v.clone()))),
                RecordPayload::RoundAdvanced(r) => {
                    entries.push(stamp(TimelineEvent::RoundAdvanced(r.clone())))
                }
                RecordPayload::JurorSubstituted(s) => {
                    entries.push(stamp(TimelineEvent::Substitution(s.clone())))
                }
                RecordPayload::SessionTerminated(t) => {
                    if let Some(dissent) = &t.dissent {
                        entries.push(stamp(TimelineEvent::Dissent(dissent.clone())));
                    }
                    entries.push(stamp(TimelineEvent::Terminated(t.clone())));
                }
            }
        }

        let verification = witness.verify(&events).await;
        debug!(
            session_id = %session_id,
            entries = entries.len(),
            valid = verification.is_valid,
            "Audit timeline reconstructed"
        );

        AuditTimeline {
            session_id,
            petition_id,
            entries,
            records,
            verification,
        }
    }

    async fn fetch_transcript(witness: &WitnessChainBuilder, event: &WitnessEvent) -> TranscriptContent {
        match witness.transcripts().get(&event.content_hash).await {
            Ok(Some(bytes)) => TranscriptContent::Available {
                content: String::from_utf8_lossy(&bytes).into_owned(),
            },
            Ok(None) => TranscriptContent::Unretrievable {
                reason: format!("no transcript stored under {}", event.content_hash),
            },
            Err(e) => {
                warn!(hash = %event.content_hash, error = %e, "Transcript fetch failed");
                TranscriptContent::Unretrievable {
                    reason: e.to_string(),
                }
            }
        }
    }
}
