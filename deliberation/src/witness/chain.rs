//! Hash-linked per-phase integrity records
//!
//! Each completed phase stores its transcript in the content-addressed store
//! and yields a [`WitnessEvent`] carrying the transcript hash plus the hash of
//! the session's previous witness. Altering any stored transcript changes its
//! recomputed hash; altering any event breaks the link that follows it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::state::{
    content_hash, ContentHash, Phase, PhaseTranscript, SessionId, TranscriptResult,
    TranscriptStore,
};

/// Integrity record for one completed phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessEvent {
    pub session_id: SessionId,
    pub phase: Phase,
    pub round: u32,
    /// BLAKE3 hash of the phase transcript
    pub content_hash: ContentHash,
    /// Content hash of the previous witness; `None` only for the first
    pub predecessor_hash: Option<ContentHash>,
    pub witnessed_at: DateTime<Utc>,
}

/// Predecessor link that does not match the prior event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    /// Position of the offending event in the chain
    pub index: usize,
    pub phase: Phase,
    pub round: u32,
    pub expected: Option<ContentHash>,
    pub found: Option<ContentHash>,
}

/// Transcript whose stored content no longer hashes to the recorded value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityFailure {
    pub index: usize,
    pub phase: Phase,
    pub round: u32,
    pub recorded: ContentHash,
    pub computed: ContentHash,
}

/// Result of verifying one session's witness chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerificationReport {
    pub is_valid: bool,
    pub events_checked: usize,
    pub broken_links: Vec<BrokenLink>,
    /// Recorded hashes with no content in the transcript store
    pub missing_transcripts: Vec<ContentHash>,
    pub integrity_failures: Vec<IntegrityFailure>,
}

impl ChainVerificationReport {
    /// One-line human summary.
    pub fn summary(&self) -> String {
        if self.is_valid {
            format!("chain valid ({} events)", self.events_checked)
        } else {
            format!(
                "chain INVALID ({} events): {} broken links, {} missing transcripts, {} integrity failures",
                self.events_checked,
                self.broken_links.len(),
                self.missing_transcripts.len(),
                self.integrity_failures.len()
            )
        }
    }
}

/// Emits and verifies witness events against a transcript store
#[derive(Clone)]
pub struct WitnessChainBuilder {
    transcripts: Arc<dyn TranscriptStore>,
}

impl WitnessChainBuilder {
    pub fn new(transcripts: Arc<dyn TranscriptStore>) -> Self {
        Self { transcripts }
    }

    pub fn transcripts(&self) -> &Arc<dyn TranscriptStore> {
        &self.transcripts
    }

    /// Store a phase transcript and produce its witness event.
    ///
    /// `previous` is the session's latest witness, if any.
    pub async fn witness(
        &self,
        transcript: &PhaseTranscript,
        previous: Option<&WitnessEvent>,
        now: DateTime<Utc>,
    ) -> TranscriptResult<WitnessEvent> {
        let bytes = transcript
            .canonical_bytes()
            .map_err(|e| crate::state::TranscriptError::Storage(e.to_string()))?;
        let hash = self.transcripts.put(&bytes).await?;

        let event = WitnessEvent {
            session_id: transcript.session_id.clone(),
            phase: transcript.phase,
            round: transcript.round,
            content_hash: hash,
            predecessor_hash: previous.map(|p| p.content_hash.clone()),
            witnessed_at: now,
        };

        debug!(
            session_id = %event.session_id,
            phase = %event.phase,
            round = event.round,
            hash = %event.content_hash,
            "Phase witnessed"
        );
        Ok(event)
    }

    /// Recompute every transcript hash and check every predecessor link.
    ///
    /// Store errors count as missing transcripts so that a partially damaged
    /// chain still yields a full report.
    pub async fn verify(&self, events: &[WitnessEvent]) -> ChainVerificationReport {
        let mut report = ChainVerificationReport {
            events_checked: events.len(),
            ..Default::default()
        };

        let mut expected_predecessor: Option<&ContentHash> = None;
        for (index, event) in events.iter().enumerate() {
            if event.predecessor_hash.as_ref() != expected_predecessor {
                report.broken_links.push(BrokenLink {
                    index,
                    phase: event.phase,
                    round: event.round,
                    expected: expected_predecessor.cloned(),
                    found: event.predecessor_hash.clone(),
                });
            }
            expected_predecessor = Some(&event.content_hash);

            match self.transcripts.get(&event.content_hash).await {
                Ok(Some(content)) => {
                    let computed = content_hash(&content);
                    if computed != event.content_hash {
                        report.integrity_failures.push(IntegrityFailure {
                            index,
                            phase: event.phase,
                            round: event.round,
                            recorded: event.content_hash.clone(),
                            computed,
                        });
                    }
                }
                Ok(None) => report.missing_transcripts.push(event.content_hash.clone()),
                Err(e) => {
                    warn!(hash = %event.content_hash, error = %e, "Transcript lookup failed");
                    report.missing_transcripts.push(event.content_hash.clone());
                }
            }
        }

        report.is_valid = report.broken_links.is_empty()
            && report.missing_transcripts.is_empty()
            && report.integrity_failures.is_empty();

        if !report.is_valid {
            warn!(summary = %report.summary(), "Witness chain verification failed");
        }
        report
    }
}
