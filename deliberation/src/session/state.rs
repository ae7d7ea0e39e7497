//! Session state machine, folded from ledger records.
//!
//! A session is never mutated directly: the orchestrator builds a record,
//! applies it here to validate the transition, and only then appends it.
//! Replaying a session's records reproduces the same state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeliberationError, DeliberationResult};
use crate::panel::Panel;
use crate::state::{
    AssignmentRecord, JurorId, LedgerRecord, Outcome, PetitionId, Phase, PoolGeneration,
    RecordPayload, RoundAdvance, SessionId, SubstitutionRecord, TerminationReason,
    TerminationRecord, Vote, VoteTally,
};
use crate::witness::WitnessEvent;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Assess,
    Position,
    CrossExamine,
    Vote,
    /// Terminated with a binding outcome.
    Complete { outcome: Outcome },
    /// Terminated without an outcome.
    Aborted { reason: TerminationReason },
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Aborted { .. })
    }

    /// The deliberation phase in progress, if the session is live.
    pub fn active(self) -> Option<Phase> {
        match self {
            Self::Assess => Some(Phase::Assess),
            Self::Position => Some(Phase::Position),
            Self::CrossExamine => Some(Phase::CrossExamine),
            Self::Vote => Some(Phase::Vote),
            Self::Complete { .. } | Self::Aborted { .. } => None,
        }
    }
}

impl From<Phase> for SessionPhase {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Assess => Self::Assess,
            Phase::Position => Self::Position,
            Phase::CrossExamine => Self::CrossExamine,
            Phase::Vote => Self::Vote,
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete { outcome } => write!(f, "COMPLETE({})", outcome),
            Self::Aborted { reason } => write!(f, "ABORTED({})", reason),
            live => match live.active() {
                Some(phase) => write!(f, "{}", phase),
                None => Ok(()),
            },
        }
    }
}

/// A deliberation session and its full history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliberationSession {
    pub id: SessionId,
    pub petition_id: PetitionId,
    pub panel: Panel,
    pub phase: SessionPhase,
    /// Current round (1-indexed)
    pub round: u32,
    pub max_rounds: u32,
    pub deadline: DateTime<Utc>,
    pub pool_generation: PoolGeneration,
    pub seed: Option<String>,
    pub created_at: DateTime<Utc>,
    pub witnesses: Vec<WitnessEvent>,
    /// Every ballot ever cast, including ones later discarded by substitution
    pub ballots: Vec<Vote>,
    pub round_advances: Vec<RoundAdvance>,
    pub substitutions: Vec<SubstitutionRecord>,
    pub termination: Option<TerminationRecord>,
    /// Sequence of the last applied record
    pub last_sequence: u64,
}

impl DeliberationSession {
    /// Build a session from its assignment record.
    pub fn from_assignment(record: &LedgerRecord) -> DeliberationResult<Self> {
        let RecordPayload::SessionAssigned(assignment) = &record.payload else {
            return Err(DeliberationError::invalid_transition(
                &record.session_id,
                format!("session must start with an assignment, got {}", record.kind()),
            ));
        };
        Self::from_parts(record, assignment)
    }

    fn from_parts(record: &LedgerRecord, assignment: &AssignmentRecord) -> DeliberationResult<Self> {
        let panel = Panel::from_ids(&assignment.panel).ok_or_else(|| {
            DeliberationError::invalid_transition(
                &record.session_id,
                format!("assignment panel is not 3 distinct jurors: {:?}", assignment.panel),
            )
        })?;

        Ok(Self {
            id: record.session_id.clone(),
            petition_id: record.petition_id.clone(),
            panel,
            phase: SessionPhase::Assess,
            round: 1,
            max_rounds: assignment.max_rounds,
            deadline: assignment.deadline,
            pool_generation: assignment.pool_generation,
            seed: assignment.seed.clone(),
            created_at: record.recorded_at,
            witnesses: Vec::new(),
            ballots: Vec::new(),
            round_advances: Vec::new(),
            substitutions: Vec::new(),
            termination: None,
            last_sequence: record.sequence,
        })
    }

    /// Fold a session's records, in sequence order. `None` if there are none.
    pub fn replay(records: &[LedgerRecord]) -> DeliberationResult<Option<Self>> {
        let Some((first, rest)) = records.split_first() else {
            return Ok(None);
        };
        let mut session = Self::from_assignment(first)?;
        for record in rest {
            session.apply(record)?;
        }
        Ok(Some(session))
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn last_witness(&self) -> Option<&WitnessEvent> {
        self.witnesses.last()
    }

    /// Ballots that count in the current round.
    ///
    /// A ballot cast by a juror who has since been substituted out is
    /// dropped here, so the replacement votes instead.
    pub fn current_ballots(&self) -> Vec<&Vote> {
        self.ballots
            .iter()
            .filter(|v| v.round == self.round && self.panel.contains(&v.juror_id))
            .collect()
    }

    pub fn current_tally(&self) -> VoteTally {
        VoteTally::from_votes(self.current_ballots())
    }

    /// Jurors who were substituted out of this session.
    pub fn removed_jurors(&self) -> BTreeSet<JurorId> {
        self.substitutions
            .iter()
            .map(|s| s.failed_juror.clone())
            .collect()
    }

    /// Substitutions made in a given round.
    pub fn substitutions_in_round(&self, round: u32) -> usize {
        self.substitutions.iter().filter(|s| s.round == round).count()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.phase {
            SessionPhase::Complete { outcome } => Some(outcome),
            _ => None,
        }
    }

    /// One-line status for logs and CLI output.
    pub fn status_line(&self) -> String {
        match &self.termination {
            Some(t) => format!(
                "{} [{}] {} after round {}",
                self.id, self.petition_id, self.phase, t.round_count
            ),
            None => format!(
                "{} [{}] {} round {}/{} panel {}",
                self.id, self.petition_id, self.phase, self.round, self.max_rounds, self.panel
            ),
        }
    }

    fn reject(&self, reason: impl Into<String>) -> DeliberationError {
        DeliberationError::invalid_transition(&self.id, reason)
    }

    /// Validate and apply one record.
    ///
    /// The session is left untouched when this returns an error.
    pub fn apply(&mut self, record: &LedgerRecord) -> DeliberationResult<()> {
        if record.session_id != self.id {
            return Err(self.reject(format!(
                "record belongs to session {}",
                record.session_id
            )));
        }
        if self.is_terminal() {
            return Err(self.reject(format!(
                "session is {} and accepts no further {}",
                self.phase,
                record.kind()
            )));
        }

        match &record.payload {
            RecordPayload::SessionAssigned(_) => {
                return Err(self.reject("session is already assigned"));
            }
            RecordPayload::PhaseWitnessed(event) => self.apply_witness(event)?,
            RecordPayload::BallotCast(vote) => self.apply_ballot(vote)?,
            RecordPayload::RoundAdvanced(advance) => self.apply_round_advance(advance)?,
            RecordPayload::JurorSubstituted(substitution) => {
                self.apply_substitution(substitution)?
            }
            RecordPayload::SessionTerminated(termination) => {
                self.phase = match termination.outcome {
                    Some(outcome) if !termination.is_abort() => SessionPhase::Complete { outcome },
                    _ => SessionPhase::Aborted {
                        reason: termination.reason,
                    },
                };
                self.termination = Some(termination.clone());
            }
        }

        self.last_sequence = record.sequence;
        Ok(())
    }

    fn apply_witness(&mut self, event: &WitnessEvent) -> DeliberationResult<()> {
        let Some(current) = self.phase.active() else {
            return Err(self.reject("no phase in progress"));
        };
        if event.phase != current || event.round != self.round {
            return Err(self.reject(format!(
                "cannot complete {} in round {}; current phase is {} in round {}",
                event.phase, event.round, current, self.round
            )));
        }
        let expected = self.last_witness().map(|w| &w.content_hash);
        if event.predecessor_hash.as_ref() != expected {
            return Err(self.reject("witness does not extend the session chain"));
        }

        if current == Phase::Vote {
            if self.current_ballots().len() < crate::panel::PANEL_SIZE {
                return Err(self.reject("VOTE completes only when all ballots are in"));
            }
        } else if let Some(next) = current.next() {
            self.phase = next.into();
        }
        self.witnesses.push(event.clone());
        Ok(())
    }

    fn apply_ballot(&mut self, vote: &Vote) -> DeliberationResult<()> {
        if self.phase != SessionPhase::Vote {
            return Err(self.reject(format!("cannot vote during {}", self.phase)));
        }
        if vote.round != self.round {
            return Err(self.reject(format!(
                "ballot for round {} in round {}",
                vote.round, self.round
            )));
        }
        if !self.panel.contains(&vote.juror_id) {
            return Err(DeliberationError::JurorNotOnPanel {
                session_id: self.id.clone(),
                juror_id: vote.juror_id.clone(),
            });
        }
        if self
            .current_ballots()
            .iter()
            .any(|v| v.juror_id == vote.juror_id)
        {
            return Err(DeliberationError::DuplicateVote {
                session_id: self.id.clone(),
                juror_id: vote.juror_id.clone(),
                round: self.round,
            });
        }
        self.ballots.push(vote.clone());
        Ok(())
    }

    fn apply_round_advance(&mut self, advance: &RoundAdvance) -> DeliberationResult<()> {
        if self.phase != SessionPhase::Vote {
            return Err(self.reject(format!("cannot start a new round during {}", self.phase)));
        }
        if advance.from_round != self.round || advance.to_round != self.round + 1 {
            return Err(self.reject(format!(
                "round advance {} -> {} does not follow round {}",
                advance.from_round, advance.to_round, self.round
            )));
        }
        if advance.to_round > self.max_rounds {
            return Err(self.reject(format!(
                "round {} exceeds the {} round limit",
                advance.to_round, self.max_rounds
            )));
        }
        self.round = advance.to_round;
        self.phase = SessionPhase::CrossExamine;
        self.round_advances.push(advance.clone());
        Ok(())
    }

    fn apply_substitution(&mut self, substitution: &SubstitutionRecord) -> DeliberationResult<()> {
        let panel = self
            .panel
            .with_replacement(&substitution.failed_juror, &substitution.replacement_juror)
            .ok_or_else(|| {
                self.reject(format!(
                    "cannot replace {} with {} on panel {}",
                    substitution.failed_juror, substitution.replacement_juror, self.panel
                ))
            })?;
        if self.removed_jurors().contains(&substitution.replacement_juror) {
            return Err(self.reject(format!(
                "{} was already substituted out",
                substitution.replacement_juror
            )));
        }
        self.panel = panel;
        self.substitutions.push(substitution.clone());
        Ok(())
    }
}
