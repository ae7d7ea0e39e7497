//! Core record types for deliberation state
//!
//! These types are persisted through the [`Ledger`](super::Ledger) and are
//! the building blocks every session view is folded from.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for deliberation sessions
pub type SessionId = String;

/// Identifier of the petition under deliberation (owned by intake)
pub type PetitionId = String;

/// Identifier of a juror
pub type JurorId = String;

/// Stable version marker of the juror pool
pub type PoolGeneration = u64;

/// Deliberation phase. Each completed phase is witnessed exactly once per round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Jurors independently assess the petition.
    Assess,
    /// Jurors state their initial positions.
    Position,
    /// Jurors challenge each other's positions.
    CrossExamine,
    /// Jurors cast ballots.
    Vote,
}

impl Phase {
    /// Phase that follows this one in a normal pass, `None` after VOTE.
    pub fn next(self) -> Option<Phase> {
        match self {
            Self::Assess => Some(Self::Position),
            Self::Position => Some(Self::CrossExamine),
            Self::CrossExamine => Some(Self::Vote),
            Self::Vote => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assess => "ASSESS",
            Self::Position => "POSITION",
            Self::CrossExamine => "CROSS_EXAMINE",
            Self::Vote => "VOTE",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding outcome of a deliberation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Acknowledge,
    Refer,
    Escalate,
}

impl Outcome {
    pub fn all() -> &'static [Outcome] {
        &[Outcome::Acknowledge, Outcome::Refer, Outcome::Escalate]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledge => "ACKNOWLEDGE",
            Self::Refer => "REFER",
            Self::Escalate => "ESCALATE",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACKNOWLEDGE" | "ACK" | "A" => Ok(Self::Acknowledge),
            "REFER" | "R" => Ok(Self::Refer),
            "ESCALATE" | "ESC" | "E" => Ok(Self::Escalate),
            other => Err(format!("unknown outcome: {}", other)),
        }
    }
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// At least two of three jurors agreed.
    Supermajority,
    /// A three-way split persisted through the final round.
    Deadlock,
    /// The session deadline fired before a resolution.
    Timeout,
    /// A second juror failure exhausted the substitution budget.
    RepeatedPanelFailure,
    /// No eligible replacement juror was left in the pool.
    ReplacementPoolExhausted,
}

impl TerminationReason {
    /// Whether this reason ends the session as ABORTED rather than COMPLETE.
    pub fn is_abort(self) -> bool {
        matches!(
            self,
            Self::RepeatedPanelFailure | Self::ReplacementPoolExhausted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Supermajority => "supermajority",
            Self::Deadlock => "deadlock",
            Self::Timeout => "timeout",
            Self::RepeatedPanelFailure => "repeated panel failure",
            Self::ReplacementPoolExhausted => "replacement pool exhausted",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single juror ballot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Round number (1-indexed)
    pub round: u32,
    pub juror_id: JurorId,
    pub outcome: Outcome,
    /// Free-text justification, preserved if the ballot ends up outvoted
    pub rationale: String,
    pub cast_at: DateTime<Utc>,
}

/// Per-outcome ballot counts for one round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub counts: BTreeMap<Outcome, u32>,
}

impl VoteTally {
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        let mut counts = BTreeMap::new();
        for vote in votes {
            *counts.entry(vote.outcome).or_insert(0) += 1;
        }
        Self { counts }
    }

    pub fn count(&self, outcome: Outcome) -> u32 {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    /// Whether every counted outcome received exactly one ballot.
    pub fn is_three_way_split(&self) -> bool {
        self.total() == 3 && self.counts.values().all(|c| *c == 1)
    }
}

impl std::fmt::Display for VoteTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = Outcome::all()
            .iter()
            .map(|o| format!("{}={}", o, self.count(*o)))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Preserved minority ballot from a 2-1 resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DissentRecord {
    pub round: u32,
    pub juror_id: JurorId,
    pub outcome: Outcome,
    pub rationale: String,
    /// The outcome that carried the round
    pub majority_outcome: Outcome,
}

/// A failed juror swapped out mid-session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutionRecord {
    pub failed_juror: JurorId,
    pub replacement_juror: JurorId,
    /// Phase in progress when the failure was signalled
    pub phase: Phase,
    pub round: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Terminal record of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationRecord {
    /// `None` when the session was aborted
    pub outcome: Option<Outcome>,
    pub reason: TerminationReason,
    /// Round in progress when the session stopped
    pub round_count: u32,
    /// Tally of the deciding round, when ballots decided it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_tally: Option<VoteTally>,
    /// Outvoted ballot from a 2-1 resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dissent: Option<DissentRecord>,
    pub terminated_at: DateTime<Utc>,
}

impl TerminationRecord {
    pub fn is_abort(&self) -> bool {
        self.reason.is_abort()
    }
}

/// Panel assignment, the first record of every session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub panel: Vec<JurorId>,
    pub pool_generation: PoolGeneration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    pub max_rounds: u32,
    pub deadline: DateTime<Utc>,
}

/// A split round sent back to CROSS_EXAMINE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAdvance {
    pub from_round: u32,
    pub to_round: u32,
    /// Distribution of the split round
    pub tally: VoteTally,
}
