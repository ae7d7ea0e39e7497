//! Supermajority resolution of one round's ballots

use serde::{Deserialize, Serialize};

use crate::panel::PANEL_SIZE;
use crate::state::{DissentRecord, Outcome, Vote, VoteTally};

/// Classification of a round's ballots.
///
/// A three-way split is not an error: it is returned as
/// [`Resolution::Indeterminate`] and handed to the deadlock handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// At least two of three ballots agree.
    Supermajority {
        outcome: Outcome,
        tally: VoteTally,
        /// The outvoted ballot, absent when the vote was unanimous
        dissent: Option<DissentRecord>,
    },
    /// Three ballots, three different outcomes.
    Indeterminate { tally: VoteTally },
    /// Fewer than three ballots so far.
    Incomplete { tally: VoteTally },
}

impl Resolution {
    pub fn tally(&self) -> &VoteTally {
        match self {
            Self::Supermajority { tally, .. }
            | Self::Indeterminate { tally }
            | Self::Incomplete { tally } => tally,
        }
    }

    pub fn is_decided(&self) -> bool {
        matches!(self, Self::Supermajority { .. })
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supermajority { outcome, tally, .. } => {
                write!(f, "supermajority {} ({})", outcome, tally)
            }
            Self::Indeterminate { tally } => write!(f, "indeterminate ({})", tally),
            Self::Incomplete { tally } => write!(f, "incomplete ({})", tally),
        }
    }
}

/// Classifies ballots by the 2-of-3 rule
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusResolver;

impl ConsensusResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve one round. `votes` must hold at most one ballot per juror.
    pub fn resolve(&self, votes: &[Vote]) -> Resolution {
        let tally = VoteTally::from_votes(votes);

        if votes.len() < PANEL_SIZE {
            return Resolution::Incomplete { tally };
        }

        let winner = Outcome::all()
            .iter()
            .copied()
            .find(|o| tally.count(*o) >= 2);

        match winner {
            Some(outcome) => {
                let dissent = votes
                    .iter()
                    .find(|v| v.outcome != outcome)
                    .map(|v| DissentRecord {
                        round: v.round,
                        juror_id: v.juror_id.clone(),
                        outcome: v.outcome,
                        rationale: v.rationale.clone(),
                        majority_outcome: outcome,
                    });
                Resolution::Supermajority {
                    outcome,
                    tally,
                    dissent,
                }
            }
            None => Resolution::Indeterminate { tally },
        }
    }
}
