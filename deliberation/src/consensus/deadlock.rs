//! Round tracking and deadlock conversion

use serde::{Deserialize, Serialize};

use super::resolver::Resolution;
use crate::state::{DissentRecord, Outcome, VoteTally};

/// What the session does after a round's ballots are in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundDecision {
    /// Terminate COMPLETE with the agreed outcome.
    Resolved {
        outcome: Outcome,
        tally: VoteTally,
        dissent: Option<DissentRecord>,
    },
    /// Split with rounds left: back to CROSS_EXAMINE in `to_round`.
    NextRound {
        from_round: u32,
        to_round: u32,
        tally: VoteTally,
    },
    /// Split on the final round: terminate COMPLETE(ESCALATE).
    Deadlocked { rounds: u32, tally: VoteTally },
    /// Not all ballots are in.
    AwaitingBallots,
}

impl RoundDecision {
    /// Whether the session should stop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved { .. } | Self::Deadlocked { .. })
    }
}

impl std::fmt::Display for RoundDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved { outcome, .. } => write!(f, "resolved {}", outcome),
            Self::NextRound {
                from_round,
                to_round,
                ..
            } => write!(f, "next_round ({} -> {})", from_round, to_round),
            Self::Deadlocked { rounds, .. } => write!(f, "deadlocked after {} rounds", rounds),
            Self::AwaitingBallots => write!(f, "awaiting_ballots"),
        }
    }
}

/// Converts persistent splits into a deterministic ESCALATE.
#[derive(Debug, Clone, Copy)]
pub struct DeadlockHandler {
    max_rounds: u32,
}

impl DeadlockHandler {
    /// Outcome every deadlock resolves to
    pub const DEADLOCK_OUTCOME: Outcome = Outcome::Escalate;

    pub fn new(max_rounds: u32) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Decide the session's next move for `round` given its resolution.
    pub fn evaluate(&self, round: u32, resolution: &Resolution) -> RoundDecision {
        match resolution {
            Resolution::Supermajority {
                outcome,
                tally,
                dissent,
            } => RoundDecision::Resolved {
                outcome: *outcome,
                tally: tally.clone(),
                dissent: dissent.clone(),
            },
            Resolution::Indeterminate { tally } if round < self.max_rounds => {
                RoundDecision::NextRound {
                    from_round: round,
                    to_round: round + 1,
                    tally: tally.clone(),
                }
            }
            Resolution::Indeterminate { tally } => RoundDecision::Deadlocked {
                rounds: round,
                tally: tally.clone(),
            },
            Resolution::Incomplete { .. } => RoundDecision::AwaitingBallots,
        }
    }
}

impl Default for DeadlockHandler {
    fn default() -> Self {
        Self::new(3)
    }
}
