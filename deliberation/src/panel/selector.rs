//! Deterministic panel selection
//!
//! The selection key `(petition id, seed, generation)` is hashed with BLAKE3
//! in extendable-output mode. Successive 8-byte segments of that stream
//! drive sampling without replacement over the canonically ordered eligible
//! pool, so the same key always yields the same ordered candidates.
//! Substitution keeps consuming the same stream, which is why a replacement
//! is reproducible from the assignment record alone.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::pool::{EligibilityPolicy, JurorPool};
use crate::state::{JurorId, PoolGeneration};

/// Number of jurors on every panel
pub const PANEL_SIZE: usize = 3;

/// Domain separation context for selection hashing
const SELECTION_CONTEXT: &str = "deliberation panel selection v1";

/// Deterministic stream of uniformly distributed indices
pub struct IndexSequence {
    reader: blake3::OutputReader,
}

impl IndexSequence {
    pub fn new(petition_id: &str, seed: Option<&str>, generation: PoolGeneration) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(SELECTION_CONTEXT);
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart
        hasher.update(&(petition_id.len() as u64).to_le_bytes());
        hasher.update(petition_id.as_bytes());
        let seed = seed.unwrap_or("");
        hasher.update(&(seed.len() as u64).to_le_bytes());
        hasher.update(seed.as_bytes());
        hasher.update(&generation.to_le_bytes());
        Self {
            reader: hasher.finalize_xof(),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut segment = [0u8; 8];
        self.reader.fill(&mut segment);
        u64::from_le_bytes(segment)
    }

    /// Next index in `0..bound`, free of modulo bias.
    ///
    /// `bound` must be non-zero.
    pub fn next_index(&mut self, bound: usize) -> usize {
        let bound = bound as u64;
        // Largest multiple of `bound` that fits; values above it are rejected
        let zone = u64::MAX - (u64::MAX % bound);
        loop {
            let value = self.next_u64();
            if value < zone {
                return (value % bound) as usize;
            }
        }
    }
}

/// Sampling without replacement: a deterministic permutation of candidates
pub struct CandidateStream {
    remaining: Vec<JurorId>,
    sequence: IndexSequence,
}

impl Iterator for CandidateStream {
    type Item = JurorId;

    fn next(&mut self) -> Option<JurorId> {
        if self.remaining.is_empty() {
            return None;
        }
        let index = self.sequence.next_index(self.remaining.len());
        Some(self.remaining.swap_remove(index))
    }
}

/// Ordered triple of distinct jurors
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Panel {
    jurors: [JurorId; PANEL_SIZE],
}

impl Panel {
    /// Build a panel, rejecting duplicates or a wrong member count.
    pub fn from_ids(ids: &[JurorId]) -> Option<Self> {
        let [a, b, c] = ids else {
            return None;
        };
        if a == b || b == c || a == c {
            return None;
        }
        Some(Self {
            jurors: [a.clone(), b.clone(), c.clone()],
        })
    }

    pub fn jurors(&self) -> &[JurorId] {
        &self.jurors
    }

    pub fn contains(&self, juror_id: &str) -> bool {
        self.jurors.iter().any(|j| j == juror_id)
    }

    /// Same seat order with `failed` swapped for `replacement`.
    pub fn with_replacement(&self, failed: &str, replacement: &str) -> Option<Self> {
        if !self.contains(failed) || self.contains(replacement) {
            return None;
        }
        let jurors = self.jurors.clone().map(|j| {
            if j == failed {
                replacement.to_string()
            } else {
                j
            }
        });
        Some(Self { jurors })
    }

    pub fn to_vec(&self) -> Vec<JurorId> {
        self.jurors.to_vec()
    }
}

impl std::fmt::Display for Panel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}", self.jurors.join(", "))
    }
}

/// Why selection could not produce a juror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsufficientPool {
    pub available: usize,
    pub required: usize,
}

/// Picks panels and replacement candidates from the pool
#[derive(Debug, Clone, Default)]
pub struct PanelSelector {
    policy: EligibilityPolicy,
}

impl PanelSelector {
    pub fn new(policy: EligibilityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EligibilityPolicy {
        &self.policy
    }

    /// Candidate order for a selection key over the current eligible pool.
    pub fn candidates(
        &self,
        petition_id: &str,
        seed: Option<&str>,
        generation: PoolGeneration,
        pool: &JurorPool,
    ) -> CandidateStream {
        CandidateStream {
            remaining: pool.eligible_ids(&self.policy),
            sequence: IndexSequence::new(petition_id, seed, generation),
        }
    }

    /// Select the panel for a petition. Pure function of its inputs.
    pub fn select(
        &self,
        petition_id: &str,
        seed: Option<&str>,
        pool: &JurorPool,
    ) -> Result<Panel, InsufficientPool> {
        let picks: Vec<JurorId> = self
            .candidates(petition_id, seed, pool.generation, pool)
            .take(PANEL_SIZE)
            .collect();

        Panel::from_ids(&picks).ok_or(InsufficientPool {
            available: picks.len(),
            required: PANEL_SIZE,
        })
    }

    /// Next candidate in the assignment stream that is not excluded.
    ///
    /// `generation` is the generation recorded at assignment, so the stream
    /// matches the one the panel was drawn from.
    pub fn next_candidate(
        &self,
        petition_id: &str,
        seed: Option<&str>,
        generation: PoolGeneration,
        pool: &JurorPool,
        excluded: &BTreeSet<JurorId>,
    ) -> Option<JurorId> {
        self.candidates(petition_id, seed, generation, pool)
            .find(|candidate| !excluded.contains(candidate))
    }
}
