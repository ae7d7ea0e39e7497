//! Consensus resolution and deadlock handling
//!
//! [`ConsensusResolver`] classifies a single round's ballots;
//! [`DeadlockHandler`] turns that classification into the session's next
//! move, converting a split on the final round into ESCALATE.

pub mod deadlock;
pub mod resolver;

pub use deadlock::{DeadlockHandler, RoundDecision};
pub use resolver::{ConsensusResolver, Resolution};
